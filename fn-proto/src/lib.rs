//! Control-channel protocol between the host supervisor and the guest agent.
//!
//! Wire format (one vsock stream, guest listens on [`CONTROL_PORT`]):
//!
//! ```text
//!   host -> guest   <decimal length>\n<msgpack ConfigurationPayload>
//!   guest -> host   msgpack SetupAck
//!   host -> guest   instruction: `halt` | `!<shell line>` | msgpack RunCodePayload
//!   guest -> host   response:    `STOP\n` | shell output | msgpack ExecutionResult
//! ```
//!
//! The setup message is length-delimited. Instructions and responses are
//! delimited by the request/response discipline: the host sends one
//! instruction and waits for its response before sending the next.
//!
//! All structured payloads are msgpack maps (named fields), never arrays.

pub mod frame;
pub mod types;

use std::io;

pub use frame::{decode, encode, read_frame, read_length, read_payload, write_frame};
pub use types::{
    Blob, ConfigurationPayload, Encoding, ExecutionResult, Interface, RunCodePayload, Scope,
    SetupAck, Volume,
};

/// Context id of the host on the vsock transport.
pub const HOST_CID: u32 = 2;

/// Port the guest listens on, and the port the readiness handshake connects to.
pub const CONTROL_PORT: u32 = 52;

/// Loopback port an executable workload is expected to serve HTTP on.
pub const APP_PORT: u16 = 8080;

/// Upper bound for a single instruction read.
pub const MAX_INSTRUCTION_SIZE: usize = 1_000_000;

/// Maximum number of decimal digits in the setup length header.
pub const MAX_HEADER_DIGITS: usize = 9;

pub const HALT_COMMAND: &[u8] = b"halt";
pub const HALT_ACK: &[u8] = b"STOP\n";
pub const SHELL_PREFIX: u8 = b'!';

/// Reply to a shell instruction that produced no output. Responses carry no
/// delimiter, so an empty reply would never reach the host.
pub const EMPTY_SHELL_REPLY: &[u8] = b"\n";

/// Errors raised while framing or (de)serializing control-channel messages.
///
/// None of these are recoverable on the stream they occur on: there is no
/// way to resynchronize after a malformed header or payload.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("length header exceeds {MAX_HEADER_DIGITS} digits")]
    HeaderTooLong,

    #[error("invalid byte {0:#04x} in length header")]
    InvalidHeader(u8),

    #[error("empty length header")]
    EmptyHeader,

    #[error("connection closed while reading the length header")]
    ClosedInHeader,

    #[error("connection closed after {received} of {expected} payload bytes")]
    UnexpectedEof { received: usize, expected: usize },

    #[error("payload of {0} bytes does not fit a {MAX_HEADER_DIGITS}-digit header")]
    PayloadTooLarge(usize),

    #[error("msgpack encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("msgpack decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
}

impl ProtocolError {
    /// True when a msgpack payload ended before the value was complete, so
    /// more bytes may still be on the way.
    pub fn is_truncated(&self) -> bool {
        use rmp_serde::decode::Error as DecodeError;
        match self {
            ProtocolError::Decode(
                DecodeError::InvalidMarkerRead(e) | DecodeError::InvalidDataRead(e),
            ) => e.kind() == io::ErrorKind::UnexpectedEof,
            _ => false,
        }
    }
}

/// One instruction received on the control channel, classified by its
/// leading bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction<'a> {
    /// Flush filesystems, acknowledge with [`HALT_ACK`], terminate.
    Halt,
    /// Shell command line (the bytes after the `!` prefix).
    Shell(&'a [u8]),
    /// msgpack-encoded [`RunCodePayload`].
    RunCode(&'a [u8]),
}

impl<'a> Instruction<'a> {
    pub fn parse(data: &'a [u8]) -> Self {
        if data == HALT_COMMAND {
            Instruction::Halt
        } else if let Some((&SHELL_PREFIX, line)) = data.split_first() {
            Instruction::Shell(line)
        } else {
            Instruction::RunCode(data)
        }
    }
}

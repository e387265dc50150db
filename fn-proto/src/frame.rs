//! Length-prefixed setup framing and msgpack helpers.
//!
//! Setup frame:
//!   `<1-9 ASCII digits>\n<payload of exactly that many bytes>`

use serde::{de::DeserializeOwned, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{ProtocolError, MAX_HEADER_DIGITS};

/// Read chunk size for payload bodies.
const READ_CHUNK: usize = 64 * 1024;

/// Read the decimal length header, one byte at a time, up to and including
/// the terminating newline.
pub async fn read_length<R: AsyncRead + Unpin>(reader: &mut R) -> Result<usize, ProtocolError> {
    let mut digits = [0u8; MAX_HEADER_DIGITS];
    let mut count = 0;

    loop {
        let mut byte = [0u8; 1];
        if reader.read(&mut byte).await? == 0 {
            return Err(ProtocolError::ClosedInHeader);
        }
        match byte[0] {
            b'\n' => break,
            b if b.is_ascii_digit() => {
                if count == MAX_HEADER_DIGITS {
                    return Err(ProtocolError::HeaderTooLong);
                }
                digits[count] = b;
                count += 1;
            }
            other => return Err(ProtocolError::InvalidHeader(other)),
        }
    }

    if count == 0 {
        return Err(ProtocolError::EmptyHeader);
    }

    // Nine decimal digits always fit a usize
    Ok(digits[..count]
        .iter()
        .fold(0usize, |acc, d| acc * 10 + usize::from(d - b'0')))
}

/// Read exactly `len` bytes, accumulating across partial reads.
///
/// The buffer grows as data arrives instead of being allocated upfront, so a
/// bogus header from a peer that then disconnects does not cost `len` bytes.
pub async fn read_payload<R: AsyncRead + Unpin>(
    reader: &mut R,
    len: usize,
) -> Result<Vec<u8>, ProtocolError> {
    let mut payload = Vec::with_capacity(len.min(READ_CHUNK));
    let mut chunk = vec![0u8; READ_CHUNK.min(len.max(1))];

    while payload.len() < len {
        let want = (len - payload.len()).min(chunk.len());
        let n = reader.read(&mut chunk[..want]).await?;
        if n == 0 {
            return Err(ProtocolError::UnexpectedEof {
                received: payload.len(),
                expected: len,
            });
        }
        payload.extend_from_slice(&chunk[..n]);
    }

    Ok(payload)
}

/// Read one complete length-prefixed frame.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>, ProtocolError> {
    let len = read_length(reader).await?;
    read_payload(reader, len).await
}

/// Write one length-prefixed frame.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    payload: &[u8],
) -> Result<(), ProtocolError> {
    let header = payload.len().to_string();
    if header.len() > MAX_HEADER_DIGITS {
        return Err(ProtocolError::PayloadTooLarge(payload.len()));
    }
    writer.write_all(header.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Encode a value as a msgpack map.
pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    Ok(rmp_serde::to_vec_named(value)?)
}

/// Decode a msgpack value.
pub fn decode<T: DeserializeOwned>(data: &[u8]) -> Result<T, ProtocolError> {
    Ok(rmp_serde::from_slice(data)?)
}

use anyhow::{bail, Context, Result};
use fn_proto::{
    ConfigurationPayload, ExecutionResult, RunCodePayload, SetupAck, HALT_ACK, HALT_COMMAND,
    MAX_INSTRUCTION_SIZE, SHELL_PREFIX,
};
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{timeout, Duration};
use tracing::{debug, warn};

/// Read chunk size for responses.
const READ_CHUNK: usize = 64 * 1024;

/// Upper bound for a single structured response.
pub const MAX_RESPONSE_SIZE: usize = 64 * 1024 * 1024;

/// How long a text response may stay silent before it is taken as complete.
const TEXT_QUIET: Duration = Duration::from_millis(50);

/// Host end of the control channel.
///
/// The configuration is length-framed. Every later exchange is one
/// instruction write followed by the response, so a client must never have
/// two instructions in flight. Structured responses are read until they
/// decode; text responses until the guest goes quiet or closes.
pub struct GuestClient<S> {
    stream: S,
    buf: Vec<u8>,
}

impl<S> GuestClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            buf: vec![0u8; READ_CHUNK],
        }
    }

    pub async fn configure(&mut self, config: &ConfigurationPayload) -> Result<SetupAck> {
        let payload = config.to_msgpack().context("encoding configuration")?;
        fn_proto::write_frame(&mut self.stream, &payload)
            .await
            .context("sending configuration")?;
        let ack: SetupAck = self.read_decoded("setup acknowledgement").await?;
        if !ack.success {
            warn!(error = ?ack.error, "guest setup failed");
        }
        Ok(ack)
    }

    pub async fn run_code(&mut self, payload: &RunCodePayload) -> Result<ExecutionResult> {
        let request = payload.to_msgpack().context("encoding run-code payload")?;
        self.send(&request).await?;
        self.read_decoded("execution result").await
    }

    /// Run a shell command in the guest and return its combined output. A
    /// command with no output yields [`fn_proto::EMPTY_SHELL_REPLY`].
    pub async fn shell(&mut self, command: &str) -> Result<Vec<u8>> {
        let mut request = Vec::with_capacity(command.len() + 1);
        request.push(SHELL_PREFIX);
        request.extend_from_slice(command.as_bytes());
        self.send(&request).await?;
        self.read_text().await
    }

    /// Ask the guest to flush its filesystems and stop.
    pub async fn halt(&mut self) -> Result<Vec<u8>> {
        self.send(HALT_COMMAND).await?;
        let reply = self.read_text().await?;
        if reply != HALT_ACK {
            bail!(
                "unexpected halt acknowledgement {:?}",
                String::from_utf8_lossy(&reply)
            );
        }
        Ok(reply)
    }

    pub fn into_inner(self) -> S {
        self.stream
    }

    async fn send(&mut self, instruction: &[u8]) -> Result<()> {
        if instruction.len() > MAX_INSTRUCTION_SIZE {
            bail!(
                "instruction of {} bytes exceeds the {} byte limit",
                instruction.len(),
                MAX_INSTRUCTION_SIZE
            );
        }
        self.stream
            .write_all(instruction)
            .await
            .context("sending instruction")?;
        self.stream.flush().await?;
        Ok(())
    }

    async fn read_some(&mut self) -> Result<usize> {
        let n = self
            .stream
            .read(&mut self.buf)
            .await
            .context("reading response")?;
        if n == 0 {
            bail!("guest closed the control connection");
        }
        Ok(n)
    }

    /// Accumulate reads until the bytes decode as one complete `T`.
    async fn read_decoded<T: DeserializeOwned>(&mut self, what: &str) -> Result<T> {
        let mut reply = Vec::new();
        loop {
            let n = self
                .read_some()
                .await
                .with_context(|| format!("{} after {} bytes", what, reply.len()))?;
            reply.extend_from_slice(&self.buf[..n]);

            match fn_proto::decode::<T>(&reply) {
                Ok(value) => {
                    debug!(bytes = reply.len(), "{} received", what);
                    return Ok(value);
                }
                Err(e) if e.is_truncated() && reply.len() < MAX_RESPONSE_SIZE => continue,
                Err(e) => return Err(e).with_context(|| format!("decoding {}", what)),
            }
        }
    }

    async fn read_text(&mut self) -> Result<Vec<u8>> {
        let n = self.read_some().await?;
        let mut reply = self.buf[..n].to_vec();
        while reply.len() < MAX_RESPONSE_SIZE {
            match timeout(TEXT_QUIET, self.stream.read(&mut self.buf)).await {
                Ok(Ok(0)) | Err(_) => break,
                Ok(Ok(n)) => reply.extend_from_slice(&self.buf[..n]),
                Ok(Err(e)) => return Err(e).context("reading response"),
            }
        }
        debug!(bytes = reply.len(), "response received");
        Ok(reply)
    }
}

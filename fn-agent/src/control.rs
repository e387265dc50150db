//! The single host connection: readiness handshake, setup exchange.

use anyhow::{Context, Result};
use fn_proto::{ConfigurationPayload, SetupAck, HOST_CID};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::vsock::{knock, VsockListener, VsockStream};

/// Listening side of the control channel. Owned by the top-level run
/// routine and consumed by [`ControlChannel::accept`]: the agent serves
/// exactly one host connection per boot.
pub struct ControlChannel {
    listener: VsockListener,
}

impl ControlChannel {
    pub fn open(port: u32) -> Result<Self> {
        let listener = VsockListener::bind(port)?;
        info!(port = port, "control channel listening");
        Ok(Self { listener })
    }

    /// Tell the host the listener is up by knocking on the same port on
    /// the host side. Failure is logged; the host may still connect.
    pub fn announce_ready(&self) {
        let port = self.listener.port();
        match knock(HOST_CID, port) {
            Ok(()) => debug!(cid = HOST_CID, port = port, "readiness handshake sent"),
            Err(e) => warn!(cid = HOST_CID, port = port, "readiness handshake failed: {:#}", e),
        }
    }

    pub async fn accept(self) -> Result<VsockStream> {
        let stream = self
            .listener
            .accept()
            .await
            .context("accepting host connection")?;
        info!("host connected");
        Ok(stream)
    }
}

/// Read and decode the length-framed configuration message.
pub async fn receive_configuration<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<ConfigurationPayload> {
    let payload = fn_proto::read_frame(reader)
        .await
        .context("reading configuration frame")?;
    debug!(bytes = payload.len(), "configuration received");
    ConfigurationPayload::from_msgpack(&payload).context("decoding configuration")
}

pub async fn send_ack<W: AsyncWrite + Unpin>(writer: &mut W, ack: &SetupAck) -> Result<()> {
    let bytes = fn_proto::encode(ack).context("encoding setup acknowledgement")?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

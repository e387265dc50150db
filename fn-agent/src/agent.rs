use anyhow::Result;
use fn_proto::{SetupAck, CONTROL_PORT};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{error, info};

use crate::bridge::Bridge;
use crate::control::{self, ControlChannel};
use crate::dispatch::{Dispatcher, SessionEnd};
use crate::loader::{self, PluginLoader};
use crate::native::NativeLoader;
use crate::paths::Layout;
use crate::setup::{GuestProvisioner, Provisioner};
use crate::system;

/// Boot sequence: listen, handshake, take the one host connection, set up,
/// then serve instructions until halt or disconnect.
pub async fn run() -> Result<SessionEnd> {
    system::export_workload_environment();

    let layout = Layout::default();
    let channel = ControlChannel::open(CONTROL_PORT)?;
    channel.announce_ready();
    let mut stream = channel.accept().await?;

    let provisioner = GuestProvisioner::new(layout.clone());
    let mut dispatcher = start(&mut stream, &layout, &provisioner, &NativeLoader).await?;
    dispatcher.serve(&mut stream).await
}

/// Exit status for the way the agent stopped. A halt or a host that went
/// away is a clean stop.
pub fn exit_code(outcome: &Result<SessionEnd>) -> i32 {
    match outcome {
        Ok(SessionEnd::Halted | SessionEnd::Disconnected) => 0,
        Err(_) => 1,
    }
}

/// Receive the configuration, provision the guest, load the workload and
/// acknowledge. A workload that cannot be loaded is reported to the host
/// and then returned as an error.
pub async fn start<S>(
    stream: &mut S,
    layout: &Layout,
    provisioner: &dyn Provisioner,
    plugins: &dyn PluginLoader,
) -> Result<Dispatcher>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let config = control::receive_configuration(stream).await?;
    info!(
        vm_hash = %config.vm_hash,
        interface = %String::from(config.interface.clone()),
        encoding = %String::from(config.encoding.clone()),
        "configuration received"
    );

    provisioner.provision(&config).await;

    let loaded = loader::load_workload(&config, layout, plugins)
        .await
        .and_then(|workload| Bridge::new(workload, layout));
    match loaded {
        Ok(bridge) => {
            control::send_ack(stream, &SetupAck::ok()).await?;
            info!("workload ready");
            Ok(Dispatcher::new(bridge))
        }
        Err(e) => {
            error!("workload failed to load: {:#}", e);
            control::send_ack(stream, &SetupAck::failed(e.to_string(), format!("{:?}", e))).await?;
            Err(e.context("workload failed to load"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code() {
        assert_eq!(exit_code(&Ok(SessionEnd::Halted)), 0);
        assert_eq!(exit_code(&Ok(SessionEnd::Disconnected)), 0);
        assert_eq!(exit_code(&Err(anyhow::anyhow!("load failed"))), 1);
    }
}

use async_trait::async_trait;
use fn_proto::ConfigurationPayload;
use tracing::info;

use crate::paths::Layout;
use crate::{mounts, network, system};

/// Applies the system side of a configuration before the workload loads.
#[async_trait]
pub trait Provisioner: Send + Sync {
    async fn provision(&self, config: &ConfigurationPayload);
}

/// Configures the running guest: identity, environment, volumes, network,
/// input data, in that order. Every step is best-effort.
pub struct GuestProvisioner {
    layout: Layout,
}

impl GuestProvisioner {
    pub fn new(layout: Layout) -> Self {
        Self { layout }
    }
}

#[async_trait]
impl Provisioner for GuestProvisioner {
    async fn provision(&self, config: &ConfigurationPayload) {
        system::set_identity(&config.vm_hash);
        system::set_variables(config.variables.as_ref());
        mounts::mount_volumes(&config.volumes, &self.layout).await;
        network::configure(
            config.ip.as_deref(),
            config.route.as_deref(),
            &config.dns_servers,
            &self.layout,
        )
        .await;
        system::extract_input_data(config.input_bytes(), &self.layout).await;
        info!("system setup finished");
    }
}

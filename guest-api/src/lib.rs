//! HTTP API served to guest workloads on a unix socket.
//!
//! Workloads reach the ledger, the host's signing connector and a small
//! key/value cache through this process instead of talking to the network
//! directly. Cache keys are namespaced by the VM identity so that VMs
//! sharing a store never see each other's entries.

pub mod cache;
pub mod error;
pub mod routes;

use std::sync::Arc;

use cache::CacheStore;

pub const DEFAULT_API_SERVER: &str = "https://api2.aleph.im";
pub const DEFAULT_CONNECTOR: &str = "http://localhost:4021";

/// Identity used when the VM hash is unknown.
pub const ANONYMOUS_VM: &str = "_";

/// Value written over the sender address of reposted pubsub messages.
pub const REPOST_ADDRESS: &str = "VM on executor";

#[derive(Debug, Clone)]
pub struct Settings {
    pub vm_hash: String,
    /// Base URL of the remote ledger read API.
    pub api_server: String,
    /// Base URL of the host-side signing connector.
    pub connector: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            vm_hash: ANONYMOUS_VM.into(),
            api_server: DEFAULT_API_SERVER.into(),
            connector: DEFAULT_CONNECTOR.into(),
        }
    }
}

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub client: reqwest::Client,
    pub cache: Arc<dyn CacheStore>,
}

impl AppState {
    pub fn new(settings: Settings, cache: Arc<dyn CacheStore>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().no_proxy().build()?;
        Ok(Self {
            settings: Arc::new(settings),
            client,
            cache,
        })
    }

    pub(crate) fn cache_key(&self, key: &str) -> String {
        format!("{}:{}", self.settings.vm_hash, key)
    }
}

pub use routes::router;

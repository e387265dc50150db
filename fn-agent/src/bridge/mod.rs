//! Run one request against the loaded workload.

pub mod in_process;
pub mod proxy;

use fn_proto::{ExecutionResult, Scope, APP_PORT};
use tokio::process::Child;
use tracing::warn;

use crate::loader::Workload;
use crate::paths::Layout;

pub use in_process::InProcessBridge;
pub use proxy::ProxyBridge;

pub enum Bridge {
    InProcess(InProcessBridge),
    /// Requests are forwarded over loopback HTTP to a child process.
    ReverseProxy { proxy: ProxyBridge, process: Child },
}

impl Bridge {
    pub fn new(workload: Workload, layout: &Layout) -> anyhow::Result<Self> {
        Ok(match workload {
            Workload::InProcess(app) => Bridge::InProcess(InProcessBridge::new(app, layout.data_dir())),
            Workload::Process(process) => Bridge::ReverseProxy {
                proxy: ProxyBridge::new(&format!("http://127.0.0.1:{}", APP_PORT))?,
                process,
            },
        })
    }

    pub async fn run(&mut self, scope: Scope) -> ExecutionResult {
        match self {
            Bridge::InProcess(bridge) => bridge.run(scope).await,
            Bridge::ReverseProxy { proxy, process } => {
                // Not restarted: the host decides what to do with a dead VM
                if let Ok(Some(status)) = process.try_wait() {
                    warn!(status = %status, "workload process has exited");
                }
                proxy.run(scope).await
            }
        }
    }
}

/// Failure result carrying the full error chain as its traceback.
pub fn failure(error: &anyhow::Error, output: Option<String>) -> ExecutionResult {
    ExecutionResult::Failure {
        error: error.to_string(),
        traceback: format!("{:?}", error),
        output,
    }
}

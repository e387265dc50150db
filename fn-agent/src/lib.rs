//! Guest init agent for function microVMs.
//!
//! Runs as PID 1. Accepts one control connection from the host over vsock,
//! applies the configuration it receives, loads the workload, then answers
//! run-code, shell and halt instructions until told to stop.

pub mod agent;
pub mod app;
pub mod archive;
pub mod bridge;
pub mod capture;
pub mod control;
pub mod dispatch;
pub mod exec;
pub mod loader;
pub mod mounts;
pub mod native;
pub mod network;
pub mod paths;
pub mod setup;
pub mod system;
pub mod vsock;

pub use app::{AppChannel, Application, RequestEvent};
pub use dispatch::{Dispatcher, SessionEnd};
pub use loader::{PluginLoader, Workload};
pub use paths::Layout;
pub use setup::Provisioner;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use guest_api::cache::MemoryCache;
use guest_api::{router, AppState, Settings, ANONYMOUS_VM, DEFAULT_API_SERVER, DEFAULT_CONNECTOR};
use tokio::net::UnixListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "guest-api", version, about = "HTTP API for guest workloads on a unix socket")]
struct Args {
    /// Unix socket to listen on
    #[arg(long, env = "GUEST_API_SOCKET", default_value = "/tmp/guest-api")]
    socket: PathBuf,

    /// Identity of the VM; signing is restricted to this address
    #[arg(long, env = "ALEPH_VM_HASH")]
    vm_hash: Option<String>,

    /// Remote ledger API proxied for read requests
    #[arg(long, env = "ALEPH_API_SERVER", default_value = DEFAULT_API_SERVER)]
    api_server: String,

    /// Host-side signing connector
    #[arg(long, env = "ALEPH_VM_CONNECTOR", default_value = DEFAULT_CONNECTOR)]
    connector: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .with_ansi(false)
        .with_writer(std::io::stderr)
        .init();

    let settings = Settings {
        vm_hash: args.vm_hash.unwrap_or_else(|| ANONYMOUS_VM.into()),
        api_server: args.api_server.trim_end_matches('/').to_string(),
        connector: args.connector.trim_end_matches('/').to_string(),
    };
    let state = AppState::new(settings, Arc::new(MemoryCache::new()))?;

    // A socket left over from a previous run blocks bind
    if args.socket.exists() {
        std::fs::remove_file(&args.socket)
            .with_context(|| format!("removing stale socket {}", args.socket.display()))?;
    }
    let listener = UnixListener::bind(&args.socket)
        .with_context(|| format!("binding {}", args.socket.display()))?;
    info!(socket = %args.socket.display(), vm_hash = %state.settings.vm_hash, "guest API listening");

    axum::serve(listener, router(state))
        .await
        .context("serving guest API")
}

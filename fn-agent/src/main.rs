use fn_agent::{agent, system, SessionEnd};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .with_ansi(false)
        .with_writer(std::io::stderr)
        .init();

    info!("fn-agent starting");

    let outcome = agent::run().await;
    match &outcome {
        Ok(SessionEnd::Halted) => info!("halting"),
        Ok(SessionEnd::Disconnected) => warn!("control connection lost, shutting down"),
        Err(e) => {
            eprintln!("[fn-agent] ==========================================");
            eprintln!("[fn-agent] FATAL ERROR: guest agent cannot continue");
            eprintln!("[fn-agent] Error: {:?}", e);
            eprintln!("[fn-agent] ==========================================");
        }
    }

    system::power_off(agent::exit_code(&outcome)).await
}

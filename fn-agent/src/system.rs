use std::collections::HashMap;
use tokio::{
    process::Command,
    time::{sleep, Duration, Instant},
};
use tracing::{debug, error, info, warn};

use crate::archive;
use crate::paths::Layout;

/// Environment variable carrying the VM identity for signing helpers.
pub const IDENTITY_VAR: &str = "ALEPH_ADDRESS_TO_USE";

/// Unix socket the host exposes its API proxy on inside the guest.
pub const API_SOCKET: &str = "/tmp/socat-socket";

/// Variables every workload sees, exported before anything else runs.
const WORKLOAD_ENVIRONMENT: [(&str, &str); 4] = [
    ("ALEPH_API_HOST", "http://localhost"),
    ("ALEPH_API_UNIX_SOCKET", API_SOCKET),
    ("ALEPH_REMOTE_CRYPTO_HOST", "http://localhost"),
    ("ALEPH_REMOTE_CRYPTO_UNIX_SOCKET", API_SOCKET),
];

const SYNC_TIMEOUT: Duration = Duration::from_secs(2);

/// Forced shutdown commands, tried in order. x86 guests boot with
/// `reboot=t`, so a reboot triple-faults and the VMM sees the VM exit.
#[cfg(target_arch = "aarch64")]
const POWER_OFF: &[&str] = &["poweroff", "reboot"];
#[cfg(not(target_arch = "aarch64"))]
const POWER_OFF: &[&str] = &["reboot"];

const POWER_OFF_GRACE: Duration = Duration::from_secs(2);

pub fn export_workload_environment() {
    for (key, value) in WORKLOAD_ENVIRONMENT {
        std::env::set_var(key, value);
    }
}

/// Set the hostname to the VM identity and expose it to workloads.
pub fn set_identity(vm_hash: &str) {
    match nix::unistd::sethostname(vm_hash) {
        Ok(()) => info!(hostname = vm_hash, "hostname set"),
        Err(e) => warn!(hostname = vm_hash, "failed to set hostname: {}", e),
    }
    std::env::set_var(IDENTITY_VAR, vm_hash);
}

pub fn set_variables(variables: Option<&HashMap<String, String>>) {
    let Some(variables) = variables else {
        return;
    };
    for (key, value) in variables {
        if key.is_empty() || key.contains('=') || key.contains('\0') || value.contains('\0') {
            warn!(key = %key, "skipping invalid environment variable");
            continue;
        }
        std::env::set_var(key, value);
    }
    info!(count = variables.len(), "environment variables set");
}

/// Write the input archive and expand it into the data directory.
///
/// Runs once per boot: an input archive already on disk means a previous
/// setup expanded it.
pub async fn extract_input_data(data: &[u8], layout: &Layout) {
    if data.is_empty() {
        return;
    }
    let archive_path = layout.input_archive();
    if archive_path.exists() {
        debug!(path = %archive_path.display(), "input data already present");
        return;
    }

    let data = data.to_vec();
    let opt_dir = layout.opt_dir();
    let data_dir = layout.data_dir();
    let result = tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
        std::fs::create_dir_all(&opt_dir)?;
        std::fs::write(&archive_path, &data)?;
        archive::extract_zip(&archive_path, &data_dir)
    })
    .await;

    match result {
        Ok(Ok(())) => info!(dir = %layout.data_dir().display(), "input data extracted"),
        Ok(Err(e)) => warn!("failed to extract input data: {:#}", e),
        Err(e) => warn!("input data extraction task failed: {}", e),
    }
}

/// Flush filesystem buffers, giving up after two seconds.
pub async fn sync_filesystems() {
    let started = Instant::now();
    let mut child = match Command::new("sync").spawn() {
        Ok(child) => child,
        Err(e) => {
            warn!("failed to spawn sync: {}", e);
            return;
        }
    };

    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                debug!(elapsed = ?started.elapsed(), status = %status, "sync completed");
                return;
            }
            Ok(None) => {}
            Err(e) => {
                warn!("sync wait error: {}", e);
                return;
            }
        }
        if started.elapsed() >= SYNC_TIMEOUT {
            warn!("sync timed out after {:?}, killing it", SYNC_TIMEOUT);
            let _ = child.kill().await;
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
}

/// Whether this process is the guest's init.
pub fn is_init() -> bool {
    std::process::id() == 1
}

/// Stop the VM and never return.
///
/// Init must not exit (the kernel panics), so as PID 1 this flushes
/// filesystems and works through the forced shutdown commands, then the
/// sysrq trigger. Any other process simply exits with `exit_code`.
pub async fn power_off(exit_code: i32) -> ! {
    if !is_init() {
        std::process::exit(exit_code);
    }

    info!(exit_code, "shutting down VM");
    sync_filesystems().await;

    for command in POWER_OFF {
        info!("calling {} -f", command);
        if let Err(e) = Command::new(command).arg("-f").spawn() {
            warn!("failed to spawn {}: {}", command, e);
        }
        sleep(POWER_OFF_GRACE).await;
        warn!("{} -f did not complete after {:?}", command, POWER_OFF_GRACE);
    }

    warn!("trying sysrq reboot");
    if let Err(e) = std::fs::write("/proc/sysrq-trigger", "b") {
        warn!("sysrq trigger failed: {}", e);
    }
    sleep(Duration::from_secs(1)).await;

    error!("VM shutdown failed");
    std::process::exit(exit_code)
}

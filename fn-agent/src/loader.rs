//! Turn the delivered code into a runnable workload.
//!
//! | interface  | plain                  | zip                          | squashfs              |
//! |------------|------------------------|------------------------------|-----------------------|
//! | in-process | write `/opt/app.so`    | extract to `/opt`, resolve   | resolve in `/opt/code`|
//! | executable | write `/opt/executable`| extract to `/opt`, run entry | run `/opt/code/entry` |

use anyhow::{anyhow, bail, Context, Result};
use fn_proto::{ConfigurationPayload, Encoding, Interface};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::process::{Child, Command};
use tokio::time::{sleep, Duration};
use tracing::{debug, info, warn};

use crate::app::Application;
use crate::archive;
use crate::paths::Layout;

const SPAWN_ATTEMPTS: u32 = 5;

/// The running application, owned by the dispatcher.
pub enum Workload {
    InProcess(Arc<dyn Application>),
    /// Child process expected to serve HTTP on the loopback application port.
    Process(Child),
}

impl std::fmt::Debug for Workload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Workload::InProcess(_) => f.write_str("Workload::InProcess"),
            Workload::Process(child) => write!(f, "Workload::Process(pid {:?})", child.id()),
        }
    }
}

/// Resolves an in-process application from a file and an exported symbol.
pub trait PluginLoader: Send + Sync {
    fn load(&self, path: &Path, symbol: &str) -> Result<Arc<dyn Application>>;
}

pub async fn load_workload(
    config: &ConfigurationPayload,
    layout: &Layout,
    plugins: &dyn PluginLoader,
) -> Result<Workload> {
    match &config.interface {
        Interface::InProcess => load_in_process(config, layout, plugins).map(Workload::InProcess),
        Interface::Executable => start_executable(config, layout).await.map(Workload::Process),
        Interface::Unknown(name) => bail!("unknown interface '{}'", name),
    }
}

fn load_in_process(
    config: &ConfigurationPayload,
    layout: &Layout,
    plugins: &dyn PluginLoader,
) -> Result<Arc<dyn Application>> {
    let (path, symbol) = match &config.encoding {
        Encoding::Plain => {
            let path = layout.plain_library();
            write_code(&path, &config.code)?;
            (path, config.entrypoint.clone())
        }
        Encoding::Zip => {
            let archive_path = layout.code_archive();
            if archive_path.exists() {
                debug!("code archive already extracted");
            } else {
                write_code(&archive_path, &config.code)?;
                archive::extract_zip(&archive_path, &layout.opt_dir())?;
            }
            resolve_module(&layout.opt_dir(), &config.entrypoint)?
        }
        Encoding::Squashfs => resolve_module(&layout.code_dir(), &config.entrypoint)?,
        Encoding::Unknown(name) => bail!("unknown encoding '{}'", name),
    };

    info!(path = %path.display(), symbol = %symbol, "loading in-process application");
    plugins
        .load(&path, &symbol)
        .with_context(|| format!("loading {} from {}", symbol, path.display()))
}

/// Resolve `module:symbol` under `root`. Dots in the module name separate
/// directories; the module is `<name>.so` or `lib<name>.so`.
fn resolve_module(root: &Path, entrypoint: &str) -> Result<(PathBuf, String)> {
    let (module, symbol) = entrypoint
        .split_once(':')
        .filter(|(m, s)| !m.is_empty() && !s.is_empty())
        .ok_or_else(|| anyhow!("entrypoint '{}' is not of the form module:symbol", entrypoint))?;

    let relative: PathBuf = module.split('.').collect();
    let name = module.rsplit('.').next().unwrap_or(module);
    let candidates = [
        root.join(&relative).with_extension("so"),
        root.join(&relative)
            .with_file_name(format!("lib{}.so", name)),
    ];

    candidates
        .into_iter()
        .find(|candidate| candidate.is_file())
        .map(|path| (path, symbol.to_string()))
        .ok_or_else(|| {
            anyhow!(
                "module '{}' not found under {}, contents:\n{}",
                module,
                root.display(),
                archive::list_tree(root)
            )
        })
}

async fn start_executable(config: &ConfigurationPayload, layout: &Layout) -> Result<Child> {
    let path = match &config.encoding {
        Encoding::Plain => {
            let path = layout.plain_executable();
            write_code(&path, &config.code)?;
            path
        }
        Encoding::Zip => {
            let archive_path = layout.code_archive();
            write_code(&archive_path, &config.code)?;
            archive::extract_zip(&archive_path, &layout.opt_dir())?;
            existing_entry(&layout.opt_dir(), &config.entrypoint)?
        }
        Encoding::Squashfs => existing_entry(&layout.code_dir(), &config.entrypoint)?,
        Encoding::Unknown(name) => bail!("unknown encoding '{}'", name),
    };

    // The code image may be read-only; the file can already be executable
    if let Err(e) = std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)) {
        warn!(path = %path.display(), "could not mark entrypoint executable: {}", e);
    }

    let child = spawn(&path).await?;
    info!(path = %path.display(), pid = ?child.id(), "workload process started");
    Ok(child)
}

fn existing_entry(root: &Path, entrypoint: &str) -> Result<PathBuf> {
    let path = root.join(entrypoint);
    if !path.is_file() {
        bail!(
            "entrypoint {} not found, contents of {}:\n{}",
            path.display(),
            root.display(),
            archive::list_tree(root)
        );
    }
    Ok(path)
}

async fn spawn(path: &Path) -> Result<Child> {
    let mut attempt = 1;
    loop {
        match Command::new(path).spawn() {
            Ok(child) => return Ok(child),
            // A concurrent fork may still hold the freshly written file open
            Err(e) if e.raw_os_error() == Some(libc::ETXTBSY) && attempt < SPAWN_ATTEMPTS => {
                attempt += 1;
                sleep(Duration::from_millis(10)).await;
            }
            Err(e) => return Err(e).with_context(|| format!("starting {}", path.display())),
        }
    }
}

fn write_code(path: &Path, code: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
    }
    std::fs::write(path, code).with_context(|| format!("writing {}", path.display()))
}

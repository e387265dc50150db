use fn_proto::Volume;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::paths::Layout;

/// Arguments for `mount`: read-only volumes are squashfs images, writable
/// ones let the kernel detect the filesystem type.
pub fn mount_args(volume: &Volume, layout: &Layout) -> Vec<String> {
    let device = layout.device(&volume.device).to_string_lossy().into_owned();
    let target = layout.resolve(&volume.mount).to_string_lossy().into_owned();
    if volume.read_only {
        vec![
            "-t".into(),
            "squashfs".into(),
            "-o".into(),
            "ro".into(),
            device,
            target,
        ]
    } else {
        vec!["-o".into(), "rw".into(), device, target]
    }
}

/// Mount every volume. A volume that fails to mount is logged and skipped.
pub async fn mount_volumes(volumes: &[Volume], layout: &Layout) {
    for volume in volumes {
        let target = layout.resolve(&volume.mount);
        if let Err(e) = tokio::fs::create_dir_all(&target).await {
            warn!(mount = %volume.mount, "failed to create mount point: {}", e);
            continue;
        }

        let output = Command::new("mount")
            .args(mount_args(volume, layout))
            .output()
            .await;
        match output {
            Ok(o) if o.status.success() => info!(
                device = %volume.device,
                mount = %volume.mount,
                read_only = volume.read_only,
                "volume mounted"
            ),
            Ok(o) => warn!(
                device = %volume.device,
                mount = %volume.mount,
                "mount failed: {}",
                String::from_utf8_lossy(&o.stderr).trim()
            ),
            Err(e) => warn!(device = %volume.device, "failed to run mount: {}", e),
        }
    }

    if !volumes.is_empty() {
        log_mount_table().await;
    }
}

async fn log_mount_table() {
    match tokio::fs::read_to_string("/proc/mounts").await {
        Ok(table) => debug!("mounts:\n{}", table.trim_end()),
        Err(e) => debug!("could not read /proc/mounts: {}", e),
    }
}

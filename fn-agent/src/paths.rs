use std::path::{Path, PathBuf};

/// Name of the guest's primary network interface.
pub const PRIMARY_INTERFACE: &str = "eth0";

/// Filesystem locations the agent reads and writes inside the guest.
///
/// `Layout::default()` is the real guest layout rooted at `/`. Tests use
/// [`Layout::rooted`] to relocate everything under a temporary directory.
#[derive(Debug, Clone)]
pub struct Layout {
    root: PathBuf,
}

impl Default for Layout {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/"),
        }
    }
}

impl Layout {
    pub fn rooted(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolve an absolute guest path against the layout root.
    pub fn resolve(&self, guest_path: impl AsRef<Path>) -> PathBuf {
        let guest_path = guest_path.as_ref();
        self.root
            .join(guest_path.strip_prefix("/").unwrap_or(guest_path))
    }

    /// Working directory for delivered code and its archives.
    pub fn opt_dir(&self) -> PathBuf {
        self.resolve("/opt")
    }

    /// Mount point of the read-only code image (squashfs encoding).
    pub fn code_dir(&self) -> PathBuf {
        self.resolve("/opt/code")
    }

    pub fn code_archive(&self) -> PathBuf {
        self.resolve("/opt/archive.zip")
    }

    /// Where plain code is written for the executable interface.
    pub fn plain_executable(&self) -> PathBuf {
        self.resolve("/opt/executable")
    }

    /// Where plain code is written for the in-process interface.
    pub fn plain_library(&self) -> PathBuf {
        self.resolve("/opt/app.so")
    }

    pub fn input_archive(&self) -> PathBuf {
        self.resolve("/opt/input.zip")
    }

    /// Input data is expanded here; anything left here after a call is
    /// returned to the host as the output archive.
    pub fn data_dir(&self) -> PathBuf {
        self.resolve("/data")
    }

    pub fn resolv_conf(&self) -> PathBuf {
        self.resolve("/etc/resolv.conf")
    }

    pub fn primary_interface(&self) -> PathBuf {
        self.resolve("/sys/class/net").join(PRIMARY_INTERFACE)
    }

    pub fn device(&self, name: &str) -> PathBuf {
        self.resolve("/dev").join(name)
    }
}

//! Redirect the process-wide standard output into a buffer.

use anyhow::{Context, Result};
use nix::fcntl::OFlag;
use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::thread::JoinHandle;

/// Active redirection of fd 1. Standard output is process-wide, so at most
/// one capture may be active at a time; callers serialize on a lock.
pub struct StdoutCapture {
    saved: OwnedFd,
    reader: JoinHandle<Vec<u8>>,
}

impl StdoutCapture {
    pub fn start() -> Result<Self> {
        let _ = std::io::stdout().flush();

        let (read_end, write_end) =
            nix::unistd::pipe2(OFlag::O_CLOEXEC).context("creating capture pipe")?;

        let saved = unsafe { libc::dup(libc::STDOUT_FILENO) };
        if saved < 0 {
            return Err(std::io::Error::last_os_error()).context("saving stdout");
        }
        let saved = unsafe { OwnedFd::from_raw_fd(saved) };

        if unsafe { libc::dup2(write_end.as_raw_fd(), libc::STDOUT_FILENO) } < 0 {
            return Err(std::io::Error::last_os_error()).context("redirecting stdout");
        }
        // fd 1 now holds the only write end
        drop(write_end);

        let reader = std::thread::spawn(move || {
            let mut output = Vec::new();
            let _ = File::from(read_end).read_to_end(&mut output);
            output
        });

        Ok(Self { saved, reader })
    }

    /// Restore the original stdout and return everything written meanwhile.
    pub fn finish(self) -> String {
        let _ = std::io::stdout().flush();
        unsafe { libc::dup2(self.saved.as_raw_fd(), libc::STDOUT_FILENO) };
        let output = self.reader.join().unwrap_or_default();
        String::from_utf8_lossy(&output).into_owned()
    }
}

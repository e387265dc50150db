//! Shell instructions.

use anyhow::{Context, Result};
use nix::fcntl::OFlag;
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::debug;

/// Run `line` with `/bin/sh -c` and return its combined stdout and stderr.
///
/// A non-zero exit prefixes the output with a one-line description of the
/// failure. Errors that prevent the shell from running are reported as text.
pub async fn run_shell(line: &[u8]) -> Vec<u8> {
    let line = String::from_utf8_lossy(line);
    debug!(command = %line, "running shell instruction");

    match run_combined(&line).await {
        Ok((status, output)) if status.success() => output,
        Ok((status, output)) => {
            let mut reply = describe_failure(&line, status).into_bytes();
            reply.push(b'\n');
            reply.extend_from_slice(&output);
            reply
        }
        Err(e) => format!("{:#}\n", e).into_bytes(),
    }
}

async fn run_combined(line: &str) -> Result<(ExitStatus, Vec<u8>)> {
    let (read_end, write_end) =
        nix::unistd::pipe2(OFlag::O_CLOEXEC).context("creating output pipe")?;
    let stderr_end = write_end.try_clone().context("duplicating output pipe")?;

    let mut command = Command::new("/bin/sh");
    command
        .arg("-c")
        .arg(line)
        .stdin(Stdio::null())
        .stdout(Stdio::from(write_end))
        .stderr(Stdio::from(stderr_end));
    let mut child = command.spawn().context("spawning /bin/sh")?;
    // Release our copies of the write end so EOF arrives when the shell exits
    drop(command);

    let mut output = Vec::new();
    tokio::fs::File::from_std(std::fs::File::from(read_end))
        .read_to_end(&mut output)
        .await
        .context("reading shell output")?;
    let status = child.wait().await.context("waiting for shell")?;
    Ok((status, output))
}

fn describe_failure(line: &str, status: ExitStatus) -> String {
    match (status.code(), status.signal()) {
        (Some(code), _) => format!("Command '{}' returned non-zero exit status {}.", line, code),
        (None, Some(signal)) => format!("Command '{}' died with signal {}.", line, signal),
        (None, None) => format!("Command '{}' failed: {}.", line, status),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_echo() {
        assert_eq!(run_shell(b"echo hello").await, b"hello\n");
    }

    #[tokio::test]
    async fn test_stderr_is_interleaved() {
        let output = run_shell(b"echo out; echo err >&2; echo out2").await;
        assert_eq!(output, b"out\nerr\nout2\n");
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_described() {
        let output = run_shell(b"echo partial; exit 3").await;
        assert_eq!(
            String::from_utf8(output).unwrap(),
            "Command 'echo partial; exit 3' returned non-zero exit status 3.\npartial\n"
        );
    }

    #[tokio::test]
    async fn test_empty_command_succeeds() {
        assert!(run_shell(b"").await.is_empty());
    }
}

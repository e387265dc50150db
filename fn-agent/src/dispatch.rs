use anyhow::{Context, Result};
use fn_proto::{
    ExecutionResult, Instruction, RunCodePayload, EMPTY_SHELL_REPLY, HALT_ACK,
    MAX_INSTRUCTION_SIZE,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, error, info};

use crate::bridge::{failure, Bridge};
use crate::{exec, system};

/// Longest instruction prefix echoed to the debug log.
const LOG_PREVIEW: usize = 500;

/// Why the instruction loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The host sent `halt`; filesystems are flushed and the ack is written.
    Halted,
    /// The host closed the connection.
    Disconnected,
}

enum Reply {
    Send(Vec<u8>),
    Halt,
}

/// Serves instructions for the lifetime of the control connection. Owns
/// the workload.
pub struct Dispatcher {
    bridge: Bridge,
}

impl Dispatcher {
    pub fn new(bridge: Bridge) -> Self {
        Self { bridge }
    }

    /// Read one instruction, answer it, repeat.
    ///
    /// Instructions are not length-framed: a read is taken to be one whole
    /// instruction, which holds while the host waits for every response
    /// before sending the next one. A run-code payload that stops short of a
    /// complete msgpack value is topped up with further reads.
    pub async fn serve<S>(&mut self, stream: &mut S) -> Result<SessionEnd>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut buf = vec![0u8; MAX_INSTRUCTION_SIZE];
        loop {
            let mut n = stream.read(&mut buf).await.context("reading instruction")?;
            if n == 0 {
                info!("host closed the control connection");
                return Ok(SessionEnd::Disconnected);
            }

            while n < buf.len() && incomplete_payload(&buf[..n]) {
                let more = stream
                    .read(&mut buf[n..])
                    .await
                    .context("reading instruction")?;
                if more == 0 {
                    info!("host closed the control connection mid-instruction");
                    return Ok(SessionEnd::Disconnected);
                }
                n += more;
            }

            match self.handle(&buf[..n]).await {
                Reply::Send(response) => {
                    stream.write_all(&response).await.context("writing response")?;
                    stream.flush().await?;
                }
                Reply::Halt => {
                    stream.write_all(HALT_ACK).await.context("writing halt ack")?;
                    stream.flush().await?;
                    info!("halt acknowledged");
                    return Ok(SessionEnd::Halted);
                }
            }
        }
    }

    async fn handle(&mut self, data: &[u8]) -> Reply {
        debug!(
            bytes = data.len(),
            "instruction: {}",
            String::from_utf8_lossy(&data[..data.len().min(LOG_PREVIEW)])
        );

        match Instruction::parse(data) {
            Instruction::Halt => {
                system::sync_filesystems().await;
                Reply::Halt
            }
            Instruction::Shell(line) => {
                let output = exec::run_shell(line).await;
                if output.is_empty() {
                    Reply::Send(EMPTY_SHELL_REPLY.to_vec())
                } else {
                    Reply::Send(output)
                }
            }
            Instruction::RunCode(payload) => Reply::Send(self.run_code(payload).await),
        }
    }

    async fn run_code(&mut self, payload: &[u8]) -> Vec<u8> {
        let result = match RunCodePayload::from_msgpack(payload) {
            Ok(payload) => self.bridge.run(payload.scope).await,
            Err(e) => failure(
                &anyhow::Error::new(e).context("decoding run-code payload"),
                None,
            ),
        };
        encode_result(&result)
    }
}

fn incomplete_payload(data: &[u8]) -> bool {
    match Instruction::parse(data) {
        Instruction::RunCode(payload) => RunCodePayload::from_msgpack(payload)
            .err()
            .is_some_and(|e| e.is_truncated()),
        _ => false,
    }
}

fn encode_result(result: &ExecutionResult) -> Vec<u8> {
    match result.to_msgpack() {
        Ok(bytes) => bytes,
        Err(e) => {
            error!("failed to encode execution result: {}", e);
            let fallback = ExecutionResult::failure(
                format!("failed to encode execution result: {}", e),
                format!("{:?}", e),
            );
            fallback
                .to_msgpack()
                .unwrap_or_else(|_| e.to_string().into_bytes())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::{AppChannel, Application};
    use crate::bridge::InProcessBridge;
    use async_trait::async_trait;
    use fn_proto::{Blob, Scope};
    use rmpv::Value;
    use std::sync::Arc;
    use tempfile::TempDir;
    use tokio::io::DuplexStream;
    use tokio::time::Duration;

    struct HelloApp;

    #[async_trait]
    impl Application for HelloApp {
        async fn call(&self, scope: Scope, channel: AppChannel) -> Result<()> {
            channel.send(Value::Map(vec![(Value::from("status"), Value::from(200))]))?;
            channel.send(Value::Map(vec![(
                Value::from("body"),
                Value::Binary(format!("hello {}", scope.path).into_bytes()),
            )]))?;
            Ok(())
        }
    }

    fn dispatcher(data_dir: &std::path::Path) -> Dispatcher {
        let bridge = InProcessBridge::new(Arc::new(HelloApp), data_dir.to_path_buf());
        Dispatcher::new(Bridge::InProcess(bridge))
    }

    async fn exchange(host: &mut DuplexStream, instruction: &[u8]) -> Vec<u8> {
        host.write_all(instruction).await.unwrap();
        let mut buf = vec![0u8; 64 * 1024];
        let n = host.read(&mut buf).await.unwrap();
        buf.truncate(n);
        buf
    }

    fn run_code(path: &str) -> Vec<u8> {
        RunCodePayload {
            scope: Scope {
                kind: "http".into(),
                method: Some("GET".into()),
                path: path.into(),
                query_string: Blob::default(),
                ..Default::default()
            },
        }
        .to_msgpack()
        .unwrap()
    }

    #[tokio::test]
    async fn test_session_serves_each_instruction_kind() {
        let tmp = TempDir::new().unwrap();
        let (mut host, mut guest) = tokio::io::duplex(MAX_INSTRUCTION_SIZE);
        let mut dispatcher = dispatcher(&tmp.path().join("data"));
        let session = tokio::spawn(async move { dispatcher.serve(&mut guest).await });

        assert_eq!(exchange(&mut host, b"!echo hello").await, b"hello\n");

        let reply = exchange(&mut host, &run_code("/world")).await;
        match ExecutionResult::from_msgpack(&reply).unwrap() {
            ExecutionResult::Success { body, .. } => {
                assert_eq!(body["body"].as_slice(), Some(&b"hello /world"[..]))
            }
            other => panic!("expected success, got {:?}", other),
        }

        // Undecodable payloads answer with a failure and keep the session open
        let reply = exchange(&mut host, b"\xc1garbage").await;
        assert!(!ExecutionResult::from_msgpack(&reply).unwrap().is_success());

        assert_eq!(exchange(&mut host, b"halt").await, b"STOP\n");
        assert_eq!(session.await.unwrap().unwrap(), SessionEnd::Halted);
    }

    #[tokio::test]
    async fn test_silent_shell_command_still_replies() {
        let tmp = TempDir::new().unwrap();
        let (mut host, mut guest) = tokio::io::duplex(1024);
        let mut dispatcher = dispatcher(tmp.path());
        let session = tokio::spawn(async move { dispatcher.serve(&mut guest).await });

        let reply = tokio::time::timeout(Duration::from_secs(5), exchange(&mut host, b"!true"))
            .await
            .expect("no reply to a silent command");
        assert_eq!(reply, EMPTY_SHELL_REPLY);

        // Output that happens to be empty on failure still carries the description
        let reply = exchange(&mut host, b"!exit 4").await;
        assert!(String::from_utf8(reply).unwrap().contains("exit status 4"));

        drop(host);
        assert_eq!(session.await.unwrap().unwrap(), SessionEnd::Disconnected);
    }

    #[tokio::test]
    async fn test_run_code_split_across_reads() {
        let tmp = TempDir::new().unwrap();
        let (mut host, mut guest) = tokio::io::duplex(MAX_INSTRUCTION_SIZE);
        let mut dispatcher = dispatcher(&tmp.path().join("data"));
        let session = tokio::spawn(async move { dispatcher.serve(&mut guest).await });

        let payload = run_code("/split");
        let (head, tail) = payload.split_at(payload.len() / 2);
        host.write_all(head).await.unwrap();
        host.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let reply = exchange(&mut host, tail).await;

        match ExecutionResult::from_msgpack(&reply).unwrap() {
            ExecutionResult::Success { body, .. } => {
                assert_eq!(body["body"].as_slice(), Some(&b"hello /split"[..]))
            }
            other => panic!("expected success, got {:?}", other),
        }

        drop(host);
        assert_eq!(session.await.unwrap().unwrap(), SessionEnd::Disconnected);
    }

    #[tokio::test]
    async fn test_close_ends_session() {
        let tmp = TempDir::new().unwrap();
        let (host, mut guest) = tokio::io::duplex(1024);
        let mut dispatcher = dispatcher(tmp.path());
        drop(host);
        assert_eq!(
            dispatcher.serve(&mut guest).await.unwrap(),
            SessionEnd::Disconnected
        );
    }

    #[test]
    fn test_encode_result_is_a_map() {
        let bytes = encode_result(&ExecutionResult::failure("e", "t"));
        assert_eq!(bytes[0] & 0xf0, 0x80);
    }
}

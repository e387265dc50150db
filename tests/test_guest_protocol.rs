//! Host client against the guest agent over an in-memory stream.

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use fn_agent::app::{AppChannel, Application};
use fn_agent::{Layout, PluginLoader, Provisioner, SessionEnd};
use fn_proto::{
    Blob, ConfigurationPayload, Encoding, ExecutionResult, Interface, RunCodePayload, Scope,
    MAX_INSTRUCTION_SIZE,
};
use fnvm::GuestClient;
use rmpv::Value;
use serde_bytes::ByteBuf;
use tempfile::TempDir;
use tokio::io::DuplexStream;
use tokio::task::JoinHandle;

/// Leaves the host system alone.
struct NoProvisioning;

#[async_trait]
impl Provisioner for NoProvisioning {
    async fn provision(&self, _config: &ConfigurationPayload) {}
}

/// Answers HTTP scopes with the request body upper-cased.
struct ShoutApp;

#[async_trait]
impl Application for ShoutApp {
    async fn call(&self, scope: Scope, mut channel: AppChannel) -> Result<()> {
        let body = channel.receive().body.to_ascii_uppercase();
        if scope.path == "/fail" {
            anyhow::bail!("requested failure");
        }
        channel.send(Value::Map(vec![(Value::from("status"), Value::from(201))]))?;
        channel.send(Value::Map(vec![(Value::from("body"), Value::Binary(body))]))?;
        Ok(())
    }
}

struct ShoutLoader;

impl PluginLoader for ShoutLoader {
    fn load(&self, _path: &Path, _symbol: &str) -> Result<Arc<dyn Application>> {
        Ok(Arc::new(ShoutApp))
    }
}

fn config(interface: Interface, encoding: Encoding, entrypoint: &str) -> ConfigurationPayload {
    ConfigurationPayload {
        code: ByteBuf::from(b"\x7fELF".to_vec()),
        encoding,
        entrypoint: entrypoint.into(),
        interface,
        input_data: None,
        vm_hash: "vm-under-test".into(),
        ip: None,
        route: None,
        dns_servers: Vec::new(),
        volumes: Vec::new(),
        variables: None,
    }
}

fn request(path: &str, body: &str) -> RunCodePayload {
    RunCodePayload {
        scope: Scope {
            kind: "http".into(),
            method: Some("POST".into()),
            path: path.into(),
            body: Some(Blob::from(body)),
            ..Default::default()
        },
    }
}

fn spawn_guest(mut stream: DuplexStream, root: &Path) -> JoinHandle<Result<SessionEnd>> {
    let layout = Layout::rooted(root);
    tokio::spawn(async move {
        let mut dispatcher =
            fn_agent::agent::start(&mut stream, &layout, &NoProvisioning, &ShoutLoader).await?;
        dispatcher.serve(&mut stream).await
    })
}

#[tokio::test]
async fn test_full_session() {
    let tmp = TempDir::new().unwrap();
    let (host, guest) = tokio::io::duplex(MAX_INSTRUCTION_SIZE);
    let agent = spawn_guest(guest, tmp.path());
    let mut client = GuestClient::new(host);

    let ack = client
        .configure(&config(Interface::InProcess, Encoding::Plain, "handler"))
        .await
        .unwrap();
    assert!(ack.success, "{:?}", ack);

    match client.run_code(&request("/", "quiet")).await.unwrap() {
        ExecutionResult::Success { headers, body, .. } => {
            assert_eq!(headers["status"].as_u64(), Some(201));
            assert_eq!(body["body"].as_slice(), Some(&b"QUIET"[..]));
        }
        other => panic!("expected success, got {:?}", other),
    }

    // A failing call does not end the session
    match client.run_code(&request("/fail", "")).await.unwrap() {
        ExecutionResult::Failure { error, .. } => assert_eq!(error, "requested failure"),
        other => panic!("expected failure, got {:?}", other),
    }

    assert_eq!(client.shell("echo still here").await.unwrap(), b"still here\n");
    assert_eq!(client.halt().await.unwrap(), b"STOP\n");
    assert_eq!(agent.await.unwrap().unwrap(), SessionEnd::Halted);
}

#[tokio::test]
async fn test_load_failure_is_acknowledged_then_fatal() {
    let tmp = TempDir::new().unwrap();
    let (host, guest) = tokio::io::duplex(MAX_INSTRUCTION_SIZE);
    let agent = spawn_guest(guest, tmp.path());
    let mut client = GuestClient::new(host);

    let ack = client
        .configure(&config(Interface::Executable, Encoding::Squashfs, "missing.sh"))
        .await
        .unwrap();
    assert!(!ack.success);
    assert!(ack.error.unwrap().contains("missing.sh"));
    assert!(ack.traceback.is_some());

    assert!(agent.await.unwrap().is_err());
}

#[tokio::test]
async fn test_unknown_interface_is_acknowledged_as_failure() {
    let tmp = TempDir::new().unwrap();
    let (host, guest) = tokio::io::duplex(MAX_INSTRUCTION_SIZE);
    let agent = spawn_guest(guest, tmp.path());
    let mut client = GuestClient::new(host);

    let ack = client
        .configure(&config(Interface::Unknown("wasi".into()), Encoding::Plain, "x"))
        .await
        .unwrap();
    assert_eq!(ack.error.as_deref(), Some("unknown interface 'wasi'"));
    assert!(agent.await.unwrap().is_err());
}

#[tokio::test]
async fn test_host_disconnect_ends_session() {
    let tmp = TempDir::new().unwrap();
    let (host, guest) = tokio::io::duplex(MAX_INSTRUCTION_SIZE);
    let agent = spawn_guest(guest, tmp.path());
    let mut client = GuestClient::new(host);

    client
        .configure(&config(Interface::InProcess, Encoding::Plain, "handler"))
        .await
        .unwrap();
    drop(client);

    assert_eq!(agent.await.unwrap().unwrap(), SessionEnd::Disconnected);
}

#[tokio::test]
async fn test_large_bodies_over_a_narrow_stream() {
    let tmp = TempDir::new().unwrap();
    let (host, guest) = tokio::io::duplex(64 * 1024);
    let agent = spawn_guest(guest, tmp.path());
    let mut client = GuestClient::new(host);

    client
        .configure(&config(Interface::InProcess, Encoding::Plain, "handler"))
        .await
        .unwrap();

    let body = "a".repeat(200_000);
    match client.run_code(&request("/", &body)).await.unwrap() {
        ExecutionResult::Success { body: reply, .. } => {
            let reply = reply["body"].as_slice().unwrap();
            assert_eq!(reply.len(), 200_000);
            assert!(reply.iter().all(|&b| b == b'A'));
        }
        other => panic!("expected success, got {:?}", other),
    }

    // The session is still in step after the large exchange
    assert_eq!(client.shell("true").await.unwrap(), b"\n");
    assert_eq!(client.shell("echo next").await.unwrap(), b"next\n");
    assert_eq!(client.halt().await.unwrap(), b"STOP\n");
    assert_eq!(agent.await.unwrap().unwrap(), SessionEnd::Halted);
}

use anyhow::{anyhow, bail, Result};
use fn_proto::{ExecutionResult, Scope};
use futures::FutureExt;
use once_cell::sync::Lazy;
use serde_bytes::ByteBuf;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use super::failure;
use crate::app::{AppChannel, Application};
use crate::archive;
use crate::capture::StdoutCapture;

/// Serializes stdout redirection across concurrent calls.
pub(crate) static CAPTURE_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

pub struct InProcessBridge {
    app: Arc<dyn Application>,
    data_dir: PathBuf,
}

impl InProcessBridge {
    pub fn new(app: Arc<dyn Application>, data_dir: PathBuf) -> Self {
        Self { app, data_dir }
    }

    pub async fn run(&self, mut scope: Scope) -> ExecutionResult {
        let body = scope.body.take().map(|b| b.0);
        let is_http = scope.is_http();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let channel = AppChannel::new(scope.request_event_type(), body, tx);

        let _guard = CAPTURE_LOCK.lock().await;
        let capture = match StdoutCapture::start() {
            Ok(capture) => Some(capture),
            Err(e) => {
                warn!("stdout capture unavailable: {:#}", e);
                None
            }
        };

        let outcome = AssertUnwindSafe(self.app.call(scope, channel))
            .catch_unwind()
            .await;
        let output = capture.map(StdoutCapture::finish).unwrap_or_default();

        let called = match outcome {
            Ok(result) => result,
            Err(panic) => Err(anyhow!("application panicked: {}", panic_message(&*panic))),
        };
        if let Err(e) = called {
            debug!("application call failed: {:#}", e);
            return failure(&e, Some(output));
        }

        let mut messages = Vec::new();
        while let Ok(message) = rx.try_recv() {
            messages.push(message);
        }
        let (headers, body) = match split_response(is_http, messages) {
            Ok(parts) => parts,
            Err(e) => return failure(&e, Some(output)),
        };

        let output_data = match self.collect_output_data().await {
            Ok(data) => data,
            Err(e) => return failure(&e, Some(output)),
        };

        ExecutionResult::Success {
            headers,
            body,
            output,
            output_data: Some(ByteBuf::from(output_data)),
        }
    }

    /// Zip of the data directory, or empty bytes when there is nothing in it.
    async fn collect_output_data(&self) -> Result<Vec<u8>> {
        let dir = self.data_dir.clone();
        tokio::task::spawn_blocking(move || {
            if archive::has_entries(&dir) {
                archive::zip_directory(&dir)
            } else {
                Ok(Vec::new())
            }
        })
        .await?
    }
}

/// HTTP scopes answer with exactly a start message and a body message;
/// anything else answers with exactly one body message.
fn split_response(
    is_http: bool,
    messages: Vec<rmpv::Value>,
) -> Result<(rmpv::Value, rmpv::Value)> {
    let expected = if is_http { 2 } else { 1 };
    if messages.len() != expected {
        bail!(
            "application sent {} response message(s), expected {}",
            messages.len(),
            expected
        );
    }
    let mut messages = messages.into_iter();
    let first = messages.next().unwrap_or(rmpv::Value::Nil);
    Ok(match messages.next() {
        Some(second) => (first, second),
        None => (rmpv::Value::Map(Vec::new()), first),
    })
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use fn_proto::Blob;
    use rmpv::Value;
    use std::io::Read;
    use tempfile::TempDir;

    /// Echoes the request body back with a 200 start message.
    struct EchoApp;

    #[async_trait]
    impl Application for EchoApp {
        async fn call(&self, scope: Scope, mut channel: AppChannel) -> Result<()> {
            let event = channel.receive();
            assert_eq!(event.kind, scope.request_event_type());
            if scope.is_http() {
                channel.send(Value::Map(vec![
                    (Value::from("type"), Value::from("http.response.start")),
                    (Value::from("status"), Value::from(200)),
                ]))?;
            }
            channel.send(Value::Map(vec![(
                Value::from("body"),
                Value::Binary(event.body),
            )]))?;
            Ok(())
        }
    }

    /// Sends a fixed number of empty messages.
    struct CountingApp(usize);

    #[async_trait]
    impl Application for CountingApp {
        async fn call(&self, _scope: Scope, channel: AppChannel) -> Result<()> {
            for _ in 0..self.0 {
                channel.send(Value::Map(Vec::new()))?;
            }
            Ok(())
        }
    }

    struct FailingApp;

    #[async_trait]
    impl Application for FailingApp {
        async fn call(&self, _scope: Scope, _channel: AppChannel) -> Result<()> {
            let msg = b"about to fail\n";
            unsafe { libc::write(libc::STDOUT_FILENO, msg.as_ptr().cast(), msg.len()) };
            bail!("handler exploded")
        }
    }

    struct PanickingApp;

    #[async_trait]
    impl Application for PanickingApp {
        async fn call(&self, _scope: Scope, _channel: AppChannel) -> Result<()> {
            panic!("kaboom")
        }
    }

    /// Writes a file into the data directory.
    struct WriterApp(PathBuf);

    #[async_trait]
    impl Application for WriterApp {
        async fn call(&self, _scope: Scope, channel: AppChannel) -> Result<()> {
            std::fs::write(self.0.join("result.txt"), b"42")?;
            channel.send(Value::from("done"))?;
            Ok(())
        }
    }

    fn http_scope(body: &[u8]) -> Scope {
        Scope {
            kind: "http".into(),
            method: Some("POST".into()),
            path: "/".into(),
            body: Some(Blob::from(body)),
            ..Default::default()
        }
    }

    fn message_scope() -> Scope {
        Scope {
            kind: "aleph.message".into(),
            ..Default::default()
        }
    }

    fn bridge(app: impl Application + 'static, data_dir: &std::path::Path) -> InProcessBridge {
        InProcessBridge::new(Arc::new(app), data_dir.to_path_buf())
    }

    #[tokio::test]
    async fn test_http_call_returns_start_and_body() {
        let tmp = TempDir::new().unwrap();
        let result = bridge(EchoApp, &tmp.path().join("data"))
            .run(http_scope(b"ping"))
            .await;

        match result {
            ExecutionResult::Success {
                headers,
                body,
                output_data,
                ..
            } => {
                assert_eq!(headers["status"].as_u64(), Some(200));
                assert_eq!(body["body"].as_slice(), Some(&b"ping"[..]));
                assert_eq!(output_data.unwrap().len(), 0);
            }
            other => panic!("expected success, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_non_http_call_has_empty_headers() {
        let tmp = TempDir::new().unwrap();
        let result = bridge(EchoApp, tmp.path()).run(message_scope()).await;
        match result {
            ExecutionResult::Success { headers, .. } => {
                assert_eq!(headers, Value::Map(Vec::new()));
            }
            other => panic!("expected success, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_wrong_message_count_fails() {
        let tmp = TempDir::new().unwrap();
        for (scope, count) in [
            (http_scope(b""), 0),
            (http_scope(b""), 1),
            (http_scope(b""), 3),
            (message_scope(), 0),
            (message_scope(), 2),
        ] {
            let result = bridge(CountingApp(count), tmp.path()).run(scope).await;
            match result {
                ExecutionResult::Failure { error, .. } => {
                    assert!(error.contains("response message"), "{}", error)
                }
                other => panic!("count {} should fail, got {:?}", count, other),
            }
        }
    }

    #[tokio::test]
    async fn test_application_error_keeps_output() {
        let tmp = TempDir::new().unwrap();
        let result = bridge(FailingApp, tmp.path()).run(message_scope()).await;
        match result {
            ExecutionResult::Failure {
                error,
                traceback,
                output,
            } => {
                assert_eq!(error, "handler exploded");
                assert!(traceback.contains("handler exploded"));
                assert!(output.unwrap().contains("about to fail"));
            }
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_panic_becomes_failure() {
        let tmp = TempDir::new().unwrap();
        let result = bridge(PanickingApp, tmp.path()).run(message_scope()).await;
        match result {
            ExecutionResult::Failure { error, .. } => assert!(error.contains("kaboom")),
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_data_directory_returned_as_zip() {
        let tmp = TempDir::new().unwrap();
        let data_dir = tmp.path().join("data");
        std::fs::create_dir_all(&data_dir).unwrap();

        let result = bridge(WriterApp(data_dir.clone()), &data_dir)
            .run(message_scope())
            .await;
        let output_data = match result {
            ExecutionResult::Success { output_data, .. } => output_data.unwrap(),
            other => panic!("expected success, got {:?}", other),
        };

        let mut zip = zip::ZipArchive::new(std::io::Cursor::new(output_data.into_vec())).unwrap();
        let mut contents = String::new();
        zip.by_name("result.txt")
            .unwrap()
            .read_to_string(&mut contents)
            .unwrap();
        assert_eq!(contents, "42");
    }
}

//! Interface between the bridge and an in-process application.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use fn_proto::Scope;
use serde::Serialize;
use tokio::sync::mpsc;

/// Message returned by [`AppChannel::receive`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RequestEvent {
    #[serde(rename = "type")]
    pub kind: &'static str,
    #[serde(with = "serde_bytes")]
    pub body: Vec<u8>,
    pub more_body: bool,
}

/// Per-call receive/send pair handed to an application.
pub struct AppChannel {
    event_type: &'static str,
    body: Option<Vec<u8>>,
    sent: mpsc::UnboundedSender<rmpv::Value>,
}

impl AppChannel {
    pub fn new(
        event_type: &'static str,
        body: Option<Vec<u8>>,
        sent: mpsc::UnboundedSender<rmpv::Value>,
    ) -> Self {
        Self {
            event_type,
            body,
            sent,
        }
    }

    /// The request body arrives in one event; later calls yield an empty body.
    pub fn receive(&mut self) -> RequestEvent {
        RequestEvent {
            kind: self.event_type,
            body: self.body.take().unwrap_or_default(),
            more_body: false,
        }
    }

    pub fn send(&self, message: rmpv::Value) -> Result<()> {
        self.sent
            .send(message)
            .map_err(|_| anyhow!("response queue closed"))
    }
}

/// An application invoked in-process, once per request.
#[async_trait]
pub trait Application: Send + Sync {
    async fn call(&self, scope: Scope, channel: AppChannel) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_body_is_delivered_once() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut channel = AppChannel::new("http.request", Some(b"payload".to_vec()), tx);

        let first = channel.receive();
        assert_eq!(first.kind, "http.request");
        assert_eq!(first.body, b"payload");
        assert!(!first.more_body);

        let second = channel.receive();
        assert!(second.body.is_empty());
        assert!(!second.more_body);
    }

    #[test]
    fn test_send_preserves_order() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let channel = AppChannel::new("aleph.message", None, tx);
        channel.send(rmpv::Value::from(1)).unwrap();
        channel.send(rmpv::Value::from(2)).unwrap();
        assert_eq!(rx.try_recv().unwrap(), rmpv::Value::from(1));
        assert_eq!(rx.try_recv().unwrap(), rmpv::Value::from(2));
    }

    #[test]
    fn test_send_after_bridge_gone_fails() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let channel = AppChannel::new("aleph.message", None, tx);
        assert!(channel.send(rmpv::Value::Nil).is_err());
    }
}

//! Program message resolution.
//!
//! A program message points at its runtime, code, data and volumes by
//! reference. References flagged `use_latest` follow amendments: before a
//! VM is configured, each one is replaced with the latest amend known to
//! the connector.

use async_trait::async_trait;
use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("connector unavailable: {0}")]
    Unavailable(String),

    #[error("hash not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Other(String),
}

impl ResolveError {
    /// HTTP status a supervisor should answer with.
    pub fn status_code(&self) -> u16 {
        match self {
            ResolveError::Unavailable(_) => 503,
            ResolveError::NotFound(_) => 404,
            ResolveError::Other(_) => 500,
        }
    }
}

/// Pointer to another stored item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reference {
    #[serde(rename = "ref", default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub use_latest: Option<bool>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Reference {
    pub fn follows_latest(&self) -> bool {
        self.use_latest.unwrap_or(false)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgramContent {
    pub runtime: Reference,
    pub code: Reference,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Reference>,
    #[serde(default)]
    pub volumes: Vec<Reference>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgramMessage {
    pub item_hash: String,
    pub content: ProgramContent,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn get_message(&self, reference: &str) -> Result<ProgramMessage, ResolveError>;
    async fn get_latest_amend(&self, reference: &str) -> Result<String, ResolveError>;
}

/// Message store backed by the connector's HTTP API.
pub struct HttpMessageStore {
    client: reqwest::Client,
    base_url: String,
}

impl HttpMessageStore {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), base_url)
    }

    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    async fn fetch(&self, path: &str, reference: &str) -> Result<reqwest::Response, ResolveError> {
        let url = format!("{}/{}/{}", self.base_url, path, reference);
        debug!(url = %url, "fetching from connector");

        let response = self.client.get(&url).send().await.map_err(|e| {
            if e.is_connect() {
                ResolveError::Unavailable(e.to_string())
            } else {
                ResolveError::Other(e.to_string())
            }
        })?;

        match response.status() {
            reqwest::StatusCode::NOT_FOUND => Err(ResolveError::NotFound(reference.to_string())),
            status if !status.is_success() => {
                Err(ResolveError::Other(format!("{} returned {}", url, status)))
            }
            _ => Ok(response),
        }
    }
}

#[async_trait]
impl MessageStore for HttpMessageStore {
    async fn get_message(&self, reference: &str) -> Result<ProgramMessage, ResolveError> {
        self.fetch("download/message", reference)
            .await?
            .json()
            .await
            .map_err(|e| ResolveError::Other(format!("invalid message {}: {}", reference, e)))
    }

    async fn get_latest_amend(&self, reference: &str) -> Result<String, ResolveError> {
        let body = self
            .fetch("compute/latest_amend", reference)
            .await?
            .text()
            .await
            .map_err(|e| ResolveError::Other(e.to_string()))?;
        // The connector answers with a JSON string
        Ok(serde_json::from_str::<String>(&body).unwrap_or_else(|_| body.trim().to_string()))
    }
}

/// Fetch a message and resolve its `use_latest` references.
/// Returns `(updated, original)`.
pub async fn load_updated_message(
    store: &dyn MessageStore,
    reference: &str,
) -> Result<(ProgramMessage, ProgramMessage), ResolveError> {
    let original = store.get_message(reference).await?;
    let mut message = original.clone();
    update_references(store, &mut message.content).await?;
    Ok((message, original))
}

async fn update_references(
    store: &dyn MessageStore,
    content: &mut ProgramContent,
) -> Result<(), ResolveError> {
    let references = std::iter::once(&mut content.runtime)
        .chain(std::iter::once(&mut content.code))
        .chain(content.data.as_mut())
        .chain(content.volumes.iter_mut());

    let pending = references
        .filter(|r| r.follows_latest())
        .map(move |r| async move {
            if let Some(current) = r.reference.as_deref() {
                let latest = store.get_latest_amend(current).await?;
                r.reference = Some(latest);
            }
            Ok::<(), ResolveError>(())
        });

    try_join_all(pending).await?;
    Ok(())
}

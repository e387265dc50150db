use anyhow::{anyhow, Context, Result};
use fn_proto::{ExecutionResult, Scope};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_LENGTH};
use reqwest::{Method, Url};
use rmpv::Value;
use std::time::Duration;
use tokio::time::sleep;
use tracing::debug;

use super::failure;

/// How long to keep trying while the workload is still binding its port.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 20,
            interval: Duration::from_millis(50),
        }
    }
}

/// Forwards scopes as HTTP requests to a workload on loopback.
pub struct ProxyBridge {
    client: reqwest::Client,
    base_url: Url,
    retry: RetryPolicy,
}

impl ProxyBridge {
    pub fn new(base_url: &str) -> Result<Self> {
        Self::with_retry(base_url, RetryPolicy::default())
    }

    pub fn with_retry(base_url: &str, retry: RetryPolicy) -> Result<Self> {
        let client = reqwest::Client::builder()
            .no_proxy()
            .build()
            .context("building HTTP client")?;
        let base_url = Url::parse(base_url).with_context(|| format!("invalid base URL {}", base_url))?;
        Ok(Self {
            client,
            base_url,
            retry,
        })
    }

    pub async fn run(&self, scope: Scope) -> ExecutionResult {
        match self.forward(scope).await {
            Ok((headers, body)) => ExecutionResult::Success {
                headers,
                body,
                output: String::new(),
                output_data: None,
            },
            Err(e) => failure(&e, None),
        }
    }

    async fn forward(&self, scope: Scope) -> Result<(Value, Value)> {
        let request = self.build_request(scope)?;

        let mut attempt = 1;
        loop {
            let pending = request
                .try_clone()
                .ok_or_else(|| anyhow!("request body cannot be replayed"))?;
            match self.client.execute(pending).await {
                Ok(response) => return read_response(response).await,
                Err(e) if e.is_connect() && attempt < self.retry.attempts => {
                    debug!(attempt = attempt, "workload not accepting connections yet");
                    attempt += 1;
                    sleep(self.retry.interval).await;
                }
                Err(e) => {
                    return Err(e)
                        .with_context(|| format!("workload request failed after {} attempt(s)", attempt))
                }
            }
        }
    }

    fn build_request(&self, scope: Scope) -> Result<reqwest::Request> {
        let mut url = self.base_url.clone();
        url.set_path(&scope.path);
        let query = scope.query_string.to_string_lossy();
        url.set_query((!query.is_empty()).then_some(query.as_str()));

        let method = scope.method.as_deref().unwrap_or("GET");
        let method = Method::from_bytes(method.as_bytes())
            .with_context(|| format!("invalid method {:?}", method))?;

        let mut headers = HeaderMap::new();
        for (name, value) in &scope.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .with_context(|| format!("invalid header name {:?}", name.to_string_lossy()))?;
            if name == CONTENT_LENGTH {
                continue;
            }
            let value = HeaderValue::from_bytes(value.as_bytes())
                .with_context(|| format!("invalid value for header {}", name))?;
            headers.append(name, value);
        }

        let mut request = self.client.request(method, url).headers(headers);
        if let Some(body) = scope.body {
            request = request.body(body.0);
        }
        request.build().context("building workload request")
    }
}

async fn read_response(response: reqwest::Response) -> Result<(Value, Value)> {
    let status = response.status().as_u16();
    let headers: Vec<Value> = response
        .headers()
        .iter()
        .map(|(name, value)| {
            Value::Array(vec![
                Value::Binary(name.as_str().as_bytes().to_vec()),
                Value::Binary(value.as_bytes().to_vec()),
            ])
        })
        .collect();
    let body = response.bytes().await.context("reading workload response")?;

    let start = Value::Map(vec![
        (Value::from("headers"), Value::Array(headers)),
        (Value::from("status"), Value::from(status)),
    ]);
    let body = Value::Map(vec![(Value::from("body"), Value::Binary(body.to_vec()))]);
    Ok((start, body))
}

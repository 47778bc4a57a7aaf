//! Link resolution engines and the fallback chain that tries them in order.
//!
//! The engines are third-party services of equal (un)reliability, so they
//! are plain trait objects: the chain knows only their order, never who
//! they are.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use super::{agent, blocking, json_response};
use crate::error::{GatewayError, GatewayResult};
use crate::extractor::{Extractor, USER_AGENT};
use crate::metadata;

pub const DEFAULT_RESOLVER_BASE: &str = "https://www.savethevideo.com";

/// One way of turning a page URL into something downloadable.
#[async_trait]
pub trait LinkResolver: Send + Sync {
    fn name(&self) -> &str;

    async fn resolve(&self, url: &str) -> GatewayResult<Value>;
}

/// Task-based resolver: submit a URL, get a task id back, poll for links.
#[derive(Clone)]
pub struct TaskResolver {
    agent: ureq::Agent,
    base_url: String,
}

impl TaskResolver {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            agent: agent(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Submits `url` and returns the upstream task object, which must carry
    /// an `id`.
    pub async fn start(&self, url: &str) -> GatewayResult<Value> {
        let agent = self.agent.clone();
        let base = self.base_url.clone();
        let url = url.to_string();
        let task = blocking(move || {
            let result = agent
                .post(&format!("{base}/api/start"))
                .set("Origin", &base)
                .set("Referer", &format!("{base}/home"))
                .set("User-Agent", USER_AGENT)
                .send_form(&[("url", url.as_str())]);
            json_response("resolver/start", result, "Link resolver is currently unavailable.")
        })
        .await?;

        match task.get("id") {
            Some(id) if !id.is_null() => {
                let status = task.get("status").cloned().unwrap_or_default();
                tracing::info!(task = %id, %status, "resolver task started");
                Ok(task)
            }
            _ => {
                tracing::warn!(response = %task.to_string().chars().take(200).collect::<String>(), "resolver returned no task id");
                Err(GatewayError::unavailable(
                    "Link resolver did not return a task ID.",
                ))
            }
        }
    }

    /// Polls the status of a task previously returned by [`Self::start`].
    pub async fn check(&self, id: &str) -> GatewayResult<Value> {
        let agent = self.agent.clone();
        let base = self.base_url.clone();
        let id = id.to_string();
        blocking(move || {
            let result = agent
                .get(&format!("{base}/api/check"))
                .query("id", &id)
                .set("Origin", &base)
                .set("Referer", &format!("{base}/home"))
                .set("User-Agent", USER_AGENT)
                .call();
            json_response("resolver/check", result, "Link resolver is currently unavailable.")
        })
        .await
    }
}

#[async_trait]
impl LinkResolver for TaskResolver {
    fn name(&self) -> &str {
        "task-resolver"
    }

    async fn resolve(&self, url: &str) -> GatewayResult<Value> {
        self.start(url).await
    }
}

/// A resolver answering `GET <endpoint>?url=<url>` with a JSON object.
#[derive(Clone)]
pub struct JsonResolver {
    agent: ureq::Agent,
    endpoint: String,
    api_key: Option<String>,
}

impl JsonResolver {
    pub fn new(endpoint: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            agent: agent(),
            endpoint: endpoint.into(),
            api_key: api_key.filter(|key| !key.is_empty()),
        }
    }
}

#[async_trait]
impl LinkResolver for JsonResolver {
    fn name(&self) -> &str {
        "json-resolver"
    }

    async fn resolve(&self, url: &str) -> GatewayResult<Value> {
        let agent = self.agent.clone();
        let endpoint = self.endpoint.clone();
        let api_key = self.api_key.clone();
        let url = url.to_string();
        let value = blocking(move || {
            let mut request = agent
                .get(&endpoint)
                .query("url", &url)
                .set("Accept", "application/json");
            if let Some(key) = &api_key {
                request = request.set("X-Api-Key", key);
            }
            json_response("json-resolver", request.call(), "Fallback resolver is unavailable.")
        })
        .await?;

        if value.is_object() {
            Ok(value)
        } else {
            Err(GatewayError::unavailable(
                "Fallback resolver returned an unexpected response.",
            ))
        }
    }
}

/// Last resort: the local extractor's metadata lookup.
pub struct ExtractorResolver {
    extractor: Arc<Extractor>,
}

impl ExtractorResolver {
    pub fn new(extractor: Arc<Extractor>) -> Self {
        Self { extractor }
    }
}

#[async_trait]
impl LinkResolver for ExtractorResolver {
    fn name(&self) -> &str {
        "extractor"
    }

    async fn resolve(&self, url: &str) -> GatewayResult<Value> {
        let info = metadata::describe(&self.extractor, url).await?;
        serde_json::to_value(info).map_err(|err| GatewayError::internal(err.to_string()))
    }
}

/// Result of a successful chain run.
#[derive(Debug, Clone, Serialize)]
pub struct Resolution {
    pub engine: String,
    pub result: Value,
}

/// Tries each engine once, in order, and returns the first success.
pub struct ResolverChain {
    engines: Vec<Arc<dyn LinkResolver>>,
}

impl ResolverChain {
    pub fn new(engines: Vec<Arc<dyn LinkResolver>>) -> Self {
        Self { engines }
    }

    pub fn engine_names(&self) -> Vec<&str> {
        self.engines.iter().map(|engine| engine.name()).collect()
    }

    pub async fn resolve(&self, url: &str) -> GatewayResult<Resolution> {
        let mut last_error = None;
        for engine in &self.engines {
            match engine.resolve(url).await {
                Ok(result) => {
                    tracing::info!(engine = engine.name(), "resolved");
                    return Ok(Resolution {
                        engine: engine.name().to_string(),
                        result,
                    });
                }
                Err(err) => {
                    tracing::warn!(engine = engine.name(), error = %err, "engine failed; trying next");
                    last_error = Some(err);
                }
            }
        }
        Err(last_error
            .unwrap_or_else(|| GatewayError::unavailable("No resolution engine configured.")))
    }
}

//! Pass-through proxies for third-party HTTP APIs.
//!
//! Calls go through a shared blocking `ureq` agent on tokio's blocking pool.
//! Upstream failures are logged with their details and surfaced to clients
//! only as [`GatewayError::UpstreamUnavailable`] with a generic message.

use std::time::Duration;

use serde_json::Value;
use tokio::task;

use crate::error::{GatewayError, GatewayResult};
use crate::extractor::USER_AGENT;

pub mod catalog;
pub mod resolver;

pub use catalog::CatalogClient;
pub use resolver::{
    ExtractorResolver, JsonResolver, LinkResolver, Resolution, ResolverChain, TaskResolver,
};

const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(20);

pub fn agent() -> ureq::Agent {
    ureq::AgentBuilder::new()
        .timeout(UPSTREAM_TIMEOUT)
        .user_agent(USER_AGENT)
        .build()
}

/// Runs a blocking upstream call off the async runtime.
async fn blocking<T, F>(call: F) -> GatewayResult<T>
where
    F: FnOnce() -> GatewayResult<T> + Send + 'static,
    T: Send + 'static,
{
    task::spawn_blocking(call)
        .await
        .map_err(|err| GatewayError::internal(format!("task join error: {err}")))?
}

/// Reads a JSON body from a finished request, mapping every failure to
/// `UpstreamUnavailable(failure)`.
fn json_response(
    label: &str,
    result: Result<ureq::Response, ureq::Error>,
    failure: &str,
) -> GatewayResult<Value> {
    match result {
        Ok(response) => response.into_json::<Value>().map_err(|err| {
            tracing::warn!(upstream = label, error = %err, "upstream returned invalid JSON");
            GatewayError::unavailable(failure)
        }),
        Err(ureq::Error::Status(code, response)) => {
            let body = response.into_string().unwrap_or_default();
            tracing::warn!(
                upstream = label,
                status = code,
                body = %body.chars().take(200).collect::<String>(),
                "upstream returned an error status"
            );
            Err(GatewayError::unavailable(failure))
        }
        Err(ureq::Error::Transport(err)) => {
            tracing::warn!(upstream = label, error = %err, "upstream unreachable");
            Err(GatewayError::unavailable(failure))
        }
    }
}

//! The download gateway: one request in, one extractor process out, its
//! stdout streamed back as the response body.
//!
//! Headers are committed only when the first stdout byte shows up. Until
//! then the request can still fail cleanly with a JSON error; afterwards a
//! failing extractor just ends the body early.

use std::io;
use std::sync::Arc;

use axum::{
    body::{Body, Bytes},
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use chrono::Utc;
use futures_util::{StreamExt, stream};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::DropGuard;

use crate::classify::classify_failure;
use crate::error::{GatewayError, GatewayResult};
use crate::extractor::{Extractor, OutputKind};
use crate::process::{ProgressRoute, StreamingJob};
use crate::progress::ProgressSink;

/// Raw `/download` query parameters.
#[derive(Debug, Default, Deserialize)]
pub struct DownloadQuery {
    pub url: Option<String>,
    pub format: Option<String>,
    #[serde(rename = "sessionId", alias = "socketId")]
    pub session_id: Option<String>,
}

/// A validated download request. Consumed once.
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadRequest {
    pub source_url: String,
    pub output: OutputKind,
    pub session_id: Option<String>,
}

impl DownloadRequest {
    pub fn from_query(query: DownloadQuery) -> GatewayResult<Self> {
        let source_url = query
            .url
            .map(|url| url.trim().to_string())
            .filter(|url| !url.is_empty())
            .ok_or_else(|| GatewayError::invalid("URL required"))?;
        Ok(Self {
            source_url,
            output: OutputKind::parse(query.format.as_deref()),
            session_id: query.session_id.filter(|id| !id.is_empty()),
        })
    }
}

pub struct Gateway {
    extractor: Arc<Extractor>,
    progress: Arc<dyn ProgressSink>,
}

impl Gateway {
    pub fn new(extractor: Arc<Extractor>, progress: Arc<dyn ProgressSink>) -> Self {
        Self {
            extractor,
            progress,
        }
    }

    pub fn extractor(&self) -> &Extractor {
        &self.extractor
    }

    /// Spawns the extractor for `request` and waits for its first output.
    ///
    /// Resolves with a streaming response as soon as one byte is available,
    /// or with [`GatewayError::ExtractionFailed`] if the process exits
    /// without writing anything. If the caller drops the returned future or
    /// the response body, the extractor is terminated in the background.
    pub async fn handle(&self, request: DownloadRequest) -> GatewayResult<Response> {
        let DownloadRequest {
            source_url,
            output,
            session_id,
        } = request;
        tracing::info!(url = %truncate(&source_url, 80), ?output, "download requested");

        let args = self.extractor.download_args(&source_url, output);
        let route = session_id.map(|session_id| ProgressRoute {
            sink: self.progress.clone(),
            session_id,
        });
        let mut job = StreamingJob::spawn(
            self.extractor.command(&args),
            route,
            self.extractor.kill_grace,
        )
        .map_err(|err| {
            tracing::error!(program = %self.extractor.program().display(), error = %err, "spawning extractor failed");
            GatewayError::internal("Download engine failed.")
        })?;

        match job.next_chunk().await {
            Some(Ok(first)) => {
                tracing::debug!(pid = job.pid, "first bytes received; committing headers");
                let (chunks, guard) = job.into_stream_parts();
                Ok(streaming_response(output, first, chunks, guard))
            }
            Some(Err(err)) => {
                tracing::error!(error = %err, "extractor stdout failed before any output");
                let outcome = job.outcome().await;
                Err(GatewayError::ExtractionFailed(
                    classify_failure(&outcome.stderr).to_string(),
                ))
            }
            None => {
                let outcome = job.outcome().await;
                let message = classify_failure(&outcome.stderr);
                tracing::error!(
                    exit_code = ?outcome.exit_code,
                    stderr = %outcome.stderr.trim(),
                    "download failed before output: {message}"
                );
                Err(GatewayError::ExtractionFailed(message.to_string()))
            }
        }
    }
}

fn streaming_response(
    output: OutputKind,
    first: Bytes,
    chunks: mpsc::Receiver<io::Result<Bytes>>,
    guard: DropGuard,
) -> Response {
    // The guard rides along with the body: dropping the body (client gone)
    // cancels the extractor.
    let rest = stream::unfold((chunks, guard), |(mut chunks, guard)| async move {
        match chunks.recv().await {
            Some(chunk) => Some((chunk, (chunks, guard))),
            None => {
                tracing::debug!("extractor output finished");
                None
            }
        }
    });
    let body = stream::once(async move { Ok::<_, io::Error>(first) }).chain(rest);

    let mut response = Body::from_stream(body).into_response();
    *response.status_mut() = StatusCode::OK;
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(output.content_type()),
    );
    if let Ok(value) = HeaderValue::from_str(&attachment_disposition(output)) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
    response
}

/// `attachment; filename="OmniFetch_<unix millis>.<ext>"`
pub fn attachment_disposition(output: OutputKind) -> String {
    format!(
        "attachment; filename=\"OmniFetch_{}.{}\"",
        Utc::now().timestamp_millis(),
        output.extension()
    )
}

fn truncate(value: &str, max: usize) -> &str {
    match value.char_indices().nth(max) {
        Some((idx, _)) => &value[..idx],
        None => value,
    }
}

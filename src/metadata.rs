//! Non-streaming extractor calls: "describe this URL" and search.
//!
//! Both spawn the extractor in JSON-dump mode and are bounded by the
//! extractor's info timeout. The structs here mirror the subset of yt-dlp's
//! JSON we read, and the shape the frontend expects back.

use serde::{Deserialize, Serialize};

use crate::classify::{classify_failure, looks_like_bot_check};
use crate::error::{GatewayError, GatewayResult};
use crate::extractor::Extractor;
use crate::process::{CapturedOutput, RunError, run_bounded};

pub const DEFAULT_SEARCH_LIMIT: usize = 12;
pub const MAX_SEARCH_LIMIT: usize = 20;

/// Subset of yt-dlp's `--dump-json` payload. Everything is optional because
/// extractors for different sites fill in different fields.
#[derive(Debug, Default, Deserialize)]
struct RawInfo {
    id: Option<String>,
    title: Option<String>,
    fulltitle: Option<String>,
    thumbnail: Option<String>,
    webpage_url: Option<String>,
    url: Option<String>,
    duration: Option<f64>,
    duration_string: Option<String>,
    uploader: Option<String>,
    channel: Option<String>,
    extractor_key: Option<String>,
}

/// What `/api/info` returns.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MediaInfo {
    pub success: bool,
    pub title: String,
    pub thumbnail: Option<String>,
    pub video_id: Option<String>,
    pub url: String,
    pub duration: Option<String>,
    pub uploader: Option<String>,
    pub source: Option<String>,
}

/// One entry of `/api/search`.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SearchResult {
    pub id: String,
    pub title: String,
    pub thumbnail: String,
    pub duration: String,
    pub channel: String,
}

/// Turns free-form user input into something the extractor understands.
///
/// A bare 11-character token is taken as a YouTube video id, anything that
/// looks like a URL passes through, and the rest becomes a search.
pub fn normalize_input(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.chars().count() == 11 && !trimmed.contains('.') && !trimmed.contains('/') {
        return format!("https://www.youtube.com/watch?v={trimmed}");
    }
    if trimmed.starts_with("http") {
        return trimmed.to_string();
    }
    format!("gvsearch1:{trimmed} movie")
}

/// Runs the extractor in metadata mode for `input`.
pub async fn describe(extractor: &Extractor, input: &str) -> GatewayResult<MediaInfo> {
    let target = normalize_input(input);
    tracing::info!(input = %truncate(&target, 80), "describing media");
    let output = run_json_mode(
        extractor,
        extractor.info_args(&target),
        "Timed out. Paste a direct URL.",
    )
    .await?;

    if !output.status.success() || output.stdout.trim().is_empty() {
        tracing::warn!(status = %output.status, stderr = %output.stderr.trim(), "metadata lookup failed");
        return Err(GatewayError::ExtractionFailed(
            classify_failure(&output.stderr).to_string(),
        ));
    }

    let raw = output
        .stdout
        .lines()
        .find(|line| line.starts_with('{'))
        .and_then(|line| serde_json::from_str::<RawInfo>(line).ok())
        .ok_or_else(|| GatewayError::ExtractionFailed("Could not parse media data.".into()))?;

    Ok(media_info(raw, &target))
}

/// Runs a flat extractor search for `query`.
pub async fn search(
    extractor: &Extractor,
    query: &str,
    limit: Option<&str>,
) -> GatewayResult<Vec<SearchResult>> {
    let limit = clamp_limit(limit);
    let output = run_json_mode(
        extractor,
        extractor.search_args(query, limit),
        "Search timed out. Try again.",
    )
    .await?;

    let results = parse_search_lines(&output.stdout);
    if results.is_empty() {
        let message = if looks_like_bot_check(&output.stderr) {
            "Rate-limited by the platform. Try again later."
        } else {
            "No results found."
        };
        return Err(GatewayError::NotFound(message.into()));
    }
    Ok(results)
}

/// Reads a caller-supplied limit leniently: leading digits count, anything
/// unusable selects the default, and the result is capped.
pub fn clamp_limit(raw: Option<&str>) -> usize {
    let digits: String = raw
        .unwrap_or_default()
        .trim()
        .chars()
        .take_while(char::is_ascii_digit)
        .collect();
    if digits.is_empty() {
        return DEFAULT_SEARCH_LIMIT;
    }
    match digits.parse::<usize>() {
        Ok(0) => DEFAULT_SEARCH_LIMIT,
        Ok(limit) => limit.min(MAX_SEARCH_LIMIT),
        Err(_) => MAX_SEARCH_LIMIT,
    }
}

async fn run_json_mode(
    extractor: &Extractor,
    args: Vec<String>,
    timeout_message: &str,
) -> GatewayResult<CapturedOutput> {
    match run_bounded(
        extractor.command(&args),
        extractor.info_timeout,
        extractor.kill_grace,
    )
    .await
    {
        Ok(output) => Ok(output),
        Err(RunError::TimedOut) => {
            tracing::warn!(timeout = ?extractor.info_timeout, "extractor timed out");
            Err(GatewayError::UpstreamTimeout(timeout_message.into()))
        }
        Err(RunError::Io(err)) => {
            tracing::error!(program = %extractor.program().display(), error = %err, "extractor could not be started");
            Err(GatewayError::internal("Download engine failed."))
        }
    }
}

fn media_info(raw: RawInfo, input: &str) -> MediaInfo {
    MediaInfo {
        success: true,
        title: raw
            .title
            .or(raw.fulltitle)
            .unwrap_or_else(|| "Unknown Title".into()),
        thumbnail: raw.thumbnail,
        video_id: raw.id,
        url: raw
            .webpage_url
            .or(raw.url)
            .unwrap_or_else(|| input.to_string()),
        duration: raw
            .duration_string
            .or_else(|| raw.duration.and_then(format_duration)),
        uploader: raw.uploader.or(raw.channel),
        source: raw.extractor_key,
    }
}

fn parse_search_lines(stdout: &str) -> Vec<SearchResult> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| line.starts_with('{'))
        .filter_map(|line| serde_json::from_str::<RawInfo>(line).ok())
        .filter_map(|raw| {
            let id = raw.id?;
            Some(SearchResult {
                thumbnail: raw
                    .thumbnail
                    .unwrap_or_else(|| format!("https://i.ytimg.com/vi/{id}/mqdefault.jpg")),
                title: raw.title.or(raw.fulltitle).unwrap_or_default(),
                duration: raw
                    .duration_string
                    .or_else(|| raw.duration.and_then(format_duration))
                    .unwrap_or_default(),
                channel: raw.channel.or(raw.uploader).unwrap_or_default(),
                id,
            })
        })
        .collect()
}

/// `m:ss`, matching what the extractor prints for short clips.
fn format_duration(seconds: f64) -> Option<String> {
    if !seconds.is_finite() || seconds <= 0.0 {
        return None;
    }
    let total = seconds as u64;
    Some(format!("{}:{:02}", total / 60, total % 60))
}

fn truncate(value: &str, max: usize) -> &str {
    match value.char_indices().nth(max) {
        Some((idx, _)) => &value[..idx],
        None => value,
    }
}

//! Progress events and the registry that routes them to push-channel clients.
//!
//! The gateway only ever sees [`ProgressSink`]. The concrete
//! [`SessionRegistry`] is owned by the WebSocket layer and handed to the
//! gateway as a trait object, which keeps tests free to plug in a recorder.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use rand_core::{OsRng, RngCore};
use regex::Regex;
use serde::Serialize;
use tokio::sync::mpsc;

static PERCENT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d+(?:\.\d+)?)%").expect("percent regex"));

/// A single progress update. Always within `0.0..=100.0`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ProgressEvent {
    pub percent: f64,
}

impl ProgressEvent {
    pub const COMPLETE: Self = Self { percent: 100.0 };
}

/// Extracts the first well-formed percentage from `line`.
pub fn parse_percent(line: &str) -> Option<f64> {
    PERCENT_RE
        .captures_iter(line)
        .filter_map(|caps| caps.get(1)?.as_str().parse::<f64>().ok())
        .find(|value| (0.0..=100.0).contains(value))
}

/// Longest unterminated line kept before it is flushed as a line of its own.
pub const MAX_LINE_BYTES: usize = 8 * 1024;

/// Splits a byte stream into lines on `\n` or `\r`.
///
/// yt-dlp redraws its progress bar with carriage returns, so a single read
/// from stderr can hold several updates, or half of one.
#[derive(Debug, Default)]
pub struct LineSplitter {
    pending: Vec<u8>,
}

impl LineSplitter {
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &byte in chunk {
            if byte == b'\n' || byte == b'\r' {
                self.take_line(&mut lines);
            } else {
                self.pending.push(byte);
                if self.pending.len() >= MAX_LINE_BYTES {
                    self.take_line(&mut lines);
                }
            }
        }
        lines
    }

    /// Returns whatever is left once the stream has closed.
    pub fn finish(&mut self) -> Option<String> {
        let mut lines = Vec::new();
        self.take_line(&mut lines);
        lines.pop()
    }

    fn take_line(&mut self, lines: &mut Vec<String>) {
        if self.pending.is_empty() {
            return;
        }
        let line = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        lines.push(line);
    }
}

/// Where the gateway publishes progress. Delivery is best effort.
pub trait ProgressSink: Send + Sync {
    fn publish(&self, session_id: &str, event: ProgressEvent);
}

/// Live push-channel sessions keyed by their opaque identifier.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, mpsc::UnboundedSender<ProgressEvent>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates a fresh session and returns the receiving half of its
    /// event channel.
    pub fn register(&self) -> (String, mpsc::UnboundedReceiver<ProgressEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut sessions = self.sessions.write();
        let id = loop {
            let candidate = new_session_id();
            if !sessions.contains_key(&candidate) {
                break candidate;
            }
        };
        sessions.insert(id.clone(), tx);
        (id, rx)
    }

    pub fn unregister(&self, session_id: &str) {
        self.sessions.write().remove(session_id);
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ProgressSink for SessionRegistry {
    fn publish(&self, session_id: &str, event: ProgressEvent) {
        if let Some(tx) = self.sessions.read().get(session_id) {
            if tx.send(event).is_err() {
                tracing::debug!(session_id, "progress listener already gone");
            }
        }
    }
}

fn new_session_id() -> String {
    let mut bytes = [0u8; 16];
    OsRng.fill_bytes(&mut bytes);
    bytes.iter().map(|byte| format!("{byte:02x}")).collect()
}

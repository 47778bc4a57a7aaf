#![forbid(unsafe_code)]

//! OmniFetch: an HTTP gateway in front of the yt-dlp media extractor.
//!
//! The binary in `src/bin/omnifetch.rs` only wires configuration and the
//! listener; everything it serves lives here so the handlers can be
//! exercised in-process.

pub mod classify;
pub mod config;
pub mod error;
pub mod extractor;
pub mod gateway;
pub mod logging;
pub mod metadata;
pub mod process;
pub mod progress;
pub mod server;
pub mod upstream;

#[cfg(test)]
mod test_support;

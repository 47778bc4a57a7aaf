//! Helpers shared by the unit tests: extractor stubs and a recording sink.

use std::fs;
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::progress::{ProgressEvent, ProgressSink};

/// Writes an executable bash script named `yt-dlp` into `dir`.
///
/// The script records its arguments (one per line) to `args.txt` next to
/// itself before running `body`.
pub fn install_stub(dir: &Path, body: &str) -> PathBuf {
    let script_path = dir.join("yt-dlp");
    let script = format!(
        "#!/usr/bin/env bash\nprintf '%s\\n' \"$@\" > \"$(dirname \"$0\")/args.txt\"\n{body}"
    );
    fs::write(&script_path, script).unwrap();
    #[cfg(unix)]
    {
        let mut perms = fs::metadata(&script_path).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&script_path, perms).unwrap();
    }
    script_path
}

/// Arguments the stub in `dir` was last invoked with, if it ran at all.
pub fn recorded_args(dir: &Path) -> Option<Vec<String>> {
    let raw = fs::read_to_string(dir.join("args.txt")).ok()?;
    Some(raw.lines().map(str::to_string).collect())
}

#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<(String, ProgressEvent)>>,
}

impl RecordingSink {
    pub fn percents(&self, session_id: &str) -> Vec<f64> {
        self.events
            .lock()
            .iter()
            .filter(|(id, _)| id == session_id)
            .map(|(_, event)| event.percent)
            .collect()
    }

    pub fn total(&self) -> usize {
        self.events.lock().len()
    }

    /// Polls until `percent` was published for `session_id` or `limit` passes.
    pub async fn wait_for_percent(&self, session_id: &str, percent: f64, limit: Duration) -> bool {
        let started = Instant::now();
        while started.elapsed() < limit {
            if self.percents(session_id).contains(&percent) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }
}

impl ProgressSink for RecordingSink {
    fn publish(&self, session_id: &str, event: ProgressEvent) {
        self.events.lock().push((session_id.to_string(), event));
    }
}

/// Serves `router` on an ephemeral local port and returns its base URL.
pub async fn spawn_upstream(router: axum::Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
}

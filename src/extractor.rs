//! Command-line construction for the external media extractor (yt-dlp).
//!
//! Every invocation the gateway makes is assembled here so the flag
//! vocabulary lives in one place. The extractor itself is an opaque external
//! dependency: we conform to its flags, we do not define them.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::process::Command;
use tokio::time;

/// Browser identity presented to every site.
pub const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

/// Resolutions a caller may ask for. Anything else falls back to
/// [`DEFAULT_HEIGHT`].
pub const ALLOWED_HEIGHTS: [u32; 5] = [1080, 720, 480, 360, 240];
pub const DEFAULT_HEIGHT: u32 = 480;

const COMMON_FLAGS: [&str; 6] = [
    "--no-check-certificates",
    "--geo-bypass",
    "--extractor-retries",
    "3",
    "--socket-timeout",
    "20",
];

const VERSION_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// What the caller wants out of the source URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    Audio,
    Video { height: u32 },
}

impl OutputKind {
    /// Parses the `format` query value. Unknown values are not an error:
    /// they silently select video at the default height.
    pub fn parse(value: Option<&str>) -> Self {
        let value = value.map(str::trim).unwrap_or_default();
        if matches!(value, "audio" | "mp3" | "ytdlp_mp3") {
            return Self::Audio;
        }
        let height = value
            .parse::<u32>()
            .ok()
            .filter(|height| ALLOWED_HEIGHTS.contains(height))
            .unwrap_or(DEFAULT_HEIGHT);
        Self::Video { height }
    }

    pub fn extension(self) -> &'static str {
        match self {
            Self::Audio => "mp3",
            Self::Video { .. } => "mp4",
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            Self::Audio => "audio/mpeg",
            Self::Video { .. } => "video/mp4",
        }
    }

    fn format_args(self) -> Vec<String> {
        match self {
            Self::Audio => strings(&["-x", "--audio-format", "mp3", "--audio-quality", "0"]),
            Self::Video { height } => vec![
                "-f".into(),
                format!(
                    "bestvideo[height<={height}][ext=mp4]+bestaudio[ext=m4a]/best[height<={height}][ext=mp4]/best[height<={height}]/best"
                ),
                "--merge-output-format".into(),
                "mp4".into(),
            ],
        }
    }
}

/// Handle on the extractor binary plus the knobs shared by every call.
#[derive(Debug, Clone)]
pub struct Extractor {
    program: PathBuf,
    cookies: PathBuf,
    pub(crate) info_timeout: Duration,
    pub(crate) kill_grace: Duration,
}

impl Extractor {
    pub fn new(program: impl Into<PathBuf>, cookies: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            cookies: cookies.into(),
            info_timeout: Duration::from_secs(30),
            kill_grace: Duration::from_secs(3),
        }
    }

    pub fn with_info_timeout(mut self, timeout: Duration) -> Self {
        self.info_timeout = timeout;
        self
    }

    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn cookies(&self) -> &Path {
        &self.cookies
    }

    pub(crate) fn command(&self, args: &[String]) -> Command {
        let mut command = Command::new(&self.program);
        command.args(args);
        command
    }

    /// Arguments for a streaming download written to stdout.
    pub fn download_args(&self, url: &str, kind: OutputKind) -> Vec<String> {
        let mut args = strings(&["-o", "-", "--no-part", "--age-limit", "99"]);
        args.extend(strings(&COMMON_FLAGS));
        args.extend(platform_headers(url));
        args.extend(self.auth_args());
        args.extend(kind.format_args());
        push_target(&mut args, url);
        args
    }

    /// Arguments for a single-item JSON metadata dump.
    pub fn info_args(&self, input: &str) -> Vec<String> {
        let mut args = strings(&["--dump-json", "--no-playlist", "--age-limit", "99"]);
        args.extend(strings(&COMMON_FLAGS));
        args.extend(platform_headers(input));
        args.extend(self.auth_args());
        push_target(&mut args, input);
        args
    }

    /// Arguments for a flat search returning one JSON object per line.
    pub fn search_args(&self, query: &str, limit: usize) -> Vec<String> {
        let mut args = strings(&[
            "--flat-playlist",
            "--dump-json",
            "--no-warnings",
            "--age-limit",
            "99",
        ]);
        args.extend(strings(&COMMON_FLAGS));
        args.extend(platform_headers("youtube.com"));
        args.extend(self.auth_args());
        push_target(&mut args, &format!("ytsearch{limit}:{query}"));
        args
    }

    /// Passes the credential artifact along when it exists. Its absence is
    /// not an error.
    fn auth_args(&self) -> Vec<String> {
        if self.cookies.is_file() {
            vec![
                "--cookies".into(),
                self.cookies.to_string_lossy().into_owned(),
            ]
        } else {
            Vec::new()
        }
    }

    /// Probes each candidate with `--version` and returns the first that
    /// answers, with its version string.
    pub async fn discover(candidates: &[PathBuf]) -> Option<(PathBuf, String)> {
        for candidate in candidates {
            let mut probe = Command::new(candidate);
            probe.arg("--version").kill_on_drop(true);
            match time::timeout(VERSION_PROBE_TIMEOUT, probe.output()).await {
                Ok(Ok(output)) if output.status.success() => {
                    let version = String::from_utf8_lossy(&output.stdout).trim().to_string();
                    return Some((candidate.clone(), version));
                }
                Ok(Ok(output)) => {
                    tracing::debug!(candidate = %candidate.display(), status = %output.status, "extractor candidate rejected");
                }
                Ok(Err(err)) => {
                    tracing::debug!(candidate = %candidate.display(), error = %err, "extractor candidate not runnable");
                }
                Err(_) => {
                    tracing::debug!(candidate = %candidate.display(), "extractor candidate timed out");
                }
            }
        }
        None
    }
}

/// Candidate locations for the extractor, most specific first.
pub fn default_candidates(configured: Option<&Path>, home: Option<&Path>) -> Vec<PathBuf> {
    let mut candidates = Vec::new();
    if let Some(path) = configured {
        candidates.push(path.to_path_buf());
    }
    if let Some(home) = home {
        candidates.push(home.join(".local/bin/yt-dlp"));
    }
    candidates.extend(
        ["/usr/local/bin/yt-dlp", "/usr/bin/yt-dlp", "yt-dlp"]
            .iter()
            .map(PathBuf::from),
    );
    candidates
}

/// Browser-like headers, plus the referer/origin pair some sites insist on.
pub fn platform_headers(url: &str) -> Vec<String> {
    let url = url.to_lowercase();
    let mut headers = strings(&[
        "--user-agent",
        USER_AGENT,
        "--add-header",
        "Accept-Language:en-US,en;q=0.9",
    ]);

    if url.contains("twitter.com") || url.contains("x.com") {
        headers.extend(strings(&[
            "--extractor-args",
            "twitter:api=syndication",
            "--add-header",
            "Referer:https://twitter.com/",
        ]));
    } else if url.contains("dailymotion.com") {
        headers.extend(strings(&[
            "--add-header",
            "Referer:https://www.dailymotion.com/",
            "--add-header",
            "Origin:https://www.dailymotion.com",
        ]));
    } else if url.contains("facebook.com") || url.contains("fb.watch") {
        headers.extend(strings(&[
            "--add-header",
            "Referer:https://www.facebook.com/",
            "--add-header",
            "Origin:https://www.facebook.com",
        ]));
    } else {
        headers.extend(strings(&["--add-header", "Referer:https://www.google.com/"]));
    }
    headers
}

// The target always follows `--` so input starting with `-` stays a target.
fn push_target(args: &mut Vec<String>, target: &str) {
    args.push("--".into());
    args.push(target.to_string());
}

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|value| value.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn position(args: &[String], value: &str) -> Option<usize> {
        args.iter().position(|arg| arg == value)
    }

    #[test]
    fn output_kind_accepts_audio_aliases() {
        for value in ["audio", "mp3", "ytdlp_mp3"] {
            assert_eq!(OutputKind::parse(Some(value)), OutputKind::Audio);
        }
    }

    #[test]
    fn output_kind_defaults_unknown_heights_to_480() {
        for value in [None, Some(""), Some("4k"), Some("1440"), Some("-1")] {
            assert_eq!(
                OutputKind::parse(value),
                OutputKind::Video { height: 480 },
                "value {value:?}"
            );
        }
        assert_eq!(
            OutputKind::parse(Some("720")),
            OutputKind::Video { height: 720 }
        );
    }

    #[test]
    fn download_args_stream_video_to_stdout() {
        let extractor = Extractor::new("yt-dlp", "/nonexistent/cookies.txt");
        let args = extractor.download_args(
            "https://example.com/v",
            OutputKind::Video { height: 720 },
        );
        let out = position(&args, "-o").unwrap();
        assert_eq!(args[out + 1], "-");
        assert!(args.contains(&"--no-check-certificates".to_string()));
        assert!(args.contains(&"--geo-bypass".to_string()));
        let selector = &args[position(&args, "-f").unwrap() + 1];
        assert_eq!(
            selector,
            "bestvideo[height<=720][ext=mp4]+bestaudio[ext=m4a]/best[height<=720][ext=mp4]/best[height<=720]/best"
        );
        assert!(position(&args, "--cookies").is_none());
        assert_eq!(&args[args.len() - 2..], ["--", "https://example.com/v"]);
    }

    #[test]
    fn download_args_extract_audio() {
        let extractor = Extractor::new("yt-dlp", "/nonexistent/cookies.txt");
        let args = extractor.download_args("https://example.com/v", OutputKind::Audio);
        let x = position(&args, "-x").unwrap();
        assert_eq!(args[x + 1..x + 5], ["--audio-format", "mp3", "--audio-quality", "0"]);
        assert!(position(&args, "-f").is_none());
    }

    #[test]
    fn cookies_are_passed_only_when_present() {
        let dir = tempdir().unwrap();
        let cookies = dir.path().join("cookies.txt");
        let extractor = Extractor::new("yt-dlp", &cookies);
        assert!(position(&extractor.info_args("https://a.b/c"), "--cookies").is_none());

        fs::write(&cookies, "# Netscape HTTP Cookie File\n").unwrap();
        let args = extractor.info_args("https://a.b/c");
        let idx = position(&args, "--cookies").unwrap();
        assert_eq!(args[idx + 1], cookies.to_string_lossy());
    }

    #[test]
    fn platform_headers_pick_site_specific_referer() {
        let twitter = platform_headers("https://x.com/user/status/1");
        assert!(twitter.contains(&"twitter:api=syndication".to_string()));
        let facebook = platform_headers("https://fb.watch/abc");
        assert!(facebook.contains(&"Origin:https://www.facebook.com".to_string()));
        let other = platform_headers("https://vimeo.com/1");
        assert!(other.contains(&"Referer:https://www.google.com/".to_string()));
        assert_eq!(other[1], USER_AGENT);
    }

    #[test]
    fn search_args_embed_limit_in_target() {
        let extractor = Extractor::new("yt-dlp", "/nonexistent");
        let args = extractor.search_args("cats", 5);
        assert_eq!(args.last().unwrap(), "ytsearch5:cats");
        assert!(args.contains(&"--flat-playlist".to_string()));
    }

    #[test]
    fn default_candidates_prefer_configured_path() {
        let candidates = default_candidates(
            Some(Path::new("/opt/yt-dlp")),
            Some(Path::new("/home/u")),
        );
        assert_eq!(candidates[0], PathBuf::from("/opt/yt-dlp"));
        assert_eq!(candidates[1], PathBuf::from("/home/u/.local/bin/yt-dlp"));
        assert_eq!(candidates.last().unwrap(), &PathBuf::from("yt-dlp"));
    }
}

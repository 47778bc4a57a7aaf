use anyhow::{Context, Result, anyhow};
use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::upstream::{catalog::DEFAULT_CATALOG_BASE, resolver::DEFAULT_RESOLVER_BASE};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/omnifetch-env";
pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 10000;
pub const DEFAULT_STATE_DIR: &str = "/tmp";
pub const COOKIES_FILE_NAME: &str = "cookies.txt";
pub const DEFAULT_INFO_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_KILL_GRACE_SECS: u64 = 3;

/// Keys read from the env file and from the process environment.
const KEYS: [&str; 13] = [
    "OMNIFETCH_HOST",
    "OMNIFETCH_PORT",
    "PORT",
    "EXTRACTOR_PATH",
    "STATE_DIR",
    "COOKIES_FILE",
    "CATALOG_TOKEN",
    "CATALOG_BASE_URL",
    "RESOLVER_BASE_URL",
    "FALLBACK_RESOLVER_URL",
    "FALLBACK_RESOLVER_KEY",
    "INFO_TIMEOUT_SECS",
    "KILL_GRACE_SECS",
];

#[derive(Debug, Clone, Default)]
pub struct EnvConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub platform_port: Option<u16>,
    pub extractor_path: Option<PathBuf>,
    pub state_dir: Option<PathBuf>,
    pub cookies_file: Option<PathBuf>,
    pub catalog_token: Option<String>,
    pub catalog_base_url: Option<String>,
    pub resolver_base_url: Option<String>,
    pub fallback_resolver_url: Option<String>,
    pub fallback_resolver_key: Option<String>,
    pub info_timeout_secs: Option<u64>,
    pub kill_grace_secs: Option<u64>,
}

impl EnvConfig {
    /// Applies one `KEY=VALUE` pair. Empty values are ignored; `origin` names
    /// the source in parse errors.
    fn apply(&mut self, key: &str, value: &str, origin: &str) -> Result<()> {
        if value.is_empty() {
            return Ok(());
        }
        match key {
            "OMNIFETCH_HOST" => self.host = Some(value.to_string()),
            "OMNIFETCH_PORT" => self.port = Some(parse_number(key, value, origin)?),
            "PORT" => self.platform_port = Some(parse_number(key, value, origin)?),
            "EXTRACTOR_PATH" => self.extractor_path = Some(PathBuf::from(value)),
            "STATE_DIR" => self.state_dir = Some(PathBuf::from(value)),
            "COOKIES_FILE" => self.cookies_file = Some(PathBuf::from(value)),
            "CATALOG_TOKEN" => self.catalog_token = Some(value.to_string()),
            "CATALOG_BASE_URL" => self.catalog_base_url = Some(value.to_string()),
            "RESOLVER_BASE_URL" => self.resolver_base_url = Some(value.to_string()),
            "FALLBACK_RESOLVER_URL" => self.fallback_resolver_url = Some(value.to_string()),
            "FALLBACK_RESOLVER_KEY" => self.fallback_resolver_key = Some(value.to_string()),
            "INFO_TIMEOUT_SECS" => {
                self.info_timeout_secs = Some(parse_number(key, value, origin)?)
            }
            "KILL_GRACE_SECS" => self.kill_grace_secs = Some(parse_number(key, value, origin)?),
            _ => {}
        }
        Ok(())
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str, origin: &str) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .parse()
        .with_context(|| format!("Parsing {key} from {origin}"))
}

/// Fully resolved runtime settings.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    pub extractor_path: Option<PathBuf>,
    pub state_dir: PathBuf,
    pub cookies_file: PathBuf,
    pub catalog_token: Option<String>,
    pub catalog_base_url: String,
    pub resolver_base_url: String,
    pub fallback_resolver_url: Option<String>,
    pub fallback_resolver_key: Option<String>,
    pub info_timeout: Duration,
    pub kill_grace: Duration,
}

pub fn read_env_config(path: &Path) -> Result<Option<EnvConfig>> {
    if !path.exists() {
        return Ok(None);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    let origin = path.display().to_string();
    let mut cfg = EnvConfig::default();
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        if let Some((key, value_raw)) = trimmed.split_once('=') {
            let value = value_raw.trim().trim_matches('"');
            cfg.apply(key.trim(), value, &origin)?;
        }
    }
    Ok(Some(cfg))
}

pub fn load_config(path: impl AsRef<Path>) -> Result<GatewayConfig> {
    load_config_with_env(path, |key| std::env::var(key).ok())
}

/// Reads the optional env file at `path`, then lets `env` override each key.
pub fn load_config_with_env(
    path: impl AsRef<Path>,
    env: impl Fn(&str) -> Option<String>,
) -> Result<GatewayConfig> {
    let path = path.as_ref();
    let mut cfg = read_env_config(path)?.unwrap_or_default();
    for key in KEYS {
        if let Some(value) = env(key) {
            cfg.apply(key, value.trim(), "the environment")?;
        }
    }

    let state_dir = cfg
        .state_dir
        .unwrap_or_else(|| PathBuf::from(DEFAULT_STATE_DIR));
    let cookies_file = cfg
        .cookies_file
        .unwrap_or_else(|| state_dir.join(COOKIES_FILE_NAME));
    let info_timeout_secs = cfg.info_timeout_secs.unwrap_or(DEFAULT_INFO_TIMEOUT_SECS);
    if info_timeout_secs == 0 {
        return Err(anyhow!("INFO_TIMEOUT_SECS must be greater than zero"));
    }

    Ok(GatewayConfig {
        host: cfg.host.unwrap_or_else(|| DEFAULT_HOST.to_string()),
        port: cfg.port.or(cfg.platform_port).unwrap_or(DEFAULT_PORT),
        extractor_path: cfg.extractor_path,
        state_dir,
        cookies_file,
        catalog_token: cfg.catalog_token,
        catalog_base_url: cfg
            .catalog_base_url
            .unwrap_or_else(|| DEFAULT_CATALOG_BASE.to_string()),
        resolver_base_url: cfg
            .resolver_base_url
            .unwrap_or_else(|| DEFAULT_RESOLVER_BASE.to_string()),
        fallback_resolver_url: cfg.fallback_resolver_url,
        fallback_resolver_key: cfg.fallback_resolver_key,
        info_timeout: Duration::from_secs(info_timeout_secs),
        kill_grace: Duration::from_secs(cfg.kill_grace_secs.unwrap_or(DEFAULT_KILL_GRACE_SECS)),
    })
}

/// Writes cookie content handed over through the environment to `path`.
///
/// Hosting dashboards often turn newlines into a literal `\n`; those are
/// restored. Returns whether a file was written.
pub fn bootstrap_cookies(content: Option<&str>, path: &Path) -> Result<bool> {
    let Some(content) = content.filter(|content| !content.trim().is_empty()) else {
        return Ok(false);
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating cookie directory {}", parent.display()))?;
    }
    let normalized = content.replace("\\n", "\n");
    fs::write(path, normalized).with_context(|| format!("writing {}", path.display()))?;
    Ok(true)
}

#![forbid(unsafe_code)]

use std::{net::SocketAddr, path::PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use omnifetch::{
    config::{DEFAULT_CONFIG_PATH, GatewayConfig, bootstrap_cookies, load_config},
    extractor::{Extractor, default_candidates},
    logging::init_logging,
    server::{AppState, router},
};
use tokio::signal;

#[derive(Parser, Debug)]
#[command(author, version, about = "Stream media downloads through yt-dlp over HTTP.")]
struct Args {
    #[arg(long = "config", value_name = "PATH", default_value = DEFAULT_CONFIG_PATH, help = "Path to the env-style config file")]
    config: PathBuf,
    #[arg(long = "host", value_name = "ADDR", help = "Address to listen on")]
    host: Option<String>,
    #[arg(short = 'p', long = "port", value_name = "PORT", help = "Port to listen on")]
    port: Option<u16>,
    #[arg(
        long = "extractor",
        value_name = "PATH",
        help = "yt-dlp binary to use instead of searching for one"
    )]
    extractor: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let args = Args::parse();

    let mut config = load_config(&args.config)
        .with_context(|| format!("loading configuration from {}", args.config.display()))?;
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if args.extractor.is_some() {
        config.extractor_path = args.extractor;
    }

    prepare_cookies(&config)?;
    let extractor = locate_extractor(&config)
        .await
        .with_info_timeout(config.info_timeout)
        .with_kill_grace(config.kill_grace);

    let app = router(AppState::from_config(extractor, &config));

    let addr = SocketAddr::new(
        config
            .host
            .parse()
            .with_context(|| format!("parsing listen address {}", config.host))?,
        config.port,
    );
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {}", addr))?;
    tracing::info!(%addr, "OmniFetch listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running gateway")?;

    tracing::info!("gateway stopped");
    Ok(())
}

fn prepare_cookies(config: &GatewayConfig) -> Result<()> {
    let content = std::env::var("YOUTUBE_COOKIES").ok();
    if bootstrap_cookies(content.as_deref(), &config.cookies_file)? {
        tracing::info!(path = %config.cookies_file.display(), "cookies written from YOUTUBE_COOKIES");
    } else if !config.cookies_file.is_file() {
        tracing::warn!(
            path = %config.cookies_file.display(),
            "no cookies file; some sites may refuse downloads"
        );
    }
    Ok(())
}

async fn locate_extractor(config: &GatewayConfig) -> Extractor {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let candidates = default_candidates(config.extractor_path.as_deref(), home.as_deref());
    let program = match Extractor::discover(&candidates).await {
        Some((path, version)) => {
            tracing::info!(path = %path.display(), %version, "extractor found");
            path
        }
        None => {
            tracing::error!(
                tried = ?candidates,
                "no working yt-dlp found; downloads will fail until one is installed"
            );
            PathBuf::from("yt-dlp")
        }
    };
    Extractor::new(program, &config.cookies_file)
}

async fn shutdown_signal() {
    if let Err(err) = signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to install Ctrl+C handler");
    }
}

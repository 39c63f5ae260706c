use std::{env, net::Ipv4Addr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, anyhow};
use clap::Parser;
use directories::ProjectDirs;
use hlsladder_video_server::{Ffmpeg, PipelineConfig, VideoServerState, create_router};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const APP_NAME: &str = "hlsladder";
const SWEEP_INTERVAL: Duration = Duration::from_secs(15 * 60);

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Sets the IP address to bind the server to
    #[arg(long, default_value = "0.0.0.0", env = "HLSLADDER_HOST")]
    host: Ipv4Addr,

    /// Sets the Port to bind the server to
    #[arg(long, default_value_t = 5000, env = "HLSLADDER_PORT")]
    port: u16,

    /// Root of the per-job input and output areas
    #[arg(long, env = "HLSLADDER_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Encoder binary
    #[arg(long, default_value = "ffmpeg", env = "HLSLADDER_FFMPEG")]
    ffmpeg: PathBuf,

    /// Probe binary
    #[arg(long, default_value = "ffprobe", env = "HLSLADDER_FFPROBE")]
    ffprobe: PathBuf,

    /// Kills an encode after this many seconds (0 disables the limit)
    #[arg(long, default_value_t = 3600, env = "HLSLADDER_ENCODE_TIMEOUT")]
    encode_timeout: u64,

    /// Deletes job directories older than this many hours
    #[arg(long, env = "HLSLADDER_RETAIN_HOURS")]
    retain_hours: Option<u64>,
}

fn resolve_data_dir(explicit: Option<PathBuf>) -> anyhow::Result<PathBuf> {
    if let Some(dir) = explicit {
        return Ok(dir);
    }

    let proj_dirs = ProjectDirs::from("", "", APP_NAME)
        .ok_or_else(|| anyhow!("Could not determine home directory"))?;
    Ok(proj_dirs.data_dir().join("ffmpeg"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Cli::parse();

    let rust_log = env::var(EnvFilter::DEFAULT_ENV).unwrap_or_default();
    let env_filter = match rust_log.is_empty() {
        true => EnvFilter::builder().parse_lossy("info"),
        false => EnvFilter::builder().parse_lossy(rust_log),
    };
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let data_dir = resolve_data_dir(args.data_dir)?;
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("Failed to create data dir {}", data_dir.display()))?;
    info!("Using data directory: {}", data_dir.display());

    let mut config = PipelineConfig::new(data_dir);
    config.ffmpeg_bin = args.ffmpeg;
    config.ffprobe_bin = args.ffprobe;
    config.encode_timeout_secs = (args.encode_timeout > 0).then_some(args.encode_timeout);

    let ffmpeg = Ffmpeg::new(config.ffmpeg_bin.clone(), config.ffprobe_bin.clone()).await?;
    let state = VideoServerState::new(&config, Arc::new(ffmpeg));
    let transcoder = state.transcoder.clone();

    if let Some(hours) = args.retain_hours {
        let sweeper = transcoder.clone();
        let max_age = Duration::from_secs(hours * 3600);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                interval.tick().await;
                match sweeper.sweep_stale(max_age).await {
                    Ok(0) => {}
                    Ok(n) => info!("Removed {n} stale job(s)"),
                    Err(err) => warn!("Stale job sweep failed: {err}"),
                }
            }
        });
    }

    let app = create_router(state);

    let listener_addr = format!("{}:{}", args.host, args.port);
    let listener = tokio::net::TcpListener::bind(&listener_addr)
        .await
        .with_context(|| format!("Failed to bind {listener_addr}"))?;
    info!("Video server running at http://{listener_addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Received Ctrl+C, shutting down server..."),
                Err(err) => error!("Unable to listen for shutdown signal: {err}"),
            }
            transcoder.cancel_all();
        })
        .await
        .context("Server failed")?;

    info!("Web server shutdown complete.");
    Ok(())
}

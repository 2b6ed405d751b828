use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use robprof::bridge::replay::{ReplayBridge, REPLAY_REGS};
use robprof::bridge::TraceInfo;
use robprof::config::Config;
use robprof::dispatch::Session;
use robprof::token::TOKEN_BYTES;

/// Replays a captured ROB trace stream through the analysis workers.
#[derive(Parser)]
#[command(name = "robprof", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,
}

/// Build-time version info.
mod version {
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Full version string with platform info.
    pub fn full() -> String {
        format!(
            "{} ({}/{})",
            RELEASE,
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(Command::Version) = &cli.command {
        println!("robprof {}", version::full());
        return Ok(());
    }

    let filter = EnvFilter::try_new(&cli.log_level)
        .with_context(|| format!("invalid log level: {}", cli.log_level))?;
    fmt().with_env_filter(filter).with_target(true).init();

    let config_path = cli
        .config
        .context("--config is required (use --help for usage)")?;
    let cfg = Config::load(&config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?;

    std::fs::create_dir_all(&cfg.output_dir)
        .with_context(|| format!("creating output directory {}", cfg.output_dir.display()))?;

    tracing::info!(
        version = version::RELEASE,
        stream = %cfg.bridge.stream_path.display(),
        workers = cfg.workers.len(),
        "starting robprof",
    );

    let bridge = ReplayBridge::open(&cfg.bridge.stream_path)?;
    let info = TraceInfo {
        tracer_id: 0,
        token_bytes: TOKEN_BYTES,
        output_dir: cfg.output_dir.clone(),
    };

    let mut session = Session::new(&cfg, &info, bridge, REPLAY_REGS)?;
    session.run_to_end()?;
    let stats = session.finish();

    tracing::info!(
        tokens = stats.total_tokens,
        buffers = stats.buffers_published,
        "robprof finished",
    );

    Ok(())
}

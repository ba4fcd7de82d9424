use anyhow::{Context, Result};
use clap::Parser;
use ohvpn_core::{logging, LaunchConfig, LinuxPlatform, LogLevel, Ohvpn, PlatformSupport};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

/// ohvpn - TUN interface to per-flow proxy bridge
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Launch configuration (JSON)
    #[arg(short, long)]
    config: PathBuf,

    /// Log level: error, warning, info, debug, trace or silent
    #[arg(long, default_value = "info")]
    log_level: LogLevel,

    /// Validate the launch configuration and exit
    #[arg(short, long)]
    test_config: bool,
}

async fn wait_for_signal() {
    use futures::StreamExt;
    match signal_hook_tokio::Signals::new([
        signal_hook::consts::SIGINT,
        signal_hook::consts::SIGTERM,
    ]) {
        Ok(mut signals) => {
            if let Some(signal) = signals.next().await {
                tracing::info!("Received signal {}, shutting down", signal);
            }
        }
        Err(e) => {
            tracing::error!("Failed to install signal handlers: {}", e);
            futures::future::pending::<()>().await;
        }
    }
}

async fn run(args: Args) -> Result<()> {
    let config = LaunchConfig::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;

    if args.test_config {
        println!("Configuration test passed!");
        return Ok(());
    }

    let platform: Arc<dyn PlatformSupport> = Arc::new(LinuxPlatform::new());
    logging::init_logging(args.log_level, Some(platform.clone()))?;

    let mut ohvpn = Ohvpn::new(config, platform)?;
    ohvpn.start().await.context("starting ohvpn")?;

    tokio::select! {
        _ = wait_for_signal() => {}
        _ = ohvpn.wait() => tracing::warn!("TUN interface went down"),
    }

    ohvpn.close().await;
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("ohvpn: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

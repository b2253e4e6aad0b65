pub mod tunnel_cli;

use anyhow::Result;
use client_core::run_tunnels;
use ssh_core::logging::tracing_logger;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tunnel_cli::{TunnelArgs, describe};

/// `filter` wins over `RUST_LOG`; the default is `info`.
pub fn init_tracing(filter: Option<&str>) {
    let env_filter = match filter {
        Some(filter) => tracing_subscriber::EnvFilter::new(filter),
        None => tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
    };
    let _ = tracing_subscriber::fmt().with_env_filter(env_filter).try_init();
}

pub async fn run(args: TunnelArgs) -> Result<()> {
    if args.check {
        let (_, hops) = args.load()?;
        for line in describe(&hops) {
            println!("{line}");
        }
        return Ok(());
    }

    let cancel = CancellationToken::new();
    cancel_on_signal(cancel.clone());
    let report = run_tunnels(&args.config, cancel, tracing_logger()).await?;
    for failure in &report.failures {
        warn!("{failure}");
    }
    info!("all tunnels closed");
    Ok(())
}

fn cancel_on_signal(cancel: CancellationToken) {
    tokio::spawn(async move {
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = wait_for_signal() => {
                info!("termination requested, closing tunnels");
                cancel.cancel();
            }
        }
    });
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = terminate.recv() => {}
            }
        }
        Err(err) => {
            warn!(?err, "SIGTERM handler unavailable; only Ctrl-C stops the tunnels");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

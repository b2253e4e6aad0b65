use clap::Parser;
use hc_cli::{init_tracing, run, tunnel_cli::TunnelArgs};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = TunnelArgs::parse();
    init_tracing(args.log_level.as_deref());
    run(args).await
}

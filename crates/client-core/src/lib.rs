mod auth;
pub mod error;
mod hostkeys;
pub mod secrets;
pub mod transport;

use std::path::Path;

pub use error::{ClientError, ClientResult};
use hc_types::{HopSpec, TunnelFile};
pub use hostkeys::HostKeyPolicy;
pub use secrets::SecretsVault;
use ssh_core::{
    logging::SharedLogger, topology::{Orchestrator, TopologyReport}
};
use tokio_util::sync::CancellationToken;
use tracing::info;
pub use transport::SshTransport;

/// Load `path`, resolve every secret, then run the hop forest until `cancel` fires
/// or every hop has ended.
pub async fn run_tunnels(path: &Path, cancel: CancellationToken, logger: SharedLogger) -> ClientResult<TopologyReport> {
    let file = TunnelFile::load(path)?;
    let hops = file.hops()?;
    let vault = SecretsVault::from_env_or_prompt(&file.secrets)?;
    info!(hops = hops.len(), secrets = vault.len(), "configuration loaded from {}", path.display());
    run_hops(hops, vault, cancel, logger).await
}

/// Run validated hops with an already resolved vault.
pub async fn run_hops(hops: Vec<HopSpec>, vault: SecretsVault, cancel: CancellationToken, logger: SharedLogger) -> ClientResult<TopologyReport> {
    let report = Orchestrator::new(SshTransport::new(), vault)
        .logger(logger)
        .run(hops, cancel)
        .await?;
    Ok(report)
}

use std::time::Duration;

use tokio::{io::AsyncWriteExt, time};

use super::{device::NetworkDevice, rules::Endpoint};

/// Best-effort reachability check; never waits longer than `timeout`.
///
/// A dial that resolves after the deadline is dropped with the abandoned
/// future, which closes it without a report.
pub async fn is_reachable(device: &dyn NetworkDevice, target: &Endpoint, timeout: Duration) -> bool {
    let origin = Endpoint::new("127.0.0.1", 0);
    match time::timeout(timeout, device.dial(target, &origin)).await {
        Ok(Ok(mut stream)) => {
            let _ = time::timeout(timeout, stream.shutdown()).await;
            true
        }
        Ok(Err(_)) | Err(_) => false,
    }
}

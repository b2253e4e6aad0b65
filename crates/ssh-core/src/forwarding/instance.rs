use std::{io, time::Duration};

use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt}, time
};
use tokio_util::sync::CancellationToken;

use super::device::ForwardStream;
use crate::{fabric_debug, fabric_warn, logging::SharedLogger};

const COPY_BUFFER: usize = 16 * 1024;
const SHUTDOWN_GRACE: Duration = Duration::from_millis(250);

/// How an instance ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InstanceEnd {
    /// The accepted side reached end of stream (or reset) first.
    AcceptedClosed,
    /// The dialed side reached end of stream (or reset) first.
    DialedClosed,
    /// The hop was cancelled.
    Cancelled,
    /// A non-graceful I/O error stopped one direction.
    Failed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InstanceReport {
    pub end: InstanceEnd,
    /// Bytes copied from the accepted connection to the dialed one.
    pub upstream: u64,
    /// Bytes copied from the dialed connection back to the accepted one.
    pub downstream: u64,
}

/// One accepted connection paired with one dialed connection.
pub struct TunnelInstance {
    rule: String,
    accepted: ForwardStream,
    dialed: ForwardStream,
}

impl TunnelInstance {
    pub fn new(rule: impl Into<String>, accepted: ForwardStream, dialed: ForwardStream) -> Self {
        Self {
            rule: rule.into(),
            accepted,
            dialed,
        }
    }

    /// Copy both ways until either side finishes or `cancel` fires, then close both.
    /// Half-closed connections are not kept open.
    pub async fn run(self, cancel: CancellationToken, logger: SharedLogger) -> InstanceReport {
        let (mut accepted_rd, mut accepted_wr) = tokio::io::split(self.accepted);
        let (mut dialed_rd, mut dialed_wr) = tokio::io::split(self.dialed);
        let mut upstream = 0u64;
        let mut downstream = 0u64;

        let (end, error) = tokio::select! {
            _ = cancel.cancelled() => (InstanceEnd::Cancelled, None),
            res = pump(&mut accepted_rd, &mut dialed_wr, &mut upstream) => classify(res, InstanceEnd::AcceptedClosed),
            res = pump(&mut dialed_rd, &mut accepted_wr, &mut downstream) => classify(res, InstanceEnd::DialedClosed),
        };

        let _ = time::timeout(SHUTDOWN_GRACE, dialed_wr.shutdown()).await;
        let _ = time::timeout(SHUTDOWN_GRACE, accepted_wr.shutdown()).await;
        drop((accepted_rd, accepted_wr, dialed_rd, dialed_wr));

        if let Some(err) = error {
            fabric_warn!(logger, "tunnel {}: copy failed: {err}", self.rule);
        }
        fabric_debug!(
            logger,
            "tunnel {}: finished copying {upstream} bytes upstream and {downstream} bytes downstream ({end:?})",
            self.rule
        );
        InstanceReport { end, upstream, downstream }
    }
}

async fn pump<R, W>(reader: &mut R, writer: &mut W, copied: &mut u64) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUFFER];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
        *copied += n as u64;
    }
}

fn classify(result: io::Result<()>, finished: InstanceEnd) -> (InstanceEnd, Option<io::Error>) {
    match result {
        Ok(()) => (finished, None),
        // Treat common half-close races as graceful termination.
        Err(err) if is_graceful(&err) => (finished, None),
        Err(err) => (InstanceEnd::Failed, Some(err)),
    }
}

fn is_graceful(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::BrokenPipe | io::ErrorKind::NotConnected | io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted
    )
}

#[cfg(test)]
#[path = "instance_tests.rs"]
mod tests;

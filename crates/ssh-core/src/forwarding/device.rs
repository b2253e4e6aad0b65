use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use super::rules::Endpoint;

type Result<T> = crate::SshResult<T>;

/// Trait for streams that can be used for forwarding.
pub trait ForwardStreamIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> ForwardStreamIo for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// Type alias for boxed forward streams.
pub type ForwardStream = Box<dyn ForwardStreamIo>;

/// An inbound connection handed out by a [`DeviceListener`].
pub struct Accepted {
    pub stream: ForwardStream,
    /// Where the connection came from, for logs and channel-open requests.
    pub origin: Endpoint,
}

/// A bound socket serving exactly one rule.
#[async_trait]
pub trait DeviceListener: Send {
    /// Wait for the next inbound connection.
    async fn accept(&mut self) -> Result<Accepted>;

    /// Bound address; the port may differ from the requested one when the peer picked it.
    fn local_endpoint(&self) -> Endpoint;

    /// Stop listening. Safe to call more than once.
    async fn close(&mut self);
}

/// "Somewhere that can listen and dial": the local machine, or the peer of a
/// control connection. Forward rules listen locally and dial remotely; reverse
/// rules do the opposite.
#[async_trait]
pub trait NetworkDevice: Send + Sync {
    async fn listen(&self, bind: &Endpoint) -> Result<Box<dyn DeviceListener>>;

    async fn dial(&self, target: &Endpoint, origin: &Endpoint) -> Result<ForwardStream>;
}

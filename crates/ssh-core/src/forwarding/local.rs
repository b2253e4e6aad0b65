use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tracing::debug;

use super::{
    device::{Accepted, DeviceListener, ForwardStream, NetworkDevice}, rules::Endpoint
};
use crate::SshCoreError;

type Result<T> = crate::SshResult<T>;

/// The machine this process runs on.
#[derive(Clone, Copy, Debug, Default)]
pub struct LocalNetwork;

#[async_trait]
impl NetworkDevice for LocalNetwork {
    async fn listen(&self, bind: &Endpoint) -> Result<Box<dyn DeviceListener>> {
        let listener = TcpListener::bind((bind.host.as_str(), bind.port))
            .await
            .map_err(|source| SshCoreError::BindFailed {
                address: bind.to_string(),
                source,
            })?;
        let local = listener.local_addr()?;
        debug!(bind = %bind, "local listener bound");
        Ok(Box::new(LocalListener {
            listener: Some(listener),
            endpoint: Endpoint::new(bind.host.clone(), local.port()),
        }))
    }

    async fn dial(&self, target: &Endpoint, _origin: &Endpoint) -> Result<ForwardStream> {
        let stream = TcpStream::connect((target.host.as_str(), target.port))
            .await
            .map_err(|source| SshCoreError::ConnectionFailed {
                address: target.to_string(),
                source,
            })?;
        stream.set_nodelay(true).ok();
        Ok(Box::new(stream))
    }
}

struct LocalListener {
    listener: Option<TcpListener>,
    endpoint: Endpoint,
}

#[async_trait]
impl DeviceListener for LocalListener {
    async fn accept(&mut self) -> Result<Accepted> {
        let listener = self
            .listener
            .as_ref()
            .ok_or_else(|| SshCoreError::Other(format!("listener on {} is closed", self.endpoint)))?;
        let (stream, origin) = listener.accept().await?;
        stream.set_nodelay(true).ok();
        Ok(Accepted {
            stream: Box::new(stream),
            origin: Endpoint::new(origin.ip().to_string(), origin.port()),
        })
    }

    fn local_endpoint(&self) -> Endpoint {
        self.endpoint.clone()
    }

    async fn close(&mut self) {
        if self.listener.take().is_some() {
            debug!(bind = %self.endpoint, "local listener closed");
        }
    }
}

//! russh-backed control connection.
//!
//! [`SshControl`] adapts an authenticated `russh` client handle to the
//! [`ControlConnection`] seam. Inbound `forwarded-tcpip` channels arrive on the
//! client handler, which hands them to [`ForwardedChannels::dispatch`]; the
//! registry routes each one to the remote listener that asked for its port.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use russh::{
    Channel, Disconnect,
    client::{self, Handle},
};
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    SshCoreError, forwarding::{Accepted, DeviceListener, Endpoint, ForwardStream}, transport::ControlConnection
};

type Result<T> = crate::SshResult<T>;

pub type SessionHandle<H> = Handle<H>;
pub type SharedSessionHandle<H> = Arc<RwLock<Handle<H>>>;

/// Routes inbound forwarded channels by the port the peer accepted them on.
#[derive(Clone, Default)]
pub struct ForwardedChannels {
    routes: Arc<Mutex<HashMap<u32, mpsc::UnboundedSender<Accepted>>>>,
}

impl ForwardedChannels {
    pub fn new() -> Self {
        Self::default()
    }

    async fn register(&self, port: u32, route: mpsc::UnboundedSender<Accepted>) {
        self.routes.lock().await.insert(port, route);
    }

    async fn unregister(&self, port: u32) {
        self.routes.lock().await.remove(&port);
    }

    /// Deliver a `forwarded-tcpip` channel to its listener, or close it when no
    /// listener claims the port.
    pub async fn dispatch(
        &self,
        channel: Channel<client::Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
    ) {
        let route = self.routes.lock().await.get(&connected_port).cloned();
        let Some(route) = route else {
            warn!(
                address = connected_address,
                port = connected_port,
                "received forwarded-tcpip with no matching reverse rule"
            );
            let _ = channel.close().await;
            return;
        };
        let accepted = Accepted {
            stream: Box::new(channel.into_stream()),
            origin: Endpoint::new(originator_address, u16::try_from(originator_port).unwrap_or_default()),
        };
        if route.send(accepted).is_err() {
            debug!(port = connected_port, "reverse listener already closed; dropping channel");
        }
    }
}

/// An authenticated SSH session used as a hop's control connection.
pub struct SshControl<H>
where
    H: client::Handler,
{
    handle: SharedSessionHandle<H>,
    destination: String,
    forwarded: ForwardedChannels,
    closed: CancellationToken,
}

impl<H> SshControl<H>
where
    H: client::Handler,
{
    /// `closed` must be cancelled when the session ends; the client handler
    /// usually holds its drop guard.
    pub fn new(handle: Handle<H>, destination: impl Into<String>, forwarded: ForwardedChannels, closed: CancellationToken) -> Self {
        Self {
            handle: Arc::new(RwLock::new(handle)),
            destination: destination.into(),
            forwarded,
            closed,
        }
    }
}

#[async_trait]
impl<H> ControlConnection for SshControl<H>
where
    H: client::Handler + Send + Sync + 'static,
{
    async fn open_channel(&self, target: &Endpoint, origin: &Endpoint) -> Result<ForwardStream> {
        if self.closed.is_cancelled() {
            return Err(SshCoreError::ControlClosed(self.destination.clone()));
        }
        let handle = self.handle.read().await;
        let channel = handle
            .channel_open_direct_tcpip(target.host.clone(), target.port.into(), origin.host.clone(), origin.port.into())
            .await
            .map_err(|err| SshCoreError::ChannelFailed {
                address: target.to_string(),
                message: err.to_string(),
            })?;
        Ok(Box::new(channel.into_stream()))
    }

    async fn request_remote_listen(&self, bind: &Endpoint) -> Result<Box<dyn DeviceListener>> {
        let (route, incoming) = mpsc::unbounded_channel();
        let requested = u32::from(bind.port);
        self.forwarded.register(requested, route.clone()).await;
        let assigned = {
            let mut handle = self.handle.write().await;
            handle.tcpip_forward(bind.host.clone(), requested).await
        };
        let assigned = match assigned {
            Ok(assigned) => assigned,
            Err(err) => {
                self.forwarded.unregister(requested).await;
                return Err(SshCoreError::RemoteBindFailed {
                    address: bind.to_string(),
                    message: err.to_string(),
                });
            }
        };
        let port = u16::try_from(assigned).ok().filter(|port| *port != 0).unwrap_or(bind.port);
        if u32::from(port) != requested {
            self.forwarded.unregister(requested).await;
            self.forwarded.register(u32::from(port), route).await;
        }
        debug!(bind = %bind, port, destination = %self.destination, "remote listener registered");
        Ok(Box::new(RemoteListener {
            handle: Arc::clone(&self.handle),
            forwarded: self.forwarded.clone(),
            endpoint: Endpoint::new(bind.host.clone(), port),
            incoming,
            closed: false,
        }))
    }

    async fn wait_closed(&self) {
        self.closed.cancelled().await
    }

    async fn close(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        let handle = self.handle.read().await;
        if let Err(err) = handle.disconnect(Disconnect::ByApplication, "", "en").await {
            debug!(?err, destination = %self.destination, "disconnect failed");
        }
        self.closed.cancel();
    }
}

struct RemoteListener<H>
where
    H: client::Handler,
{
    handle: SharedSessionHandle<H>,
    forwarded: ForwardedChannels,
    endpoint: Endpoint,
    incoming: mpsc::UnboundedReceiver<Accepted>,
    closed: bool,
}

#[async_trait]
impl<H> DeviceListener for RemoteListener<H>
where
    H: client::Handler + Send + Sync + 'static,
{
    async fn accept(&mut self) -> Result<Accepted> {
        self.incoming
            .recv()
            .await
            .ok_or_else(|| SshCoreError::Other(format!("remote listener on {} is closed", self.endpoint)))
    }

    fn local_endpoint(&self) -> Endpoint {
        self.endpoint.clone()
    }

    async fn close(&mut self) {
        if std::mem::replace(&mut self.closed, true) {
            return;
        }
        self.forwarded.unregister(u32::from(self.endpoint.port)).await;
        self.incoming.close();
        let handle = self.handle.read().await;
        if let Err(err) = handle
            .cancel_tcpip_forward(self.endpoint.host.clone(), u32::from(self.endpoint.port))
            .await
        {
            debug!(?err, bind = %self.endpoint, "failed to cancel remote forward");
        }
    }
}

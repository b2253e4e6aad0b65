use std::sync::Arc;

use async_trait::async_trait;

use super::{
    device::{DeviceListener, ForwardStream, NetworkDevice}, rules::Endpoint
};
use crate::transport::ControlConnection;

type Result<T> = crate::SshResult<T>;

/// The peer at the far end of a control connection.
pub struct RemoteNetwork<C> {
    control: Arc<C>,
}

impl<C> RemoteNetwork<C> {
    pub fn new(control: Arc<C>) -> Self {
        Self { control }
    }
}

impl<C> Clone for RemoteNetwork<C> {
    fn clone(&self) -> Self {
        Self {
            control: Arc::clone(&self.control),
        }
    }
}

#[async_trait]
impl<C> NetworkDevice for RemoteNetwork<C>
where
    C: ControlConnection,
{
    async fn listen(&self, bind: &Endpoint) -> Result<Box<dyn DeviceListener>> {
        self.control.request_remote_listen(bind).await
    }

    async fn dial(&self, target: &Endpoint, origin: &Endpoint) -> Result<ForwardStream> {
        self.control.open_channel(target, origin).await
    }
}

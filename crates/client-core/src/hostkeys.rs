// Internal Result type alias
type Result<T> = crate::ClientResult<T>;
use russh::{
    Channel, client::{Msg, Session}, keys::{HashAlg, PublicKey}
};
use ssh_core::session::ForwardedChannels;
use tokio_util::sync::DropGuard;
use tracing::{info, warn};

/// How a hop's server key is checked.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HostKeyPolicy {
    /// Accept whatever the server presents; the fingerprint is still logged.
    AcceptAny,
    /// Require this `SHA256:...` fingerprint.
    Pinned(String),
}

impl HostKeyPolicy {
    pub fn from_pin(pin: Option<&str>) -> Self {
        match pin.map(str::trim).filter(|pin| !pin.is_empty()) {
            Some(pin) => HostKeyPolicy::Pinned(pin.to_string()),
            None => HostKeyPolicy::AcceptAny,
        }
    }

    pub fn check(&self, authority: &str, server_key: &PublicKey) -> Result<bool> {
        let presented = server_key.fingerprint(HashAlg::Sha256).to_string();
        match self {
            HostKeyPolicy::AcceptAny => {
                info!("accepting host key for {authority} ({presented})");
                Ok(true)
            }
            HostKeyPolicy::Pinned(expected) if fingerprints_match(expected, &presented) => {
                info!("host key for {authority} verified against pinned fingerprint");
                Ok(true)
            }
            HostKeyPolicy::Pinned(expected) => Err(crate::ClientError::HostKeyFailed(format!(
                "host key mismatch for {authority} (pinned {expected} vs received {presented})"
            ))),
        }
    }
}

fn fingerprints_match(expected: &str, presented: &str) -> bool {
    let expected = expected.trim();
    let expected = expected.strip_prefix("SHA256:").unwrap_or(expected).trim_end_matches('=');
    let presented = presented.strip_prefix("SHA256:").unwrap_or(presented).trim_end_matches('=');
    expected == presented
}

/// Per-connection russh handler.
///
/// The drop guard cancels the control connection's "closed" token once russh
/// drops the handler, which happens when the session ends for any reason.
pub struct ClientHandler {
    authority: String,
    policy: HostKeyPolicy,
    forwarded: ForwardedChannels,
    _closed: DropGuard,
}

impl ClientHandler {
    pub fn new(authority: String, policy: HostKeyPolicy, forwarded: ForwardedChannels, closed: DropGuard) -> Self {
        Self {
            authority,
            policy,
            forwarded,
            _closed: closed,
        }
    }
}

impl russh::client::Handler for ClientHandler {
    type Error = crate::ClientError;

    fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> impl std::future::Future<Output = std::result::Result<bool, Self::Error>> + Send {
        let verdict = self.policy.check(&self.authority, server_public_key);
        async move { verdict }
    }

    fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut Session,
    ) -> impl std::future::Future<Output = std::result::Result<(), Self::Error>> + Send {
        let forwarded = self.forwarded.clone();
        let connected_address = connected_address.to_string();
        let originator_address = originator_address.to_string();
        async move {
            forwarded
                .dispatch(channel, &connected_address, connected_port, &originator_address, originator_port)
                .await;
            Ok(())
        }
    }

    fn server_channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> impl std::future::Future<Output = std::result::Result<(), Self::Error>> + Send {
        warn!(host = host_to_connect, port = port_to_connect, "server opened an unsolicited direct-tcpip channel");
        async move {
            let _ = channel.close().await;
            Ok(())
        }
    }
}

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use hc_types::HopSpec;
use russh::client;
use ssh_core::{
    SshCoreError, SshResult, crypto::preferred_for, forwarding::Endpoint, session::{ForwardedChannels, SshControl}, transport::{Credential, Transport}
};
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    ClientError, auth::authenticate, hostkeys::{ClientHandler, HostKeyPolicy}
};

const DEFAULT_SSH_PORT: u16 = 22;
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Dials hops with russh.
#[derive(Clone, Debug, Default)]
pub struct SshTransport {
    keepalive_interval: Option<Duration>,
}

impl SshTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the keepalive interval (30 seconds by default).
    pub fn keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval = Some(interval);
        self
    }

    fn config(&self, hop: &HopSpec) -> client::Config {
        if hop.legacy_crypto {
            warn!(destination = %hop.destination, "legacy crypto enabled: offering weak kex and cipher suites");
        }
        client::Config {
            preferred: preferred_for(hop.legacy_crypto),
            nodelay: true,
            inactivity_timeout: None,
            keepalive_interval: Some(self.keepalive_interval.unwrap_or(KEEPALIVE_INTERVAL)),
            keepalive_max: 3,
            ..Default::default()
        }
    }
}

#[async_trait]
impl Transport for SshTransport {
    type Control = SshControl<ClientHandler>;

    async fn dial(&self, hop: &HopSpec, credentials: &[Credential]) -> SshResult<Self::Control> {
        let endpoint = Endpoint::parse_with_default_port(&hop.destination, DEFAULT_SSH_PORT)?;
        let authority = endpoint.to_string();
        let closed = CancellationToken::new();
        let forwarded = ForwardedChannels::new();
        let handler = ClientHandler::new(
            authority.clone(),
            HostKeyPolicy::from_pin(hop.host_key.as_deref()),
            forwarded.clone(),
            closed.clone().drop_guard(),
        );

        info!("connecting to {authority} as {}", hop.user);
        let timeout = hop.dial_timeout();
        let connect = client::connect(Arc::new(self.config(hop)), (endpoint.host.as_str(), endpoint.port), handler);
        let mut session = match time::timeout(timeout, connect).await {
            Ok(Ok(session)) => session,
            Ok(Err(ClientError::HostKeyFailed(message))) => {
                return Err(SshCoreError::AuthRejected {
                    destination: authority,
                    message,
                });
            }
            Ok(Err(err)) => return Err(err.into()),
            Err(_) => {
                return Err(SshCoreError::DialTimeout {
                    address: authority,
                    timeout,
                });
            }
        };

        if let Err(err) = authenticate(&mut session, &hop.user, credentials).await {
            return Err(match err {
                ClientError::AuthFailed(message) | ClientError::Crypto(message) => SshCoreError::AuthRejected {
                    destination: authority,
                    message,
                },
                other => other.into(),
            });
        }

        Ok(SshControl::new(session, authority, forwarded, closed))
    }
}

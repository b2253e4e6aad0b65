//! Seams between the tunnel fabric and the SSH implementation.
//!
//! The fabric only needs four things from a control connection: open a
//! channel to an address on the peer, ask the peer to listen, notice when the
//! peer goes away, and close. [`Transport`] produces such connections; the
//! russh-backed implementation lives in `client-core`, tests plug in doubles.

use std::{collections::HashMap, path::PathBuf};

use async_trait::async_trait;
use hc_types::{AuthMethodSpec, HopSpec};
use secrecy::SecretString;

use crate::{
    SshCoreError, forwarding::{DeviceListener, Endpoint, ForwardStream}
};

type Result<T> = crate::SshResult<T>;

/// One authenticated session to a remote host.
#[async_trait]
pub trait ControlConnection: Send + Sync + 'static {
    /// Open an outbound channel from the peer to `target`.
    async fn open_channel(&self, target: &Endpoint, origin: &Endpoint) -> Result<ForwardStream>;

    /// Ask the peer to listen on `bind` and deliver inbound connections back here.
    async fn request_remote_listen(&self, bind: &Endpoint) -> Result<Box<dyn DeviceListener>>;

    /// Resolves once the connection is gone, whoever closed it.
    async fn wait_closed(&self);

    /// Close the session. Later calls are no-ops.
    async fn close(&self);
}

/// Dials control connections.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    type Control: ControlConnection;

    async fn dial(&self, hop: &HopSpec, credentials: &[Credential]) -> Result<Self::Control>;
}

/// Authentication material with secrets already resolved.
#[derive(Clone, Debug)]
pub enum Credential {
    Password(SecretString),
    PrivateKey {
        path: PathBuf,
        passphrase: Option<SecretString>,
    },
}

impl Credential {
    pub fn label(&self) -> &'static str {
        match self {
            Credential::Password(_) => "password",
            Credential::PrivateKey { .. } => "publickey",
        }
    }
}

/// Looks up named secrets.
pub trait SecretResolver: Send + Sync {
    fn resolve(&self, name: &str) -> Result<SecretString>;
}

impl SecretResolver for HashMap<String, SecretString> {
    fn resolve(&self, name: &str) -> Result<SecretString> {
        self.get(name).cloned().ok_or_else(|| SshCoreError::MissingSecret(name.to_string()))
    }
}

/// Resolve a hop's auth methods in order. A key file wins over a password secret.
pub fn resolve_credentials(methods: &[AuthMethodSpec], secrets: &dyn SecretResolver) -> Result<Vec<Credential>> {
    methods
        .iter()
        .map(|method| {
            if let Some(path) = &method.key_file {
                let passphrase = method.key_passphrase_secret.as_deref().map(|name| secrets.resolve(name)).transpose()?;
                return Ok(Credential::PrivateKey {
                    path: path.clone(),
                    passphrase,
                });
            }
            match &method.password_secret {
                Some(name) => Ok(Credential::Password(secrets.resolve(name)?)),
                None => Err(SshCoreError::empty("auth method")),
            }
        })
        .collect()
}

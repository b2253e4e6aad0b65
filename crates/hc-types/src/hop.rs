//! In-memory hop model.
//!
//! A [`HopSpec`] is one SSH control connection plus the rules it serves; its
//! `through` list holds the hops reached via this one. These structs carry no
//! protocol types so they can be built by config loaders, tests and the CLI alike.

use std::{path::PathBuf, time::Duration};

/// Bind address used when a rule does not name one.
pub const DEFAULT_BIND_ADDRESS: &str = "127.0.0.1";

/// Dial timeout applied when a hop does not configure one.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// One hop of the topology.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HopSpec {
    /// `host:port` of the SSH server; a missing port means 22.
    pub destination: String,
    /// Principal to authenticate as.
    pub user: String,
    /// Authentication methods, tried in order.
    pub auth: Vec<AuthMethodSpec>,
    /// Rules listening locally and dialing through the hop.
    pub forward: Vec<ForwardRule>,
    /// Rules listening on the peer and dialing locally.
    pub reverse: Vec<ReverseRule>,
    /// Hops whose control connection is reached through this one.
    pub through: Vec<HopSpec>,
    /// Dial timeout for the control connection and for every tunnel dial.
    pub timeout: Option<Duration>,
    /// Probe forward destinations before opening listeners.
    pub probe: bool,
    /// Pinned SHA-256 host key fingerprint (`SHA256:...`).
    pub host_key: Option<String>,
    /// Offer legacy key exchange and cipher suites.
    pub legacy_crypto: bool,
}

impl HopSpec {
    /// Create a hop with no rules, auth methods or children.
    pub fn new(destination: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            destination: destination.into(),
            user: user.into(),
            ..Default::default()
        }
    }

    /// Human-readable identity used in logs and errors.
    pub fn label(&self) -> String {
        format!("{}@{}", self.user, self.destination)
    }

    pub fn dial_timeout(&self) -> Duration {
        self.timeout.unwrap_or(DEFAULT_DIAL_TIMEOUT)
    }

    /// Forward and reverse rules that are not marked `ignore`.
    pub fn active_rules(&self) -> impl Iterator<Item = (RuleKind, &RuleSpec)> {
        let forward = self.forward.iter().map(|rule| (RuleKind::Forward, rule));
        let reverse = self.reverse.iter().map(|rule| (RuleKind::Reverse, rule));
        forward.chain(reverse).filter(|(_, rule)| !rule.ignore)
    }

    /// Depth-first walk over this hop and every hop reached through it.
    pub fn walk(&self) -> Vec<&HopSpec> {
        let mut out = vec![self];
        for child in &self.through {
            out.extend(child.walk());
        }
        out
    }
}

/// Which side of the hop a rule listens on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RuleKind {
    Forward,
    Reverse,
}

/// A named port forwarding rule.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RuleSpec {
    /// Name shown in logs.
    pub name: String,
    /// Optional bind address (defaults to [`DEFAULT_BIND_ADDRESS`]).
    pub bind_address: Option<String>,
    /// Port to listen on. Kept wide so out-of-range values survive until validation.
    pub port: u32,
    /// Destination as `host:port`.
    pub target: String,
    /// Skip this rule entirely.
    pub ignore: bool,
}

impl RuleSpec {
    pub fn new(name: impl Into<String>, port: u32, target: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            port,
            target: target.into(),
            ..Default::default()
        }
    }

    pub fn bind_host(&self) -> &str {
        self.bind_address.as_deref().filter(|addr| !addr.is_empty()).unwrap_or(DEFAULT_BIND_ADDRESS)
    }
}

/// Local listener, remote destination.
pub type ForwardRule = RuleSpec;
/// Remote listener, local destination.
pub type ReverseRule = RuleSpec;

/// One authentication method; secrets are referenced by name.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AuthMethodSpec {
    /// Private key file. Takes precedence over the password secret.
    pub key_file: Option<PathBuf>,
    /// Secret holding the key passphrase.
    pub key_passphrase_secret: Option<String>,
    /// Secret holding the account password.
    pub password_secret: Option<String>,
}

impl AuthMethodSpec {
    pub fn key(path: impl Into<PathBuf>) -> Self {
        Self {
            key_file: Some(path.into()),
            ..Default::default()
        }
    }

    pub fn password(secret: impl Into<String>) -> Self {
        Self {
            password_secret: Some(secret.into()),
            ..Default::default()
        }
    }

    /// Secret names this method depends on.
    pub fn secret_names(&self) -> impl Iterator<Item = &str> {
        let passphrase = self.key_file.as_ref().and(self.key_passphrase_secret.as_deref());
        let password = if self.key_file.is_some() { None } else { self.password_secret.as_deref() };
        passphrase.into_iter().chain(password)
    }
}

//! YAML configuration schema.
//!
//! Keys are lower-cased field names so existing tunnel files keep working:
//!
//! ```yaml
//! secrets:
//!   - name: bastion
//!     env: BASTION_PASSWORD
//! sshconfigs:
//!   - destination: bastion.example:22
//!     user: ops
//!     auth:
//!       - pwdauth:
//!           passwordsecret: bastion
//!     tunnels:
//!       - name: inner-ssh
//!         port: 1234
//!         target: inner.example:22
//!     throughssh:
//!       - destination: localhost:1234
//!         user: ops
//! ```
use std::{
    path::{Path, PathBuf}, time::Duration
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    hop::{AuthMethodSpec, HopSpec, RuleSpec}, validation
};

/// Errors raised while loading or validating a tunnel file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unable to open config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("unable to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("config defines no sshconfigs")]
    Empty,

    #[error("secret specified without a name")]
    UnnamedSecret,

    #[error("secret {0} is defined more than once")]
    DuplicateSecret(String),

    #[error("secret {secret} not setup (referenced by {hop})")]
    UnknownSecret { secret: String, hop: String },

    #[error("{hop}: destination must not be empty")]
    EmptyDestination { hop: String },

    #[error("{hop}: invalid auth details; set keyauth.filelocation or pwdauth.passwordsecret")]
    InvalidAuth { hop: String },

    #[error("{hop}: no authentication methods configured")]
    NoAuth { hop: String },

    #[error("local port {port} is bound by both {first} and {second}")]
    DuplicatePort { port: u32, first: String, second: String },

    #[error("{hop}: destination port {port} is forwarded by the hop itself or a hop reached through it")]
    Cycle { hop: String, port: u32 },
}

/// Top level of a tunnel file.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelFile {
    #[serde(default)]
    pub secrets: Vec<SecretEntry>,
    #[serde(default)]
    pub sshconfigs: Vec<HopEntry>,
}

/// A named secret, read from `env` or prompted for.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretEntry {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HopEntry {
    #[serde(default)]
    pub destination: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub auth: Vec<AuthEntry>,
    #[serde(default)]
    pub tunnels: Vec<TunnelEntry>,
    #[serde(default, rename = "reversetunnels")]
    pub reverse_tunnels: Vec<TunnelEntry>,
    #[serde(default, rename = "throughssh")]
    pub through_ssh: Vec<HopEntry>,
    /// Dial timeout in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub probe: bool,
    #[serde(default, rename = "hostkey", skip_serializing_if = "Option::is_none")]
    pub host_key: Option<String>,
    #[serde(default, rename = "legacycrypto")]
    pub legacy_crypto: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthEntry {
    #[serde(default, rename = "keyauth", skip_serializing_if = "Option::is_none")]
    pub key_auth: Option<KeyAuthEntry>,
    #[serde(default, rename = "pwdauth", skip_serializing_if = "Option::is_none")]
    pub password_auth: Option<PasswordAuthEntry>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyAuthEntry {
    #[serde(default, rename = "filelocation")]
    pub file_location: String,
    /// Secret holding the key passphrase.
    #[serde(default, rename = "passwordsecret", skip_serializing_if = "Option::is_none")]
    pub password_secret: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PasswordAuthEntry {
    #[serde(default, rename = "passwordsecret")]
    pub password_secret: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelEntry {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub port: u32,
    #[serde(default)]
    pub target: String,
    #[serde(default)]
    pub ignore: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bind: Option<String>,
}

impl TunnelFile {
    pub fn from_yaml(contents: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(contents)?)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&contents)
    }

    /// Validate the file and convert it into the hop forest.
    pub fn hops(&self) -> Result<Vec<HopSpec>, ConfigError> {
        validation::validate_secrets(&self.secrets)?;
        let hops = self
            .sshconfigs
            .iter()
            .enumerate()
            .map(|(idx, entry)| entry.to_spec(&format!("config #{idx}")))
            .collect::<Result<Vec<_>, _>>()?;
        if hops.is_empty() {
            return Err(ConfigError::Empty);
        }
        validation::validate_secret_references(&hops, &self.secrets)?;
        validation::validate_topology(&hops)?;
        Ok(hops)
    }
}

impl HopEntry {
    fn to_spec(&self, position: &str) -> Result<HopSpec, ConfigError> {
        if self.destination.trim().is_empty() {
            return Err(ConfigError::EmptyDestination { hop: position.to_string() });
        }
        let mut hop = HopSpec::new(self.destination.trim(), self.user.clone());
        let label = hop.label();
        if self.auth.is_empty() {
            return Err(ConfigError::NoAuth { hop: label });
        }
        hop.auth = self
            .auth
            .iter()
            .map(|entry| entry.to_spec(&label))
            .collect::<Result<Vec<_>, _>>()?;
        hop.forward = self.tunnels.iter().map(TunnelEntry::to_rule).collect();
        hop.reverse = self.reverse_tunnels.iter().map(TunnelEntry::to_rule).collect();
        hop.timeout = self.timeout.map(Duration::from_secs);
        hop.probe = self.probe;
        hop.host_key = self.host_key.clone().filter(|fp| !fp.trim().is_empty());
        hop.legacy_crypto = self.legacy_crypto;
        hop.through = self
            .through_ssh
            .iter()
            .enumerate()
            .map(|(idx, child)| child.to_spec(&format!("{label} -> throughssh #{idx}")))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(hop)
    }
}

impl AuthEntry {
    fn to_spec(&self, hop: &str) -> Result<AuthMethodSpec, ConfigError> {
        if let Some(key) = &self.key_auth
            && !key.file_location.trim().is_empty()
        {
            return Ok(AuthMethodSpec {
                key_file: Some(PathBuf::from(key.file_location.trim())),
                key_passphrase_secret: key.password_secret.clone().filter(|name| !name.is_empty()),
                password_secret: None,
            });
        }
        if let Some(pwd) = &self.password_auth
            && !pwd.password_secret.trim().is_empty()
        {
            return Ok(AuthMethodSpec::password(pwd.password_secret.trim()));
        }
        Err(ConfigError::InvalidAuth { hop: hop.to_string() })
    }
}

impl TunnelEntry {
    fn to_rule(&self) -> RuleSpec {
        RuleSpec {
            name: self.name.clone(),
            bind_address: self.bind.clone(),
            port: self.port,
            target: self.target.trim().to_string(),
            ignore: self.ignore,
        }
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;

//! Secret vault resolved once, before any connection is attempted.
//!
//! Each configured secret is read from its environment variable when one is
//! named and set; otherwise the operator is prompted on the terminal. Nothing
//! is resolved lazily, so a missing secret stops the run before any hop dials.

use std::{collections::HashMap, env};

use hc_types::config::SecretEntry;
use rpassword::prompt_password;
use secrecy::SecretString;
use ssh_core::{SshCoreError, SshResult, transport::SecretResolver};
use tracing::debug;

// Internal Result type alias
type Result<T> = crate::ClientResult<T>;

#[derive(Default)]
pub struct SecretsVault {
    values: HashMap<String, SecretString>,
}

impl SecretsVault {
    /// Resolve from the process environment, prompting for whatever is left.
    pub fn from_env_or_prompt(entries: &[SecretEntry]) -> Result<Self> {
        Self::resolve_with(entries, |name| env::var(name).ok(), |name| {
            prompt_password(format!("Enter value for secret {name}: ")).map_err(crate::ClientError::Io)
        })
    }

    /// Resolve with explicit sources; `lookup` sees variable names, `prompt` sees secret names.
    pub fn resolve_with(
        entries: &[SecretEntry],
        lookup: impl Fn(&str) -> Option<String>,
        mut prompt: impl FnMut(&str) -> Result<String>,
    ) -> Result<Self> {
        let mut values = HashMap::with_capacity(entries.len());
        for entry in entries {
            let from_env = entry.env.as_deref().filter(|var| !var.is_empty()).and_then(&lookup);
            let value = match from_env {
                Some(value) => {
                    debug!(secret = %entry.name, "secret taken from environment");
                    value
                }
                None => prompt(&entry.name)?,
            };
            if value.is_empty() {
                return Err(crate::ClientError::Secret {
                    name: entry.name.clone(),
                    message: "no value provided".to_string(),
                });
            }
            values.insert(entry.name.clone(), SecretString::new(value.into_boxed_str()));
        }
        Ok(Self { values })
    }

    pub fn insert(&mut self, name: impl Into<String>, value: SecretString) {
        self.values.insert(name.into(), value);
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl SecretResolver for SecretsVault {
    fn resolve(&self, name: &str) -> SshResult<SecretString> {
        self.values.get(name).cloned().ok_or_else(|| SshCoreError::MissingSecret(name.to_string()))
    }
}

use std::{path::Path, sync::Arc};

// Internal Result type alias
type Result<T> = crate::ClientResult<T>;
use russh::{
    client::{self, AuthResult}, keys::{self, HashAlg, PrivateKeyWithHashAlg}
};
use secrecy::{ExposeSecret, SecretString};
use ssh_core::{session::SessionHandle, transport::Credential};
use tokio::fs;
use tracing::{debug, info, warn};

use crate::ClientError;

/// Try each credential in order until the server accepts one.
pub async fn authenticate<H>(session: &mut SessionHandle<H>, username: &str, credentials: &[Credential]) -> Result<()>
where
    H: client::Handler + Send,
{
    if credentials.is_empty() {
        return Err(ClientError::AuthFailed("no authentication methods configured".to_string()));
    }

    let rsa_hash_hint = session.best_supported_rsa_hash().await.unwrap_or(None).flatten();

    for credential in credentials {
        let label = credential.label();
        match authenticate_one(session, username, credential, rsa_hash_hint).await {
            Ok(AuthResult::Success) => {
                info!(method = label, user = username, "authentication succeeded");
                return Ok(());
            }
            Ok(AuthResult::Failure { .. }) => {
                warn!(method = label, user = username, "authentication rejected by server");
            }
            Err(err) => {
                warn!(method = label, user = username, error = %err, "authentication attempt failed");
            }
        }
    }

    Err(ClientError::AuthFailed(
        "all authentication methods were rejected by the server".to_string(),
    ))
}

async fn authenticate_one<H>(
    session: &mut SessionHandle<H>,
    username: &str,
    credential: &Credential,
    rsa_hint: Option<HashAlg>,
) -> Result<AuthResult>
where
    H: client::Handler + Send,
{
    match credential {
        Credential::Password(password) => session
            .authenticate_password(username.to_string(), password.expose_secret().to_string())
            .await
            .map_err(Into::into),
        Credential::PrivateKey { path, passphrase } => {
            let key = Arc::new(load_identity(path, passphrase.as_ref()).await?);
            debug!(key = ?key.algorithm(), path = %path.display(), "attempting public-key auth");
            let hash_alg = if key.algorithm().is_rsa() { rsa_hint } else { None };
            session
                .authenticate_publickey(username.to_string(), PrivateKeyWithHashAlg::new(key, hash_alg))
                .await
                .map_err(Into::into)
        }
    }
}

async fn load_identity(path: &Path, passphrase: Option<&SecretString>) -> Result<keys::PrivateKey> {
    let data = fs::read_to_string(path).await?;
    load_private_key(&data, path, passphrase)
}

/// Parse an OpenSSH or PEM private key, decrypting it with `passphrase` when needed.
pub(crate) fn load_private_key(data: &str, path: &Path, passphrase: Option<&SecretString>) -> Result<keys::PrivateKey> {
    if passphrase.is_none()
        && let Ok(key) = keys::PrivateKey::from_openssh(data)
        && !key.is_encrypted()
    {
        return Ok(key);
    }
    match keys::decode_secret_key(data, passphrase.map(|secret| secret.expose_secret())) {
        Ok(key) => Ok(key),
        Err(keys::Error::KeyIsEncrypted) => Err(ClientError::Crypto(format!(
            "{} is encrypted and no passphrase secret is configured",
            path.display()
        ))),
        Err(err) => Err(ClientError::Crypto(format!("failed to load {}: {err}", path.display()))),
    }
}

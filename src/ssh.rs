//! SSH listener accepting agent control connections.

mod metrics;
mod session;

use std::{net::SocketAddr, path::Path, sync::Arc, time::Duration};

use derive_builder::Builder;
use eyre::{eyre, Result, WrapErr};
use russh::server::{Config, Handler, Server};
use russh_keys::key::{KeyPair, PublicKey};
use session::AgentSession;
use tracing::{error, info};

use crate::{pool::Pool, registry::Registry};

/// Everything a control connection needs from the rest of the server.
#[derive(Builder)]
pub struct ServerState {
    pub authorized_keys: Vec<PublicKey>,
    pub register_url: String,
    pub registry: Arc<Registry>,
    pub pool: Arc<Pool>,
    #[builder(default)]
    pub http: reqwest::Client,
}

#[derive(Clone)]
pub struct TunnelServer {
    state: Arc<ServerState>,
}

impl TunnelServer {
    #[must_use]
    pub fn new(state: ServerState) -> Self {
        Self {
            state: Arc::new(state),
        }
    }

    pub async fn run(&mut self, host_key: KeyPair, addr: (String, u16)) -> Result<()> {
        let config = Config {
            keys: vec![host_key],
            auth_rejection_time: Duration::from_secs(1),
            auth_rejection_time_initial: Some(Duration::ZERO),
            inactivity_timeout: None,
            ..Default::default()
        };

        info!(host = addr.0, port = addr.1, "ssh listener starting");

        self.run_on_address(Arc::new(config), addr)
            .await
            .wrap_err("ssh listener failed")?;

        Ok(())
    }
}

impl Server for TunnelServer {
    type Handler = AgentSession;

    fn new_client(&mut self, peer: Option<SocketAddr>) -> Self::Handler {
        if let Some(peer) = peer {
            info!(%peer, "agent connection");
        }

        AgentSession::new(self.state.clone())
    }

    fn handle_session_error(&mut self, error: <Self::Handler as Handler>::Error) {
        if let Some(russh::Error::IO(_)) = error.downcast_ref::<russh::Error>() {
            return;
        }

        error!("unhandled session error: {:#?}", error);
    }
}

/// Load the server host key, generating and persisting one on first start.
pub fn load_or_create_host_key(path: &Path) -> Result<KeyPair> {
    if path.exists() {
        return russh_keys::load_secret_key(path, None)
            .wrap_err_with(|| format!("failed to load host key from {}", path.display()));
    }

    let key = KeyPair::generate_ed25519().ok_or_else(|| eyre!("ed25519 keygen failed"))?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = std::fs::File::create(path)
        .wrap_err_with(|| format!("failed to write host key to {}", path.display()))?;
    russh_keys::encode_pkcs8_pem(&key, file)?;

    info!(path = %path.display(), "generated new host key");

    Ok(key)
}

/// Parse an `authorized_keys`-style file: one OpenSSH public key per line,
/// `#` comments and blank lines ignored.
pub fn load_authorized_keys(path: &Path) -> Result<Vec<PublicKey>> {
    let raw = std::fs::read_to_string(path)
        .wrap_err_with(|| format!("failed to read authorized keys from {}", path.display()))?;

    let mut keys = Vec::new();
    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let mut fields = line.split_whitespace();
        let (algo, data) = match (fields.next(), fields.next()) {
            (Some(algo), Some(data)) => (algo, data),
            _ => return Err(eyre!("malformed authorized key line: {line}")),
        };

        let key = russh_keys::parse_public_key_base64(data)
            .wrap_err_with(|| format!("invalid {algo} key in {}", path.display()))?;
        keys.push(key);
    }

    if keys.is_empty() {
        return Err(eyre!("no keys found in {}", path.display()));
    }

    Ok(keys)
}

#[cfg(test)]
mod tests {
    use russh_keys::PublicKeyBase64;

    use super::*;

    #[test]
    fn host_key_is_generated_then_reloaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys/host_key");

        let created = load_or_create_host_key(&path).unwrap();
        assert!(path.exists());

        let reloaded = load_or_create_host_key(&path).unwrap();
        assert_eq!(
            created.clone_public_key().unwrap().public_key_base64(),
            reloaded.clone_public_key().unwrap().public_key_base64()
        );
    }

    #[test]
    fn authorized_keys_parses_openssh_lines() {
        let key = KeyPair::generate_ed25519().unwrap();
        let public = key.clone_public_key().unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("authorized_keys");
        std::fs::write(
            &path,
            format!(
                "# fleet agents\n\nssh-ed25519 {} agent@example\n",
                public.public_key_base64()
            ),
        )
        .unwrap();

        let keys = load_authorized_keys(&path).unwrap();

        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].public_key_base64(), public.public_key_base64());
    }

    #[test]
    fn authorized_keys_rejects_empty_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("authorized_keys");
        std::fs::write(&path, "# nothing here\n").unwrap();

        assert!(load_authorized_keys(&path).is_err());
    }
}

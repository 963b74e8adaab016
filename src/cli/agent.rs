use std::{path::PathBuf, sync::Arc, time::Duration, time::Instant};

use cata::{Command, Container};
use chrono::{DateTime, Utc};
use clap::Parser;
use eyre::{eyre, Result, WrapErr};
use russh::client;
use russh_keys::key::KeyPair;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    agent,
    policy::PathPolicy,
    protocol::{
        self, ClientIdentity, ClientInfo, CreatedBy, Registration, Request, Response,
    },
};

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const STEADY_THRESHOLD: Duration = Duration::from_secs(30);

/// Run the on-host agent: dial the server, punch the reverse tunnel,
/// register, and serve operator requests inbound over the tunnel.
#[derive(Parser, Container)]
pub struct Agent {
    /// Server hostname or address
    #[arg(long)]
    server: String,

    /// Server SSH port
    #[arg(long, default_value_t = 2222)]
    ssh_port: u16,

    /// Private key used to authenticate to the server
    #[arg(long)]
    key: PathBuf,

    /// Display name; defaults to the hostname
    #[arg(long)]
    name: Option<String>,

    /// Free-form purpose string shown to operators
    #[arg(long, default_value = "")]
    purpose: String,

    /// Tag, repeatable
    #[arg(long = "tag")]
    tags: Vec<String>,

    /// Allowed path root, repeatable; no flags means unrestricted
    #[arg(long = "allow")]
    allowed_paths: Vec<PathBuf>,

    /// Directory holding the persisted identity; falls back to
    /// REACH_DATA_DIR, then ~/.reach
    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// Ceiling for the reconnect backoff
    #[arg(long, value_parser = humantime::parse_duration, default_value = "60s")]
    max_backoff: Duration,
}

/// The part of the identity that must survive restarts.
#[derive(Serialize, Deserialize)]
struct PersistedIdentity {
    uuid: String,
    first_seen: DateTime<Utc>,
}

impl PersistedIdentity {
    fn load_or_create(state_dir: &std::path::Path) -> Result<Self> {
        let path = state_dir.join("identity.json");

        if path.exists() {
            let raw = std::fs::read_to_string(&path)
                .wrap_err_with(|| format!("failed to read {}", path.display()))?;
            return serde_json::from_str(&raw)
                .wrap_err_with(|| format!("corrupt identity file at {}", path.display()));
        }

        let identity = Self {
            uuid: uuid::Uuid::new_v4().to_string(),
            first_seen: Utc::now(),
        };

        std::fs::create_dir_all(state_dir)?;
        std::fs::write(&path, serde_json::to_string_pretty(&identity)?)
            .wrap_err_with(|| format!("failed to write {}", path.display()))?;

        info!(uuid = identity.uuid, "created new agent identity");

        Ok(identity)
    }
}

struct ControlClient {
    agent: Arc<agent::Agent>,
}

#[async_trait::async_trait]
impl client::Handler for ControlClient {
    type Error = eyre::Error;

    async fn check_server_key(
        &mut self,
        _: &russh_keys::key::PublicKey,
    ) -> Result<bool, Self::Error> {
        // The agent authenticates itself with a pre-shared key; the server
        // end of the tunnel is whatever we dialed.
        Ok(true)
    }

    /// Inbound tunnel stream: the server accepted an operator connection on
    /// our reverse port and opened a channel for it.
    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: russh::Channel<client::Msg>,
        _connected_address: &str,
        _connected_port: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        let agent = self.agent.clone();

        tokio::spawn(async move {
            if let Err(error) = agent.serve_tunnel(channel.into_stream()).await {
                debug!(%error, "tunnel stream ended with error");
            }
        });

        Ok(())
    }
}

#[async_trait::async_trait]
impl Command for Agent {
    async fn run(&self) -> Result<()> {
        let state_dir = self.state_dir.clone().unwrap_or_else(crate::config::data_dir);
        let identity = PersistedIdentity::load_or_create(&state_dir)?;

        let key = russh_keys::load_secret_key(&self.key, None)
            .wrap_err_with(|| format!("failed to load key from {}", self.key.display()))?;

        let policy = if self.allowed_paths.is_empty() {
            PathPolicy::unrestricted()
        } else {
            PathPolicy::new(Some(self.allowed_paths.clone()))
        };
        let handler = Arc::new(agent::Agent::new(policy));

        info!(
            uuid = identity.uuid,
            server = self.server,
            restricted = handler.policy().is_restricted(),
            "agent starting"
        );

        let serve = self.reconnect_loop(&handler, &identity, &key);

        tokio::select! {
            result = serve => result,
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                handler.shutdown().await;
                Ok(())
            }
        }
    }
}

impl Agent {
    async fn reconnect_loop(
        &self,
        handler: &Arc<agent::Agent>,
        identity: &PersistedIdentity,
        key: &KeyPair,
    ) -> Result<()> {
        let mut backoff = INITIAL_BACKOFF;

        loop {
            let started = Instant::now();

            match self.connect_and_serve(handler, identity, key).await {
                Ok(()) => {
                    info!("server closed the control connection");
                }
                Err(error) => {
                    warn!(%error, "control connection failed");
                }
            }

            // A connection that lived a while earns a fresh backoff.
            if started.elapsed() > STEADY_THRESHOLD {
                backoff = INITIAL_BACKOFF;
            }

            info!(delay = ?backoff, "reconnecting");
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(self.max_backoff);
        }
    }

    async fn connect_and_serve(
        &self,
        handler: &Arc<agent::Agent>,
        identity: &PersistedIdentity,
        key: &KeyPair,
    ) -> Result<()> {
        let config = Arc::new(client::Config {
            keepalive_interval: Some(Duration::from_secs(30)),
            keepalive_max: 3,
            ..Default::default()
        });

        let mut handle = client::connect(
            config,
            (self.server.as_str(), self.ssh_port),
            ControlClient {
                agent: handler.clone(),
            },
        )
        .await
        .wrap_err("failed to reach server")?;

        let fingerprint = format!("SHA256:{}", key.clone_public_key()?.fingerprint());

        let authenticated = handle
            .authenticate_publickey(protocol::TUNNEL_USER, Arc::new(key.clone()))
            .await?;
        if !authenticated {
            return Err(eyre!("server rejected our key; is it in authorized_keys?"));
        }

        // Reverse forward with port 0: the server binds an ephemeral
        // loopback port and that becomes our tunnel endpoint.
        if !handle.tcpip_forward("127.0.0.1", 0).await? {
            return Err(eyre!("server refused the reverse tunnel"));
        }

        let registration = self.registration(identity, fingerprint);
        let mut channel = handle.channel_open_session().await?;

        let request = Request::new(
            protocol::METHOD_REGISTER,
            serde_json::to_value(&registration)?,
        );
        let frame = protocol::encode_message(&request.to_json()?);
        channel.data(&frame[..]).await?;

        // One framed response confirms registration; after that the channel
        // only exists to notice the transport going away.
        let mut buffer: Vec<u8> = Vec::new();
        let mut registered = false;

        while let Some(msg) = channel.wait().await {
            if let russh::ChannelMsg::Data { data } = msg {
                buffer.extend_from_slice(&data);

                match protocol::decode_message(&buffer) {
                    Ok((body, _)) => {
                        let response = Response::from_json(&body)?;
                        match response.into_result() {
                            Ok(result) => {
                                info!(registered = %result["registered"], "registration confirmed");
                                registered = true;
                                buffer.clear();
                            }
                            Err(error) => {
                                return Err(eyre!(
                                    "registration rejected: {} ({})",
                                    error.message,
                                    error.code
                                ));
                            }
                        }
                    }
                    Err(
                        protocol::ProtocolError::IncompleteHeader(_)
                        | protocol::ProtocolError::IncompleteBody { .. },
                    ) => {}
                    Err(error) => return Err(error.into()),
                }
            }
        }

        if registered {
            Ok(())
        } else {
            Err(eyre!("control channel closed before registration completed"))
        }
    }

    fn registration(&self, identity: &PersistedIdentity, fingerprint: String) -> Registration {
        let display_name = self.name.clone().unwrap_or_else(|| {
            hostname::get()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|_| "unnamed-agent".to_string())
        });

        let client_id = uuid::Uuid::new_v4().to_string();

        Registration {
            identity: ClientIdentity {
                uuid: identity.uuid.clone(),
                display_name,
                purpose: self.purpose.clone(),
                tags: self.tags.clone(),
                capabilities: vec![
                    "run_command".to_string(),
                    "file_ops".to_string(),
                    "ssh_sessions".to_string(),
                    "sftp".to_string(),
                    "metrics".to_string(),
                ],
                public_key_fingerprint: fingerprint,
                first_seen: identity.first_seen,
                created_by: CreatedBy::Auto,
                key_mismatch: false,
                previous_fingerprint: None,
            },
            client_info: ClientInfo::local(client_id, identity.uuid.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_survives_reloads() {
        let dir = tempfile::tempdir().unwrap();

        let first = PersistedIdentity::load_or_create(dir.path()).unwrap();
        let second = PersistedIdentity::load_or_create(dir.path()).unwrap();

        assert_eq!(first.uuid, second.uuid);
        assert_eq!(first.first_seen, second.first_seen);
    }

    #[test]
    fn corrupt_identity_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("identity.json"), "not json").unwrap();

        assert!(PersistedIdentity::load_or_create(dir.path()).is_err());
    }
}

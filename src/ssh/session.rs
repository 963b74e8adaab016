//! Per-agent control connection: authentication, reverse-tunnel setup and
//! the registration handshake.
//!
//! RPC traffic never touches this channel; it flows through the forwarded
//! tunnel streams. The control connection exists to hold the SSH transport
//! open, carry exactly one framed `register` exchange and tear the client
//! down when the transport goes away.

use std::{collections::HashMap, sync::Arc};

use eyre::{eyre, Result};
use russh::{
    keys::key::PublicKey,
    server::{self, Auth, Msg},
    ChannelId, CryptoVec, MethodSet,
};
use russh_keys::PublicKeyBase64;
use tokio::{net::TcpListener, task::JoinSet};
use tracing::{debug, info, warn};

use super::{
    metrics::{
        ACTIVE_SESSIONS, AUTH_ATTEMPTS, AUTH_RESULTS, REGISTRATIONS, TOTAL_SESSIONS,
        TUNNEL_CONNECTIONS,
    },
    ServerState,
};
use crate::protocol::{
    self, Registration, Request, Response, ERR_COMMAND_FAILED, ERR_INVALID_PARAMS,
    ERR_METHOD_NOT_FOUND,
};

pub struct AgentSession {
    state: Arc<ServerState>,
    fingerprint: Option<String>,
    tunnel_port: Option<u16>,
    registered_uuid: Option<String>,
    channels: HashMap<ChannelId, Vec<u8>>,
    tasks: JoinSet<Result<()>>,
}

impl AgentSession {
    pub fn new(state: Arc<ServerState>) -> Self {
        TOTAL_SESSIONS.inc();
        ACTIVE_SESSIONS.inc();

        Self {
            state,
            fingerprint: None,
            tunnel_port: None,
            registered_uuid: None,
            channels: HashMap::new(),
            tasks: JoinSet::new(),
        }
    }

    /// Forward a complete registration payload to the registry's internal
    /// endpoint, stamped with the facts only this side knows: the allocated
    /// tunnel port and the fingerprint observed during authentication.
    async fn register(&mut self, request: &Request) -> Result<String> {
        let tunnel_port = self
            .tunnel_port
            .ok_or_else(|| eyre!("registration before reverse tunnel was established"))?;
        let fingerprint = self
            .fingerprint
            .clone()
            .ok_or_else(|| eyre!("registration without an authenticated key"))?;

        let mut registration: Registration = serde_json::from_value(request.params.clone())?;
        registration.client_info.tunnel_port = tunnel_port;
        registration.identity.public_key_fingerprint = fingerprint;

        let uuid = registration.identity.uuid.clone();

        let response = self
            .state
            .http
            .post(&self.state.register_url)
            .json(&registration)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(eyre!(
                "registry rejected registration: {}",
                response.status()
            ));
        }

        REGISTRATIONS.inc();
        info!(
            uuid,
            name = registration.identity.display_name,
            tunnel_port,
            "agent registered"
        );

        self.registered_uuid = Some(uuid.clone());

        Ok(uuid)
    }

    async fn handle_frame(&mut self, body: &str) -> Response {
        let request = match Request::from_json(body) {
            Ok(request) => request,
            Err(error) => {
                return Response::failure(
                    ERR_INVALID_PARAMS,
                    format!("Malformed request: {error}"),
                    None,
                )
            }
        };

        let id = request.id.clone();

        if request.method != protocol::METHOD_REGISTER {
            return Response::failure(
                ERR_METHOD_NOT_FOUND,
                format!("Unknown method: {}", request.method),
                id,
            );
        }

        match self.register(&request).await {
            Ok(uuid) => Response::success(serde_json::json!({"registered": uuid}), id),
            Err(error) => {
                warn!(%error, "registration failed");
                Response::failure(ERR_COMMAND_FAILED, error.to_string(), id)
            }
        }
    }
}

#[async_trait::async_trait]
impl server::Handler for AgentSession {
    type Error = eyre::Error;

    async fn auth_publickey(&mut self, user: &str, key: &PublicKey) -> Result<Auth> {
        AUTH_ATTEMPTS.inc();

        let offered = key.public_key_base64();
        let accepted = self
            .state
            .authorized_keys
            .iter()
            .any(|authorized| authorized.public_key_base64() == offered);

        if accepted {
            let fingerprint = format!("SHA256:{}", key.fingerprint());
            debug!(user, fingerprint, "agent key accepted");

            AUTH_RESULTS.accept.inc();
            self.fingerprint = Some(fingerprint);

            return Ok(Auth::Accept);
        }

        warn!(user, "agent key rejected");
        AUTH_RESULTS.reject.inc();

        Ok(Auth::Reject {
            proceed_with_methods: Some(MethodSet::PUBLICKEY),
        })
    }

    async fn channel_open_session(
        &mut self,
        channel: russh::Channel<Msg>,
        _: &mut server::Session,
    ) -> Result<bool> {
        debug!("control channel opened");
        self.channels.insert(channel.id(), Vec::new());

        Ok(true)
    }

    async fn channel_close(&mut self, id: ChannelId, _: &mut server::Session) -> Result<()> {
        self.channels.remove(&id);

        Ok(())
    }

    /// The agent asks for a reverse forward; the OS picks the port and that
    /// port becomes the client's tunnel endpoint. Each operator connection
    /// accepted there turns into a forwarded-tcpip channel to the agent.
    async fn tcpip_forward(
        &mut self,
        address: &str,
        port: &mut u32,
        session: &mut server::Session,
    ) -> Result<bool> {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
        let allocated = listener.local_addr()?.port();

        *port = u32::from(allocated);
        self.tunnel_port = Some(allocated);

        info!(requested = address, tunnel_port = allocated, "reverse tunnel bound");

        let handle = session.handle();
        self.tasks.spawn(async move {
            let mut streams: JoinSet<Result<()>> = JoinSet::new();

            loop {
                let (socket, addr) = listener.accept().await?;
                TUNNEL_CONNECTIONS.inc();
                debug!(peer = %addr, tunnel_port = allocated, "tunnel connection");

                let channel = match handle
                    .channel_open_forwarded_tcpip(
                        "127.0.0.1",
                        u32::from(allocated),
                        addr.ip().to_string(),
                        u32::from(addr.port()),
                    )
                    .await
                {
                    Ok(channel) => channel,
                    Err(error) => {
                        warn!(%error, "agent refused forwarded channel");
                        continue;
                    }
                };

                while let Some(finished) = streams.try_join_next() {
                    if let Ok(Err(error)) = finished {
                        debug!(%error, "tunnel stream error");
                    }
                }

                streams.spawn(async move {
                    let mut socket = socket;
                    let mut stream = channel.into_stream();
                    tokio::io::copy_bidirectional(&mut stream, &mut socket).await?;

                    Ok(())
                });
            }
        });

        Ok(true)
    }

    /// Control-channel bytes are framed registration traffic. Frames can be
    /// split across transport packets, so buffer until one decodes.
    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut server::Session,
    ) -> Result<()> {
        let buffer = self.channels.entry(channel).or_default();
        buffer.extend_from_slice(data);

        let (body, rest) = match protocol::decode_message(buffer) {
            Ok((body, rest)) => (body, rest.to_vec()),
            Err(
                protocol::ProtocolError::IncompleteHeader(_)
                | protocol::ProtocolError::IncompleteBody { .. },
            ) => return Ok(()),
            Err(error) => return Err(error.into()),
        };

        self.channels.insert(channel, rest);

        let response = self.handle_frame(&body).await;
        let encoded = protocol::encode_message(&response.to_json()?);
        session.data(channel, CryptoVec::from_slice(&encoded));

        Ok(())
    }
}

impl Drop for AgentSession {
    fn drop(&mut self) {
        ACTIVE_SESSIONS.dec();
        self.tasks.abort_all();

        // The transport is gone; tell the registry the tunnel went with it.
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };

        if let Some(uuid) = self.registered_uuid.take() {
            let state = self.state.clone();
            let port = self.tunnel_port;

            runtime.spawn(async move {
                // Only deregister if the registry still points at this
                // session's tunnel; a reconnect may already have replaced it.
                let current = state.registry.connection_facts(&uuid).await;
                if current.map(|(_, p)| p) == port {
                    state.pool.evict(&uuid).await;
                    state.registry.remove_connection(&uuid).await;
                }
            });
        }
    }
}

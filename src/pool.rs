//! Cached RPC connections to agents, keyed by identity uuid.
//!
//! Each entry is a framed JSON-RPC client over a TCP connection to the
//! agent's reverse-tunnel port on loopback. The registry's view of the
//! tunnel port is authoritative: a cached entry whose port no longer matches
//! is closed and replaced, and reconnects evict unconditionally via
//! [`Pool::clear_stale`] before the new connection is published.

use std::{collections::HashMap, sync::Arc, time::Duration};

use serde_json::{json, Value};
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
    sync::Mutex,
};
use tracing::{debug, info};

use crate::{
    protocol::{self, ProtocolError, Request, Response, RpcError},
    registry::Registry,
};

/// Default per-call deadline, matching the agent's own command timeout.
pub const CALL_TIMEOUT: Duration = Duration::from_secs(300);

pub use crate::protocol::TUNNEL_USER;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("client is offline")]
    Offline,

    #[error("rpc timed out after {0:?}")]
    Timeout(Duration),

    #[error("agent returned error {}: {}", .0.code, .0.message)]
    Rpc(RpcError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl PoolError {
    /// Transport-class failures surface to operators as 503; agent-side RPC
    /// errors carry their own code.
    #[must_use]
    pub fn is_transport(&self) -> bool {
        !matches!(self, Self::Rpc(_))
    }
}

trait Transport: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Transport for T {}

/// One framed JSON-RPC connection. The transport lock is held across the
/// write/read pair, which is what gives per-connection FIFO ordering.
pub struct RpcClient {
    transport: Mutex<Box<dyn Transport>>,
    timeout: Duration,
}

impl RpcClient {
    pub async fn connect(port: u16) -> Result<Self, PoolError> {
        let stream = TcpStream::connect(("127.0.0.1", port)).await?;
        stream.set_nodelay(true)?;

        debug!(port, "opened tunnel rpc connection");

        Ok(Self::from_stream(stream))
    }

    pub fn from_stream(stream: impl AsyncRead + AsyncWrite + Unpin + Send + 'static) -> Self {
        Self {
            transport: Mutex::new(Box::new(stream)),
            timeout: CALL_TIMEOUT,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub async fn call(&self, method: &str, params: Value) -> Result<Value, PoolError> {
        self.call_with_timeout(method, params, self.timeout).await
    }

    pub async fn call_with_timeout(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, PoolError> {
        let request = Request::new(method, params);

        let exchange = async {
            let mut transport = self.transport.lock().await;

            protocol::write_frame(&mut *transport, &request.to_json()?).await?;
            let body = protocol::read_frame(&mut *transport).await?;

            Ok::<Response, PoolError>(Response::from_json(&body)?)
        };

        let response = tokio::time::timeout(timeout, exchange)
            .await
            .map_err(|_| PoolError::Timeout(timeout))??;

        response.into_result().map_err(PoolError::Rpc)
    }

    pub async fn run_command(
        &self,
        command: &str,
        cwd: Option<&str>,
        timeout_secs: u64,
    ) -> Result<Value, PoolError> {
        let mut params = json!({"cmd": command, "timeout": timeout_secs});
        if let Some(cwd) = cwd {
            params["cwd"] = json!(cwd);
        }

        // Give the agent its full window before the transport deadline hits.
        let deadline = Duration::from_secs(timeout_secs) + Duration::from_secs(30);
        self.call_with_timeout(protocol::METHOD_RUN_COMMAND, params, deadline)
            .await
    }

    pub async fn read_file(&self, path: &str) -> Result<Value, PoolError> {
        self.call(protocol::METHOD_READ_FILE, json!({"path": path}))
            .await
    }

    pub async fn write_file(&self, path: &str, content: &str, binary: bool) -> Result<Value, PoolError> {
        self.call(
            protocol::METHOD_WRITE_FILE,
            json!({"path": path, "content": content, "binary": binary}),
        )
        .await
    }

    pub async fn list_files(&self, path: &str) -> Result<Value, PoolError> {
        self.call(protocol::METHOD_LIST_FILES, json!({"path": path}))
            .await
    }

    pub async fn heartbeat(&self, timeout: Duration) -> Result<(), PoolError> {
        self.call_with_timeout(protocol::METHOD_HEARTBEAT, json!({}), timeout)
            .await
            .map(|_| ())
    }
}

struct CachedConn {
    client_id: String,
    tunnel_port: u16,
    client: Arc<RpcClient>,
}

/// Per-identity cache of live RPC connections.
pub struct Pool {
    registry: Arc<Registry>,
    conns: Mutex<HashMap<String, CachedConn>>,
}

impl Pool {
    #[must_use]
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            registry,
            conns: Mutex::new(HashMap::new()),
        }
    }

    /// Connection for `uuid`, reusing the cached one when its tunnel port
    /// still matches the registry.
    pub async fn get(&self, uuid: &str) -> Result<Arc<RpcClient>, PoolError> {
        let (client_id, tunnel_port) = self
            .registry
            .connection_facts(uuid)
            .await
            .ok_or(PoolError::Offline)?;

        {
            let mut conns = self.conns.lock().await;
            let cached = conns
                .get(uuid)
                .map(|cached| (cached.tunnel_port, cached.client.clone()));

            if let Some((cached_port, client)) = cached {
                if cached_port == tunnel_port {
                    return Ok(client);
                }

                info!(
                    uuid,
                    stale = cached_port,
                    current = tunnel_port,
                    "tunnel port changed, dropping cached connection"
                );
                conns.remove(uuid);
            }
        }

        let client = Arc::new(RpcClient::connect(tunnel_port).await?);

        // Double-checked: another task may have connected while we were
        // dialing. The one already in the map wins.
        let mut conns = self.conns.lock().await;
        if let Some(cached) = conns.get(uuid) {
            if cached.tunnel_port == tunnel_port {
                return Ok(cached.client.clone());
            }
        }

        conns.insert(
            uuid.to_string(),
            CachedConn {
                client_id,
                tunnel_port,
                client: client.clone(),
            },
        );

        Ok(client)
    }

    /// Unconditional eviction by the superseded session's client id. Called
    /// by the registry during reconnect, before the new connection becomes
    /// visible.
    pub async fn clear_stale(&self, client_id: &str) {
        let mut conns = self.conns.lock().await;
        let before = conns.len();

        conns.retain(|_, cached| cached.client_id != client_id);

        if conns.len() < before {
            debug!(client_id, "evicted stale pooled connection");
        }
    }

    /// Eviction by identity, for disconnects.
    pub async fn evict(&self, uuid: &str) {
        self.conns.lock().await.remove(uuid);
    }

    #[cfg(test)]
    pub(crate) async fn cached_port(&self, uuid: &str) -> Option<u16> {
        self.conns
            .lock()
            .await
            .get(uuid)
            .map(|cached| cached.tunnel_port)
    }

    /// SFTP session over the same tunnel port. The agent end answers SSH on
    /// tunnel streams that open with the SSH banner.
    pub async fn sftp(&self, uuid: &str) -> Result<SftpConnection, PoolError> {
        let (_, tunnel_port) = self
            .registry
            .connection_facts(uuid)
            .await
            .ok_or(PoolError::Offline)?;

        SftpConnection::connect(tunnel_port).await
    }

    #[cfg(test)]
    pub(crate) async fn insert_for_test(
        &self,
        uuid: &str,
        client_id: &str,
        tunnel_port: u16,
        client: RpcClient,
    ) {
        self.conns.lock().await.insert(
            uuid.to_string(),
            CachedConn {
                client_id: client_id.to_string(),
                tunnel_port,
                client: Arc::new(client),
            },
        );
    }
}

struct PermissiveClient;

#[async_trait::async_trait]
impl russh::client::Handler for PermissiveClient {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _: &russh_keys::key::PublicKey,
    ) -> Result<bool, Self::Error> {
        // Loopback-to-loopback through our own tunnel; there is no host key
        // to pin.
        Ok(true)
    }
}

/// Async SFTP client over a tunnel port.
pub struct SftpConnection {
    session: russh_sftp::client::SftpSession,
    _handle: russh::client::Handle<PermissiveClient>,
}

impl SftpConnection {
    pub async fn connect(port: u16) -> Result<Self, PoolError> {
        let config = Arc::new(russh::client::Config {
            inactivity_timeout: Some(Duration::from_secs(300)),
            ..Default::default()
        });

        let mut handle = russh::client::connect(config, ("127.0.0.1", port), PermissiveClient)
            .await
            .map_err(io_from_ssh)?;

        let authenticated = handle
            .authenticate_none(TUNNEL_USER)
            .await
            .map_err(io_from_ssh)?;
        if !authenticated {
            return Err(PoolError::Io(std::io::Error::other(
                "tunnel sftp authentication rejected",
            )));
        }

        let mut channel = handle.channel_open_session().await.map_err(io_from_ssh)?;
        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(io_from_ssh)?;

        let session = russh_sftp::client::SftpSession::new(channel.into_stream())
            .await
            .map_err(|error| PoolError::Io(std::io::Error::other(error)))?;

        info!(port, "sftp session established over tunnel");

        Ok(Self {
            session,
            _handle: handle,
        })
    }

    pub async fn upload(&self, remote_path: &str, data: &[u8]) -> Result<u64, PoolError> {
        use tokio::io::AsyncWriteExt;

        let mut file = self
            .session
            .create(remote_path)
            .await
            .map_err(io_from_sftp)?;
        file.write_all(data).await?;
        file.shutdown().await?;

        Ok(data.len() as u64)
    }

    pub async fn download(&self, remote_path: &str) -> Result<Vec<u8>, PoolError> {
        use tokio::io::AsyncReadExt;

        let mut file = self.session.open(remote_path).await.map_err(io_from_sftp)?;
        let mut data = Vec::new();
        file.read_to_end(&mut data).await?;

        Ok(data)
    }

    pub async fn close(self) -> Result<(), PoolError> {
        self.session.close().await.map_err(io_from_sftp)
    }
}

fn io_from_ssh(error: russh::Error) -> PoolError {
    PoolError::Io(std::io::Error::other(error))
}

fn io_from_sftp<E>(error: E) -> PoolError
where
    E: std::error::Error + Send + Sync + 'static,
{
    PoolError::Io(std::io::Error::other(error))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ERR_METHOD_NOT_FOUND, METHOD_HEARTBEAT};

    /// Serve one framed request on the far end of a duplex pipe.
    async fn answer_one(
        mut server: tokio::io::DuplexStream,
        respond: impl FnOnce(Request) -> Response + Send + 'static,
    ) {
        let body = protocol::read_frame(&mut server).await.unwrap();
        let request = Request::from_json(&body).unwrap();
        let response = respond(request);
        protocol::write_frame(&mut server, &response.to_json().unwrap())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn call_roundtrips_result() {
        let (near, far) = tokio::io::duplex(4096);
        let client = RpcClient::from_stream(near);

        let server = tokio::spawn(answer_one(far, |request| {
            assert_eq!(request.method, METHOD_HEARTBEAT);
            Response::success(json!({"status": "alive"}), request.id)
        }));

        let result = client.call(METHOD_HEARTBEAT, json!({})).await.unwrap();
        assert_eq!(result, json!({"status": "alive"}));

        server.await.unwrap();
    }

    #[tokio::test]
    async fn call_surfaces_rpc_errors() {
        let (near, far) = tokio::io::duplex(4096);
        let client = RpcClient::from_stream(near);

        let server = tokio::spawn(answer_one(far, |request| {
            Response::failure(ERR_METHOD_NOT_FOUND, "Unknown method: nope", request.id)
        }));

        let err = client.call("nope", json!({})).await.unwrap_err();
        match err {
            PoolError::Rpc(rpc) => {
                assert_eq!(rpc.code, ERR_METHOD_NOT_FOUND);
            }
            other => panic!("expected rpc error, got {other:?}"),
        }
        assert!(!PoolError::Rpc(RpcError {
            code: ERR_METHOD_NOT_FOUND,
            message: String::new(),
        })
        .is_transport());

        server.await.unwrap();
    }

    #[tokio::test]
    async fn call_times_out() {
        let (near, _far) = tokio::io::duplex(4096);
        let client = RpcClient::from_stream(near).with_timeout(Duration::from_millis(50));

        let err = client.call(METHOD_HEARTBEAT, json!({})).await.unwrap_err();

        assert!(matches!(err, PoolError::Timeout(_)));
        assert!(err.is_transport());
    }
}

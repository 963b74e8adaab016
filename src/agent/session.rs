//! Persistent outbound SSH sessions the agent keeps open on behalf of the
//! operator.
//!
//! Each session is one SSH connection with one interactive shell channel.
//! Command output is framed by a quiet-period heuristic: after writing the
//! command we keep reading until the deadline or until the channel has been
//! silent for two seconds, which is as close to "the prompt came back" as a
//! PTY gets without sentinel injection.

use std::{
    collections::HashMap,
    path::PathBuf,
    sync::Arc,
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use russh::client;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt, WriteHalf},
    sync::Mutex,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::AgentError;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const KEEPALIVE: Duration = Duration::from_secs(30);
const INITIAL_SETTLE: Duration = Duration::from_millis(500);
const POLL_INTERVAL: Duration = Duration::from_millis(100);
const QUIET_PERIOD: Duration = Duration::from_secs(2);

const PTY_TERM: &str = "xterm";
const PTY_COLS: u32 = 200;
const PTY_ROWS: u32 = 50;

pub trait StreamIo: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send {}
impl<T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send> StreamIo for T {}

/// Remote host keys are accepted as offered; operators drive these sessions
/// interactively and pinning is their call, not the agent's.
struct AcceptingClient;

#[async_trait::async_trait]
impl client::Handler for AcceptingClient {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _: &russh_keys::key::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct SessionMeta {
    pub session_id: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub created_at: DateTime<Utc>,
}

struct SshSession {
    meta: SessionMeta,
    writer: Arc<Mutex<WriteHalf<Box<dyn StreamIo>>>>,
    output: Arc<Mutex<Vec<u8>>>,
    cancel: CancellationToken,
    handle: client::Handle<AcceptingClient>,
}

#[derive(Default)]
pub struct SessionManager {
    sessions: Mutex<HashMap<String, SshSession>>,
}

impl SessionManager {
    /// Open a session: connect, authenticate, request a PTY + shell, then
    /// let the prompt settle and hand back whatever the host printed.
    pub async fn open(
        &self,
        host: &str,
        username: &str,
        password: Option<&str>,
        key_file: Option<&str>,
        port: u16,
    ) -> Result<Value, AgentError> {
        info!(host, port, username, "opening ssh session");

        let config = Arc::new(client::Config {
            keepalive_interval: Some(KEEPALIVE),
            ..Default::default()
        });

        let mut handle = tokio::time::timeout(
            CONNECT_TIMEOUT,
            client::connect(config, (host, port), AcceptingClient),
        )
        .await
        .map_err(|_| AgentError::Failed(format!("SSH connection to {host}:{port} timed out")))?
        .map_err(|error| AgentError::Failed(format!("SSH connection failed: {error}")))?;

        let authenticated = match (password, key_file) {
            (Some(password), _) => handle
                .authenticate_password(username, password)
                .await
                .map_err(|error| AgentError::Failed(format!("SSH connection failed: {error}")))?,
            (None, Some(key_file)) => {
                let path = expand_user(key_file);
                if !path.exists() {
                    return Err(AgentError::InvalidParams(format!(
                        "Key file not found: {key_file}"
                    )));
                }

                let key = russh_keys::load_secret_key(&path, None).map_err(|error| {
                    AgentError::InvalidParams(format!("Failed to load key {key_file}: {error}"))
                })?;

                handle
                    .authenticate_publickey(username, Arc::new(key))
                    .await
                    .map_err(|error| AgentError::Failed(format!("SSH connection failed: {error}")))?
            }
            (None, None) => {
                return Err(AgentError::InvalidParams(
                    "Either password or key_file is required".to_string(),
                ))
            }
        };

        if !authenticated {
            return Err(AgentError::InvalidParams(format!(
                "Authentication failed for {username}@{host}"
            )));
        }

        let mut channel = handle
            .channel_open_session()
            .await
            .map_err(|error| AgentError::Failed(format!("SSH channel failed: {error}")))?;
        channel
            .request_pty(false, PTY_TERM, PTY_COLS, PTY_ROWS, 0, 0, &[])
            .await
            .map_err(|error| AgentError::Failed(format!("PTY request failed: {error}")))?;
        channel
            .request_shell(false)
            .await
            .map_err(|error| AgentError::Failed(format!("Shell request failed: {error}")))?;

        let stream: Box<dyn StreamIo> = Box::new(channel.into_stream());
        let (mut reader, writer) = tokio::io::split(stream);

        let output = Arc::new(Mutex::new(Vec::new()));
        let cancel = CancellationToken::new();

        {
            let output = output.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let mut buf = [0_u8; 4096];
                loop {
                    tokio::select! {
                        () = cancel.cancelled() => break,
                        read = reader.read(&mut buf) => match read {
                            Ok(0) | Err(_) => break,
                            Ok(n) => output.lock().await.extend_from_slice(&buf[..n]),
                        },
                    }
                }
            });
        }

        tokio::time::sleep(INITIAL_SETTLE).await;
        let initial_output = drain(&output).await;

        let session_id = uuid::Uuid::new_v4().simple().to_string()[..8].to_string();
        let meta = SessionMeta {
            session_id: session_id.clone(),
            host: host.to_string(),
            port,
            username: username.to_string(),
            created_at: Utc::now(),
        };

        self.sessions.lock().await.insert(
            session_id.clone(),
            SshSession {
                meta: meta.clone(),
                writer: Arc::new(Mutex::new(writer)),
                output,
                cancel,
                handle,
            },
        );

        info!(session_id, host, "ssh session opened");

        Ok(json!({
            "session_id": meta.session_id,
            "host": meta.host,
            "port": meta.port,
            "username": meta.username,
            "initial_output": initial_output,
        }))
    }

    /// Write a command to the shell and collect output until the deadline or
    /// a quiet period. The echoed command line, if present, is stripped.
    pub async fn command(
        &self,
        session_id: &str,
        command: &str,
        timeout: Duration,
    ) -> Result<Value, AgentError> {
        let (writer, output) = {
            let sessions = self.sessions.lock().await;
            let session = sessions
                .get(session_id)
                .ok_or_else(|| session_not_found(session_id))?;

            (session.writer.clone(), session.output.clone())
        };

        // Anything queued up before the command belongs to the previous one.
        let _stale = drain(&output).await;

        debug!(session_id, command, "sending command");
        {
            let mut writer = writer.lock().await;
            writer
                .write_all(format!("{command}\n").as_bytes())
                .await
                .map_err(|error| AgentError::Failed(format!("Failed to write to shell: {error}")))?;
            writer
                .flush()
                .await
                .map_err(|error| AgentError::Failed(format!("Failed to write to shell: {error}")))?;
        }

        let deadline = Instant::now() + timeout;
        let mut collected = String::new();
        let mut last_data = Instant::now();

        while Instant::now() < deadline {
            let chunk = drain(&output).await;
            if chunk.is_empty() {
                if last_data.elapsed() > QUIET_PERIOD {
                    break;
                }
                tokio::time::sleep(POLL_INTERVAL).await;
            } else {
                collected.push_str(&chunk);
                last_data = Instant::now();
            }
        }

        let stdout = strip_echo(&collected, command).trim().to_string();
        debug!(session_id, bytes = stdout.len(), "command complete");

        Ok(json!({"session_id": session_id, "stdout": stdout}))
    }

    pub async fn close(&self, session_id: &str) -> Result<Value, AgentError> {
        let session = self
            .sessions
            .lock()
            .await
            .remove(session_id)
            .ok_or_else(|| session_not_found(session_id))?;

        let host = session.meta.host.clone();
        shutdown_session(session).await;

        info!(session_id, host, "ssh session closed");

        Ok(json!({"session_id": session_id, "closed": true, "host": host}))
    }

    pub async fn list(&self) -> Value {
        let sessions = self.sessions.lock().await;
        let metas: Vec<&SessionMeta> = sessions.values().map(|s| &s.meta).collect();

        json!({"sessions": metas, "count": metas.len()})
    }

    /// Close everything on agent shutdown. Failures are logged, never fatal.
    pub async fn close_all(&self) {
        let sessions: Vec<(String, SshSession)> =
            self.sessions.lock().await.drain().collect();

        for (session_id, session) in sessions {
            debug!(session_id, "closing session on shutdown");
            shutdown_session(session).await;
        }
    }
}

async fn shutdown_session(session: SshSession) {
    session.cancel.cancel();

    if let Err(error) = session.writer.lock().await.shutdown().await {
        warn!(session = session.meta.session_id, %error, "error closing shell");
    }

    if let Err(error) = session
        .handle
        .disconnect(russh::Disconnect::ByApplication, "", "")
        .await
    {
        warn!(session = session.meta.session_id, %error, "error closing client");
    }
}

async fn drain(output: &Arc<Mutex<Vec<u8>>>) -> String {
    let bytes = std::mem::take(&mut *output.lock().await);

    String::from_utf8_lossy(&bytes).into_owned()
}

fn session_not_found(session_id: &str) -> AgentError {
    AgentError::InvalidParams(format!("Session not found: {session_id}"))
}

/// The shell echoes the command back on the first line; drop it when seen.
fn strip_echo<'a>(output: &'a str, command: &str) -> &'a str {
    match output.split_once('\n') {
        Some((first, rest)) if first.contains(command) => rest,
        _ => output,
    }
}

fn expand_user(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }

    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_echo_drops_the_echoed_line() {
        let output = "ls -la\r\ntotal 4\nfile.txt";

        assert_eq!(strip_echo(output, "ls -la"), "total 4\nfile.txt");
    }

    #[test]
    fn strip_echo_keeps_output_without_echo() {
        let output = "total 4\nfile.txt";

        assert_eq!(strip_echo(output, "ls -la"), output);
    }

    #[test]
    fn strip_echo_handles_single_line() {
        assert_eq!(strip_echo("ls", "ls"), "ls");
    }

    #[tokio::test]
    async fn command_on_unknown_session_is_invalid_params() {
        let manager = SessionManager::default();

        let err = manager
            .command("deadbeef", "ls", Duration::from_secs(1))
            .await
            .unwrap_err();

        assert!(matches!(err, AgentError::InvalidParams(_)));
    }

    #[tokio::test]
    async fn close_on_unknown_session_is_invalid_params() {
        let manager = SessionManager::default();

        let err = manager.close("deadbeef").await.unwrap_err();

        assert!(matches!(err, AgentError::InvalidParams(_)));
    }

    #[tokio::test]
    async fn list_is_empty_by_default() {
        let manager = SessionManager::default();

        let listing = manager.list().await;

        assert_eq!(listing["count"], 0);
        assert_eq!(listing["sessions"], serde_json::json!([]));
    }

    #[test]
    fn expand_user_resolves_home() {
        std::env::set_var("HOME", "/home/tester");

        assert_eq!(
            expand_user("~/.ssh/id_ed25519"),
            PathBuf::from("/home/tester/.ssh/id_ed25519")
        );
        assert_eq!(expand_user("/etc/key"), PathBuf::from("/etc/key"));
    }
}

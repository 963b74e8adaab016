//! The agent's request dispatcher and tunnel serving loop.
//!
//! Every inbound tunnel stream is served independently: streams opening with
//! the SSH banner go to the embedded SFTP endpoint, everything else is
//! length-prefixed JSON-RPC handled here. Within one stream requests are
//! handled strictly in order.

pub mod metrics;
pub mod session;
pub mod sftp;

use std::{
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use base64::Engine;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tracing::{debug, info, warn};

use crate::{
    policy::{PathPolicy, PolicyError},
    protocol::{
        self, ProtocolError, Request, Response, ERR_COMMAND_FAILED, ERR_FILE_NOT_FOUND,
        ERR_INVALID_PARAMS, ERR_METHOD_NOT_FOUND, ERR_PATH_DENIED,
    },
};

/// `read_file` ceiling; anything larger should go through SFTP.
const MAX_READ_SIZE: u64 = 10 * 1024 * 1024;

const DEFAULT_COMMAND_TIMEOUT: u64 = 300;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Unknown method: {0}")]
    MethodNotFound(String),

    #[error("{0}")]
    InvalidParams(String),

    #[error("{0}")]
    PathDenied(String),

    #[error("{0}")]
    FileNotFound(String),

    #[error("{0}")]
    Failed(String),
}

impl AgentError {
    #[must_use]
    pub fn code(&self) -> i32 {
        match self {
            Self::MethodNotFound(_) => ERR_METHOD_NOT_FOUND,
            Self::InvalidParams(_) => ERR_INVALID_PARAMS,
            Self::PathDenied(_) => ERR_PATH_DENIED,
            Self::FileNotFound(_) => ERR_FILE_NOT_FOUND,
            Self::Failed(_) => ERR_COMMAND_FAILED,
        }
    }

    fn missing(key: &str) -> Self {
        Self::InvalidParams(format!("Missing required parameter: {key}"))
    }
}

impl From<PolicyError> for AgentError {
    fn from(error: PolicyError) -> Self {
        match error {
            PolicyError::Denied(path) => Self::PathDenied(format!("Path not in allowed list: {path}")),
            PolicyError::Io(error) => Self::Failed(error.to_string()),
        }
    }
}

pub struct Agent {
    policy: PathPolicy,
    sessions: session::SessionManager,
}

impl Agent {
    #[must_use]
    pub fn new(policy: PathPolicy) -> Self {
        Self {
            policy,
            sessions: session::SessionManager::default(),
        }
    }

    #[must_use]
    pub fn policy(&self) -> &PathPolicy {
        &self.policy
    }

    /// Process one request. Never panics the caller; every failure becomes
    /// an error response with the matching code.
    pub async fn handle(&self, request: Request) -> Response {
        let id = request.id.clone();

        match self.dispatch(&request).await {
            Ok(result) => Response::success(result, id),
            Err(error) => {
                debug!(method = request.method, %error, "request failed");
                Response::failure(error.code(), error.to_string(), id)
            }
        }
    }

    async fn dispatch(&self, request: &Request) -> Result<Value, AgentError> {
        let params = &request.params;

        match request.method.as_str() {
            protocol::METHOD_RUN_COMMAND => self.run_command(params).await,
            protocol::METHOD_READ_FILE => self.read_file(params).await,
            protocol::METHOD_WRITE_FILE => self.write_file(params).await,
            protocol::METHOD_LIST_FILES => self.list_files(params).await,
            protocol::METHOD_HEARTBEAT => Ok(json!({"status": "alive"})),
            protocol::METHOD_GET_METRICS => get_metrics(params).await,
            protocol::METHOD_SSH_SESSION_OPEN => self.ssh_session_open(params).await,
            protocol::METHOD_SSH_SESSION_COMMAND => self.ssh_session_command(params).await,
            protocol::METHOD_SSH_SESSION_CLOSE => {
                self.sessions.close(str_param(params, "session_id")?).await
            }
            protocol::METHOD_SSH_SESSION_LIST => Ok(self.sessions.list().await),
            other => Err(AgentError::MethodNotFound(other.to_string())),
        }
    }

    async fn run_command(&self, params: &Value) -> Result<Value, AgentError> {
        let cmd = str_param(params, "cmd")?;
        let timeout = u64_param(params, "timeout").unwrap_or(DEFAULT_COMMAND_TIMEOUT);

        let cwd = match opt_str_param(params, "cwd") {
            Some(cwd) => Some(self.policy.resolve(cwd)?),
            None => None,
        };

        info!(cmd, "running command");

        let mut command = tokio::process::Command::new("sh");
        command.arg("-c").arg(cmd).kill_on_drop(true);
        if let Some(cwd) = cwd {
            command.current_dir(cwd);
        }

        let output = tokio::time::timeout(Duration::from_secs(timeout), command.output()).await;

        match output {
            Ok(Ok(output)) => Ok(json!({
                "stdout": String::from_utf8_lossy(&output.stdout),
                "stderr": String::from_utf8_lossy(&output.stderr),
                "returncode": output.status.code().unwrap_or(-1),
            })),
            // The timeout is part of the result contract, not an error.
            Err(_) => Ok(json!({
                "stdout": "",
                "stderr": format!("Command timed out after {timeout} seconds"),
                "returncode": -1,
            })),
            Ok(Err(error)) => Err(AgentError::Failed(format!("Failed to run command: {error}"))),
        }
    }

    async fn read_file(&self, params: &Value) -> Result<Value, AgentError> {
        let path = self.policy.resolve(str_param(params, "path")?)?;

        let meta = tokio::fs::metadata(&path)
            .await
            .map_err(|_| AgentError::FileNotFound(format!("File not found: {}", path.display())))?;

        if !meta.is_file() {
            return Err(AgentError::Failed(format!("Not a file: {}", path.display())));
        }

        if meta.len() > MAX_READ_SIZE {
            return Err(AgentError::Failed(format!("File too large: {} bytes", meta.len())));
        }

        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|error| AgentError::Failed(error.to_string()))?;
        let size = bytes.len();

        match String::from_utf8(bytes) {
            Ok(content) => Ok(json!({
                "content": content,
                "size": size,
                "path": path.display().to_string(),
            })),
            Err(raw) => Ok(json!({
                "content": base64::engine::general_purpose::STANDARD.encode(raw.as_bytes()),
                "size": size,
                "path": path.display().to_string(),
                "binary": true,
            })),
        }
    }

    async fn write_file(&self, params: &Value) -> Result<Value, AgentError> {
        let path = self.policy.resolve(str_param(params, "path")?)?;
        let content = str_param(params, "content")?;
        let binary = bool_param(params, "binary");

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|error| AgentError::Failed(error.to_string()))?;
        }

        let data = if binary {
            base64::engine::general_purpose::STANDARD
                .decode(content)
                .map_err(|error| AgentError::Failed(format!("Invalid base64 content: {error}")))?
        } else {
            content.as_bytes().to_vec()
        };

        let size = data.len();
        tokio::fs::write(&path, data)
            .await
            .map_err(|error| AgentError::Failed(error.to_string()))?;

        Ok(json!({"path": path.display().to_string(), "size": size}))
    }

    async fn list_files(&self, params: &Value) -> Result<Value, AgentError> {
        let path = self.policy.resolve(str_param(params, "path")?)?;

        let meta = tokio::fs::metadata(&path).await.map_err(|_| {
            AgentError::FileNotFound(format!("Directory not found: {}", path.display()))
        })?;

        if !meta.is_dir() {
            return Err(AgentError::Failed(format!("Not a directory: {}", path.display())));
        }

        let mut dir = tokio::fs::read_dir(&path)
            .await
            .map_err(|error| AgentError::Failed(error.to_string()))?;

        let mut entries = Vec::new();
        loop {
            let entry = match dir.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(error) => return Err(AgentError::Failed(error.to_string())),
            };

            let name = entry.file_name().to_string_lossy().into_owned();
            match entry.metadata().await {
                Ok(meta) => {
                    use std::os::unix::fs::PermissionsExt;

                    let mtime = meta
                        .modified()
                        .ok()
                        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                        .map_or(0.0, |d| d.as_secs_f64());

                    entries.push(json!({
                        "name": name,
                        "type": if meta.is_dir() { "dir" } else { "file" },
                        "size": if meta.is_file() { meta.len() } else { 0 },
                        "mode": filemode(meta.permissions().mode()),
                        "mtime": mtime,
                    }));
                }
                // One unreadable entry shouldn't sink the whole listing.
                Err(_) => entries.push(json!({
                    "name": name,
                    "type": "unknown",
                    "error": "permission denied",
                })),
            }
        }

        Ok(json!({"path": path.display().to_string(), "entries": entries}))
    }

    async fn ssh_session_open(&self, params: &Value) -> Result<Value, AgentError> {
        let host = str_param(params, "host")?;
        let username = str_param(params, "username")?;
        let password = opt_str_param(params, "password");
        let key_file = opt_str_param(params, "key_file");
        let port = u64_param(params, "port").unwrap_or(22);
        let port = u16::try_from(port)
            .map_err(|_| AgentError::InvalidParams(format!("Invalid port: {port}")))?;

        self.sessions
            .open(host, username, password, key_file, port)
            .await
    }

    async fn ssh_session_command(&self, params: &Value) -> Result<Value, AgentError> {
        let session_id = str_param(params, "session_id")?;
        let command = str_param(params, "command")?;
        let timeout = params
            .get("timeout")
            .and_then(Value::as_f64)
            .unwrap_or(300.0);

        self.sessions
            .command(session_id, command, Duration::from_secs_f64(timeout.max(0.0)))
            .await
    }

    /// Serve framed JSON-RPC on one tunnel stream until EOF. Fire-and-forget
    /// requests (no id) are processed without a response frame.
    pub async fn serve_stream<S>(&self, mut stream: S) -> Result<(), ProtocolError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        loop {
            let body = match protocol::read_frame(&mut stream).await {
                Ok(body) => body,
                Err(ProtocolError::Io(error))
                    if error.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    return Ok(());
                }
                Err(error) => return Err(error),
            };

            let request = match Request::from_json(&body) {
                Ok(request) => request,
                Err(error) => {
                    warn!(%error, "malformed request frame");
                    let response = Response::failure(
                        ERR_INVALID_PARAMS,
                        format!("Malformed request: {error}"),
                        None,
                    );
                    protocol::write_frame(&mut stream, &response.to_json()?).await?;
                    continue;
                }
            };

            let expects_response = request.expects_response();
            let response = self.handle(request).await;

            if expects_response {
                protocol::write_frame(&mut stream, &response.to_json()?).await?;
            }
        }
    }

    /// Serve one inbound tunnel stream, sniffing the first bytes to decide
    /// between the SFTP endpoint (SSH banner) and JSON-RPC (length prefix,
    /// which can never start with `SSH-`).
    pub async fn serve_tunnel<S>(&self, mut stream: S) -> eyre::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut prefix = [0_u8; 4];
        if let Err(error) = stream.read_exact(&mut prefix).await {
            debug!(%error, "tunnel stream closed before any data");
            return Ok(());
        }

        let stream = PrefixedStream::new(prefix.to_vec(), stream);

        if &prefix == b"SSH-" {
            sftp::serve_ssh(stream, self.policy.clone()).await
        } else {
            self.serve_stream(stream).await.map_err(Into::into)
        }
    }

    /// Close interactive sessions on shutdown.
    pub async fn shutdown(&self) {
        self.sessions.close_all().await;
    }
}

fn str_param<'a>(params: &'a Value, key: &str) -> Result<&'a str, AgentError> {
    params
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| AgentError::missing(key))
}

fn opt_str_param<'a>(params: &'a Value, key: &str) -> Option<&'a str> {
    params.get(key).and_then(Value::as_str)
}

fn u64_param(params: &Value, key: &str) -> Option<u64> {
    params.get(key).and_then(Value::as_u64)
}

fn bool_param(params: &Value, key: &str) -> bool {
    params.get(key).and_then(Value::as_bool).unwrap_or(false)
}

async fn get_metrics(params: &Value) -> Result<Value, AgentError> {
    let summary = bool_param(params, "summary");

    tokio::task::spawn_blocking(move || {
        if summary {
            metrics::summary()
        } else {
            metrics::collect()
        }
    })
    .await
    .map_err(|error| AgentError::Failed(format!("Metrics collection failed: {error}")))
}

/// `ls -l` style mode string, matching what operators expect in listings.
fn filemode(mode: u32) -> String {
    let kind = match mode & 0o170_000 {
        0o040_000 => 'd',
        0o120_000 => 'l',
        0o140_000 => 's',
        0o060_000 => 'b',
        0o020_000 => 'c',
        0o010_000 => 'p',
        _ => '-',
    };

    let mut out = String::with_capacity(10);
    out.push(kind);
    for shift in [6_u32, 3, 0] {
        let bits = (mode >> shift) & 0o7;
        out.push(if bits & 0o4 != 0 { 'r' } else { '-' });
        out.push(if bits & 0o2 != 0 { 'w' } else { '-' });
        out.push(if bits & 0o1 != 0 { 'x' } else { '-' });
    }

    out
}

/// A stream whose first reads replay bytes already consumed by the sniffer.
pub struct PrefixedStream<S> {
    prefix: Vec<u8>,
    pos: usize,
    inner: S,
}

impl<S> PrefixedStream<S> {
    pub fn new(prefix: Vec<u8>, inner: S) -> Self {
        Self {
            prefix,
            pos: 0,
            inner,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PrefixedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();

        if this.pos < this.prefix.len() {
            let remaining = &this.prefix[this.pos..];
            let take = remaining.len().min(buf.remaining());
            buf.put_slice(&remaining[..take]);
            this.pos += take;

            return Poll::Ready(Ok(()));
        }

        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PrefixedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{METHOD_HEARTBEAT, METHOD_RUN_COMMAND};

    fn request(method: &str, params: Value) -> Request {
        Request {
            method: method.to_string(),
            params,
            id: Some("1".to_string()),
        }
    }

    fn unrestricted() -> Agent {
        Agent::new(PathPolicy::unrestricted())
    }

    #[tokio::test]
    async fn heartbeat_is_alive() {
        let response = unrestricted()
            .handle(request(METHOD_HEARTBEAT, json!({})))
            .await;

        assert_eq!(response.result.unwrap(), json!({"status": "alive"}));
    }

    #[tokio::test]
    async fn unknown_method_is_method_not_found() {
        let response = unrestricted().handle(request("frobnicate", json!({}))).await;

        let error = response.error.unwrap();
        assert_eq!(error.code, ERR_METHOD_NOT_FOUND);
        assert!(error.message.contains("frobnicate"));
    }

    #[tokio::test]
    async fn missing_param_is_invalid_params() {
        let response = unrestricted()
            .handle(request(METHOD_RUN_COMMAND, json!({})))
            .await;

        let error = response.error.unwrap();
        assert_eq!(error.code, ERR_INVALID_PARAMS);
        assert!(error.message.contains("cmd"));
    }

    #[tokio::test]
    async fn run_command_captures_output() {
        let response = unrestricted()
            .handle(request(METHOD_RUN_COMMAND, json!({"cmd": "echo hi"})))
            .await;

        let result = response.result.unwrap();
        assert_eq!(result["stdout"], "hi\n");
        assert_eq!(result["returncode"], 0);
    }

    #[tokio::test]
    async fn run_command_nonzero_exit_is_a_result() {
        let response = unrestricted()
            .handle(request(METHOD_RUN_COMMAND, json!({"cmd": "exit 3"})))
            .await;

        let result = response.result.unwrap();
        assert_eq!(result["returncode"], 3);
    }

    #[tokio::test]
    async fn run_command_timeout_returns_inline() {
        let response = unrestricted()
            .handle(request(
                METHOD_RUN_COMMAND,
                json!({"cmd": "sleep 5", "timeout": 1}),
            ))
            .await;

        let result = response.result.unwrap();
        assert_eq!(result["returncode"], -1);
        assert_eq!(result["stderr"], "Command timed out after 1 seconds");
        assert_eq!(result["stdout"], "");
    }

    #[tokio::test]
    async fn run_command_cwd_is_validated() {
        let dir = tempfile::tempdir().unwrap();
        let agent = Agent::new(PathPolicy::new(Some(vec![dir.path().to_path_buf()])));

        let response = agent
            .handle(request(
                METHOD_RUN_COMMAND,
                json!({"cmd": "pwd", "cwd": "/etc"}),
            ))
            .await;

        assert_eq!(response.error.unwrap().code, ERR_PATH_DENIED);
    }

    #[tokio::test]
    async fn read_file_missing_is_file_not_found() {
        let response = unrestricted()
            .handle(request(
                protocol::METHOD_READ_FILE,
                json!({"path": "/definitely/not/here"}),
            ))
            .await;

        assert_eq!(response.error.unwrap().code, ERR_FILE_NOT_FOUND);
    }

    #[tokio::test]
    async fn read_file_outside_allow_list_is_denied() {
        let dir = tempfile::tempdir().unwrap();
        let agent = Agent::new(PathPolicy::new(Some(vec![dir.path().to_path_buf()])));

        let response = agent
            .handle(request(
                protocol::METHOD_READ_FILE,
                json!({"path": "/etc/passwd"}),
            ))
            .await;

        assert_eq!(response.error.unwrap().code, ERR_PATH_DENIED);
    }

    #[tokio::test]
    async fn read_file_too_large_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let big = dir.path().join("big.bin");
        let file = std::fs::File::create(&big).unwrap();
        file.set_len(MAX_READ_SIZE + 1).unwrap();

        let response = unrestricted()
            .handle(request(
                protocol::METHOD_READ_FILE,
                json!({"path": big.display().to_string()}),
            ))
            .await;

        let error = response.error.unwrap();
        assert_eq!(error.code, ERR_COMMAND_FAILED);
        assert!(error.message.contains("File too large"));
    }

    #[tokio::test]
    async fn binary_write_read_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob.bin").display().to_string();
        let agent = unrestricted();

        let write = agent
            .handle(request(
                protocol::METHOD_WRITE_FILE,
                json!({"path": path, "content": "SGVsbG8=", "binary": true}),
            ))
            .await;
        assert_eq!(write.result.unwrap()["size"], 5);

        assert_eq!(std::fs::read(dir.path().join("blob.bin")).unwrap(), b"Hello");

        // Force the binary read path with a non-UTF-8 byte.
        std::fs::write(dir.path().join("blob.bin"), [0x48, 0x65, 0x6c, 0x6c, 0x6f, 0xff]).unwrap();
        let read = agent
            .handle(request(
                protocol::METHOD_READ_FILE,
                json!({"path": dir.path().join("blob.bin").display().to_string()}),
            ))
            .await;

        let result = read.result.unwrap();
        assert_eq!(result["binary"], true);
        assert_eq!(result["content"], "SGVsbG//");
    }

    #[tokio::test]
    async fn write_file_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("deep/nested/file.txt");

        let response = unrestricted()
            .handle(request(
                protocol::METHOD_WRITE_FILE,
                json!({"path": path.display().to_string(), "content": "data"}),
            ))
            .await;

        assert!(response.error.is_none());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "data");
    }

    #[tokio::test]
    async fn list_files_reports_entries() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"abc").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();

        let response = unrestricted()
            .handle(request(
                protocol::METHOD_LIST_FILES,
                json!({"path": dir.path().display().to_string()}),
            ))
            .await;

        let result = response.result.unwrap();
        let entries = result["entries"].as_array().unwrap();
        assert_eq!(entries.len(), 2);

        let file = entries.iter().find(|e| e["name"] == "a.txt").unwrap();
        assert_eq!(file["type"], "file");
        assert_eq!(file["size"], 3);
        assert!(file["mode"].as_str().unwrap().starts_with('-'));

        let sub = entries.iter().find(|e| e["name"] == "sub").unwrap();
        assert_eq!(sub["type"], "dir");
    }

    #[tokio::test]
    async fn serve_stream_answers_frames_in_order() {
        let agent = unrestricted();
        let (near, mut far) = tokio::io::duplex(4096);

        let serving = tokio::spawn(async move {
            let agent = agent;
            agent.serve_stream(near).await
        });

        for i in 0..3 {
            let request = Request {
                method: METHOD_HEARTBEAT.to_string(),
                params: json!({}),
                id: Some(format!("req-{i}")),
            };
            protocol::write_frame(&mut far, &request.to_json().unwrap())
                .await
                .unwrap();

            let body = protocol::read_frame(&mut far).await.unwrap();
            let response = Response::from_json(&body).unwrap();
            assert_eq!(response.id.as_deref(), Some(format!("req-{i}").as_str()));
        }

        drop(far);
        serving.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn fire_and_forget_produces_no_response() {
        let agent = unrestricted();
        let (near, mut far) = tokio::io::duplex(4096);

        let serving = tokio::spawn(async move {
            let agent = agent;
            agent.serve_stream(near).await
        });

        let silent = Request {
            method: METHOD_HEARTBEAT.to_string(),
            params: json!({}),
            id: None,
        };
        protocol::write_frame(&mut far, &silent.to_json().unwrap())
            .await
            .unwrap();

        // The next frame on the wire answers the identified request, not the
        // fire-and-forget one.
        let identified = Request {
            method: METHOD_HEARTBEAT.to_string(),
            params: json!({}),
            id: Some("loud".to_string()),
        };
        protocol::write_frame(&mut far, &identified.to_json().unwrap())
            .await
            .unwrap();

        let body = protocol::read_frame(&mut far).await.unwrap();
        let response = Response::from_json(&body).unwrap();
        assert_eq!(response.id.as_deref(), Some("loud"));

        drop(far);
        serving.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn prefixed_stream_replays_sniffed_bytes() {
        let (near, mut far) = tokio::io::duplex(64);

        tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            far.write_all(b"0123rest-of-stream").await.unwrap();
        });

        let mut near = near;
        let mut sniffed = [0_u8; 4];
        near.read_exact(&mut sniffed).await.unwrap();
        assert_eq!(&sniffed, b"0123");

        let mut stream = PrefixedStream::new(sniffed.to_vec(), near);
        let mut replay = [0_u8; 8];
        stream.read_exact(&mut replay).await.unwrap();
        assert_eq!(&replay, b"0123rest");
    }

    #[test]
    fn filemode_formats_like_ls() {
        assert_eq!(filemode(0o100_644), "-rw-r--r--");
        assert_eq!(filemode(0o040_755), "drwxr-xr-x");
        assert_eq!(filemode(0o120_777), "lrwxrwxrwx");
    }
}

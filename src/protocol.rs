//! Wire protocol shared by `reach serve` and `reach agent`.
//!
//! Every message on the tunnel is a 4-byte big-endian length followed by a
//! UTF-8 JSON body. Requests carry `{method, params, id}`; responses echo the
//! id and carry exactly one of `result` or `error`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const METHOD_RUN_COMMAND: &str = "run_command";
pub const METHOD_READ_FILE: &str = "read_file";
pub const METHOD_WRITE_FILE: &str = "write_file";
pub const METHOD_LIST_FILES: &str = "list_files";
pub const METHOD_HEARTBEAT: &str = "heartbeat";
pub const METHOD_GET_METRICS: &str = "get_metrics";
pub const METHOD_SSH_SESSION_OPEN: &str = "ssh_session_open";
pub const METHOD_SSH_SESSION_COMMAND: &str = "ssh_session_command";
pub const METHOD_SSH_SESSION_CLOSE: &str = "ssh_session_close";
pub const METHOD_SSH_SESSION_LIST: &str = "ssh_session_list";
pub const METHOD_REGISTER: &str = "register";

pub const ERR_METHOD_NOT_FOUND: i32 = -32601;
pub const ERR_INVALID_PARAMS: i32 = -32602;
pub const ERR_COMMAND_FAILED: i32 = -32000;
pub const ERR_PATH_DENIED: i32 = -32001;
pub const ERR_FILE_NOT_FOUND: i32 = -32002;

/// Ceiling on a single frame. Anything larger is a corrupt or hostile peer.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Username used on tunnel SFTP connections. The tunnel terminates on
/// loopback at both ends, so the name is a protocol marker, not a secret.
pub const TUNNEL_USER: &str = "reach";

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("incomplete message header: {0} of 4 bytes")]
    IncompleteHeader(usize),

    #[error("incomplete message body: {have} of {want} bytes")]
    IncompleteBody { have: usize, want: usize },

    #[error("frame of {0} bytes exceeds the {MAX_FRAME_LEN} byte ceiling")]
    Oversized(usize),

    #[error("message body is not valid UTF-8")]
    Utf8(#[from] std::string::FromUtf8Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Frame a message for the tunnel.
#[allow(clippy::cast_possible_truncation)]
#[must_use]
pub fn encode_message(msg: &str) -> Vec<u8> {
    let body = msg.as_bytes();
    let mut framed = Vec::with_capacity(4 + body.len());
    framed.extend_from_slice(&(body.len() as u32).to_be_bytes());
    framed.extend_from_slice(body);

    framed
}

/// Decode one frame from the front of `data`, returning the body and any
/// trailing bytes so concatenated frames decode pairwise.
pub fn decode_message(data: &[u8]) -> Result<(String, &[u8]), ProtocolError> {
    if data.len() < 4 {
        return Err(ProtocolError::IncompleteHeader(data.len()));
    }

    let want = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
    if want > MAX_FRAME_LEN {
        return Err(ProtocolError::Oversized(want));
    }

    let body = &data[4..];
    if body.len() < want {
        return Err(ProtocolError::IncompleteBody {
            have: body.len(),
            want,
        });
    }

    let msg = String::from_utf8(body[..want].to_vec())?;

    Ok((msg, &body[want..]))
}

/// Read one frame off an async stream.
pub async fn read_frame<R>(reader: &mut R) -> Result<String, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0_u8; 4];
    reader.read_exact(&mut header).await?;

    let want = u32::from_be_bytes(header) as usize;
    if want > MAX_FRAME_LEN {
        return Err(ProtocolError::Oversized(want));
    }

    let mut body = vec![0_u8; want];
    reader.read_exact(&mut body).await?;

    Ok(String::from_utf8(body)?)
}

/// Write one frame to an async stream.
pub async fn write_frame<W>(writer: &mut W, msg: &str) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&encode_message(msg)).await?;
    writer.flush().await?;

    Ok(())
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub method: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub id: Option<String>,
}

impl Request {
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self {
            method: method.into(),
            params,
            id: Some(uuid::Uuid::new_v4().to_string()),
        }
    }

    pub fn from_json(data: &str) -> Result<Self, ProtocolError> {
        let mut request: Self = serde_json::from_str(data)?;
        if request.params.is_null() {
            request.params = Value::Object(serde_json::Map::new());
        }

        Ok(request)
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Fire-and-forget requests carry no id and expect no response.
    #[must_use]
    pub fn expects_response(&self) -> bool {
        self.id.is_some()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Response {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl Response {
    pub fn success(result: Value, id: Option<String>) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(code: i32, message: impl Into<String>, id: Option<String>) -> Self {
        Self {
            id,
            result: None,
            error: Some(RpcError {
                code,
                message: message.into(),
            }),
        }
    }

    pub fn from_json(data: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(data)?)
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Collapse into the result payload or the wire error.
    pub fn into_result(self) -> Result<Value, RpcError> {
        match (self.result, self.error) {
            (_, Some(error)) => Err(error),
            (Some(result), None) => Ok(result),
            (None, None) => Ok(Value::Null),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CreatedBy {
    #[default]
    Auto,
    Manual,
}

/// Durable identity for one logical agent. Survives reconnects, host moves
/// and OS reinstalls; the uuid is issued on first registration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClientIdentity {
    pub uuid: String,
    pub display_name: String,
    #[serde(default)]
    pub purpose: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    pub public_key_fingerprint: String,
    pub first_seen: chrono::DateTime<chrono::Utc>,
    #[serde(default)]
    pub created_by: CreatedBy,
    #[serde(default)]
    pub key_mismatch: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_fingerprint: Option<String>,
}

/// Current-session facts for an identity. Replaced wholesale on reconnect.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClientInfo {
    pub client_id: String,
    pub hostname: String,
    pub platform: String,
    pub username: String,
    pub tunnel_port: u16,
    pub connected_at: chrono::DateTime<chrono::Utc>,
    pub last_heartbeat: chrono::DateTime<chrono::Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity_uuid: Option<String>,
}

impl ClientInfo {
    /// Snapshot the local host's facts for a fresh registration. The tunnel
    /// port is filled in by the server, which is the side that allocated it.
    #[must_use]
    pub fn local(client_id: impl Into<String>, identity_uuid: impl Into<String>) -> Self {
        let now = chrono::Utc::now();

        Self {
            client_id: client_id.into(),
            hostname: hostname::get()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|_| "unknown".to_string()),
            platform: format!("{} {}", std::env::consts::OS, std::env::consts::ARCH),
            username: std::env::var("USER")
                .or_else(|_| std::env::var("USERNAME"))
                .unwrap_or_else(|_| "unknown".to_string()),
            tunnel_port: 0,
            connected_at: now,
            last_heartbeat: now,
            identity_uuid: Some(identity_uuid.into()),
        }
    }
}

/// The registration payload the agent sends over its control channel.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Registration {
    pub identity: ClientIdentity,
    pub client_info: ClientInfo,
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use serde_json::json;

    use super::*;

    fn identity() -> ClientIdentity {
        ClientIdentity {
            uuid: "abc-123".to_string(),
            display_name: "alpha".to_string(),
            purpose: "testing".to_string(),
            tags: vec!["test".to_string()],
            capabilities: vec![],
            public_key_fingerprint: "SHA256:AAA".to_string(),
            first_seen: chrono::Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            created_by: CreatedBy::Auto,
            key_mismatch: false,
            previous_fingerprint: None,
        }
    }

    #[test]
    fn encode_simple() {
        let encoded = encode_message("hello");

        assert_eq!(encoded.len(), 9);
        assert_eq!(&encoded[..4], b"\x00\x00\x00\x05");
        assert_eq!(&encoded[4..], b"hello");
    }

    #[test]
    fn encode_unicode_counts_bytes() {
        let encoded = encode_message("こんにちは");

        assert_eq!(&encoded[..4], b"\x00\x00\x00\x0f");
    }

    #[test]
    fn decode_simple() {
        let (msg, rest) = decode_message(b"\x00\x00\x00\x05hello").unwrap();

        assert_eq!(msg, "hello");
        assert!(rest.is_empty());
    }

    #[test]
    fn decode_keeps_trailing_bytes() {
        let (msg, rest) = decode_message(b"\x00\x00\x00\x05helloextra").unwrap();

        assert_eq!(msg, "hello");
        assert_eq!(rest, b"extra");
    }

    #[test]
    fn decode_incomplete_header() {
        let err = decode_message(b"\x00\x00").unwrap_err();

        assert!(matches!(err, ProtocolError::IncompleteHeader(2)));
    }

    #[test]
    fn decode_incomplete_body() {
        let err = decode_message(b"\x00\x00\x00\x10short").unwrap_err();

        assert!(matches!(
            err,
            ProtocolError::IncompleteBody { have: 5, want: 16 }
        ));
    }

    #[test]
    fn decode_rejects_oversized_frames() {
        let mut data = Vec::new();
        data.extend_from_slice(&(u32::MAX).to_be_bytes());
        data.extend_from_slice(b"ignored");

        assert!(matches!(
            decode_message(&data).unwrap_err(),
            ProtocolError::Oversized(_)
        ));
    }

    #[test]
    fn concatenated_messages_decode_pairwise() {
        let mut combined = encode_message("first");
        combined.extend_from_slice(&encode_message("second"));

        let (first, rest) = decode_message(&combined).unwrap();
        let (second, rest) = decode_message(rest).unwrap();

        assert_eq!(first, "first");
        assert_eq!(second, "second");
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn frame_roundtrip_over_stream() {
        let mut buffer = Vec::new();
        write_frame(&mut buffer, r#"{"method":"heartbeat"}"#)
            .await
            .unwrap();

        let mut cursor = std::io::Cursor::new(buffer);
        let body = read_frame(&mut cursor).await.unwrap();

        assert_eq!(body, r#"{"method":"heartbeat"}"#);
    }

    #[test]
    fn request_roundtrip() {
        let original = Request {
            method: METHOD_WRITE_FILE.to_string(),
            params: json!({"path": "/a", "content": "b"}),
            id: Some("42".to_string()),
        };

        let restored = Request::from_json(&original.to_json().unwrap()).unwrap();

        assert_eq!(restored, original);
    }

    #[test]
    fn request_defaults_params_and_id() {
        let request = Request::from_json(r#"{"method": "heartbeat"}"#).unwrap();

        assert_eq!(request.method, METHOD_HEARTBEAT);
        assert_eq!(request.params, json!({}));
        assert!(request.id.is_none());
        assert!(!request.expects_response());
    }

    #[test]
    fn response_success_omits_error_key() {
        let response = Response::success(json!({"status": "ok"}), Some("1".to_string()));
        let encoded = response.to_json().unwrap();
        let raw: Value = serde_json::from_str(&encoded).unwrap();

        assert_eq!(raw["result"], json!({"status": "ok"}));
        assert!(raw.get("error").is_none());
    }

    #[test]
    fn response_failure_omits_result_key() {
        let response = Response::failure(ERR_PATH_DENIED, "denied", Some("2".to_string()));
        let encoded = response.to_json().unwrap();
        let raw: Value = serde_json::from_str(&encoded).unwrap();

        assert_eq!(raw["error"]["code"], json!(ERR_PATH_DENIED));
        assert!(raw.get("result").is_none());
    }

    #[test]
    fn response_into_result() {
        let ok = Response::success(json!([1, 2, 3]), None).into_result().unwrap();
        assert_eq!(ok, json!([1, 2, 3]));

        let err = Response::failure(ERR_COMMAND_FAILED, "timeout", None)
            .into_result()
            .unwrap_err();
        assert_eq!(err.code, ERR_COMMAND_FAILED);
        assert_eq!(err.message, "timeout");
    }

    #[test]
    fn error_codes_are_negative_and_stable() {
        assert_eq!(ERR_METHOD_NOT_FOUND, -32601);
        assert_eq!(ERR_INVALID_PARAMS, -32602);
        assert_eq!(ERR_COMMAND_FAILED, -32000);
        assert_eq!(ERR_PATH_DENIED, -32001);
        assert_eq!(ERR_FILE_NOT_FOUND, -32002);
    }

    #[test]
    fn identity_defaults_on_deserialize() {
        let raw = json!({
            "uuid": "def-456",
            "display_name": "bravo",
            "public_key_fingerprint": "SHA256:BBB",
            "first_seen": "2024-01-02T00:00:00Z",
        });

        let identity: ClientIdentity = serde_json::from_value(raw).unwrap();

        assert_eq!(identity.created_by, CreatedBy::Auto);
        assert!(!identity.key_mismatch);
        assert!(identity.previous_fingerprint.is_none());
        assert!(identity.tags.is_empty());
    }

    #[test]
    fn registration_roundtrip() {
        let mut info = ClientInfo::local("client-1", "abc-123");
        info.tunnel_port = 40001;

        let registration = Registration {
            identity: identity(),
            client_info: info,
        };

        let encoded = serde_json::to_string(&registration).unwrap();
        let restored: Registration = serde_json::from_str(&encoded).unwrap();

        assert_eq!(restored.identity.uuid, "abc-123");
        assert_eq!(restored.client_info.tunnel_port, 40001);
        assert_eq!(
            restored.client_info.identity_uuid.as_deref(),
            Some("abc-123")
        );
    }
}

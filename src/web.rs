//! Operator HTTP and WebSocket surface.
//!
//! Everything here is a thin view over the registry, pool, history store and
//! event stream. A single bearer token gates the API; the public paths are
//! limited to health, prometheus metrics and the loopback registration hook
//! used by the SSH listener.

use std::{convert::Infallible, net::SocketAddr, sync::Arc, time::Instant};

use base64::Engine;
use bytes::Buf;
use chrono::Utc;
use eyre::{Result, WrapErr};
use futures::{SinkExt, StreamExt, TryStreamExt};
use prometheus::{Encoder, TextEncoder};
use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use warp::{
    http::StatusCode,
    reject::{self, Reject, Rejection},
    reply::{self, Reply},
    Filter,
};

use crate::{
    events::{EventKind, Events},
    health::HealthMonitor,
    history::{CommandRecord, HistoryQuery, HistoryStore, StatusFilter},
    pool::{Pool, PoolError},
    registry::Registry,
};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

const DEFAULT_EVENT_LIMIT: usize = 20;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<Registry>,
    pub pool: Arc<Pool>,
    pub health: Arc<HealthMonitor>,
    pub history: HistoryStore,
    pub events: Events,
    pub api_key: Option<String>,
    pub started_at: Instant,
}

#[derive(Debug)]
struct Unauthorized;

impl Reject for Unauthorized {}

fn with_state(
    state: AppState,
) -> impl Filter<Extract = (AppState,), Error = Infallible> + Clone {
    warp::any().map(move || state.clone())
}

#[derive(Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

/// Bearer check for the non-public routes. The token may arrive in the
/// Authorization header or, for WebSocket clients that cannot set headers,
/// the `token` query parameter.
fn authorized(api_key: Option<String>) -> impl Filter<Extract = (), Error = Rejection> + Clone {
    warp::header::optional::<String>("authorization")
        .and(warp::query::<TokenQuery>())
        .and_then(move |header: Option<String>, query: TokenQuery| {
            let api_key = api_key.clone();

            async move {
                let Some(api_key) = api_key else {
                    return Ok(());
                };

                if let Some(header) = header {
                    if header.strip_prefix("Bearer ") == Some(api_key.as_str()) {
                        return Ok(());
                    }
                }

                if query.token.as_deref() == Some(api_key.as_str()) {
                    return Ok(());
                }

                Err(reject::custom(Unauthorized))
            }
        })
        .untuple_one()
}

async fn handle_rejection(rejection: Rejection) -> Result<impl Reply, Rejection> {
    if rejection.find::<Unauthorized>().is_some() {
        return Ok(reply::with_status(
            reply::json(&json!({"error": "Unauthorized"})),
            StatusCode::UNAUTHORIZED,
        ));
    }

    Err(rejection)
}

fn json_error(message: impl Into<String>, status: StatusCode) -> reply::WithStatus<reply::Json> {
    reply::with_status(reply::json(&json!({"error": message.into()})), status)
}

/// 503 when the pool can't reach the agent, 500 for agent-side failures.
fn pool_error_reply(error: &PoolError) -> reply::WithStatus<reply::Json> {
    let status = if error.is_transport() {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };

    json_error(error.to_string(), status)
}

/// Unknown uuids are 404; known-but-offline clients are 503. The two must
/// stay distinct so automation can tell "retry later" from "wrong id".
enum ClientGate {
    NotFound,
    Offline,
}

impl ClientGate {
    fn message(&self) -> &'static str {
        match self {
            Self::NotFound => "Client not found",
            Self::Offline => "Client is offline",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Offline => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    fn reply(&self) -> reply::WithStatus<reply::Json> {
        json_error(self.message(), self.status())
    }
}

/// Client lookup preamble shared by the per-client routes.
async fn require_online(state: &AppState, uuid: &str) -> Result<String, ClientGate> {
    match state.registry.describe_client(uuid).await {
        None => Err(ClientGate::NotFound),
        Some(view) if !view.online => Err(ClientGate::Offline),
        Some(view) => Ok(view.identity.display_name),
    }
}

pub fn routes(
    state: AppState,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    let auth = authorized(state.api_key.clone());

    let health = warp::path!("health")
        .and(warp::get())
        .and(with_state(state.clone()))
        .then(health_handler);

    let metrics = warp::path!("metrics").and(warp::get()).and_then(metrics_handler);

    let internal_register = warp::path!("internal" / "register")
        .and(warp::post())
        .and(warp::body::json())
        .and(with_state(state.clone()))
        .then(internal_register_handler);

    let dashboard = warp::path!("api" / "v1" / "dashboard")
        .and(warp::get())
        .and(auth.clone())
        .and(with_state(state.clone()))
        .then(dashboard_handler);

    let clients = warp::path!("api" / "v1" / "clients")
        .and(warp::get())
        .and(auth.clone())
        .and(with_state(state.clone()))
        .then(clients_handler);

    let client_detail = warp::path!("api" / "v1" / "clients" / String)
        .and(warp::get())
        .and(auth.clone())
        .and(with_state(state.clone()))
        .then(client_detail_handler);

    let command_detail = warp::path!("api" / "v1" / "clients" / String / "history" / String)
        .and(warp::get())
        .and(auth.clone())
        .and(with_state(state.clone()))
        .then(command_detail_handler);

    let history_list = warp::path!("api" / "v1" / "clients" / String / "history")
        .and(warp::get())
        .and(auth.clone())
        .and(warp::query::<HistoryParams>())
        .and(with_state(state.clone()))
        .then(history_handler);

    let run_command = warp::path!("api" / "v1" / "clients" / String / "history")
        .and(warp::post())
        .and(auth.clone())
        .and(warp::body::json())
        .and(with_state(state.clone()))
        .then(run_command_handler);

    let history_clear = warp::path!("api" / "v1" / "clients" / String / "history")
        .and(warp::delete())
        .and(auth.clone())
        .and(with_state(state.clone()))
        .then(history_clear_handler);

    let files_list = warp::path!("api" / "v1" / "clients" / String / "files")
        .and(warp::get())
        .and(auth.clone())
        .and(warp::query::<PathParams>())
        .and(with_state(state.clone()))
        .then(files_list_handler);

    let file_preview = warp::path!("api" / "v1" / "clients" / String / "files" / "preview")
        .and(warp::get())
        .and(auth.clone())
        .and(warp::query::<PathParams>())
        .and(with_state(state.clone()))
        .then(file_preview_handler);

    let file_download = warp::path!("api" / "v1" / "clients" / String / "files" / "download")
        .and(warp::get())
        .and(auth.clone())
        .and(warp::query::<PathParams>())
        .and(with_state(state.clone()))
        .then(file_download_handler);

    let file_upload = warp::path!("api" / "v1" / "clients" / String / "files" / "upload")
        .and(warp::post())
        .and(auth.clone())
        .and(warp::multipart::form().max_length(64 * 1024 * 1024))
        .and(with_state(state.clone()))
        .then(file_upload_handler);

    let events = warp::path!("api" / "v1" / "events")
        .and(warp::get())
        .and(auth.clone())
        .and(warp::query::<EventParams>())
        .and(with_state(state.clone()))
        .then(events_handler);

    let ws = warp::path!("api" / "v1" / "ws")
        .and(auth)
        .and(warp::ws())
        .and(with_state(state))
        .map(|ws: warp::ws::Ws, state: AppState| {
            ws.on_upgrade(move |socket| ws_handler(socket, state))
        });

    health
        .or(metrics)
        .or(internal_register)
        .or(dashboard)
        .or(clients)
        .or(client_detail)
        .or(command_detail)
        .or(history_list)
        .or(run_command)
        .or(history_clear)
        .or(files_list)
        .or(file_preview)
        .or(file_download)
        .or(file_upload)
        .or(events)
        .or(ws)
        .recover(handle_rejection)
}

/// Bind and serve until the token fires. Bind failures are fatal.
pub async fn serve(state: AppState, addr: SocketAddr, shutdown: CancellationToken) -> Result<()> {
    if state.api_key.is_none() {
        warn!("no api key configured; server is UNAUTHENTICATED");
    }

    let (bound, server) = warp::serve(routes(state))
        .try_bind_with_graceful_shutdown(addr, async move {
            shutdown.cancelled().await;
        })
        .wrap_err_with(|| format!("failed to bind http listener on {addr}"))?;

    info!(addr = %bound, "http listener started");
    server.await;

    Ok(())
}

async fn health_handler(state: AppState) -> reply::Json {
    reply::json(&json!({
        "status": "healthy",
        "service": "reach",
        "online_clients": state.registry.online_count().await,
        "total_clients": state.registry.total_count().await,
    }))
}

async fn metrics_handler() -> Result<impl Reply, Rejection> {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&prometheus::gather(), &mut buffer)
        .map_err(|_| warp::reject::reject())?;

    Ok(buffer)
}

async fn internal_register_handler(
    registration: crate::protocol::Registration,
    state: AppState,
) -> reply::WithStatus<reply::Json> {
    match state
        .registry
        .register(registration, &state.pool, &state.health)
        .await
    {
        Ok((uuid, display_name)) => reply::with_status(
            reply::json(&json!({"registered": uuid, "display_name": display_name})),
            StatusCode::OK,
        ),
        Err(error) => {
            warn!(%error, "internal registration failed");
            json_error(error.to_string(), StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

async fn dashboard_handler(state: AppState) -> reply::Json {
    let online = state.registry.online_count().await;

    reply::json(&json!({
        "server": {
            "uptime_seconds": state.started_at.elapsed().as_secs(),
            "version": VERSION,
        },
        "clients": {
            "online": online,
            "total": state.registry.total_count().await,
        },
        "tunnels": {
            "active": online,
        },
    }))
}

async fn clients_handler(state: AppState) -> reply::Json {
    let clients = state.registry.list_clients().await;

    reply::json(&json!({
        "clients": clients,
        "online_count": state.registry.online_count().await,
        "total_count": state.registry.total_count().await,
    }))
}

async fn client_detail_handler(uuid: String, state: AppState) -> reply::WithStatus<reply::Json> {
    match state.registry.describe_client(&uuid).await {
        Some(view) => reply::with_status(reply::json(&view), StatusCode::OK),
        None => json_error("Client not found", StatusCode::NOT_FOUND),
    }
}

#[derive(Deserialize)]
struct HistoryParams {
    limit: Option<usize>,
    offset: Option<usize>,
    search: Option<String>,
    status: Option<String>,
}

async fn history_handler(
    uuid: String,
    params: HistoryParams,
    state: AppState,
) -> reply::WithStatus<reply::Json> {
    let query = HistoryQuery {
        limit: params.limit.unwrap_or(50),
        offset: params.offset.unwrap_or(0),
        search: params.search,
        status: params.status.as_deref().and_then(StatusFilter::parse),
    };
    let (limit, offset) = (query.limit, query.offset);

    match state.history.list_for_client(&uuid, query).await {
        Ok((commands, total)) => reply::with_status(
            reply::json(&json!({
                "commands": commands,
                "total": total,
                "limit": limit,
                "offset": offset,
            })),
            StatusCode::OK,
        ),
        Err(error) => json_error(error.to_string(), StatusCode::INTERNAL_SERVER_ERROR),
    }
}

async fn command_detail_handler(
    _uuid: String,
    command_id: String,
    state: AppState,
) -> reply::WithStatus<reply::Json> {
    match state.history.get(&command_id).await {
        Ok(Some(record)) => reply::with_status(reply::json(&record), StatusCode::OK),
        Ok(None) => json_error("Command not found", StatusCode::NOT_FOUND),
        Err(error) => json_error(error.to_string(), StatusCode::INTERNAL_SERVER_ERROR),
    }
}

/// Purge a client's history wholesale, for decommissioned agents. Works
/// whether or not the registry still knows the uuid, since the records may
/// outlive the identity.
async fn history_clear_handler(uuid: String, state: AppState) -> reply::WithStatus<reply::Json> {
    match state.history.delete_for_client(&uuid).await {
        Ok(deleted) => reply::with_status(
            reply::json(&json!({"client_uuid": uuid, "deleted": deleted})),
            StatusCode::OK,
        ),
        Err(error) => json_error(error.to_string(), StatusCode::INTERNAL_SERVER_ERROR),
    }
}

#[derive(Deserialize)]
struct RunRequest {
    command: Option<String>,
    cwd: Option<String>,
    timeout: Option<u64>,
}

async fn run_command_handler(
    uuid: String,
    body: RunRequest,
    state: AppState,
) -> reply::WithStatus<reply::Json> {
    let display_name = match require_online(&state, &uuid).await {
        Ok(name) => name,
        Err(gate) => return gate.reply(),
    };

    let Some(command) = body.command.filter(|c| !c.is_empty()) else {
        return json_error("Missing 'command' field", StatusCode::BAD_REQUEST);
    };

    let timeout = body.timeout.unwrap_or(300);
    let started_at = Utc::now();

    let outcome = match state.pool.get(&uuid).await {
        Ok(conn) => conn.run_command(&command, body.cwd.as_deref(), timeout).await,
        Err(error) => Err(error),
    };

    match outcome {
        Ok(result) => {
            let record = CommandRecord::finished(
                &uuid,
                &command,
                body.cwd,
                result["stdout"].as_str().unwrap_or_default(),
                result["stderr"].as_str().unwrap_or_default(),
                i32::try_from(result["returncode"].as_i64().unwrap_or(-1)).unwrap_or(-1),
                started_at,
                Utc::now(),
                "web",
            );

            if let Err(error) = state.history.add(record.clone()).await {
                warn!(%error, "failed to persist command record");
            }

            let mut summary = format!("Ran: {}", truncate(&command, 50));
            if command.len() > 50 {
                summary.push_str("...");
            }
            state
                .events
                .record(
                    EventKind::CommandExecuted,
                    &uuid,
                    &display_name,
                    summary,
                    json!({"command": command, "returncode": record.returncode}),
                )
                .await;

            reply::with_status(reply::json(&record), StatusCode::OK)
        }
        Err(error) => {
            // Transport failures still leave a history record so the
            // operator sees the attempt and its wall time.
            let record = CommandRecord::finished(
                &uuid,
                &command,
                body.cwd,
                "",
                error.to_string(),
                -1,
                started_at,
                Utc::now(),
                "web",
            );

            if let Err(persist) = state.history.add(record.clone()).await {
                warn!(%persist, "failed to persist failed command record");
            }

            let status = if error.is_transport() {
                StatusCode::SERVICE_UNAVAILABLE
            } else {
                StatusCode::INTERNAL_SERVER_ERROR
            };

            reply::with_status(
                reply::json(&json!({"error": error.to_string(), "record": record})),
                status,
            )
        }
    }
}

#[derive(Deserialize)]
struct PathParams {
    path: Option<String>,
}

async fn files_list_handler(
    uuid: String,
    params: PathParams,
    state: AppState,
) -> reply::WithStatus<reply::Json> {
    let display_name = match require_online(&state, &uuid).await {
        Ok(name) => name,
        Err(gate) => return gate.reply(),
    };

    let path = params.path.unwrap_or_else(|| "/".to_string());

    let listing = match state.pool.get(&uuid).await {
        Ok(conn) => conn.list_files(&path).await,
        Err(error) => Err(error),
    };

    match listing {
        Ok(result) => {
            state
                .events
                .record(
                    EventKind::FileAccessed,
                    &uuid,
                    &display_name,
                    format!("Listed: {path}"),
                    json!({"path": path, "operation": "list"}),
                )
                .await;

            reply::with_status(
                reply::json(&json!({
                    "path": path,
                    "entries": result.get("entries").cloned().unwrap_or_else(|| json!([])),
                })),
                StatusCode::OK,
            )
        }
        Err(error) => pool_error_reply(&error),
    }
}

async fn file_preview_handler(
    uuid: String,
    params: PathParams,
    state: AppState,
) -> reply::WithStatus<reply::Json> {
    if let Err(gate) = require_online(&state, &uuid).await {
        return gate.reply();
    }

    let Some(path) = params.path else {
        return json_error("Missing 'path' parameter", StatusCode::BAD_REQUEST);
    };

    let read = match state.pool.get(&uuid).await {
        Ok(conn) => conn.read_file(&path).await,
        Err(error) => Err(error),
    };

    match read {
        Ok(result) => {
            let binary = result["binary"].as_bool().unwrap_or(false);
            let content = result["content"].as_str().unwrap_or_default();
            let size = result["size"].as_u64().unwrap_or(content.len() as u64);

            reply::with_status(
                reply::json(&json!({
                    "path": path,
                    "content": if binary { json!(null) } else { json!(content) },
                    "binary": binary,
                    "size": size,
                    "mimeType": guess_mime(&path),
                })),
                StatusCode::OK,
            )
        }
        Err(error) => pool_error_reply(&error),
    }
}

enum Payload {
    Rpc(serde_json::Value),
    Bytes(Vec<u8>),
}

async fn sftp_download(state: &AppState, uuid: &str, path: &str) -> Result<Payload, PoolError> {
    let sftp = state.pool.sftp(uuid).await?;
    let data = sftp.download(path).await?;
    let _closed = sftp.close().await;

    Ok(Payload::Bytes(data))
}

fn bytes_error(message: &str, status: StatusCode) -> warp::http::Response<Vec<u8>> {
    warp::http::Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(serde_json::to_vec(&json!({"error": message})).unwrap_or_default())
        .unwrap_or_default()
}

async fn file_download_handler(
    uuid: String,
    params: PathParams,
    state: AppState,
) -> warp::http::Response<Vec<u8>> {
    let display_name = match require_online(&state, &uuid).await {
        Ok(name) => name,
        Err(gate) => return bytes_error(gate.message(), gate.status()),
    };

    let Some(path) = params.path else {
        return bytes_error("Missing 'path' parameter", StatusCode::BAD_REQUEST);
    };

    let read = match state.pool.get(&uuid).await {
        Ok(conn) => conn.read_file(&path).await,
        Err(error) => Err(error),
    };

    // Files over the JSON-RPC read ceiling come down the SFTP side of the
    // tunnel instead.
    let read = match read {
        Err(PoolError::Rpc(rpc)) if rpc.message.contains("File too large") => {
            sftp_download(&state, &uuid, &path).await
        }
        other => other.map(Payload::Rpc),
    };

    match read {
        Ok(payload) => {
            let data = match payload {
                Payload::Bytes(data) => data,
                Payload::Rpc(result) => {
                    let content = result["content"].as_str().unwrap_or_default();
                    if result["binary"].as_bool().unwrap_or(false) {
                        match base64::engine::general_purpose::STANDARD.decode(content) {
                            Ok(data) => data,
                            Err(error) => {
                                return bytes_error(
                                    &format!("Corrupt file payload: {error}"),
                                    StatusCode::INTERNAL_SERVER_ERROR,
                                )
                            }
                        }
                    } else {
                        content.as_bytes().to_vec()
                    }
                }
            };

            let filename = path.rsplit('/').next().unwrap_or("download").to_string();

            state
                .events
                .record(
                    EventKind::FileAccessed,
                    &uuid,
                    &display_name,
                    format!("Downloaded: {filename}"),
                    json!({"path": path, "operation": "download"}),
                )
                .await;

            warp::http::Response::builder()
                .header("content-type", "application/octet-stream")
                .header(
                    "content-disposition",
                    format!("attachment; filename=\"{filename}\""),
                )
                .body(data)
                .unwrap_or_default()
        }
        Err(error) => {
            let status = if error.is_transport() {
                StatusCode::SERVICE_UNAVAILABLE
            } else {
                StatusCode::INTERNAL_SERVER_ERROR
            };

            bytes_error(&error.to_string(), status)
        }
    }
}

async fn file_upload_handler(
    uuid: String,
    form: warp::multipart::FormData,
    state: AppState,
) -> reply::WithStatus<reply::Json> {
    let display_name = match require_online(&state, &uuid).await {
        Ok(name) => name,
        Err(gate) => return gate.reply(),
    };

    let mut file: Option<Vec<u8>> = None;
    let mut dest_path: Option<String> = None;

    let mut parts = form;
    loop {
        let part = match parts.try_next().await {
            Ok(Some(part)) => part,
            Ok(None) => break,
            Err(error) => {
                return json_error(format!("Invalid form: {error}"), StatusCode::BAD_REQUEST)
            }
        };

        let name = part.name().to_string();
        let data = match read_part(part).await {
            Ok(data) => data,
            Err(error) => {
                return json_error(format!("Invalid form: {error}"), StatusCode::BAD_REQUEST)
            }
        };

        match name.as_str() {
            "file" => file = Some(data),
            "path" => dest_path = Some(String::from_utf8_lossy(&data).into_owned()),
            _ => {}
        }
    }

    let Some(content) = file else {
        return json_error("No file provided", StatusCode::BAD_REQUEST);
    };
    let Some(dest_path) = dest_path else {
        return json_error("Missing 'path' field", StatusCode::BAD_REQUEST);
    };

    let size = content.len();

    // Large uploads stream over SFTP; small ones ride the JSON-RPC path.
    let (written, binary) = if size > 10 * 1024 * 1024 {
        let streamed = match state.pool.sftp(&uuid).await {
            Ok(sftp) => {
                let result = sftp.upload(&dest_path, &content).await.map(|_| json!({}));
                let _closed = sftp.close().await;
                result
            }
            Err(error) => Err(error),
        };

        (streamed, true)
    } else {
        let (payload, binary) = match String::from_utf8(content) {
            Ok(text) => (text, false),
            Err(raw) => (
                base64::engine::general_purpose::STANDARD.encode(raw.as_bytes()),
                true,
            ),
        };

        let written = match state.pool.get(&uuid).await {
            Ok(conn) => conn.write_file(&dest_path, &payload, binary).await,
            Err(error) => Err(error),
        };

        (written, binary)
    };

    match written {
        Ok(_) => {
            let filename = dest_path.rsplit('/').next().unwrap_or(&dest_path).to_string();

            state
                .events
                .record(
                    EventKind::FileAccessed,
                    &uuid,
                    &display_name,
                    format!("Uploaded: {filename}"),
                    json!({"path": dest_path, "operation": "upload", "size": size}),
                )
                .await;

            reply::with_status(
                reply::json(&json!({"path": dest_path, "size": size, "binary": binary})),
                StatusCode::OK,
            )
        }
        Err(error) => pool_error_reply(&error),
    }
}

#[derive(Deserialize)]
struct EventParams {
    limit: Option<usize>,
}

async fn events_handler(params: EventParams, state: AppState) -> reply::Json {
    let events = state
        .events
        .store()
        .recent(params.limit.unwrap_or(DEFAULT_EVENT_LIMIT))
        .await;

    reply::json(&json!({"events": events}))
}

/// Push channel: initial fleet snapshot, then typed events as they happen.
/// Application-level `ping` text is answered with `pong`.
async fn ws_handler(socket: warp::ws::WebSocket, state: AppState) {
    let (mut sink, mut source) = socket.split();

    let snapshot = json!({
        "type": "initial_state",
        "data": {
            "clients": state.registry.list_clients().await,
            "online_count": state.registry.online_count().await,
            "total_count": state.registry.total_count().await,
        },
    });

    if sink.send(warp::ws::Message::text(snapshot.to_string())).await.is_err() {
        return;
    }

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<String>();
    let id = state.events.broadcast().subscribe(tx.clone()).await;
    debug!(subscriber = id, "websocket connected");

    let forward = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if sink.send(warp::ws::Message::text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(message) = source.next().await {
        match message {
            Ok(message) if message.is_text() => {
                if message.to_str() == Ok("ping") {
                    let _pong = tx.send("pong".to_string());
                }
            }
            Ok(message) if message.is_close() => break,
            Ok(_) => {}
            Err(error) => {
                debug!(%error, "websocket receive error");
                break;
            }
        }
    }

    state.events.broadcast().unsubscribe(id).await;
    forward.abort();
    debug!(subscriber = id, "websocket disconnected");
}

async fn read_part(mut part: warp::multipart::Part) -> Result<Vec<u8>, warp::Error> {
    let mut data = Vec::new();

    while let Some(chunk) = part.data().await {
        let mut chunk = chunk?;
        while chunk.has_remaining() {
            let bytes = chunk.chunk();
            data.extend_from_slice(bytes);
            let advanced = bytes.len();
            chunk.advance(advanced);
        }
    }

    Ok(data)
}

fn truncate(text: &str, limit: usize) -> &str {
    match text.char_indices().nth(limit) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// MIME by extension for previews; everything unknown is an octet stream.
fn guess_mime(path: &str) -> &'static str {
    let ext = path.rsplit('.').next().unwrap_or_default().to_lowercase();

    match ext.as_str() {
        "txt" | "log" => "text/plain",
        "md" => "text/markdown",
        "py" => "text/x-python",
        "js" => "text/javascript",
        "ts" => "text/typescript",
        "json" => "application/json",
        "yaml" | "yml" => "text/yaml",
        "xml" => "text/xml",
        "html" => "text/html",
        "css" => "text/css",
        "sh" => "text/x-shellscript",
        "csv" => "text/csv",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::{
        health::HealthConfig,
        protocol::{ClientIdentity, ClientInfo, CreatedBy, Registration},
    };

    fn registration(uuid: &str, port: u16) -> Registration {
        let mut info = ClientInfo::local("client-1", uuid);
        info.tunnel_port = port;

        Registration {
            identity: ClientIdentity {
                uuid: uuid.to_string(),
                display_name: "alpha".to_string(),
                purpose: String::new(),
                tags: vec![],
                capabilities: vec![],
                public_key_fingerprint: "SHA256:AAA".to_string(),
                first_seen: Utc::now(),
                created_by: CreatedBy::Auto,
                key_mismatch: false,
                previous_fingerprint: None,
            },
            client_info: info,
        }
    }

    fn state_with_key(api_key: Option<&str>) -> AppState {
        let events = Events::default();
        let registry = Arc::new(Registry::new(events.clone()));
        let pool = Arc::new(Pool::new(registry.clone()));
        let health = Arc::new(HealthMonitor::new(
            registry.clone(),
            pool.clone(),
            HealthConfig::default(),
        ));

        AppState {
            registry,
            pool,
            health,
            history: HistoryStore::open_in_memory().unwrap(),
            events,
            api_key: api_key.map(String::from),
            started_at: Instant::now(),
        }
    }

    async fn register(state: &AppState, uuid: &str, port: u16) {
        state
            .registry
            .register(registration(uuid, port), &state.pool, &state.health)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn health_is_public() {
        let routes = routes(state_with_key(Some("secret")));

        let response = warp::test::request().path("/health").reply(&routes).await;

        assert_eq!(response.status(), StatusCode::OK);
        let body: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(body["service"], "reach");
    }

    #[tokio::test]
    async fn api_requires_bearer() {
        let routes = routes(state_with_key(Some("secret")));

        let denied = warp::test::request()
            .path("/api/v1/clients")
            .reply(&routes)
            .await;
        assert_eq!(denied.status(), StatusCode::UNAUTHORIZED);

        let wrong = warp::test::request()
            .path("/api/v1/clients")
            .header("authorization", "Bearer nope")
            .reply(&routes)
            .await;
        assert_eq!(wrong.status(), StatusCode::UNAUTHORIZED);

        let allowed = warp::test::request()
            .path("/api/v1/clients")
            .header("authorization", "Bearer secret")
            .reply(&routes)
            .await;
        assert_eq!(allowed.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn token_query_param_is_accepted() {
        let routes = routes(state_with_key(Some("secret")));

        let response = warp::test::request()
            .path("/api/v1/events?token=secret")
            .reply(&routes)
            .await;

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn no_key_means_unauthenticated() {
        let routes = routes(state_with_key(None));

        let response = warp::test::request()
            .path("/api/v1/clients")
            .reply(&routes)
            .await;

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn clients_include_tunnel_port_and_online() {
        let state = state_with_key(None);
        register(&state, "U1", 40001).await;

        let routes = routes(state);
        let response = warp::test::request()
            .path("/api/v1/clients")
            .reply(&routes)
            .await;

        let body: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
        let client = &body["clients"][0];
        assert_eq!(client["uuid"], "U1");
        assert_eq!(client["online"], true);
        assert_eq!(client["tunnel_port"], 40001);
    }

    #[tokio::test]
    async fn unknown_client_is_404_offline_is_503() {
        let state = state_with_key(None);
        register(&state, "U1", 40001).await;
        state.registry.remove_connection("U1").await;

        let routes = routes(state);

        let missing = warp::test::request()
            .method("POST")
            .path("/api/v1/clients/nope/history")
            .json(&json!({"command": "ls"}))
            .reply(&routes)
            .await;
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        let offline = warp::test::request()
            .method("POST")
            .path("/api/v1/clients/U1/history")
            .json(&json!({"command": "ls"}))
            .reply(&routes)
            .await;
        assert_eq!(offline.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn run_records_history_even_on_transport_failure() {
        let state = state_with_key(None);
        // Port 1 on loopback refuses connections.
        register(&state, "U1", 1).await;

        let routes = routes(state.clone());
        let response = warp::test::request()
            .method("POST")
            .path("/api/v1/clients/U1/history")
            .json(&json!({"command": "echo hi"}))
            .reply(&routes)
            .await;

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let (records, total) = state
            .history
            .list_for_client("U1", HistoryQuery::default())
            .await
            .unwrap();
        assert_eq!(total, 1);
        assert_eq!(records[0].returncode, -1);
        assert_eq!(records[0].stdout, "");
        assert!(!records[0].stderr.is_empty());
    }

    #[tokio::test]
    async fn history_query_params_map_to_filters() {
        let state = state_with_key(None);
        let now = Utc::now();

        for (code, command) in [(0, "good"), (1, "bad")] {
            state
                .history
                .add(CommandRecord::finished(
                    "U1",
                    command,
                    None,
                    "",
                    "",
                    code,
                    now - Duration::seconds(1),
                    now,
                    "test",
                ))
                .await
                .unwrap();
        }

        let routes = routes(state);

        let response = warp::test::request()
            .path("/api/v1/clients/U1/history?status=failed&limit=10")
            .reply(&routes)
            .await;

        let body: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(body["total"], 1);
        assert_eq!(body["commands"][0]["command"], "bad");
        assert_eq!(body["limit"], 10);
    }

    #[tokio::test]
    async fn history_delete_purges_one_client() {
        let state = state_with_key(None);
        let now = Utc::now();

        for (uuid, command) in [("U1", "one"), ("U1", "two"), ("U2", "kept")] {
            state
                .history
                .add(CommandRecord::finished(
                    uuid,
                    command,
                    None,
                    "",
                    "",
                    0,
                    now - Duration::seconds(1),
                    now,
                    "test",
                ))
                .await
                .unwrap();
        }

        let routes = routes(state.clone());

        let response = warp::test::request()
            .method("DELETE")
            .path("/api/v1/clients/U1/history")
            .reply(&routes)
            .await;

        assert_eq!(response.status(), StatusCode::OK);
        let body: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(body["deleted"], 2);

        let (_, remaining) = state
            .history
            .list_for_client("U2", HistoryQuery::default())
            .await
            .unwrap();
        assert_eq!(remaining, 1);
    }

    #[tokio::test]
    async fn command_detail_404s_when_missing() {
        let routes = routes(state_with_key(None));

        let response = warp::test::request()
            .path("/api/v1/clients/U1/history/no-such-id")
            .reply(&routes)
            .await;

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn events_endpoint_returns_recent() {
        let state = state_with_key(None);
        register(&state, "U1", 40001).await;

        let routes = routes(state);
        let response = warp::test::request()
            .path("/api/v1/events")
            .reply(&routes)
            .await;

        let body: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(body["events"][0]["type"], "client.connected");
    }

    #[test]
    fn mime_guess_table() {
        assert_eq!(guess_mime("/var/log/syslog.log"), "text/plain");
        assert_eq!(guess_mime("notes.md"), "text/markdown");
        assert_eq!(guess_mime("conf.yaml"), "text/yaml");
        assert_eq!(guess_mime("data.bin"), "application/octet-stream");
        assert_eq!(guess_mime("noextension"), "application/octet-stream");
    }
}

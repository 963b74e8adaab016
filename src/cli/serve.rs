use std::{
    net::SocketAddr,
    path::PathBuf,
    sync::Arc,
    time::{Duration, Instant},
};

use cata::{Command, Container};
use clap::Parser;
use eyre::{Result, WrapErr};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    config,
    events::Events,
    health::{HealthConfig, HealthMonitor},
    history::HistoryStore,
    pool::Pool,
    registry::Registry,
    ssh::{self, ServerStateBuilder, TunnelServer},
    web::{self, AppState},
};

/// Run the control-plane server: SSH listener for agents, HTTP/WebSocket
/// surface for operators.
#[derive(Parser, Container)]
pub struct Serve {
    /// HTTP bind host
    #[arg(long, default_value = "127.0.0.1")]
    http_host: String,

    /// HTTP bind port
    #[arg(long, default_value_t = 8765)]
    http_port: u16,

    /// SSH listener bind host
    #[arg(long, default_value = "0.0.0.0")]
    ssh_host: String,

    /// SSH listener bind port
    #[arg(long, default_value_t = 2222)]
    ssh_port: u16,

    /// Server host key path; generated on first start when absent
    #[arg(long)]
    host_key: Option<PathBuf>,

    /// authorized_keys file holding the agents' public keys
    #[arg(long)]
    authorized_keys: PathBuf,

    /// Bearer token for the API; falls back to REACH_API_KEY
    /// (legacy: ETPHONEHOME_API_KEY)
    #[arg(long)]
    api_key: Option<String>,

    /// State directory; falls back to REACH_DATA_DIR, then ~/.reach
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Heartbeat probe interval
    #[arg(long, value_parser = humantime::parse_duration, default_value = "30s")]
    heartbeat_interval: Duration,

    /// Consecutive heartbeat failures before a client goes offline
    #[arg(long, default_value_t = 3)]
    failure_threshold: u32,

    /// Window after registration during which failures are ignored
    #[arg(long, value_parser = humantime::parse_duration, default_value = "60s")]
    grace_period: Duration,

    /// Days of command history to keep
    #[arg(long, default_value_t = 30)]
    retention_days: i64,
}

#[async_trait::async_trait]
impl Command for Serve {
    async fn run(&self) -> Result<()> {
        let data_dir = self.data_dir.clone().unwrap_or_else(config::data_dir);
        let api_key = self.api_key.clone().or_else(config::api_key);

        let history = HistoryStore::open(data_dir.join("history.db"))
            .wrap_err("failed to open command history store")?;

        let events = Events::default();
        let registry = Arc::new(Registry::new(events.clone()));
        let pool = Arc::new(Pool::new(registry.clone()));
        let health = Arc::new(HealthMonitor::new(
            registry.clone(),
            pool.clone(),
            HealthConfig {
                interval: self.heartbeat_interval,
                failure_threshold: self.failure_threshold,
                grace_period: self.grace_period,
                ..Default::default()
            },
        ));

        let state = AppState {
            registry: registry.clone(),
            pool: pool.clone(),
            health: health.clone(),
            history: history.clone(),
            events,
            api_key,
            started_at: Instant::now(),
        };

        let host_key_path = self
            .host_key
            .clone()
            .unwrap_or_else(|| data_dir.join("host_key"));
        let host_key = ssh::load_or_create_host_key(&host_key_path)?;
        let authorized_keys = ssh::load_authorized_keys(&self.authorized_keys)?;
        info!(count = authorized_keys.len(), "loaded agent keys");

        let shutdown = CancellationToken::new();

        let probe_loop = {
            let health = health.clone();
            let token = shutdown.clone();
            tokio::spawn(async move { health.run(token).await })
        };

        let retention_loop = {
            let history = history.clone();
            let token = shutdown.clone();
            let days = self.retention_days;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_secs(24 * 60 * 60));

                loop {
                    tokio::select! {
                        () = token.cancelled() => return,
                        _ = ticker.tick() => {}
                    }

                    if let Err(error) = history.delete_old(days).await {
                        warn!(%error, "history retention purge failed");
                    }
                }
            })
        };

        let mut tunnel_server = TunnelServer::new(
            ServerStateBuilder::default()
                .authorized_keys(authorized_keys)
                .register_url(format!(
                    "http://{}:{}/internal/register",
                    self.http_host, self.http_port
                ))
                .registry(registry)
                .pool(pool)
                .build()?,
        );

        let ssh_addr = (self.ssh_host.clone(), self.ssh_port);
        let http_addr: SocketAddr = format!("{}:{}", self.http_host, self.http_port)
            .parse()
            .wrap_err("invalid http bind address")?;

        // Either listener failing is fatal; the other side is useless alone.
        let result = tokio::select! {
            result = web::serve(state, http_addr, shutdown.clone()) => result,
            result = tunnel_server.run(host_key, ssh_addr) => result,
        };

        shutdown.cancel();
        let _stopped = tokio::join!(probe_loop, retention_loop);

        result
    }
}

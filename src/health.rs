//! Heartbeat probing and online/offline transitions.
//!
//! One probe loop owns all per-uuid state. Registration resets a client's
//! state (fresh grace window, cached probe connection dropped) before the new
//! connection is published, so a probe can never run against a dead tunnel
//! that the registry still advertises.

use std::{collections::HashMap, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{pool::Pool, pool::RpcClient, registry::Registry};

#[derive(Clone, Copy, Debug)]
pub struct HealthConfig {
    pub interval: Duration,
    pub failure_threshold: u32,
    pub grace_period: Duration,
    pub probe_timeout: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            failure_threshold: 3,
            grace_period: Duration::from_secs(60),
            probe_timeout: Duration::from_secs(10),
        }
    }
}

struct HealthState {
    grace_deadline: DateTime<Utc>,
    consecutive_failures: u32,
    conn: Option<Arc<RpcClient>>,
}

enum Verdict {
    Alive,
    InGrace,
    Failing(u32),
    Offline,
}

impl HealthState {
    fn fresh(grace: Duration) -> Self {
        Self {
            grace_deadline: Utc::now() + grace,
            consecutive_failures: 0,
            conn: None,
        }
    }

    fn note(&mut self, success: bool, now: DateTime<Utc>, threshold: u32) -> Verdict {
        if success {
            self.consecutive_failures = 0;
            return Verdict::Alive;
        }

        self.conn = None;

        if now < self.grace_deadline {
            return Verdict::InGrace;
        }

        self.consecutive_failures += 1;
        if self.consecutive_failures >= threshold {
            Verdict::Offline
        } else {
            Verdict::Failing(self.consecutive_failures)
        }
    }
}

pub struct HealthMonitor {
    registry: Arc<Registry>,
    pool: Arc<Pool>,
    config: HealthConfig,
    state: Mutex<HashMap<String, HealthState>>,
}

impl HealthMonitor {
    #[must_use]
    pub fn new(registry: Arc<Registry>, pool: Arc<Pool>, config: HealthConfig) -> Self {
        Self {
            registry,
            pool,
            config,
            state: Mutex::new(HashMap::new()),
        }
    }

    /// Zero the failure count, re-arm the grace window and drop any cached
    /// probe connection. Must run before the registry publishes the client's
    /// new connection.
    pub async fn reset_health(&self, uuid: &str, client_id: Option<&str>) {
        debug!(uuid, client_id, "health reset");

        self.state
            .lock()
            .await
            .insert(uuid.to_string(), HealthState::fresh(self.config.grace_period));
    }

    /// Probe loop. Cancels within one interval of `shutdown` firing.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = shutdown.cancelled() => {
                    info!("health monitor stopping");
                    return;
                }
                _ = ticker.tick() => {}
            }

            tokio::select! {
                () = shutdown.cancelled() => {
                    info!("health monitor stopping");
                    return;
                }
                () = self.probe_all() => {}
            }
        }
    }

    async fn probe_all(&self) {
        for (uuid, tunnel_port) in self.registry.online_ports().await {
            let success = self.probe(&uuid, tunnel_port).await;
            self.record(&uuid, success).await;
        }
    }

    /// One heartbeat against one client, reusing the monitor's own cached
    /// connection when it has one.
    async fn probe(&self, uuid: &str, tunnel_port: u16) -> bool {
        let cached = self.state.lock().await.get(uuid).and_then(|s| s.conn.clone());

        let conn = match cached {
            Some(conn) => conn,
            None => match RpcClient::connect(tunnel_port).await {
                Ok(conn) => {
                    let conn = Arc::new(conn);
                    if let Some(state) = self.state.lock().await.get_mut(uuid) {
                        state.conn = Some(conn.clone());
                    }
                    conn
                }
                Err(error) => {
                    debug!(uuid, %error, "heartbeat connect failed");
                    return false;
                }
            },
        };

        match conn.heartbeat(self.config.probe_timeout).await {
            Ok(()) => true,
            Err(error) => {
                debug!(uuid, %error, "heartbeat failed");
                false
            }
        }
    }

    async fn record(&self, uuid: &str, success: bool) {
        let verdict = {
            let mut state = self.state.lock().await;
            let entry = state
                .entry(uuid.to_string())
                .or_insert_with(|| HealthState::fresh(self.config.grace_period));

            entry.note(success, Utc::now(), self.config.failure_threshold)
        };

        match verdict {
            Verdict::Alive => self.registry.touch_heartbeat(uuid).await,
            Verdict::InGrace => debug!(uuid, "heartbeat failure ignored during grace"),
            Verdict::Failing(count) => {
                warn!(uuid, failures = count, "heartbeat failing");
            }
            Verdict::Offline => {
                warn!(uuid, "failure threshold crossed, marking offline");

                self.state.lock().await.remove(uuid);
                self.pool.evict(uuid).await;
                self.registry.remove_connection(uuid).await;
            }
        }
    }
}

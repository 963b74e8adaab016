//! Who is in the fleet and where they are right now.
//!
//! Identities are durable (uuid + fingerprint + descriptive metadata);
//! connections are the current session's facts (tunnel port, host info).
//! The two are deliberately split: hostnames, addresses and even operating
//! systems change under an agent, the uuid does not.

use std::collections::{hash_map::Entry, HashMap};

use eyre::{eyre, Result};
use itertools::Itertools;
use serde::Serialize;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::{
    events::{EventKind, Events},
    health::HealthMonitor,
    pool::Pool,
    protocol::{ClientIdentity, ClientInfo, Registration},
};

#[derive(Default)]
struct State {
    identities: HashMap<String, ClientIdentity>,
    // Invariant: at most one connection per identity uuid. Enforced by
    // keying on the uuid and replacing wholesale in `register`.
    connections: HashMap<String, ClientInfo>,
}

/// Merged identity + current-session view handed to operators.
#[derive(Clone, Debug, Serialize)]
pub struct ClientView {
    #[serde(flatten)]
    pub identity: ClientIdentity,
    pub online: bool,
    #[serde(flatten)]
    pub connection: Option<ClientInfo>,
}

pub struct Registry {
    state: Mutex<State>,
    events: Events,
}

impl Registry {
    #[must_use]
    pub fn new(events: Events) -> Self {
        Self {
            state: Mutex::new(State::default()),
            events,
        }
    }

    /// Install a registration: reconcile the identity, then swap in the new
    /// connection. Any prior session for the same uuid has its pooled
    /// connection and health state cleared *before* the new connection
    /// becomes visible to readers; both locks are taken in a fixed order
    /// (registry, then pool) so a concurrent operator request either sees
    /// the old tunnel with its old connection or the new tunnel with none.
    pub async fn register(
        &self,
        registration: Registration,
        pool: &Pool,
        health: &HealthMonitor,
    ) -> Result<(String, String)> {
        let Registration {
            identity: offered,
            client_info,
        } = registration;

        let uuid = offered.uuid.clone();
        if uuid.is_empty() {
            return Err(eyre!("registration carries no identity uuid"));
        }

        let mut state = self.state.lock().await;

        match state.identities.entry(uuid.clone()) {
            Entry::Occupied(mut entry) => {
                let existing = entry.get_mut();

                if existing.public_key_fingerprint != offered.public_key_fingerprint {
                    warn!(
                        uuid,
                        stored = existing.public_key_fingerprint,
                        offered = offered.public_key_fingerprint,
                        "public key mismatch on reconnect; keeping stored fingerprint"
                    );

                    existing.key_mismatch = true;
                    existing.previous_fingerprint = Some(offered.public_key_fingerprint);
                }

                existing.display_name = offered.display_name;
                existing.purpose = offered.purpose;
                existing.tags = offered.tags;
                existing.capabilities = offered.capabilities;
            }
            Entry::Vacant(entry) => {
                info!(uuid, name = offered.display_name, "new identity");
                entry.insert(offered);
            }
        }

        let prior = state.connections.get(&uuid).cloned();
        if let Some(prior) = &prior {
            pool.clear_stale(&prior.client_id).await;
        }
        health
            .reset_health(&uuid, prior.as_ref().map(|p| p.client_id.as_str()))
            .await;

        let mut info = client_info;
        info.identity_uuid = Some(uuid.clone());
        let tunnel_port = info.tunnel_port;
        state.connections.insert(uuid.clone(), info);

        let display_name = state
            .identities
            .get(&uuid)
            .map(|identity| identity.display_name.clone())
            .unwrap_or_default();

        drop(state);

        info!(uuid, name = display_name, tunnel_port, "client registered");

        self.events
            .record(
                EventKind::ClientConnected,
                &uuid,
                &display_name,
                "Connected",
                json!({"tunnel_port": tunnel_port}),
            )
            .await;

        Ok((uuid, display_name))
    }

    /// Drop the connection for `uuid` if one exists (agent disconnect or
    /// failure threshold crossed). The identity stays; only the session goes.
    pub async fn remove_connection(&self, uuid: &str) {
        let removed = {
            let mut state = self.state.lock().await;
            let removed = state.connections.remove(uuid);
            removed.map(|conn| {
                let name = state
                    .identities
                    .get(uuid)
                    .map(|identity| identity.display_name.clone())
                    .unwrap_or_default();
                (conn, name)
            })
        };

        if let Some((conn, name)) = removed {
            info!(uuid, tunnel_port = conn.tunnel_port, "client disconnected");

            self.events
                .record(
                    EventKind::ClientDisconnected,
                    uuid,
                    name,
                    "Disconnected",
                    json!({"tunnel_port": conn.tunnel_port}),
                )
                .await;
        }
    }

    pub async fn describe_client(&self, uuid: &str) -> Option<ClientView> {
        let state = self.state.lock().await;
        let identity = state.identities.get(uuid)?.clone();
        let connection = state.connections.get(uuid).cloned();

        Some(ClientView {
            identity,
            online: connection.is_some(),
            connection,
        })
    }

    pub async fn list_clients(&self) -> Vec<ClientView> {
        let state = self.state.lock().await;

        state
            .identities
            .values()
            .map(|identity| {
                let connection = state.connections.get(&identity.uuid).cloned();
                ClientView {
                    identity: identity.clone(),
                    online: connection.is_some(),
                    connection,
                }
            })
            .sorted_by(|a, b| a.identity.display_name.cmp(&b.identity.display_name))
            .collect()
    }

    pub async fn online_count(&self) -> usize {
        self.state.lock().await.connections.len()
    }

    pub async fn total_count(&self) -> usize {
        self.state.lock().await.identities.len()
    }

    /// `(client_id, tunnel_port)` for the pool, or `None` when offline.
    pub async fn connection_facts(&self, uuid: &str) -> Option<(String, u16)> {
        self.state
            .lock()
            .await
            .connections
            .get(uuid)
            .map(|conn| (conn.client_id.clone(), conn.tunnel_port))
    }

    pub async fn online_ports(&self) -> Vec<(String, u16)> {
        self.state
            .lock()
            .await
            .connections
            .iter()
            .map(|(uuid, conn)| (uuid.clone(), conn.tunnel_port))
            .collect()
    }

    pub async fn touch_heartbeat(&self, uuid: &str) {
        if let Some(conn) = self.state.lock().await.connections.get_mut(uuid) {
            conn.last_heartbeat = chrono::Utc::now();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Utc;

    use super::*;
    use crate::{health::HealthConfig, pool::RpcClient, protocol::CreatedBy};

    fn registration(uuid: &str, fingerprint: &str, client_id: &str, port: u16) -> Registration {
        let mut info = ClientInfo::local(client_id, uuid);
        info.tunnel_port = port;

        Registration {
            identity: ClientIdentity {
                uuid: uuid.to_string(),
                display_name: "alpha".to_string(),
                purpose: "testing".to_string(),
                tags: vec![],
                capabilities: vec![],
                public_key_fingerprint: fingerprint.to_string(),
                first_seen: Utc::now(),
                created_by: CreatedBy::Auto,
                key_mismatch: false,
                previous_fingerprint: None,
            },
            client_info: info,
        }
    }

    fn fixture() -> (Arc<Registry>, Arc<Pool>, HealthMonitor, Events) {
        let events = Events::default();
        let registry = Arc::new(Registry::new(events.clone()));
        let pool = Arc::new(Pool::new(registry.clone()));
        let health = HealthMonitor::new(registry.clone(), pool.clone(), HealthConfig::default());

        (registry, pool, health, events)
    }

    #[tokio::test]
    async fn register_creates_identity_and_connection() {
        let (registry, pool, health, _events) = fixture();

        let (uuid, name) = registry
            .register(registration("U1", "SHA256:AAA", "c1", 40001), &pool, &health)
            .await
            .unwrap();

        assert_eq!(uuid, "U1");
        assert_eq!(name, "alpha");

        let view = registry.describe_client("U1").await.unwrap();
        assert!(view.online);
        assert_eq!(view.connection.as_ref().unwrap().tunnel_port, 40001);
        assert_eq!(registry.online_count().await, 1);
        assert_eq!(registry.total_count().await, 1);
    }

    #[tokio::test]
    async fn reconnect_replaces_the_single_connection() {
        let (registry, pool, health, _events) = fixture();

        registry
            .register(registration("U1", "SHA256:AAA", "c1", 40001), &pool, &health)
            .await
            .unwrap();
        registry
            .register(registration("U1", "SHA256:AAA", "c2", 40777), &pool, &health)
            .await
            .unwrap();

        assert_eq!(registry.online_count().await, 1);
        assert_eq!(registry.total_count().await, 1);

        let view = registry.describe_client("U1").await.unwrap();
        assert_eq!(view.connection.as_ref().unwrap().tunnel_port, 40777);
        assert_eq!(view.connection.as_ref().unwrap().client_id, "c2");
    }

    #[tokio::test]
    async fn key_mismatch_preserves_uuid_and_stored_fingerprint() {
        let (registry, pool, health, _events) = fixture();

        registry
            .register(registration("U1", "SHA256:AAA", "c1", 40001), &pool, &health)
            .await
            .unwrap();
        registry
            .register(registration("U1", "SHA256:BBB", "c2", 40002), &pool, &health)
            .await
            .unwrap();

        let view = registry.describe_client("U1").await.unwrap();

        assert_eq!(view.identity.uuid, "U1");
        assert_eq!(view.identity.public_key_fingerprint, "SHA256:AAA");
        assert!(view.identity.key_mismatch);
        assert_eq!(
            view.identity.previous_fingerprint.as_deref(),
            Some("SHA256:BBB")
        );
        assert_eq!(registry.total_count().await, 1);
    }

    #[tokio::test]
    async fn reconnect_evicts_pooled_connection_before_publishing() {
        let (registry, pool, health, _events) = fixture();

        registry
            .register(registration("U1", "SHA256:AAA", "c1", 40001), &pool, &health)
            .await
            .unwrap();

        // Simulate an operator having a pooled connection to the old tunnel.
        let (near, _far) = tokio::io::duplex(64);
        pool.insert_for_test("U1", "c1", 40001, RpcClient::from_stream(near))
            .await;
        assert_eq!(pool.cached_port("U1").await, Some(40001));

        registry
            .register(registration("U1", "SHA256:AAA", "c2", 40777), &pool, &health)
            .await
            .unwrap();

        // The stale entry keyed by the superseded client id is gone and the
        // registry already shows the new port.
        assert_eq!(pool.cached_port("U1").await, None);
        let view = registry.describe_client("U1").await.unwrap();
        assert_eq!(view.connection.as_ref().unwrap().tunnel_port, 40777);
    }

    #[tokio::test]
    async fn remove_connection_marks_offline_and_records_event() {
        let (registry, pool, health, events) = fixture();

        registry
            .register(registration("U1", "SHA256:AAA", "c1", 40001), &pool, &health)
            .await
            .unwrap();
        registry.remove_connection("U1").await;

        let view = registry.describe_client("U1").await.unwrap();
        assert!(!view.online);
        assert!(view.connection.is_none());
        assert_eq!(registry.online_count().await, 0);

        let recent = events.store().recent(10).await;
        assert_eq!(recent[0].kind, EventKind::ClientDisconnected);
        assert_eq!(recent[1].kind, EventKind::ClientConnected);
    }

    #[tokio::test]
    async fn describe_unknown_client_is_none() {
        let (registry, _pool, _health, _events) = fixture();

        assert!(registry.describe_client("nope").await.is_none());
    }
}

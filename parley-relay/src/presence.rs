//! Presence registry.
//!
//! Tracks which end-user devices have at least one live connection. Three
//! kinds of keys live in the KV store:
//!
//! - `presence:conn:{connectionId}`: JSON [`SessionInfo`], with TTL
//! - `presence:device:{appId}:{deviceId}`: set of live connection ids
//! - `presence:app:{appId}`: set of live connection ids for the app
//!
//! The device set is the single source of truth for online/offline. A
//! device goes ONLINE only when an add actually inserted a member and left
//! the set with exactly one; it goes OFFLINE only when a remove actually
//! deleted a member and left the set empty. Concurrent connects and
//! disconnects therefore produce exactly one broadcast per boundary.

use crate::error::KvResult;
use crate::kv::KeyValueStore;
use parley_types::{AppId, ConnectionId, DeviceId, SessionInfo};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Boundary transition caused by a presence update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceChange {
    /// The device went from zero to one live connection.
    Online,
    /// The device went from one to zero live connections.
    Offline,
    /// No boundary was crossed.
    Unchanged,
}

/// Multi-connection presence aggregator over a [`KeyValueStore`].
#[derive(Clone)]
pub struct PresenceRegistry {
    kv: Arc<dyn KeyValueStore>,
    ttl: Duration,
}

impl std::fmt::Debug for PresenceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PresenceRegistry")
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

fn connection_key(connection: &ConnectionId) -> String {
    format!("presence:conn:{connection}")
}

fn device_key(app: &AppId, device: &DeviceId) -> String {
    format!("presence:device:{app}:{device}")
}

fn app_key(app: &AppId) -> String {
    format!("presence:app:{app}")
}

impl PresenceRegistry {
    /// Create a registry whose records live for `ttl` unless refreshed.
    pub fn new(kv: Arc<dyn KeyValueStore>, ttl: Duration) -> Self {
        Self { kv, ttl }
    }

    /// Record a live connection.
    pub async fn set_presence(&self, session: &SessionInfo) -> KvResult<PresenceChange> {
        let record = serde_json::to_string(session)
            .map_err(|e| crate::error::KvError::Unavailable(e.to_string()))?;
        let member = session.connection_id.to_string();
        let ttl = Some(self.ttl);

        self.kv
            .set(&connection_key(&session.connection_id), record, ttl)
            .await?;
        self.kv
            .set_add(&app_key(&session.app_id), &member, ttl)
            .await?;
        let change = self
            .kv
            .set_add(&device_key(&session.app_id, &session.device_id), &member, ttl)
            .await?;

        if change.changed && change.cardinality == 1 {
            debug!(app = %session.app_id, device = %session.device_id, "device online");
            return Ok(PresenceChange::Online);
        }
        if change.cardinality > 1 {
            // Members left behind by connections that died without cleanup.
            // This connection is live, so pruning never empties the set.
            self.prune(&device_key(&session.app_id, &session.device_id))
                .await?;
        }
        Ok(PresenceChange::Unchanged)
    }

    /// Re-arm the TTLs of a live connection (called on every heartbeat).
    ///
    /// If the records had already expired the connection is re-added, which
    /// counts as an online transition when the device set was empty.
    pub async fn refresh_presence(&self, session: &SessionInfo) -> KvResult<PresenceChange> {
        self.set_presence(session).await
    }

    /// Forget a connection.
    pub async fn remove_presence(
        &self,
        app: &AppId,
        device: &DeviceId,
        connection: &ConnectionId,
    ) -> KvResult<PresenceChange> {
        let member = connection.to_string();
        self.kv.delete(&connection_key(connection)).await?;
        self.kv.set_remove(&app_key(app), &member).await?;
        let key = device_key(app, device);
        let change = self.kv.set_remove(&key, &member).await?;

        let emptied = if change.cardinality == 0 {
            change.changed
        } else {
            // Expired members must not keep the device online.
            self.prune(&key).await?.emptied
        };
        if emptied {
            debug!(app = %app, device = %device, "device offline");
            Ok(PresenceChange::Offline)
        } else {
            Ok(PresenceChange::Unchanged)
        }
    }

    /// Whether the device has a live connection.
    ///
    /// Members whose per-connection record expired are ignored, so a
    /// crashed process never leaves a device online forever. They stay in
    /// the set until the next presence update removes them, which is where
    /// the OFFLINE boundary gets reported.
    pub async fn is_online(&self, app: &AppId, device: &DeviceId) -> KvResult<bool> {
        let live = self.read(&device_key(app, device)).await?;
        Ok(!live.sessions.is_empty())
    }

    /// Live connections of the device.
    pub async fn device_connections(
        &self,
        app: &AppId,
        device: &DeviceId,
    ) -> KvResult<Vec<ConnectionId>> {
        let live = self.read(&device_key(app, device)).await?;
        Ok(live.sessions.into_iter().map(|s| s.connection_id).collect())
    }

    /// Every live end-user session of an app, read in one batch.
    pub async fn list_sessions(&self, app: &AppId) -> KvResult<Vec<SessionInfo>> {
        // The app set carries no boundary, so stale members go right away.
        let mut sessions = self.prune(&app_key(app)).await?.sessions;
        sessions.sort_by_key(|s| s.connected_at);
        Ok(sessions)
    }

    /// Remove stale members of `set_key`.
    ///
    /// `emptied` is set only when one of these removals took the set to
    /// zero, so concurrent callers report the boundary once between them.
    async fn prune(&self, set_key: &str) -> KvResult<LiveMembers> {
        let mut live = self.read(set_key).await?;
        for member in std::mem::take(&mut live.stale) {
            let change = self.kv.set_remove(set_key, &member).await?;
            if change.changed && change.cardinality == 0 {
                live.emptied = true;
            }
        }
        Ok(live)
    }

    /// Split the members of `set_key` into live sessions and stale ids.
    async fn read(&self, set_key: &str) -> KvResult<LiveMembers> {
        let members = self.kv.members(set_key).await?;
        let mut live = LiveMembers::default();
        if members.is_empty() {
            return Ok(live);
        }
        let keys: Vec<String> = members.iter().map(|m| format!("presence:conn:{m}")).collect();
        let records = self.kv.get_many(&keys).await?;

        for (member, record) in members.into_iter().zip(records) {
            match record.map(|r| serde_json::from_str::<SessionInfo>(&r)) {
                Some(Ok(session)) => live.sessions.push(session),
                Some(Err(e)) => {
                    warn!(member = %member, error = %e, "unreadable presence record");
                    live.stale.push(member);
                }
                None => live.stale.push(member),
            }
        }
        Ok(live)
    }
}

#[derive(Debug, Default)]
struct LiveMembers {
    sessions: Vec<SessionInfo>,
    stale: Vec<String>,
    emptied: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryStore;

    fn registry() -> PresenceRegistry {
        PresenceRegistry::new(Arc::new(MemoryStore::new()), Duration::from_secs(90))
    }

    fn session(device: &str) -> SessionInfo {
        SessionInfo {
            connection_id: ConnectionId::new(),
            device_id: device.into(),
            app_id: "acme".into(),
            connected_at: 0,
        }
    }

    #[tokio::test]
    async fn two_connections_one_device() {
        let presence = registry();
        let phone = session("d1");
        let tablet = session("d1");
        let app = phone.app_id.clone();
        let device = phone.device_id.clone();

        assert_eq!(presence.set_presence(&phone).await.unwrap(), PresenceChange::Online);
        assert_eq!(
            presence.set_presence(&tablet).await.unwrap(),
            PresenceChange::Unchanged
        );
        assert!(presence.is_online(&app, &device).await.unwrap());

        assert_eq!(
            presence
                .remove_presence(&app, &device, &phone.connection_id)
                .await
                .unwrap(),
            PresenceChange::Unchanged
        );
        assert!(presence.is_online(&app, &device).await.unwrap());

        assert_eq!(
            presence
                .remove_presence(&app, &device, &tablet.connection_id)
                .await
                .unwrap(),
            PresenceChange::Offline
        );
        assert!(!presence.is_online(&app, &device).await.unwrap());
    }

    #[tokio::test]
    async fn repeated_remove_reports_offline_once() {
        let presence = registry();
        let s = session("d1");
        presence.set_presence(&s).await.unwrap();

        let first = presence
            .remove_presence(&s.app_id, &s.device_id, &s.connection_id)
            .await
            .unwrap();
        let second = presence
            .remove_presence(&s.app_id, &s.device_id, &s.connection_id)
            .await
            .unwrap();
        assert_eq!(first, PresenceChange::Offline);
        assert_eq!(second, PresenceChange::Unchanged);
    }

    #[tokio::test]
    async fn refresh_of_live_connection_is_unchanged() {
        let presence = registry();
        let s = session("d1");
        presence.set_presence(&s).await.unwrap();
        assert_eq!(
            presence.refresh_presence(&s).await.unwrap(),
            PresenceChange::Unchanged
        );
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_self_heals() {
        let presence = registry();
        let s = session("d1");
        presence.set_presence(&s).await.unwrap();

        // No heartbeat and no explicit cleanup.
        tokio::time::advance(Duration::from_secs(91)).await;
        assert!(!presence.is_online(&s.app_id, &s.device_id).await.unwrap());
        assert!(presence.list_sessions(&s.app_id).await.unwrap().is_empty());

        // A late heartbeat brings the device back.
        assert_eq!(
            presence.refresh_presence(&s).await.unwrap(),
            PresenceChange::Online
        );
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_keeps_presence_alive() {
        let presence = registry();
        let s = session("d1");
        presence.set_presence(&s).await.unwrap();

        for _ in 0..4 {
            tokio::time::advance(Duration::from_secs(60)).await;
            presence.refresh_presence(&s).await.unwrap();
        }
        assert!(presence.is_online(&s.app_id, &s.device_id).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn expired_sibling_does_not_block_offline() {
        let presence = registry();
        let crashed = session("d1");
        let live = session("d1");
        let (app, device) = (live.app_id.clone(), live.device_id.clone());
        presence.set_presence(&crashed).await.unwrap();
        presence.set_presence(&live).await.unwrap();

        // Only one connection keeps heartbeating; the other never detaches.
        for _ in 0..4 {
            tokio::time::advance(Duration::from_secs(30)).await;
            presence.refresh_presence(&live).await.unwrap();
        }
        assert_eq!(
            presence.device_connections(&app, &device).await.unwrap(),
            vec![live.connection_id]
        );

        assert_eq!(
            presence
                .remove_presence(&app, &device, &live.connection_id)
                .await
                .unwrap(),
            PresenceChange::Offline
        );
        assert!(!presence.is_online(&app, &device).await.unwrap());

        // The next connection is a fresh boundary, reported once.
        assert_eq!(
            presence.set_presence(&session("d1")).await.unwrap(),
            PresenceChange::Online
        );
    }

    #[tokio::test(start_paused = true)]
    async fn connect_prunes_expired_sibling() {
        let presence = registry();
        let crashed = session("d1");
        let live = session("d1");
        let (app, device) = (live.app_id.clone(), live.device_id.clone());
        presence.set_presence(&crashed).await.unwrap();
        presence.set_presence(&live).await.unwrap();

        tokio::time::advance(Duration::from_secs(60)).await;
        presence.refresh_presence(&live).await.unwrap();
        tokio::time::advance(Duration::from_secs(60)).await;

        // Crashed record expired; the device set is still alive.
        let newcomer = session("d1");
        assert_eq!(
            presence.set_presence(&newcomer).await.unwrap(),
            PresenceChange::Unchanged
        );
        assert_eq!(
            presence
                .remove_presence(&app, &device, &live.connection_id)
                .await
                .unwrap(),
            PresenceChange::Unchanged
        );
        assert_eq!(
            presence
                .remove_presence(&app, &device, &newcomer.connection_id)
                .await
                .unwrap(),
            PresenceChange::Offline
        );
    }

    #[tokio::test]
    async fn list_sessions_is_scoped_to_app() {
        let presence = registry();
        let a = session("d1");
        let b = SessionInfo {
            connected_at: 5,
            ..session("d2")
        };
        let other = SessionInfo {
            app_id: "globex".into(),
            ..session("d3")
        };
        for s in [&a, &b, &other] {
            presence.set_presence(s).await.unwrap();
        }

        let listed = presence.list_sessions(&"acme".into()).await.unwrap();
        assert_eq!(listed, vec![a.clone(), b]);
        assert_eq!(
            presence
                .device_connections(&a.app_id, &a.device_id)
                .await
                .unwrap(),
            vec![a.connection_id]
        );
    }

    #[tokio::test]
    async fn devices_are_independent() {
        let presence = registry();
        assert_eq!(
            presence.set_presence(&session("d1")).await.unwrap(),
            PresenceChange::Online
        );
        assert_eq!(
            presence.set_presence(&session("d2")).await.unwrap(),
            PresenceChange::Online
        );
    }
}

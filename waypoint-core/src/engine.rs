//! The authoritative pub/sub state machine.
//!
//! One engine instance owns the connection registry, both grant
//! whitelists, the character/map relations and the cached character
//! snapshots. All mutation happens synchronously on the caller's
//! context; the engine never awaits.

use crate::access::AccessTokenStore;
use crate::registry::{ConnectionId, ConnectionRegistry};
use crate::stats::{self, ChannelStats, CharacterStats, ConnectionStats, SubscriptionStats};
use crate::time;
use crate::GRANT_TTL_SECS;
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tokio::sync::mpsc::UnboundedSender;
use waypoint_protocol::Payload;

/// Grants expired longer than this are dropped by housekeeping.
const SWEEP_GRACE_SECS: i64 = 60;

/// Narrow seam for backend-shipped log batches.
pub trait EventLog {
    /// Records a batch of log entries for the named stream.
    fn record(&self, stream: &str, entries: &[Value]);
}

/// Default sink: forwards entries to the `tracing` facade.
pub struct TracingEventLog;

impl EventLog for TracingEventLog {
    fn record(&self, stream: &str, entries: &[Value]) {
        for entry in entries {
            tracing::info!(target: "waypoint::logdata", stream, %entry);
        }
    }
}

/// Result of a client subscription attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscribeOutcome {
    /// Grant redeemed; carries the sorted, deduplicated changed mapIds.
    Subscribed(Vec<i64>),
    /// Character grant missing, mismatched or expired.
    Denied,
    /// Required fields missing from the request.
    Invalid,
}

struct MapSubscription {
    character_ids: BTreeSet<i64>,
    name: String,
}

/// Authoritative subscription state, owned and injected - never ambient.
pub struct SubscriptionEngine {
    registry: ConnectionRegistry,
    access: AccessTokenStore,

    /// characterId -> live connection ids.
    characters: HashMap<i64, BTreeSet<ConnectionId>>,

    /// mapId -> subscriber set and display name.
    subscriptions: BTreeMap<i64, MapSubscription>,

    /// Cached character snapshots for valid subscribers.
    character_data: BTreeMap<i64, Value>,

    /// Outstanding health-check token, at most one.
    health_check_token: Option<f64>,

    event_log: Box<dyn EventLog + Send>,
}

impl Default for SubscriptionEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriptionEngine {
    pub fn new() -> Self {
        Self {
            registry: ConnectionRegistry::new(),
            access: AccessTokenStore::new(),
            characters: HashMap::new(),
            subscriptions: BTreeMap::new(),
            character_data: BTreeMap::new(),
            health_check_token: None,
            event_log: Box::new(TracingEventLog),
        }
    }

    /// Replaces the log-batch sink.
    pub fn with_event_log(mut self, event_log: Box<dyn EventLog + Send>) -> Self {
        self.event_log = event_log;
        self
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    // Connection lifecycle ===============================================

    /// Registers a freshly accepted client connection.
    pub fn on_connection_open(
        &mut self,
        remote_address: impl Into<String>,
        sender: UnboundedSender<String>,
    ) -> ConnectionId {
        self.registry.register(remote_address, sender)
    }

    /// Tears down a closed client connection: every character tied to it
    /// is unsubscribed with connection scope, then the registry entry is
    /// dropped.
    pub fn on_connection_closed(&mut self, conn: ConnectionId) {
        let character_ids = self.character_ids_by_connection(conn);
        self.unsubscribe_characters(&character_ids, Some(conn));
        self.registry.unregister(conn);
    }

    // Client-originated operations =======================================

    /// Handles a client `subscribe` request.
    ///
    /// The character grant gates everything: on denial the connection
    /// stays open and unsubscribed. On success the connection is
    /// associated and the snapshot cached before any map grant is
    /// checked - a character may gain map access later.
    pub fn subscribe(&mut self, conn: ConnectionId, load: &Value, now: i64) -> SubscribeOutcome {
        let character_id = load.get("id").and_then(Value::as_i64).unwrap_or(0);
        let character_token = load.get("token").and_then(Value::as_str).unwrap_or("");

        if character_id == 0 || character_token.is_empty() {
            tracing::debug!(conn, "sub. data invalid");
            return SubscribeOutcome::Invalid;
        }

        let Some(snapshot) = self
            .access
            .redeem_character_grant(character_id, character_token, now)
        else {
            tracing::info!(conn, character_id, "sub. denied");
            return SubscribeOutcome::Denied;
        };

        self.characters.entry(character_id).or_default().insert(conn);
        self.set_character_data(&snapshot);

        let mut changed: BTreeSet<i64> = BTreeSet::new();
        let map_requests = load
            .get("mapData")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[]);
        for request in map_requests {
            let map_id = request.get("id").and_then(Value::as_i64).unwrap_or(0);
            let map_token = request.get("token").and_then(Value::as_str).unwrap_or("");
            let map_name = request.get("name").and_then(Value::as_str).unwrap_or("");

            if map_id != 0
                && !map_token.is_empty()
                && self.access.redeem_map_grant(map_id, character_id, map_token, now)
            {
                let subscription = self
                    .subscriptions
                    .entry(map_id)
                    .or_insert_with(|| MapSubscription {
                        character_ids: BTreeSet::new(),
                        name: String::new(),
                    });
                subscription.character_ids.insert(character_id);
                subscription.name = map_name.to_string();
                changed.insert(map_id);
            }
        }

        tracing::info!(conn, character_id, map_ids = ?changed, "sub.");
        self.broadcast_map_subscriptions(&changed);
        SubscribeOutcome::Subscribed(changed.into_iter().collect())
    }

    /// Handles a client `unsubscribe` request: only characterIds the
    /// connection actually holds are honored.
    pub fn unsubscribe_client(&mut self, conn: ConnectionId, load: &Value) {
        let requested: BTreeSet<i64> = match load {
            Value::Array(ids) => ids.iter().filter_map(Value::as_i64).collect(),
            other => other.as_i64().into_iter().collect(),
        };
        let owned = self.character_ids_by_connection(conn);
        let character_ids: Vec<i64> = owned
            .into_iter()
            .filter(|id| requested.contains(id))
            .collect();
        if !character_ids.is_empty() {
            self.unsubscribe_characters(&character_ids, Some(conn));
        }
    }

    /// Validates a client health-check token.
    ///
    /// The stored token is cleared on every attempt. Only a valid check
    /// installs `new_token` for the next round and earns statistics.
    pub fn client_health_check(&mut self, token: f64, new_token: f64) -> Option<SubscriptionStats> {
        let stored = self.health_check_token.take();
        let valid = token as i64 != 0 && stored.map(|t| t as i64) == Some(token as i64);
        if !valid {
            return None;
        }
        self.health_check_token = Some(new_token);
        Some(self.subscription_stats())
    }

    // Backend-driven operations ==========================================

    /// Stores a fresh health-check token, overwriting any previous one.
    pub fn set_health_check_token(&mut self, token: f64) -> f64 {
        self.health_check_token = Some(token);
        token
    }

    /// Refreshes a cached snapshot only if one is already present, then
    /// re-broadcasts every map the character subscribes to.
    pub fn character_update(&mut self, load: &Value) {
        self.update_character_data(load);
        let character_id = load.get("id").and_then(Value::as_i64).unwrap_or(0);
        let map_ids = self.map_ids_by_character(character_id);
        self.broadcast_map_subscriptions(&map_ids);
    }

    /// Fully unsubscribes the given characterIds (backend logout).
    pub fn character_logout(&mut self, load: &Value) -> bool {
        let character_ids: Vec<i64> = match load {
            Value::Array(ids) => ids.iter().filter_map(Value::as_i64).collect(),
            other => other.as_i64().into_iter().collect(),
        };
        self.unsubscribe_characters(&character_ids, None)
    }

    /// Whitelists access tokens for a pending client subscription.
    ///
    /// Answers `"OK"` or `false`, mirroring the control protocol.
    pub fn map_connection_access(&mut self, load: &Value, now: i64) -> Value {
        let character_id = load.get("id").and_then(Value::as_i64).unwrap_or(0);
        let snapshot = load.get("characterData").cloned().unwrap_or(Value::Null);
        let token = load.get("token").and_then(Value::as_str).unwrap_or("");

        if character_id == 0 || snapshot.is_null() || token.is_empty() {
            return Value::Bool(false);
        }

        let expires_at = now + GRANT_TTL_SECS;
        self.access
            .issue_character_grant(character_id, token, snapshot, expires_at);

        let map_requests = load
            .get("mapData")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[]);
        for request in map_requests {
            let map_id = request.get("id").and_then(Value::as_i64).unwrap_or(0);
            let map_token = request.get("token").and_then(Value::as_str).unwrap_or("");
            self.access
                .issue_map_grant(map_id, character_id, map_token, expires_at);
        }

        Value::String("OK".to_string())
    }

    /// Reconciles a map's authoritative character list against the
    /// current subscriber set. Returns the resulting subscriber count.
    ///
    /// Characters need a live connection and a cached snapshot to stay
    /// eligible; everyone else receives a deletion notice for the map.
    pub fn map_access(&mut self, load: &Value) -> i64 {
        let map_id = load.get("id").and_then(Value::as_i64).unwrap_or(0);
        if map_id == 0 {
            return 0;
        }
        let map_name = load.get("name").and_then(Value::as_str).unwrap_or("");
        let authoritative = load
            .get("characterIds")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[]);

        let mut new_ids: BTreeSet<i64> = BTreeSet::new();
        for character_id in authoritative.iter().filter_map(Value::as_i64) {
            let connected = self
                .characters
                .get(&character_id)
                .is_some_and(|conns| !conns.is_empty());
            if connected && self.character_data.contains_key(&character_id) {
                new_ids.insert(character_id);
            }
        }

        let current: BTreeSet<i64> = self
            .subscriptions
            .get(&map_id)
            .map(|s| s.character_ids.clone())
            .unwrap_or_default();

        // deletion notice to exactly the no-longer-valid characters
        let removed: Vec<i64> = current.difference(&new_ids).copied().collect();
        let removed_connections = self.connections_by_character_ids(&removed);
        if let Ok(payload) = Payload::new("mapAccess", json!(map_id), Some(removed)) {
            self.broadcast(&removed_connections, &payload);
        }

        if new_ids.is_empty() {
            self.subscriptions.remove(&map_id);
        } else {
            let key_set_changed = current != new_ids;
            let subscription = self
                .subscriptions
                .entry(map_id)
                .or_insert_with(|| MapSubscription {
                    character_ids: BTreeSet::new(),
                    name: String::new(),
                });
            subscription.character_ids = new_ids.clone();
            subscription.name = map_name.to_string();

            if key_set_changed {
                self.broadcast_map_subscriptions(&BTreeSet::from([map_id]));
            }
        }
        new_ids.len() as i64
    }

    /// Broadcasts raw map data to all current subscribers of the
    /// embedded mapId. Returns the recipient count.
    pub fn map_update(&mut self, load: &Value) -> usize {
        let map_id = load.pointer("/config/id").and_then(Value::as_i64).unwrap_or(0);
        let count = self.broadcast_map_data("mapUpdate", map_id, load.clone());
        tracing::debug!(map_id, connections = count, "update map data");
        count
    }

    /// Broadcasts a deletion notice, then drops the subscription entry.
    pub fn map_deleted(&mut self, map_id: i64) -> usize {
        let count = self.broadcast_map_data("mapDeleted", map_id, json!(map_id));
        self.subscriptions.remove(&map_id);
        tracing::info!(map_id, connections = count, "delete map");
        count
    }

    /// Routes a backend log batch through the event-log seam.
    pub fn log_data(&mut self, load: &Value) {
        let stream = load
            .pointer("/meta/stream")
            .and_then(Value::as_str)
            .unwrap_or("default");
        let entries = load
            .get("log")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[]);
        self.event_log.record(stream, entries);
    }

    // Broadcasting =======================================================

    /// Sends a serialized envelope to every connection of the map's
    /// subscribers. The recipient set is derived fresh on every call.
    pub fn broadcast_map_data(&mut self, task: &str, map_id: i64, load: Value) -> usize {
        let character_ids = self.character_ids_by_map(map_id);
        let connections = self.connections_by_character_ids(&character_ids);
        match Payload::new(task, load, Some(character_ids)) {
            Ok(payload) => self.broadcast(&connections, &payload),
            Err(err) => {
                tracing::error!(%err, "payload construction failed");
                0
            }
        }
    }

    /// Sends one envelope to a single connection.
    pub fn send_to(&mut self, conn: ConnectionId, payload: &Payload) -> bool {
        self.broadcast(&BTreeSet::from([conn]), payload) == 1
    }

    fn broadcast(&mut self, connections: &BTreeSet<ConnectionId>, payload: &Payload) -> usize {
        let data = match serde_json::to_string(payload) {
            Ok(data) => data,
            Err(err) => {
                tracing::error!(%err, "payload serialization failed");
                return 0;
            }
        };
        let now = time::unix_now_micros();
        let mut delivered = 0;
        for &conn in connections {
            let sent = self
                .registry
                .lookup(conn)
                .map(|c| c.send(data.clone()))
                .unwrap_or(false);
            if sent {
                self.registry.record_delivery(conn, now);
                delivered += 1;
            }
        }
        delivered
    }

    /// Broadcasts refreshed subscription views for the given maps to
    /// everyone subscribed to them. Maps without subscribers or without
    /// any cached snapshot are skipped.
    fn broadcast_map_subscriptions(&mut self, map_ids: &BTreeSet<i64>) {
        for &map_id in map_ids {
            let character_ids = self.character_ids_by_map(map_id);
            if character_ids.is_empty() {
                continue;
            }
            let characters: BTreeMap<i64, Value> = character_ids
                .iter()
                .filter_map(|id| self.character_data.get(id).map(|data| (*id, data.clone())))
                .collect();
            if characters.is_empty() {
                continue;
            }
            let systems = stats::group_characters_by_system(&characters);
            let load = json!({
                "config": {"id": map_id},
                "data": {"systems": systems},
            });
            let count = self.broadcast_map_data("mapSubscriptions", map_id, load);
            tracing::debug!(map_id, connections = count, "update map subscriptions data");
        }
    }

    // Unsubscription =====================================================

    /// Unsubscribes characterIds from all maps. With a connection given,
    /// only that connection's association is dropped per character.
    pub fn unsubscribe_characters(
        &mut self,
        character_ids: &[i64],
        conn: Option<ConnectionId>,
    ) -> bool {
        let mut processed = false;
        for &character_id in character_ids {
            processed = self.unsubscribe_character(character_id, conn);
        }
        processed
    }

    fn unsubscribe_character(&mut self, character_id: i64, conn: Option<ConnectionId>) -> bool {
        if character_id == 0 {
            return true;
        }
        match conn {
            Some(conn) => {
                // drop a single connection (e.g. one browser window)
                if let Some(connections) = self.characters.get_mut(&character_id) {
                    connections.remove(&conn);
                    if connections.is_empty() {
                        self.characters.remove(&character_id);
                    }
                }
                // TODO: drop the cached snapshot once the character has no
                // map subscriptions left anywhere
            }
            None => {
                // drop all connections for the character plus its snapshot
                self.characters.remove(&character_id);
                self.character_data.remove(&character_id);
            }
        }

        // the character leaves every map either way; a surviving
        // connection can regain access through mapAccess reconciliation
        let mut changed: BTreeSet<i64> = BTreeSet::new();
        self.subscriptions.retain(|&map_id, subscription| {
            if subscription.character_ids.remove(&character_id) {
                changed.insert(map_id);
            }
            !subscription.character_ids.is_empty()
        });

        tracing::info!(character_id, map_ids = ?changed, "unsub.");
        self.broadcast_map_subscriptions(&changed);
        true
    }

    // Lookups ============================================================

    fn character_ids_by_connection(&self, conn: ConnectionId) -> Vec<i64> {
        let mut character_ids: Vec<i64> = self
            .characters
            .iter()
            .filter(|(_, connections)| connections.contains(&conn))
            .map(|(&id, _)| id)
            .collect();
        character_ids.sort_unstable();
        character_ids
    }

    fn character_ids_by_map(&self, map_id: i64) -> Vec<i64> {
        self.subscriptions
            .get(&map_id)
            .map(|s| s.character_ids.iter().copied().collect())
            .unwrap_or_default()
    }

    fn map_ids_by_character(&self, character_id: i64) -> BTreeSet<i64> {
        self.subscriptions
            .iter()
            .filter(|(_, s)| s.character_ids.contains(&character_id))
            .map(|(&map_id, _)| map_id)
            .collect()
    }

    fn connections_by_character(&self, character_id: i64) -> BTreeSet<ConnectionId> {
        self.characters
            .get(&character_id)
            .map(|connections| {
                connections
                    .iter()
                    .copied()
                    .filter(|&conn| self.registry.exists(conn))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn connections_by_character_ids(&self, character_ids: &[i64]) -> BTreeSet<ConnectionId> {
        let mut connections = BTreeSet::new();
        for &character_id in character_ids {
            connections.extend(self.connections_by_character(character_id));
        }
        connections
    }

    // Snapshot cache =====================================================

    fn set_character_data(&mut self, snapshot: &Value) {
        if let Some(character_id) = snapshot.get("id").and_then(Value::as_i64) {
            if character_id != 0 {
                self.character_data.insert(character_id, snapshot.clone());
            }
        }
    }

    fn update_character_data(&mut self, snapshot: &Value) {
        let character_id = snapshot.get("id").and_then(Value::as_i64).unwrap_or(0);
        if self.character_data.contains_key(&character_id) {
            self.set_character_data(snapshot);
        }
    }

    // Diagnostics ========================================================

    /// Per-map subscriber detail plus aggregate unique counts. Derived
    /// fresh on every call; never load-bearing for correctness.
    pub fn subscription_stats(&self) -> SubscriptionStats {
        let mut unique_subscribers: BTreeSet<i64> = BTreeSet::new();
        let mut unique_connections: BTreeSet<ConnectionId> = BTreeSet::new();
        let mut channels = Vec::with_capacity(self.subscriptions.len());

        for (&map_id, subscription) in &self.subscriptions {
            let mut map_connections: BTreeSet<ConnectionId> = BTreeSet::new();
            let mut subscriptions = Vec::with_capacity(subscription.character_ids.len());

            for &character_id in &subscription.character_ids {
                let connections = self.connections_by_character(character_id);
                let connection_stats = connections
                    .iter()
                    .filter_map(|&conn| self.registry.lookup(conn))
                    .map(|c| {
                        ConnectionStats::new(c.id, c.remote_address.clone(), c.last_send())
                    })
                    .collect();
                map_connections.extend(&connections);

                subscriptions.push(CharacterStats {
                    character_id,
                    character_name: self
                        .character_data
                        .get(&character_id)
                        .and_then(|data| data.get("name"))
                        .and_then(Value::as_str)
                        .map(ToString::to_string),
                    count_con: connections.len(),
                    connections: connection_stats,
                });
            }

            unique_subscribers.extend(&subscription.character_ids);
            unique_connections.extend(&map_connections);

            channels.push(ChannelStats {
                channel_id: map_id,
                channel_name: subscription.name.clone(),
                count_sub: subscription.character_ids.len(),
                count_con: map_connections.len(),
                subscriptions,
            });
        }

        SubscriptionStats {
            count_sub: unique_subscribers.len(),
            count_con: unique_connections.len(),
            channels,
        }
    }

    /// Current subscriber set for a map, if any.
    pub fn map_subscribers(&self, map_id: i64) -> Option<Vec<i64>> {
        self.subscriptions.get(&map_id).map(|s| s.character_ids.iter().copied().collect())
    }

    /// Whether a snapshot is cached for the character.
    pub fn has_character_data(&self, character_id: i64) -> bool {
        self.character_data.contains_key(&character_id)
    }

    // Housekeeping =======================================================

    /// Periodic idle-state expiry: sweeps grants that expired more than
    /// a grace window ago. The redemption path stays lazy regardless.
    pub fn housekeeping(&mut self, now: i64) {
        self.access.sweep_expired(now, SWEEP_GRACE_SECS);
    }
}

//! Hub-side liveness tracking.
//!
//! Every tracked connection decays on each heartbeat tick unless it answers
//! with a `PONG`:
//! 1. A live connection is marked "possibly dead" and sent a `PING`
//! 2. A connection still not alive on later ticks collects strikes
//! 3. Once strikes reach `max_strikes`, the next tick asks for a forced close
//!
//! A silent connection is therefore evicted on the `max_strikes + 1`th tick
//! after its last ping. The tracker never touches sockets: `tick()` returns
//! actions and the caller performs them. The transport's close callback
//! removes the entry via `unregister()`.

use std::collections::HashMap;
use std::fmt;

use indexmap::IndexMap;
use uuid::Uuid;

use crate::config::HeartbeatConfig;

/// Opaque connection identifier, generated at upgrade time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// A member connection as seen by the hub.
#[derive(Debug, Clone)]
pub struct Connection {
    id: ConnectionId,
    /// Remote socket address, if the transport reported one
    pub remote_address: Option<String>,
    /// Query parameters from the upgrade request
    pub parameters: HashMap<String, String>,
    /// Optimistic liveness flag, cleared when a ping is sent
    pub alive: bool,
    /// Consecutive missed heartbeat cycles
    pub strikes: u32,
    /// Last time a PONG arrived (or the connection was created), in ms
    pub last_ping_at: u64,
    evicting: bool,
}

impl Connection {
    pub fn new(
        id: ConnectionId,
        remote_address: Option<String>,
        parameters: HashMap<String, String>,
        now_ms: u64,
    ) -> Self {
        Self {
            id,
            remote_address,
            parameters,
            alive: true,
            strikes: 0,
            last_ping_at: now_ms,
            evicting: false,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Whether a forced close has been requested and not yet completed.
    pub fn is_evicting(&self) -> bool {
        self.evicting
    }
}

/// Work produced by a heartbeat tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerAction {
    /// Send `PING` to this connection
    SendPing(ConnectionId),
    /// Force-close this connection
    Evict { id: ConnectionId, strikes: u32 },
}

/// Map of live connections plus the strike-based eviction algorithm.
#[derive(Debug)]
pub struct LivenessTracker {
    config: HeartbeatConfig,
    /// Insertion-ordered so `get_all()` iterates oldest first
    connections: IndexMap<ConnectionId, Connection>,
}

impl LivenessTracker {
    pub fn new(config: HeartbeatConfig) -> Self {
        Self {
            config,
            connections: IndexMap::new(),
        }
    }

    pub fn config(&self) -> &HeartbeatConfig {
        &self.config
    }

    /// Start tracking a connection.
    pub fn register(&mut self, connection: Connection) {
        self.connections.insert(connection.id, connection);
    }

    /// Stop tracking a connection. Idempotent.
    pub fn unregister(&mut self, id: &ConnectionId) -> Option<Connection> {
        self.connections.shift_remove(id)
    }

    pub fn get(&self, id: &ConnectionId) -> Option<&Connection> {
        self.connections.get(id)
    }

    pub fn get_mut(&mut self, id: &ConnectionId) -> Option<&mut Connection> {
        self.connections.get_mut(id)
    }

    /// All tracked connections in insertion order.
    pub fn get_all(&self) -> impl Iterator<Item = &Connection> {
        self.connections.values()
    }

    pub fn ids(&self) -> Vec<ConnectionId> {
        self.connections.keys().copied().collect()
    }

    pub fn count(&self) -> usize {
        self.connections.len()
    }

    /// Record a `PONG`. Resets the decay regardless of where in the cycle
    /// the connection was.
    ///
    /// Returns false if the id is not tracked.
    pub fn record_pong(&mut self, id: &ConnectionId, now_ms: u64) -> bool {
        match self.connections.get_mut(id) {
            Some(conn) => {
                conn.alive = true;
                conn.strikes = 0;
                conn.last_ping_at = now_ms;
                conn.evicting = false;
                true
            }
            None => false,
        }
    }

    /// Run one heartbeat cycle.
    pub fn tick(&mut self, _now_ms: u64) -> Vec<TrackerAction> {
        let mut actions = Vec::new();

        // Snapshot ids: evictions may race with close callbacks that
        // unregister entries while the caller is acting on this cycle.
        for id in self.ids() {
            let Some(conn) = self.connections.get_mut(&id) else {
                continue;
            };

            if conn.alive {
                conn.alive = false;
                actions.push(TrackerAction::SendPing(id));
            } else if conn.strikes < self.config.max_strikes {
                conn.strikes += 1;
            } else if !conn.evicting {
                conn.evicting = true;
                actions.push(TrackerAction::Evict {
                    id,
                    strikes: conn.strikes,
                });
            }
        }

        actions
    }
}

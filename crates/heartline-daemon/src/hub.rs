//! Hub: accepts member connections and evicts the ones that stop answering.
//!
//! The upgrade route runs the gate before completing the WebSocket upgrade,
//! so rejected requests get a plain 403 and never reach the tracker. A
//! single heartbeat task drives the tracker; connection tasks feed it PONGs
//! and unregister themselves on close.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Context, Result};
use axum::extract::{ConnectInfo, Query, State, WebSocketUpgrade};
use axum::http::{StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use heartline_core::clock::now_ms;
use heartline_core::{
    classify, AuthHandler, Connection, ConnectionId, ConfigError, ControlMessage, EventBus,
    GateDecision, HubConfig, HubEvent, Inbound, LivenessTracker, Subscription, TrackerAction,
    UpgradeGate, UpgradeRequest,
};

use crate::connection::{run_socket, ConnectionHandle, NORMAL_CLOSE};

/// Tracker plus the outbound queue of every tracked connection.
struct HubState {
    tracker: LivenessTracker,
    handles: HashMap<ConnectionId, ConnectionHandle>,
    destroyed: bool,
}

struct HubShared {
    config: HubConfig,
    gate: UpgradeGate,
    state: Mutex<HubState>,
    events: Arc<EventBus<HubEvent>>,
    heartbeat_task: Mutex<Option<JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
}

/// Builder for a [`Hub`] with an optional async auth handler.
pub struct HubBuilder {
    config: HubConfig,
    handler: Option<Arc<dyn AuthHandler>>,
}

impl HubBuilder {
    pub fn auth_handler(mut self, handler: impl AuthHandler + 'static) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }

    pub fn build(self) -> Result<Hub, ConfigError> {
        self.config.validate()?;

        let mut gate = UpgradeGate::new(self.config.auth.parameters.clone());
        if let Some(handler) = self.handler {
            gate = gate.with_handler(handler);
        }

        let (shutdown, _) = watch::channel(false);
        let tracker = LivenessTracker::new(self.config.heartbeat.clone());

        Ok(Hub {
            shared: Arc::new(HubShared {
                config: self.config,
                gate,
                state: Mutex::new(HubState {
                    tracker,
                    handles: HashMap::new(),
                    destroyed: false,
                }),
                events: Arc::new(EventBus::new()),
                heartbeat_task: Mutex::new(None),
                shutdown,
            }),
        })
    }
}

/// Cheap to clone; all clones share the same connections.
#[derive(Clone)]
pub struct Hub {
    shared: Arc<HubShared>,
}

impl Hub {
    pub fn builder(config: HubConfig) -> HubBuilder {
        HubBuilder {
            config,
            handler: None,
        }
    }

    /// Hub without an auth handler.
    pub fn new(config: HubConfig) -> Result<Self, ConfigError> {
        Self::builder(config).build()
    }

    pub fn config(&self) -> &HubConfig {
        &self.shared.config
    }

    /// Bind to an address and return the TCP listener.
    pub async fn bind(listen_addr: &str) -> Result<TcpListener> {
        let listener = TcpListener::bind(listen_addr)
            .await
            .with_context(|| format!("Failed to bind {}", listen_addr))?;
        info!("Hub listening on {}", listener.local_addr()?);
        Ok(listener)
    }

    /// Router that upgrades on any path, for embedding in a larger app.
    ///
    /// Must be served with `into_make_service_with_connect_info::<SocketAddr>()`.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/", get(upgrade_handler))
            .fallback(upgrade_handler)
            .with_state(self.clone())
    }

    /// Serve until [`Hub::destroy`] is called.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        self.start_heartbeat();

        let mut shutdown = self.shared.shutdown.subscribe();
        axum::serve(
            listener,
            self.router()
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stopped| *stopped).await;
        })
        .await
        .context("Hub server failed")?;

        info!("Hub stopped serving");
        Ok(())
    }

    /// Start the heartbeat loop. Called by [`Hub::serve`]; idempotent.
    pub fn start_heartbeat(&self) {
        let mut task = lock(&self.shared.heartbeat_task);
        if task.is_some() || self.shared.state().destroyed {
            return;
        }

        let shared = Arc::clone(&self.shared);
        let period = self.shared.config.heartbeat.interval();
        *task = Some(tokio::spawn(async move {
            // First cycle one full interval after start
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                shared.heartbeat_cycle();
            }
        }));
    }

    /// Subscribe to hub events.
    pub fn subscribe(
        &self,
        callback: impl Fn(&HubEvent) + Send + Sync + 'static,
    ) -> Subscription<HubEvent> {
        self.shared.events.subscribe(callback)
    }

    /// Send an application payload to one member.
    pub fn send(&self, id: &ConnectionId, text: impl Into<String>) -> Result<()> {
        let state = self.shared.state();
        let handle = state
            .handles
            .get(id)
            .ok_or_else(|| anyhow::anyhow!("Unknown connection: {}", id))?;
        if !handle.send_text(text) {
            anyhow::bail!("Connection {} is closing", id);
        }
        Ok(())
    }

    /// Send an application payload to every member. Returns how many were queued.
    pub fn broadcast(&self, text: &str) -> usize {
        let state = self.shared.state();
        state
            .tracker
            .get_all()
            .filter_map(|conn| state.handles.get(&conn.id()))
            .filter(|handle| handle.send_text(text))
            .count()
    }

    /// Close one connection with a normal close frame.
    ///
    /// The member sees an ordinary close and will reconnect.
    pub fn close(&self, id: &ConnectionId) -> bool {
        match self.shared.state().handles.get(id) {
            Some(handle) => {
                info!("Closing connection {}", id);
                handle.close(NORMAL_CLOSE, "closed by hub")
            }
            None => false,
        }
    }

    /// Number of tracked connections.
    pub fn count(&self) -> usize {
        self.shared.state().tracker.count()
    }

    /// Snapshot of every tracked connection, oldest first.
    pub fn connections(&self) -> Vec<Connection> {
        self.shared.state().tracker.get_all().cloned().collect()
    }

    pub fn connection(&self, id: &ConnectionId) -> Option<Connection> {
        self.shared.state().tracker.get(id).cloned()
    }

    /// Run one heartbeat cycle immediately.
    pub fn heartbeat_now(&self) {
        self.shared.heartbeat_cycle();
    }

    /// Stop the heartbeat loop, drop every connection and stop serving.
    /// Safe to call more than once.
    pub fn destroy(&self) {
        let dropped = {
            let mut state = self.shared.state();
            if state.destroyed {
                return;
            }
            state.destroyed = true;
            for handle in state.handles.values() {
                handle.terminate();
            }
            state.handles.len()
        };

        if let Some(task) = lock(&self.shared.heartbeat_task).take() {
            task.abort();
        }
        // Stored even with no receiver yet, so a later serve() returns at once
        self.shared.shutdown.send_replace(true);

        info!("Hub destroyed ({} connection(s) dropped)", dropped);
    }

    pub fn is_destroyed(&self) -> bool {
        self.shared.state().destroyed
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl HubShared {
    fn state(&self) -> MutexGuard<'_, HubState> {
        lock(&self.state)
    }

    fn heartbeat_cycle(&self) {
        let mut evicted = Vec::new();
        {
            let mut state = self.state();
            if state.destroyed {
                return;
            }

            let actions = state.tracker.tick(now_ms());
            for action in actions {
                match action {
                    TrackerAction::SendPing(id) => {
                        if let Some(handle) = state.handles.get(&id) {
                            handle.send_control(ControlMessage::Ping);
                        }
                    }
                    TrackerAction::Evict { id, strikes } => {
                        warn!(
                            "Evicting {} after {} missed heartbeat(s)",
                            id,
                            strikes + 1
                        );
                        if let Some(handle) = state.handles.get(&id) {
                            handle.terminate();
                        }
                        evicted.push((id, strikes));
                    }
                }
            }
        }

        for (id, strikes) in evicted {
            self.events.emit(HubEvent::Evicted { id, strikes });
        }
    }

    /// Track a freshly upgraded connection. False if the hub is shutting down.
    fn register(&self, connection: Connection, handle: ConnectionHandle) -> bool {
        let mut state = self.state();
        if state.destroyed {
            return false;
        }
        state.handles.insert(connection.id(), handle);
        state.tracker.register(connection);
        true
    }

    fn on_text(&self, id: ConnectionId, text: &str) {
        match classify(text) {
            Inbound::Control(ControlMessage::Pong) => {
                if !self.state().tracker.record_pong(&id, now_ms()) {
                    debug!("PONG from untracked connection {}", id);
                }
            }
            Inbound::Control(other) => {
                debug!("Ignoring {:?} from member {}", other, id);
            }
            Inbound::Malformed(raw) => {
                warn!("Dropping malformed control frame from {}: {}", id, raw);
            }
            Inbound::Data(data) => {
                self.events.emit(HubEvent::Message {
                    id,
                    text: data.to_string(),
                });
            }
        }
    }

    fn on_closed(&self, id: ConnectionId, code: Option<u16>, reason: String) {
        let removed = {
            let mut state = self.state();
            state.handles.remove(&id);
            state.tracker.unregister(&id).is_some()
        };

        if removed {
            info!("Connection closed: {} ({:?} {})", id, code, reason);
            self.events
                .emit(HubEvent::Disconnected { id, code, reason });
        }
    }
}

async fn upgrade_handler(
    State(hub): State<Hub>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(parameters): Query<HashMap<String, String>>,
    uri: Uri,
    ws: WebSocketUpgrade,
) -> Response {
    let request = UpgradeRequest {
        path: uri.path().to_string(),
        remote_address: Some(addr.to_string()),
        parameters,
    };

    if let GateDecision::Reject(reason) = hub.shared.gate.evaluate(&request).await {
        warn!("Rejected upgrade from {}: {}", addr, reason);
        hub.shared.events.emit(HubEvent::Rejected {
            remote_address: request.remote_address,
            reason,
        });
        return StatusCode::FORBIDDEN.into_response();
    }

    if hub.is_destroyed() {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    let connection = hub.shared.gate.admit(request, now_ms());
    ws.on_upgrade(move |socket| async move {
        let shared = hub.shared;
        let id = connection.id();
        let remote_address = connection.remote_address.clone();

        let (tx, rx) = mpsc::unbounded_channel();
        let handle = ConnectionHandle::new(id, tx);

        // Announce goes first so it precedes any PING
        let interval_ms = shared.config.heartbeat.interval_ms;
        handle.send_control(ControlMessage::HeartbeatAnnounce(interval_ms));

        if !shared.register(connection, handle) {
            debug!("Hub destroyed during upgrade, dropping {}", id);
            return;
        }

        info!("New connection from {:?} ({})", remote_address, id);
        shared.events.emit(HubEvent::Connected {
            id,
            remote_address,
        });

        let text_shared = Arc::clone(&shared);
        let info = run_socket(id, socket, rx, move |text| text_shared.on_text(id, text)).await;

        shared.on_closed(id, info.code, info.reason);
    })
}

//! Member: one persistent connection to a hub, with automatic reconnection.
//!
//! Manages:
//! - Connection attempts and retry scheduling (one driver task)
//! - Fast failure when the hub rejects the upgrade with 403
//! - Readiness waiters for callers that want to await "connected"
//! - A heartbeat watchdog sized by the hub's announced interval

use std::sync::{Arc, Mutex, MutexGuard, Weak};

use futures::{SinkExt, StreamExt};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        protocol::{frame::coding::CloseCode, CloseFrame},
        Error as WsError, Message,
    },
};
use tracing::{debug, error, info, warn};
use url::Url;

use heartline_core::clock::now_ms;
use heartline_core::{
    classify, CloseOutcome, ConfigError, ConnectDecision, ControlMessage, ErrorOutcome, EventBus,
    HeartbeatWatch, Inbound, LinkError, MemberConfig, MemberEvent, Phase, Readiness,
    ReadinessQueue, Ready, ReconnectMachine, Subscription,
};

use crate::connection::{CloseInfo, Outbound};

/// Lifecycle state. Never held across an `.await`.
struct MemberState {
    machine: ReconnectMachine,
    readiness: ReadinessQueue,
    watch: HeartbeatWatch,
    /// Outbound queue of the open session, if any
    outbound: Option<mpsc::UnboundedSender<Outbound>>,
    driver: Option<JoinHandle<()>>,
    watchdog: Option<JoinHandle<()>>,
}

struct MemberShared {
    url: Url,
    state: Mutex<MemberState>,
    events: Arc<EventBus<MemberEvent>>,
}

/// Cheap to clone; all clones share one connection.
///
/// Call [`Member::destroy`] when done: background tasks keep the member
/// alive otherwise.
#[derive(Clone)]
pub struct Member {
    shared: Arc<MemberShared>,
}

/// Hub URL with the configured parameters appended to the query.
pub fn build_url(config: &MemberConfig) -> Result<Url, ConfigError> {
    let mut url = Url::parse(&config.url)
        .map_err(|e| ConfigError::Invalid(format!("invalid url {}: {}", config.url, e)))?;

    if !config.parameters.is_empty() {
        let mut keys: Vec<_> = config.parameters.keys().collect();
        keys.sort();
        let mut query = url.query_pairs_mut();
        for key in keys {
            query.append_pair(key, &config.parameters[key]);
        }
    }

    Ok(url)
}

/// Map a failed connect into the member's error vocabulary.
///
/// A non-101 upgrade response is reported with its HTTP status; the state
/// machine decides whether that status is fatal.
fn connect_error(e: WsError) -> LinkError {
    match e {
        WsError::Http(response) => LinkError::Rejected {
            status: response.status().as_u16(),
        },
        other => LinkError::Transport(other.to_string()),
    }
}

impl Member {
    pub fn new(config: MemberConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let url = build_url(&config)?;

        Ok(Self {
            shared: Arc::new(MemberShared {
                url,
                state: Mutex::new(MemberState {
                    machine: ReconnectMachine::new(config.reconnect.clone()),
                    readiness: ReadinessQueue::new(),
                    watch: HeartbeatWatch::new(&config.heartbeat, now_ms()),
                    outbound: None,
                    driver: None,
                    watchdog: None,
                }),
                events: Arc::new(EventBus::new()),
            }),
        })
    }

    pub fn url(&self) -> &Url {
        &self.shared.url
    }

    /// Start connecting unless an attempt is already outstanding.
    ///
    /// Resolves like [`Member::ready`]. Starting an attempt needs a Tokio
    /// runtime; without one the call fails with `Transport` and state is
    /// left untouched.
    pub fn connect(&self) -> Ready {
        let mut state = self.shared.state();
        let starts = matches!(state.machine.phase(), Phase::Idle | Phase::Closed { .. });
        let runtime = match Handle::try_current() {
            Ok(runtime) => Some(runtime),
            Err(e) if starts => {
                warn!("Cannot connect to {}: {}", self.shared.url, e);
                return Ready::resolved(Err(LinkError::Transport(e.to_string())));
            }
            Err(_) => None,
        };

        match state.machine.connect() {
            ConnectDecision::Fail(e) => return Ready::resolved(Err(e)),
            ConnectDecision::AlreadyConnected => return Ready::resolved(Ok(())),
            ConnectDecision::AlreadyInFlight => {}
            ConnectDecision::Start => {
                info!("Connecting to {}", self.shared.url);
                let shared = Arc::clone(&self.shared);
                if let Some(runtime) = runtime {
                    state.driver = Some(runtime.spawn(drive(shared)));
                }
            }
        }
        state.readiness.enqueue()
    }

    /// Resolve once connected.
    ///
    /// Fails immediately when `connect()` was never called, after a fatal
    /// rejection, after exhaustion, or after `destroy()`.
    pub fn ready(&self) -> Ready {
        let mut state = self.shared.state();
        match state.machine.readiness() {
            Readiness::Ready => Ready::resolved(Ok(())),
            Readiness::Failed(e) => Ready::resolved(Err(e)),
            Readiness::Wait => state.readiness.enqueue(),
        }
    }

    /// Send an application payload to the hub.
    pub fn send(&self, text: impl Into<String>) -> Result<(), LinkError> {
        let state = self.shared.state();
        if !state.machine.is_connected() {
            return Err(LinkError::NotConnected);
        }
        let outbound = state.outbound.as_ref().ok_or(LinkError::NotConnected)?;
        outbound
            .send(Outbound::Text(text.into()))
            .map_err(|_| LinkError::NotConnected)
    }

    /// Subscribe to member events.
    pub fn subscribe(
        &self,
        callback: impl Fn(&MemberEvent) + Send + Sync + 'static,
    ) -> Subscription<MemberEvent> {
        self.shared.events.subscribe(callback)
    }

    pub fn is_connected(&self) -> bool {
        self.shared.state().machine.is_connected()
    }

    pub fn is_in_flight(&self) -> bool {
        self.shared.state().machine.is_in_flight()
    }

    pub fn fatal_error(&self) -> Option<LinkError> {
        self.shared.state().machine.fatal_error().cloned()
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.shared.state().machine.reconnect_attempts()
    }

    /// Heartbeat duration in milliseconds (hub-announced once connected).
    pub fn heartbeat_duration_ms(&self) -> u64 {
        self.shared.state().watch.duration_ms()
    }

    pub fn last_heartbeat_at(&self) -> u64 {
        self.shared.state().watch.last_heartbeat_at()
    }

    /// Disable reconnection, cancel timers, drop the socket and fail any
    /// queued waiters with `Destroyed`. Safe to call more than once.
    pub fn destroy(&self) {
        let (was_connected, failed) = {
            let mut state = self.shared.state();
            let was_connected = state.machine.is_connected();
            if !state.machine.destroy() {
                return;
            }
            if let Some(outbound) = state.outbound.take() {
                let _ = outbound.send(Outbound::Terminate);
            }
            if let Some(watchdog) = state.watchdog.take() {
                watchdog.abort();
            }
            if let Some(driver) = state.driver.take() {
                driver.abort();
            }
            (was_connected, state.readiness.flush_err(LinkError::Destroyed))
        };

        info!("Member destroyed ({} waiter(s) failed)", failed);
        if was_connected {
            self.shared.events.emit(MemberEvent::Close {
                code: None,
                reason: "destroyed".to_string(),
            });
        }
    }
}

impl MemberShared {
    fn state(&self) -> MutexGuard<'_, MemberState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Transport opened. False if the socket must be dropped instead.
    fn on_open(self: &Arc<Self>, outbound: mpsc::UnboundedSender<Outbound>) -> bool {
        let released = {
            let mut state = self.state();
            if !state.machine.on_open() {
                return false;
            }
            state.outbound = Some(outbound);
            state.watch.arm(now_ms());
            self.arm_watchdog(&mut state);
            state.readiness.flush_ok()
        };

        info!("Connected to {} ({} waiter(s) released)", self.url, released);
        self.events.emit(MemberEvent::Open);
        true
    }

    /// Replace the watchdog timer with one at the current heartbeat period.
    fn arm_watchdog(self: &Arc<Self>, state: &mut MemberState) {
        if let Some(previous) = state.watchdog.take() {
            previous.abort();
        }

        let period = state.watch.period();
        let shared: Weak<Self> = Arc::downgrade(self);
        state.watchdog = Some(tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match shared.upgrade() {
                    Some(shared) if shared.check_watchdog() => {}
                    _ => break,
                }
            }
        }));
    }

    /// One watchdog firing. Returns false once the watchdog should stop.
    fn check_watchdog(&self) -> bool {
        let state = self.state();
        if !state.machine.is_connected() {
            return false;
        }

        let now = now_ms();
        if !state.watch.is_expired(now) {
            return true;
        }

        warn!(
            "No heartbeat from {} for {}ms (duration {}ms), closing connection",
            self.url,
            now.saturating_sub(state.watch.last_heartbeat_at()),
            state.watch.duration_ms()
        );
        if let Some(outbound) = &state.outbound {
            let _ = outbound.send(Outbound::Terminate);
        }
        false
    }

    /// Handle an inbound text frame. Returns a reply to send, if any.
    fn on_text(self: &Arc<Self>, text: &str) -> Option<String> {
        match classify(text) {
            Inbound::Control(ControlMessage::Ping) => {
                self.state().watch.record_ping(now_ms());
                Some(ControlMessage::Pong.encode())
            }
            Inbound::Control(ControlMessage::HeartbeatAnnounce(ms)) => {
                let mut state = self.state();
                if state.watch.negotiate(ms, now_ms()) {
                    debug!("Hub heartbeat interval is {}ms", ms);
                    self.arm_watchdog(&mut state);
                } else {
                    warn!("Ignoring heartbeat announcement of {}ms", ms);
                }
                None
            }
            Inbound::Control(ControlMessage::Pong) => None,
            Inbound::Malformed(raw) => {
                warn!("Dropping malformed control frame from hub: {}", raw);
                None
            }
            Inbound::Data(data) => {
                self.events.emit(MemberEvent::Message(data.to_string()));
                None
            }
        }
    }

    fn on_error(&self, error: LinkError) {
        let fatal = {
            let mut state = self.state();
            match state.machine.on_error(&error) {
                ErrorOutcome::Fatal(e) => {
                    state.readiness.flush_err(e);
                    true
                }
                ErrorOutcome::Surface => false,
            }
        };

        if fatal {
            error!("Hub {} rejected the connection: {}", self.url, error);
        } else {
            warn!("Connection error on {}: {}", self.url, error);
        }
        self.events.emit(MemberEvent::Error(error));
    }

    /// Session over (or attempt failed). Decide whether to retry.
    fn on_close(&self, info: CloseInfo) -> CloseOutcome {
        let outcome = {
            let mut state = self.state();
            state.outbound = None;
            if let Some(watchdog) = state.watchdog.take() {
                watchdog.abort();
            }
            let outcome = state.machine.on_close();
            if let CloseOutcome::GaveUp { attempts } = outcome {
                state.readiness.flush_err(LinkError::Exhausted { attempts });
            }
            outcome
        };

        self.events.emit(MemberEvent::Close {
            code: info.code,
            reason: info.reason,
        });

        match &outcome {
            CloseOutcome::Retry { attempt, delay } => {
                info!(
                    "Scheduled reconnect to {} in {:?} (attempt {})",
                    self.url, delay, attempt
                );
                self.events.emit(MemberEvent::Reconnecting {
                    attempt: *attempt,
                    delay_ms: delay.as_millis() as u64,
                });
            }
            CloseOutcome::GaveUp { attempts } => {
                warn!(
                    "Giving up on {} after {} reconnect attempt(s)",
                    self.url, attempts
                );
            }
            CloseOutcome::Terminal => {
                debug!("Connection to {} closed for good", self.url);
            }
        }

        outcome
    }

    /// One attempt: connect, then pump frames until the socket closes.
    async fn run_session(self: &Arc<Self>) -> CloseInfo {
        let ws = match connect_async(self.url.as_str()).await {
            Ok((ws, _response)) => ws,
            Err(e) => {
                let error = connect_error(e);
                let info = CloseInfo {
                    code: None,
                    reason: error.to_string(),
                };
                self.on_error(error);
                return info;
            }
        };

        let (tx, mut outbound) = mpsc::unbounded_channel();
        if !self.on_open(tx) {
            return CloseInfo {
                code: None,
                reason: "destroyed".to_string(),
            };
        }

        let (mut sink, mut stream) = ws.split();
        let mut info = CloseInfo::default();

        loop {
            tokio::select! {
                incoming = stream.next() => match incoming {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(reply) = self.on_text(text.as_str()) {
                            if let Err(e) = sink.send(Message::text(reply)).await {
                                debug!("Failed to reply to {}: {}", self.url, e);
                                info.reason = e.to_string();
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        debug!("Received close frame from {}", self.url);
                        if let Some(frame) = frame {
                            info.code = Some(u16::from(frame.code));
                            info.reason = frame.reason.to_string();
                        }
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        match e {
                            WsError::ConnectionClosed | WsError::AlreadyClosed => {
                                debug!("Connection {} closed", self.url);
                            }
                            other => {
                                info.reason = other.to_string();
                                self.on_error(LinkError::Transport(other.to_string()));
                            }
                        }
                        break;
                    }
                    None => {
                        debug!("Connection {} stream ended", self.url);
                        break;
                    }
                },
                queued = outbound.recv() => match queued {
                    Some(Outbound::Text(text)) => {
                        if let Err(e) = sink.send(Message::text(text)).await {
                            info.reason = e.to_string();
                            self.on_error(LinkError::Transport(e.to_string()));
                            break;
                        }
                    }
                    Some(Outbound::Close { code, reason }) => {
                        let frame = CloseFrame {
                            code: CloseCode::from(code),
                            reason: reason.clone().into(),
                        };
                        let _ = sink.send(Message::Close(Some(frame))).await;
                        info.code = Some(code);
                        info.reason = reason;
                        break;
                    }
                    Some(Outbound::Terminate) | None => {
                        info.reason = "terminated".to_string();
                        break;
                    }
                },
            }
        }

        info
    }
}

/// Attempt, run, back off, repeat until the state machine says stop.
async fn drive(shared: Arc<MemberShared>) {
    loop {
        let info = shared.run_session().await;
        match shared.on_close(info) {
            CloseOutcome::Retry { delay, .. } => tokio::time::sleep(delay).await,
            CloseOutcome::GaveUp { .. } | CloseOutcome::Terminal => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;

    #[test]
    fn test_build_url_appends_parameters() {
        let mut config = MemberConfig::new("ws://127.0.0.1:9000/");
        config.parameters.insert("key".into(), "secret".into());
        config.parameters.insert("room".into(), "a b".into());

        let url = build_url(&config).unwrap();
        assert_eq!(url.as_str(), "ws://127.0.0.1:9000/?key=secret&room=a+b");
    }

    #[test]
    fn test_build_url_without_parameters() {
        let config = MemberConfig::new("ws://127.0.0.1:9000/");
        assert_eq!(build_url(&config).unwrap().as_str(), "ws://127.0.0.1:9000/");
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        assert!(Member::new(MemberConfig::new("http://127.0.0.1:9000")).is_err());
    }

    #[test]
    fn test_ready_before_connect_is_usage_error() {
        let member = Member::new(MemberConfig::new("ws://127.0.0.1:9000")).unwrap();
        assert_eq!(
            member.ready().now_or_never(),
            Some(Err(LinkError::NotConnecting))
        );
        assert!(!member.is_connected());
        assert!(!member.is_in_flight());
    }

    #[test]
    fn test_connect_outside_runtime_fails_without_state_change() {
        let member = Member::new(MemberConfig::new("ws://127.0.0.1:9000")).unwrap();

        assert!(matches!(
            member.connect().now_or_never(),
            Some(Err(LinkError::Transport(_)))
        ));
        assert!(!member.is_in_flight());
        assert_eq!(
            member.ready().now_or_never(),
            Some(Err(LinkError::NotConnecting))
        );
    }

    #[test]
    fn test_send_while_disconnected() {
        let member = Member::new(MemberConfig::new("ws://127.0.0.1:9000")).unwrap();
        assert_eq!(member.send("hello"), Err(LinkError::NotConnected));
    }

    #[test]
    fn test_destroy_before_connect() {
        let member = Member::new(MemberConfig::new("ws://127.0.0.1:9000")).unwrap();
        member.destroy();
        member.destroy();

        assert_eq!(
            member.connect().now_or_never(),
            Some(Err(LinkError::Destroyed))
        );
        assert_eq!(
            member.ready().now_or_never(),
            Some(Err(LinkError::Destroyed))
        );
    }

    #[test]
    fn test_rejection_maps_http_status() {
        let response = tokio_tungstenite::tungstenite::http::Response::builder()
            .status(403)
            .body(None)
            .unwrap();
        assert_eq!(
            connect_error(WsError::Http(response)),
            LinkError::Rejected { status: 403 }
        );
        assert!(matches!(
            connect_error(WsError::ConnectionClosed),
            LinkError::Transport(_)
        ));
    }

    #[test]
    fn test_default_heartbeat_duration() {
        let member = Member::new(MemberConfig::new("ws://127.0.0.1:9000")).unwrap();
        assert_eq!(member.heartbeat_duration_ms(), 30_000);
    }
}

//! heartline-core: connection-lifecycle protocol shared by hubs and members.
//!
//! This crate provides the runtime-independent pieces:
//! - Heartbeat control tokens and inbound frame classification
//! - Hub-side liveness tracking with strike-based eviction
//! - Upgrade gate (parameter match + async auth predicate)
//! - Member-side reconnect state machine, readiness waiters and watchdog
//!
//! State machines take `now_ms` arguments and return actions; sockets,
//! timers and tasks live in `heartline-daemon`.

pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod gate;
pub mod protocol;
pub mod readiness;
pub mod reconnect;
pub mod tracker;
pub mod watchdog;

pub use config::{
    AuthConfig, HeartbeatConfig, HubConfig, MemberConfig, ReconnectConfig, WatchdogConfig,
};
pub use error::{ConfigError, LinkError, REJECTION_STATUS};
pub use events::{EventBus, HubEvent, MemberEvent, Subscription};
pub use gate::{auth_fn, AuthHandler, GateDecision, RejectReason, UpgradeGate, UpgradeRequest};
pub use protocol::{classify, ControlMessage, Inbound};
pub use readiness::{Ready, ReadinessQueue};
pub use reconnect::{CloseOutcome, ConnectDecision, ErrorOutcome, Phase, Readiness, ReconnectMachine};
pub use tracker::{Connection, ConnectionId, LivenessTracker, TrackerAction};
pub use watchdog::HeartbeatWatch;

//! Member-side reconnect state machine.
//!
//! Pure transitions only. The runtime reports transport events (open, close,
//! error) and acts on the returned outcomes: schedule a retry, flush readiness
//! waiters, or stop for good.
//!
//! ```text
//! Idle ──connect──▶ InFlight ──open──▶ Connected
//!                     ▲  │                 │
//!                     │  └─────close───────┤
//!                     └──retry (budget)────┘
//!       InFlight/Connected ──close, no budget──▶ Closed
//!       any ──403──▶ Fatal      any ──destroy──▶ Destroyed
//! ```

use std::time::Duration;

use crate::config::ReconnectConfig;
use crate::error::LinkError;

/// Lifecycle phase. `Connected` and `InFlight` are distinct variants, so a
/// member is never both.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Phase {
    /// `connect()` has never been called
    Idle,
    /// An attempt is open or a retry is scheduled
    InFlight,
    Connected,
    /// Reconnect budget ran out after `attempts` retries
    Closed { attempts: u32 },
    /// Upgrade rejected; terminal
    Fatal(LinkError),
    Destroyed,
}

/// What `connect()` should do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectDecision {
    /// Open a new attempt
    Start,
    AlreadyInFlight,
    AlreadyConnected,
    /// Fail fast without touching the network
    Fail(LinkError),
}

/// What to do after the transport closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseOutcome {
    /// Try again after `delay`
    Retry { attempt: u32, delay: Duration },
    /// Budget exhausted; fail queued waiters with `Exhausted`
    GaveUp { attempts: u32 },
    /// Fatal or destroyed; waiters were already flushed
    Terminal,
}

/// Classification of a transport error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorOutcome {
    /// Lifecycle ended; fail all waiters with this error
    Fatal(LinkError),
    /// Report on the error channel, state unchanged
    Surface,
}

/// Immediate answer to `ready()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    Failed(LinkError),
    /// Queue a waiter until the next flush
    Wait,
}

/// Reconnect bookkeeping for one member.
#[derive(Debug, Clone)]
pub struct ReconnectMachine {
    config: ReconnectConfig,
    phase: Phase,
    reconnect_attempts: u32,
    /// Set by fatal errors and `destroy()`: no close will schedule a retry
    retry_disabled: bool,
}

impl ReconnectMachine {
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            config,
            phase: Phase::Idle,
            reconnect_attempts: 0,
            retry_disabled: false,
        }
    }

    pub fn phase(&self) -> &Phase {
        &self.phase
    }

    pub fn is_connected(&self) -> bool {
        self.phase == Phase::Connected
    }

    pub fn is_in_flight(&self) -> bool {
        self.phase == Phase::InFlight
    }

    pub fn fatal_error(&self) -> Option<&LinkError> {
        match &self.phase {
            Phase::Fatal(e) => Some(e),
            _ => None,
        }
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts
    }

    pub fn retry_disabled(&self) -> bool {
        self.retry_disabled
    }

    /// Caller wants a connection.
    pub fn connect(&mut self) -> ConnectDecision {
        match &self.phase {
            Phase::InFlight => ConnectDecision::AlreadyInFlight,
            Phase::Connected => ConnectDecision::AlreadyConnected,
            Phase::Fatal(e) => ConnectDecision::Fail(e.clone()),
            Phase::Destroyed => ConnectDecision::Fail(LinkError::Destroyed),
            Phase::Idle | Phase::Closed { .. } => {
                self.phase = Phase::InFlight;
                self.reconnect_attempts = 0;
                ConnectDecision::Start
            }
        }
    }

    /// Transport opened. Returns false if the member was destroyed (or went
    /// fatal) meanwhile and the new socket must be dropped.
    pub fn on_open(&mut self) -> bool {
        match self.phase {
            Phase::Destroyed | Phase::Fatal(_) => false,
            _ => {
                self.phase = Phase::Connected;
                self.reconnect_attempts = 0;
                true
            }
        }
    }

    /// Transport closed, for any reason (including a failed attempt).
    pub fn on_close(&mut self) -> CloseOutcome {
        match self.phase {
            Phase::Fatal(_) | Phase::Destroyed => return CloseOutcome::Terminal,
            Phase::Idle | Phase::Closed { .. } => return CloseOutcome::Terminal,
            Phase::InFlight | Phase::Connected => {}
        }

        let within_budget = self
            .config
            .max_attempts
            .map(|max| self.reconnect_attempts < max)
            .unwrap_or(true);

        if !self.retry_disabled && within_budget {
            self.reconnect_attempts += 1;
            self.phase = Phase::InFlight;
            CloseOutcome::Retry {
                attempt: self.reconnect_attempts,
                delay: self.config.interval(),
            }
        } else {
            self.phase = Phase::Closed {
                attempts: self.reconnect_attempts,
            };
            CloseOutcome::GaveUp {
                attempts: self.reconnect_attempts,
            }
        }
    }

    /// Transport reported an error. Only an upgrade rejection is fatal.
    pub fn on_error(&mut self, error: &LinkError) -> ErrorOutcome {
        if self.phase == Phase::Destroyed {
            return ErrorOutcome::Surface;
        }
        if !error.is_fatal() {
            return ErrorOutcome::Surface;
        }
        self.phase = Phase::Fatal(error.clone());
        self.retry_disabled = true;
        ErrorOutcome::Fatal(error.clone())
    }

    /// Answer a `ready()` call without waiting.
    pub fn readiness(&self) -> Readiness {
        match &self.phase {
            Phase::Connected => Readiness::Ready,
            Phase::InFlight => Readiness::Wait,
            Phase::Fatal(e) => Readiness::Failed(e.clone()),
            Phase::Destroyed => Readiness::Failed(LinkError::Destroyed),
            Phase::Closed { attempts } => {
                Readiness::Failed(LinkError::Exhausted { attempts: *attempts })
            }
            Phase::Idle => Readiness::Failed(LinkError::NotConnecting),
        }
    }

    /// Shut down for good. Returns false if already destroyed.
    pub fn destroy(&mut self) -> bool {
        if self.phase == Phase::Destroyed {
            return false;
        }
        self.phase = Phase::Destroyed;
        self.retry_disabled = true;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine(max_attempts: Option<u32>) -> ReconnectMachine {
        ReconnectMachine::new(ReconnectConfig {
            interval_ms: 50,
            max_attempts,
        })
    }

    fn rejected() -> LinkError {
        LinkError::Rejected { status: 403 }
    }

    // ==================== connect ====================

    #[test]
    fn test_new_machine_is_idle() {
        let m = machine(Some(3));
        assert_eq!(m.phase(), &Phase::Idle);
        assert!(!m.is_connected());
        assert!(!m.is_in_flight());
        assert_eq!(m.readiness(), Readiness::Failed(LinkError::NotConnecting));
    }

    #[test]
    fn test_connect_is_single_flight() {
        let mut m = machine(Some(3));
        assert_eq!(m.connect(), ConnectDecision::Start);
        assert_eq!(m.connect(), ConnectDecision::AlreadyInFlight);
        assert!(m.is_in_flight());
        assert_eq!(m.readiness(), Readiness::Wait);
    }

    #[test]
    fn test_open_resets_attempts() {
        let mut m = machine(Some(3));
        m.connect();
        m.on_close();
        m.on_close();
        assert_eq!(m.reconnect_attempts(), 2);

        assert!(m.on_open());
        assert!(m.is_connected());
        assert!(!m.is_in_flight());
        assert_eq!(m.reconnect_attempts(), 0);
        assert_eq!(m.readiness(), Readiness::Ready);
        assert_eq!(m.connect(), ConnectDecision::AlreadyConnected);
    }

    // ==================== close / retry ====================

    #[test]
    fn test_close_schedules_retry() {
        let mut m = machine(Some(3));
        m.connect();
        m.on_open();

        let outcome = m.on_close();

        assert_eq!(
            outcome,
            CloseOutcome::Retry {
                attempt: 1,
                delay: Duration::from_millis(50)
            }
        );
        assert!(!m.is_connected());
        assert!(m.is_in_flight());
        assert_eq!(m.readiness(), Readiness::Wait);
    }

    #[test]
    fn test_retries_stop_at_max_attempts() {
        let mut m = machine(Some(3));
        m.connect();

        for attempt in 1..=3 {
            assert!(matches!(m.on_close(), CloseOutcome::Retry { attempt: a, .. } if a == attempt));
        }
        assert_eq!(m.on_close(), CloseOutcome::GaveUp { attempts: 3 });
        assert_eq!(m.phase(), &Phase::Closed { attempts: 3 });
        assert_eq!(
            m.readiness(),
            Readiness::Failed(LinkError::Exhausted { attempts: 3 })
        );

        // Nothing more happens on stray closes
        assert_eq!(m.on_close(), CloseOutcome::Terminal);
        assert_eq!(m.reconnect_attempts(), 3);
    }

    #[test]
    fn test_zero_budget_gives_up_immediately() {
        let mut m = machine(Some(0));
        m.connect();
        assert_eq!(m.on_close(), CloseOutcome::GaveUp { attempts: 0 });
    }

    #[test]
    fn test_unbounded_budget_keeps_retrying() {
        let mut m = machine(None);
        m.connect();
        for attempt in 1..=1000 {
            assert!(matches!(m.on_close(), CloseOutcome::Retry { attempt: a, .. } if a == attempt));
        }
    }

    #[test]
    fn test_connect_after_exhaustion_starts_fresh() {
        let mut m = machine(Some(1));
        m.connect();
        m.on_close();
        m.on_close();

        assert_eq!(m.connect(), ConnectDecision::Start);
        assert_eq!(m.reconnect_attempts(), 0);
        assert!(m.is_in_flight());
    }

    // ==================== errors ====================

    #[test]
    fn test_rejection_is_fatal() {
        let mut m = machine(Some(10));
        m.connect();

        assert_eq!(m.on_error(&rejected()), ErrorOutcome::Fatal(rejected()));
        assert_eq!(m.fatal_error(), Some(&rejected()));
        assert!(m.retry_disabled());
        assert!(!m.is_in_flight());
        assert!(!m.is_connected());
    }

    #[test]
    fn test_fatal_blocks_all_future_retries_and_connects() {
        let mut m = machine(None);
        m.connect();
        m.on_error(&rejected());

        for _ in 0..5 {
            assert_eq!(m.on_close(), CloseOutcome::Terminal);
        }
        assert_eq!(m.connect(), ConnectDecision::Fail(rejected()));
        assert_eq!(m.readiness(), Readiness::Failed(rejected()));
    }

    #[test]
    fn test_other_errors_do_not_change_state() {
        let mut m = machine(Some(3));
        m.connect();
        m.on_open();

        let outcome = m.on_error(&LinkError::Transport("connection reset".into()));

        assert_eq!(outcome, ErrorOutcome::Surface);
        assert!(m.is_connected());
        assert!(!m.retry_disabled());
    }

    #[test]
    fn test_non_403_rejection_status_is_not_fatal() {
        let mut m = machine(Some(3));
        m.connect();
        assert_eq!(
            m.on_error(&LinkError::Rejected { status: 500 }),
            ErrorOutcome::Surface
        );
        assert!(m.fatal_error().is_none());
    }

    // ==================== destroy ====================

    #[test]
    fn test_destroy_is_terminal_and_idempotent() {
        let mut m = machine(None);
        m.connect();
        m.on_open();

        assert!(m.destroy());
        assert!(!m.destroy());

        assert_eq!(m.on_close(), CloseOutcome::Terminal);
        assert!(!m.on_open());
        assert_eq!(m.connect(), ConnectDecision::Fail(LinkError::Destroyed));
        assert_eq!(m.readiness(), Readiness::Failed(LinkError::Destroyed));
    }
}

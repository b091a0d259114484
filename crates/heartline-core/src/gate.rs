//! Upgrade gate: decides whether a pending upgrade becomes a tracked
//! connection.
//!
//! The cheap parameter comparison always runs before the (possibly slow)
//! async handler.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use crate::tracker::{Connection, ConnectionId};

/// What the gate sees of a pending upgrade request.
#[derive(Debug, Clone, Default)]
pub struct UpgradeRequest {
    /// Request path, e.g. `/`
    pub path: String,
    /// Remote socket address, if known
    pub remote_address: Option<String>,
    /// Parsed query parameters
    pub parameters: HashMap<String, String>,
}

/// Async authentication predicate.
///
/// Only `Ok(true)` lets the upgrade through.
#[async_trait]
pub trait AuthHandler: Send + Sync {
    async fn authorize(&self, request: &UpgradeRequest) -> anyhow::Result<bool>;
}

/// Adapts an async closure into an [`AuthHandler`].
pub struct FnAuthHandler<F>(F);

/// Build an [`AuthHandler`] from an async closure taking the request.
pub fn auth_fn<F, Fut>(f: F) -> FnAuthHandler<F>
where
    F: Fn(UpgradeRequest) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<bool>> + Send,
{
    FnAuthHandler(f)
}

#[async_trait]
impl<F, Fut> AuthHandler for FnAuthHandler<F>
where
    F: Fn(UpgradeRequest) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<bool>> + Send,
{
    async fn authorize(&self, request: &UpgradeRequest) -> anyhow::Result<bool> {
        (self.0)(request.clone()).await
    }
}

/// Why an upgrade was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    MissingParameter { key: String },
    ParameterMismatch { key: String },
    HandlerDenied,
    HandlerFailed(String),
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectReason::MissingParameter { key } => write!(f, "missing parameter '{}'", key),
            RejectReason::ParameterMismatch { key } => {
                write!(f, "parameter '{}' does not match", key)
            }
            RejectReason::HandlerDenied => write!(f, "auth handler denied the request"),
            RejectReason::HandlerFailed(e) => write!(f, "auth handler failed: {}", e),
        }
    }
}

/// Gate outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    Accept,
    Reject(RejectReason),
}

/// Parameter requirement plus optional async predicate.
#[derive(Clone, Default)]
pub struct UpgradeGate {
    parameters: Option<HashMap<String, String>>,
    handler: Option<Arc<dyn AuthHandler>>,
}

impl UpgradeGate {
    pub fn new(parameters: Option<HashMap<String, String>>) -> Self {
        Self {
            parameters,
            handler: None,
        }
    }

    pub fn with_handler(mut self, handler: Arc<dyn AuthHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Check the configured parameters only.
    pub fn check_parameters(&self, request: &UpgradeRequest) -> GateDecision {
        let Some(required) = &self.parameters else {
            return GateDecision::Accept;
        };

        // Sorted for a deterministic rejection reason
        let mut keys: Vec<_> = required.keys().collect();
        keys.sort();

        for key in keys {
            match request.parameters.get(key) {
                None => {
                    return GateDecision::Reject(RejectReason::MissingParameter {
                        key: key.clone(),
                    });
                }
                Some(value) if value != &required[key] => {
                    return GateDecision::Reject(RejectReason::ParameterMismatch {
                        key: key.clone(),
                    });
                }
                Some(_) => {}
            }
        }

        GateDecision::Accept
    }

    /// Run the full gate. Never fails: handler errors become rejections.
    pub async fn evaluate(&self, request: &UpgradeRequest) -> GateDecision {
        if let GateDecision::Reject(reason) = self.check_parameters(request) {
            return GateDecision::Reject(reason);
        }

        let Some(handler) = &self.handler else {
            return GateDecision::Accept;
        };

        match handler.authorize(request).await {
            Ok(true) => GateDecision::Accept,
            Ok(false) => GateDecision::Reject(RejectReason::HandlerDenied),
            Err(e) => GateDecision::Reject(RejectReason::HandlerFailed(e.to_string())),
        }
    }

    /// Initial connection state for an accepted request.
    pub fn admit(&self, request: UpgradeRequest, now_ms: u64) -> Connection {
        Connection::new(
            ConnectionId::generate(),
            request.remote_address,
            request.parameters,
            now_ms,
        )
    }
}

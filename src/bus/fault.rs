//! Single-slot fault register and health signal.

use std::fmt;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

/// An unexpected internal failure worth an operator's attention.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fault {
    /// component that hit the failure, e.g. `pipeline` or `bus`
    pub origin: String,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.at.to_rfc3339(), self.origin, self.message)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Unhealthy(Fault),
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }
}

/// Holds the most recent fault until a health check collects it.
#[derive(Debug, Default)]
pub struct FaultRegister {
    slot: Mutex<Option<Fault>>,
}

impl FaultRegister {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a fault, replacing one that was not collected yet.
    pub fn record(&self, origin: &str, message: impl Into<String>) {
        let fault = Fault {
            origin: origin.to_string(),
            message: message.into(),
            at: Utc::now(),
        };
        tracing::error!(origin = %fault.origin, message = %fault.message, "repository fault");
        *self.slot.lock() = Some(fault);
    }

    /// take the pending fault, leaving the slot empty
    pub fn take(&self) -> Option<Fault> {
        self.slot.lock().take()
    }

    pub fn is_empty(&self) -> bool {
        self.slot.lock().is_none()
    }

    /// Read and clear: each fault makes exactly one check unhealthy.
    pub fn check(&self) -> HealthStatus {
        match self.take() {
            Some(fault) => HealthStatus::Unhealthy(fault),
            None => HealthStatus::Healthy,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unhealthy_exactly_once() {
        let register = FaultRegister::new();
        assert!(register.check().is_healthy());

        register.record("pipeline", "failed to delete staging ref");
        match register.check() {
            HealthStatus::Unhealthy(fault) => {
                assert_eq!(fault.origin, "pipeline");
                assert!(fault.to_string().contains("failed to delete staging ref"));
            }
            HealthStatus::Healthy => panic!("fault was not reported"),
        }
        assert!(register.check().is_healthy());
    }

    #[test]
    fn test_latest_fault_wins() {
        let register = FaultRegister::new();
        register.record("a", "first");
        register.record("b", "second");
        assert_eq!(register.take().unwrap().message, "second");
        assert!(register.is_empty());
    }
}

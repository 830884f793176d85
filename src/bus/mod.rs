//! Fault and notification bus.
//!
//! After the pipeline moves refs it tells the bus, which forwards the event
//! to the per-branch caches. Unexpected failures anywhere on the write path
//! land in the [`FaultRegister`], which the health check drains.

mod fault;
mod notify;

pub use fault::{Fault, FaultRegister, HealthStatus};
pub use notify::{NotificationBus, RefChange, RefListener, RefsChanged};

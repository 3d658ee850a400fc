//! Session delivery and reconciliation services.
//!
//! The [`DrillEngine`] wires everything together: the session manager
//! starts and stops drills, the delivery coordinator pushes questions out
//! as channel polls, and the callback reconciler resolves answers and
//! elapsed deadlines against pending responses exactly once.

#![forbid(unsafe_code)]

pub mod catalog;
pub mod channel;
pub mod config;
pub mod delivery;
pub mod engine;
pub mod error;
pub mod flow;
pub mod planner;
pub mod reconciler;
pub mod registry;
pub mod retry;
pub mod session_manager;
pub mod timeout;

#[cfg(test)]
mod test_support;

pub use catalog::QuestionCatalog;
pub use channel::{ChannelError, NotificationSink, PollChannel};
pub use config::{EngineConfig, RetryPolicy};
pub use delivery::DeliveryCoordinator;
pub use drill_core::Clock;
pub use engine::DrillEngine;
pub use error::{DeliveryError, EngineError, ReconcileError, SessionError};
pub use flow::SessionFlow;
pub use reconciler::{CallbackReconciler, Resolution};
pub use registry::PollRegistry;
pub use retry::RetryExecutor;
pub use session_manager::{SessionManager, SessionProgress};
pub use timeout::{DeadlineHandler, TimeoutScheduler};

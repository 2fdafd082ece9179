//! Control plane core: function registry, admission-controlled invocation
//! queue, execution correlation store, backend dispatchers and the
//! concurrency controller.

use std::fmt::Display;

use thiserror::Error;

pub mod dispatch;
pub mod estimator;
pub mod idempotency;
pub mod plane;
pub mod queue;
pub mod registry;
pub mod resolver;
pub mod scaling;
pub mod scheduler;
pub mod service;
pub mod store;
pub mod sync_queue;
pub mod task;

pub use nimbus_common as common;

/// Why an invocation was turned away at the door.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// Per-function queue depth hit the configured ceiling.
    Depth,
    /// Predicted wait exceeded the admission limit.
    EstWait,
    /// The caller's wait ended with a queue timeout.
    Timeout,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::Depth => "depth",
            RejectReason::EstWait => "est_wait",
            RejectReason::Timeout => "timeout",
        }
    }
}

impl Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Function not found: {0}")]
    FunctionNotFound(String),

    #[error("Function already registered: {0}")]
    FunctionExists(String),

    #[error("Duplicate execution id: {0}")]
    DuplicateExecution(String),

    #[error("Invocation rejected ({reason}), retry after {retry_after_seconds}s")]
    Rejected {
        reason: RejectReason,
        retry_after_seconds: u32,
    },

    #[error(transparent)]
    Common(#[from] nimbus_common::NimbusError),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn rejected(reason: RejectReason, retry_after_seconds: u32) -> Self {
        Error::Rejected {
            reason,
            retry_after_seconds,
        }
    }
}

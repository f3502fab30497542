//! Error taxonomy for the runtime core.
//!
//! User-visible failures travel as `Error`-kind messages; these values are
//! the internal currency that produces them. The core never unwinds across
//! the dispatch boundary.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuntimeError {
    /// Receiver id does not resolve to a live service.
    #[error("unknown service {0:#010x}")]
    UnknownService(u32),

    /// Receiver id resolves to a worker whose thread has already exited.
    #[error("worker {0} is not accepting messages")]
    WorkerGone(u32),

    /// Service id encodes a worker index outside the configured pool.
    #[error("invalid worker index {0}")]
    InvalidWorker(u32),

    /// Mailbox occupancy reached the hard limit; the message was dropped.
    #[error("mailbox of worker {worker} full ({len} >= {hard})")]
    QueueFull { worker: u32, len: usize, hard: usize },

    /// Unique name already registered to another service.
    #[error("unique service name '{0}' already registered")]
    NameTaken(String),

    /// No factory registered for the requested service type.
    #[error("unknown service type '{0}'")]
    UnknownServiceType(String),

    /// Service `init` reported failure; creation was aborted.
    #[error("service init failed: {0}")]
    InitFailed(String),

    /// Creation request reached a worker that is shutting down.
    #[error("worker {0} is stopping, creation refused")]
    Stopping(u32),

    /// Prefab id not registered on the sending worker.
    #[error("unknown prefab {0}")]
    UnknownPrefab(u32),

    /// Administrative command not in the built-in set.
    #[error("unknown command '{0}'")]
    UnknownCommand(String),

    /// Rejected configuration value.
    #[error("invalid config: {0}")]
    InvalidConfig(String),
}

impl RuntimeError {
    /// Routing failures answer the sender with an `Error`-kind reply when a
    /// session is pending, and are otherwise dropped with a warning.
    pub fn is_routing(&self) -> bool {
        matches!(
            self,
            RuntimeError::UnknownService(_)
                | RuntimeError::WorkerGone(_)
                | RuntimeError::InvalidWorker(_)
                | RuntimeError::QueueFull { .. }
        )
    }

    /// Creation failures reply to the requester with service id 0.
    pub fn is_creation(&self) -> bool {
        matches!(
            self,
            RuntimeError::NameTaken(_)
                | RuntimeError::UnknownServiceType(_)
                | RuntimeError::InitFailed(_)
                | RuntimeError::Stopping(_)
        )
    }

    pub fn init_failed(msg: impl Into<String>) -> Self {
        RuntimeError::InitFailed(msg.into())
    }

    pub fn invalid_config(msg: impl Into<String>) -> Self {
        RuntimeError::InvalidConfig(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, RuntimeError>;

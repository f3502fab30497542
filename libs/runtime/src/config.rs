//! Runtime configuration.
//!
//! Deserializable from TOML so embedders can ship a config file next to the
//! binary; every field has a default suitable for tests.

use serde::{Deserialize, Serialize};

use crate::error::{Result, RuntimeError};

/// Mailbox occupancy limits.
///
/// Crossing `soft` logs a warning once per crossing; at `hard` new messages
/// are dropped and the sender sees routing-error behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct MailboxLimits {
    pub soft: usize,
    pub hard: usize,
}

impl Default for MailboxLimits {
    fn default() -> Self {
        Self { soft: 8192, hard: 65536 }
    }
}

/// Top-level runtime configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Number of worker threads. Normalised to at least 1.
    pub workers: u32,

    /// Mailbox occupancy limits applied to every worker.
    pub mailbox: MailboxLimits,

    /// Maximum messages a worker drains per loop iteration.
    pub batch_quantum: usize,

    /// How long a stopping worker keeps draining its mailbox before exiting.
    pub graceful_drain_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            mailbox: MailboxLimits::default(),
            batch_quantum: 256,
            graceful_drain_ms: 5000,
        }
    }
}

impl RuntimeConfig {
    /// Parse from a TOML string.
    pub fn from_toml(s: &str) -> Result<Self> {
        let cfg: RuntimeConfig =
            toml::from_str(s).map_err(|e| RuntimeError::invalid_config(e.to_string()))?;
        cfg.validated()
    }

    /// Normalise and reject inconsistent values.
    pub fn validated(mut self) -> Result<Self> {
        if self.workers == 0 {
            self.workers = 1;
        }
        if self.workers > crate::message::MAX_WORKERS {
            return Err(RuntimeError::invalid_config(format!(
                "workers {} exceeds addressable maximum {}",
                self.workers,
                crate::message::MAX_WORKERS
            )));
        }
        if self.mailbox.soft > self.mailbox.hard {
            return Err(RuntimeError::invalid_config(format!(
                "mailbox soft limit {} exceeds hard limit {}",
                self.mailbox.soft, self.mailbox.hard
            )));
        }
        if self.batch_quantum == 0 {
            self.batch_quantum = 1;
        }
        Ok(self)
    }
}

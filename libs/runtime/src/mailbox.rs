//! Per-worker MPSC mailbox.
//!
//! Producers are any thread (services, timers, the I/O reactor, the server
//! tick); the owning worker is the sole consumer. Messages enqueued by one
//! producer keep their relative order; there is no cross-producer ordering.
//! Lifecycle commands travel through the same queue as [`Control`] envelopes
//! so they stay FIFO with the traffic that precedes them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};

use crate::config::MailboxLimits;
use crate::error::{Result, RuntimeError};
use crate::message::Message;

/// Queue item: ordinary traffic or a lifecycle command.
#[derive(Debug)]
pub enum Envelope {
    Post(Message),
    Control(Control),
}

/// Lifecycle commands addressed to a worker, never visible to handlers.
#[derive(Debug)]
pub enum Control {
    Create(CreateService),
    Remove {
        id: u32,
        requester: u32,
        session: i32,
    },
    Stop {
        graceful: bool,
    },
    /// Master tick: advance timers, poll the reactor, refresh counters.
    Tick {
        now_ms: i64,
    },
}

/// Parameters of a service creation request.
#[derive(Debug, Clone)]
pub struct CreateService {
    /// Factory type name.
    pub kind: String,
    /// Opaque config string handed to `Service::init`.
    pub config: String,
    /// Display name; also the unique name when `unique` is set.
    pub name: String,
    pub unique: bool,
    pub requester: u32,
    pub session: i32,
}

struct Shared {
    worker: u32,
    limits: MailboxLimits,
    soft_warned: AtomicBool,
}

/// Producer half. Cheap to clone; shared by every thread that can address
/// the worker.
#[derive(Clone)]
pub struct MailboxSender {
    tx: Sender<Envelope>,
    shared: Arc<Shared>,
}

impl MailboxSender {
    /// Enqueue a user message, enforcing the occupancy limits.
    pub fn push(&self, msg: Message) -> Result<()> {
        let len = self.tx.len();
        if len >= self.shared.limits.hard {
            return Err(RuntimeError::QueueFull {
                worker: self.shared.worker,
                len,
                hard: self.shared.limits.hard,
            });
        }
        if len >= self.shared.limits.soft {
            if !self.shared.soft_warned.swap(true, Ordering::Relaxed) {
                tracing::warn!(
                    worker = self.shared.worker,
                    len,
                    soft = self.shared.limits.soft,
                    "mailbox past soft limit"
                );
            }
        } else {
            self.shared.soft_warned.store(false, Ordering::Relaxed);
        }
        self.tx
            .send(Envelope::Post(msg))
            .map_err(|_| RuntimeError::WorkerGone(self.shared.worker))
    }

    /// Enqueue a lifecycle command. Not subject to occupancy limits: a full
    /// queue must not block shutdown.
    pub fn push_control(&self, ctl: Control) -> Result<()> {
        self.tx
            .send(Envelope::Control(ctl))
            .map_err(|_| RuntimeError::WorkerGone(self.shared.worker))
    }

    pub fn len(&self) -> usize {
        self.tx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }
}

/// Consumer half, owned by the worker thread.
pub struct Mailbox {
    rx: Receiver<Envelope>,
}

impl Mailbox {
    /// Block up to `timeout` for the next envelope.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<Envelope> {
        self.rx.recv_timeout(timeout).ok()
    }

    /// Move up to `max` already-queued envelopes into `buf` without
    /// blocking. Returns the number drained.
    pub fn drain_into(&self, buf: &mut Vec<Envelope>, max: usize) -> usize {
        let mut n = 0;
        while n < max {
            match self.rx.try_recv() {
                Ok(env) => {
                    buf.push(env);
                    n += 1;
                }
                Err(_) => break,
            }
        }
        n
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

/// Build a mailbox pair for the given worker.
pub fn mailbox(worker: u32, limits: MailboxLimits) -> (MailboxSender, Mailbox) {
    let (tx, rx) = crossbeam_channel::unbounded();
    let sender = MailboxSender {
        tx,
        shared: Arc::new(Shared {
            worker,
            limits,
            soft_warned: AtomicBool::new(false),
        }),
    };
    (sender, Mailbox { rx })
}

//! Per-worker timer facility.
//!
//! Owned by the worker thread and advanced on the server's master tick.
//! Each expiration synthesises a `Timer`-kind message carrying the timer id
//! in the session field, addressed to the owning service. The original used
//! a hierarchical wheel; a deadline heap keeps the same observable
//! behaviour at this scale.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

use crate::message::{Message, MessageKind};

/// Worker-local timer id, never zero.
pub type TimerId = u32;

#[derive(Debug)]
struct TimerEntry {
    interval_ms: i64,
    /// Remaining firings; 0 means repeat until removed.
    remaining: u32,
    owner: u32,
}

#[derive(Default)]
pub struct TimerWheel {
    next_id: TimerId,
    entries: HashMap<TimerId, TimerEntry>,
    // Lazily pruned: removed timers are skipped when their deadline pops.
    deadlines: BinaryHeap<Reverse<(i64, TimerId)>>,
}

impl TimerWheel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule a timer firing every `interval_ms` for `times` firings
    /// (0 = until removed). Intervals are clamped to at least 1 ms.
    pub fn repeat(&mut self, interval_ms: i64, times: u32, owner: u32, now_ms: i64) -> TimerId {
        let interval_ms = interval_ms.max(1);
        let id = self.alloc_id();
        self.entries.insert(
            id,
            TimerEntry {
                interval_ms,
                remaining: times,
                owner,
            },
        );
        self.deadlines.push(Reverse((now_ms + interval_ms, id)));
        id
    }

    /// Remove a timer. Idempotent; unknown ids are a no-op. An expiration
    /// already emitted before removal is still delivered.
    pub fn remove(&mut self, id: TimerId) {
        self.entries.remove(&id);
    }

    /// Fire everything due at `now_ms`, emitting one message per
    /// expiration. Returns the number fired.
    pub fn advance(&mut self, now_ms: i64, mut emit: impl FnMut(Message)) -> usize {
        let mut fired = 0;
        while let Some(&Reverse((deadline, id))) = self.deadlines.peek() {
            if deadline > now_ms {
                break;
            }
            self.deadlines.pop();
            let Some(entry) = self.entries.get_mut(&id) else {
                continue; // removed since scheduling
            };
            let msg = Message::new(bytes::Bytes::new())
                .with_receiver(entry.owner)
                .with_session(id as i32)
                .with_kind(MessageKind::Timer);
            emit(msg);
            fired += 1;

            if entry.remaining == 1 {
                self.entries.remove(&id);
            } else {
                if entry.remaining > 1 {
                    entry.remaining -= 1;
                }
                self.deadlines.push(Reverse((deadline + entry.interval_ms, id)));
            }
        }
        fired
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn alloc_id(&mut self) -> TimerId {
        loop {
            // Session fields are i32; keep ids in the positive range.
            self.next_id = if self.next_id >= i32::MAX as u32 {
                1
            } else {
                self.next_id + 1
            };
            if !self.entries.contains_key(&self.next_id) {
                return self.next_id;
            }
        }
    }
}

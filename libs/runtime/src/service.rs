//! Service contract and the capability surface handed to handlers.
//!
//! A service lives inside exactly one worker; its record is mutated only by
//! that worker's thread, so nothing here needs synchronisation. Handlers
//! run to completion: asynchrony is expressed by sending a message with a
//! positive session and later receiving the negated-session reply.

use bytes::Bytes;
use std::collections::HashMap;

use crate::error::{Result, RuntimeError};
use crate::message::{Message, MessageKind};
use crate::router::{NewService, Router};
use crate::timer::{TimerId, TimerWheel};

/// User-defined actor behaviour.
///
/// `init` runs once on the owning worker before any dispatch; returning an
/// error aborts creation. `dispatch` is invoked per message and must not
/// block; blocking I/O belongs to the reactor.
pub trait Service: Send {
    fn init(&mut self, ctx: &mut ServiceContext, config: &str) -> Result<()>;

    fn dispatch(&mut self, ctx: &mut ServiceContext, msg: &mut Message);
}

/// Worker-owned bookkeeping for one service.
pub(crate) struct ServiceMeta {
    pub id: u32,
    pub name: String,
    pub unique: bool,
    /// Live flag; a dead service no longer receives dispatches.
    pub ok: bool,
    /// Wall time spent inside `dispatch`, microseconds. Read resets.
    pub cpu_us: i64,
}

pub(crate) struct ServiceSlot {
    pub meta: ServiceMeta,
    pub handler: Box<dyn Service>,
}

/// A pre-assembled payload registered on the owning worker, reusable
/// across sends without copying the bytes.
#[derive(Debug, Clone)]
pub struct Prefab {
    pub payload: Bytes,
    pub header: String,
    pub kind: MessageKind,
}

/// Worker-local prefab table; ids are meaningful only on this worker.
#[derive(Default)]
pub(crate) struct PrefabStore {
    next: u32,
    slots: HashMap<u32, Prefab>,
}

impl PrefabStore {
    pub fn insert(&mut self, prefab: Prefab) -> u32 {
        self.next = self.next.wrapping_add(1).max(1);
        while self.slots.contains_key(&self.next) {
            self.next = self.next.wrapping_add(1).max(1);
        }
        self.slots.insert(self.next, prefab);
        self.next
    }

    pub fn get(&self, id: u32) -> Option<&Prefab> {
        self.slots.get(&id)
    }

    pub fn remove(&mut self, id: u32) {
        self.slots.remove(&id);
    }
}

/// Everything a handler may do, built per call on the owning worker
/// thread. Borrows are disjoint slices of the worker's state, which is why
/// a context never outlives a single `init`/`dispatch` invocation.
pub struct ServiceContext<'a> {
    pub(crate) meta: &'a mut ServiceMeta,
    pub(crate) router: &'a Router,
    pub(crate) timer: &'a mut TimerWheel,
    pub(crate) prefabs: &'a mut PrefabStore,
    pub(crate) worker_id: u32,
}

impl ServiceContext<'_> {
    pub fn id(&self) -> u32 {
        self.meta.id
    }

    pub fn name(&self) -> &str {
        &self.meta.name
    }

    pub fn worker_id(&self) -> u32 {
        self.worker_id
    }

    /// Cached server clock in epoch milliseconds.
    pub fn now(&self) -> i64 {
        self.router.now()
    }

    /// Spent dispatch time in microseconds; reading resets the accumulator.
    pub fn cpu_cost(&mut self) -> i64 {
        std::mem::take(&mut self.meta.cpu_us)
    }

    /// Send a message from this service. Delivery failures come back as
    /// `Error`-kind replies when `session > 0`, never as a return value.
    pub fn send(
        &self,
        receiver: u32,
        payload: impl Into<Bytes>,
        header: impl Into<String>,
        session: i32,
        kind: MessageKind,
    ) {
        self.router
            .send(self.meta.id, receiver, payload, header, session, kind);
    }

    /// Reply to a request: pass the negated session of the request being
    /// answered.
    pub fn respond(
        &self,
        receiver: u32,
        payload: impl Into<Bytes>,
        header: impl Into<String>,
        session: i32,
        kind: MessageKind,
    ) {
        self.router.respond(receiver, payload, header, session, kind);
    }

    /// Deliver a copy to every worker for local fan-out.
    pub fn broadcast(
        &self,
        payload: impl Into<Bytes>,
        header: impl Into<String>,
        kind: MessageKind,
    ) {
        self.router.broadcast(self.meta.id, payload, header, kind);
    }

    /// Register a reusable payload on this worker. Returns the prefab id.
    pub fn make_prefab(&mut self, payload: impl Into<Bytes>) -> u32 {
        self.prefabs.insert(Prefab {
            payload: payload.into(),
            header: String::new(),
            kind: MessageKind::Text,
        })
    }

    /// Register a prefab with a default header and kind.
    pub fn make_prefab_with(
        &mut self,
        payload: impl Into<Bytes>,
        header: impl Into<String>,
        kind: MessageKind,
    ) -> u32 {
        self.prefabs.insert(Prefab {
            payload: payload.into(),
            header: header.into(),
            kind,
        })
    }

    pub fn remove_prefab(&mut self, prefab: u32) {
        self.prefabs.remove(prefab);
    }

    /// Send a registered prefab. An empty `header` (resp. `Unknown` kind)
    /// falls back to the prefab's default.
    pub fn send_prefab(
        &self,
        receiver: u32,
        prefab: u32,
        header: impl Into<String>,
        session: i32,
        kind: MessageKind,
    ) -> Result<()> {
        let slot = self
            .prefabs
            .get(prefab)
            .ok_or(RuntimeError::UnknownPrefab(prefab))?;
        let header = {
            let h = header.into();
            if h.is_empty() { slot.header.clone() } else { h }
        };
        let kind = if kind == MessageKind::Unknown { slot.kind } else { kind };
        self.router
            .send(self.meta.id, receiver, slot.payload.clone(), header, session, kind);
        Ok(())
    }

    /// Schedule a repeating timer owned by this service; `times == 0`
    /// repeats until removed. Expirations arrive as `Timer`-kind messages
    /// with the timer id in the session field.
    pub fn repeat(&mut self, interval_ms: i64, times: u32) -> TimerId {
        let now = self.router.now();
        self.timer.repeat(interval_ms, times, self.meta.id, now)
    }

    pub fn remove_timer(&mut self, id: TimerId) {
        self.timer.remove(id);
    }

    /// Mark this service dead and ask the router to remove it.
    pub fn quit(&mut self) {
        self.meta.ok = false;
        self.router.remove_service(self.meta.id, 0, 0);
    }

    /// Request creation of another service; the reply (new id, or 0 on
    /// failure) is delivered to this service with the negated session.
    pub fn new_service(&self, req: NewService, worker_hint: u32, session: i32) {
        self.router.new_service(req, worker_hint, self.meta.id, session);
    }

    /// Request removal of another service.
    pub fn kill(&self, id: u32, session: i32) {
        self.router.remove_service(id, self.meta.id, session);
    }

    pub fn query_unique(&self, name: &str) -> u32 {
        self.router.query_unique(name)
    }

    pub fn set_env(&self, key: impl Into<String>, value: impl Into<String>) {
        self.router.set_env(key, value);
    }

    pub fn get_env(&self, key: &str) -> Option<String> {
        self.router.get_env(key)
    }

    /// Run a built-in administrative command; the reply arrives with the
    /// negated session.
    pub fn runcmd(&self, cmd: &str, session: i32) {
        self.router.runcmd(self.meta.id, cmd, session);
    }

    pub fn worker_info(&self, worker: u32) -> Option<String> {
        self.router.worker_info(worker)
    }

    pub fn service_count(&self) -> u32 {
        self.router.service_count()
    }

    /// Ask the server to shut down with the given code; negative codes
    /// abort without a graceful drain.
    pub fn shutdown(&self, code: i32) {
        self.router.shutdown(code);
    }
}

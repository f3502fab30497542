//! Process-wide directory and routing front door.
//!
//! Exactly one router exists per server; every component is parameterised
//! by a reference to it rather than a process global, so tests can host
//! several runtimes side by side. The router owns the unique-name map, the
//! environment map, the service factory map and the worker list; messages
//! and lifecycle commands all pass through here to reach a worker mailbox.

use bytes::Bytes;
use dashmap::DashMap;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::RuntimeError;
use crate::factory::FactoryMap;
use crate::mailbox::{Control, CreateService};
use crate::message::{worker_of, Message, MessageKind};
use crate::server::ServerCore;
use crate::worker::WorkerHandle;

/// Parameters of a service creation request, minus the routing fields.
#[derive(Debug, Clone)]
pub struct NewService {
    pub kind: String,
    pub config: String,
    /// Display name; doubles as the unique name when `unique` is set.
    /// Empty falls back to `kind`.
    pub name: String,
    pub unique: bool,
}

impl NewService {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            config: String::new(),
            name: String::new(),
            unique: false,
        }
    }

    pub fn config(mut self, config: impl Into<String>) -> Self {
        self.config = config.into();
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn unique(mut self, unique: bool) -> Self {
        self.unique = unique;
        self
    }
}

pub struct Router {
    core: Arc<ServerCore>,
    /// Immutable after server init.
    workers: OnceCell<Vec<Arc<WorkerHandle>>>,
    names: Mutex<HashMap<String, u32>>,
    env: DashMap<String, String>,
    factories: FactoryMap,
    /// Round-robin cursor for shared-worker placement.
    next: AtomicU32,
}

impl Router {
    pub(crate) fn new(core: Arc<ServerCore>) -> Self {
        Self {
            core,
            workers: OnceCell::new(),
            names: Mutex::new(HashMap::new()),
            env: DashMap::new(),
            factories: FactoryMap::new(),
            next: AtomicU32::new(0),
        }
    }

    pub(crate) fn install_workers(&self, workers: Vec<Arc<WorkerHandle>>) {
        if self.workers.set(workers).is_err() {
            warn!("worker list installed twice, second install ignored");
        }
    }

    pub(crate) fn workers(&self) -> &[Arc<WorkerHandle>] {
        self.workers.get().map(Vec::as_slice).unwrap_or(&[])
    }

    /// Resolve a 1-based worker index.
    pub(crate) fn worker(&self, index: u32) -> Option<&Arc<WorkerHandle>> {
        if index == 0 {
            return None;
        }
        self.workers().get(index as usize - 1)
    }

    /// Register a service constructor under a type name.
    pub fn register_factory<F>(&self, kind: impl Into<String>, ctor: F)
    where
        F: Fn() -> Box<dyn crate::service::Service> + Send + Sync + 'static,
    {
        self.factories.register(kind, ctor);
    }

    pub(crate) fn factories(&self) -> &FactoryMap {
        &self.factories
    }

    /// Cached server clock, epoch milliseconds.
    pub fn now(&self) -> i64 {
        self.core.now()
    }

    /// Store the shutdown signal word; the server loop observes it.
    pub fn shutdown(&self, code: i32) {
        self.core.set_signal(code);
    }

    /// Build and route a unicast message. Delivery failures follow the
    /// routing-error policy toward the sender instead of surfacing here.
    pub fn send(
        &self,
        sender: u32,
        receiver: u32,
        payload: impl Into<Bytes>,
        header: impl Into<String>,
        session: i32,
        kind: MessageKind,
    ) {
        let msg = Message::new(payload)
            .with_sender(sender)
            .with_receiver(receiver)
            .with_session(session)
            .with_kind(kind)
            .with_header(header);
        self.route(msg);
    }

    /// Reply helper: callers pass the already-negated session. A zero
    /// receiver or session means nobody is waiting; the reply is skipped.
    pub fn respond(
        &self,
        receiver: u32,
        payload: impl Into<Bytes>,
        header: impl Into<String>,
        session: i32,
        kind: MessageKind,
    ) {
        if receiver == 0 || session == 0 {
            return;
        }
        self.send(0, receiver, payload, header, session, kind);
    }

    /// Enqueue one copy of the message to every worker; each worker fans
    /// out to its live services in ascending id order.
    pub fn broadcast(
        &self,
        sender: u32,
        payload: impl Into<Bytes>,
        header: impl Into<String>,
        kind: MessageKind,
    ) {
        let mut msg = Message::new(payload)
            .with_sender(sender)
            .with_kind(kind)
            .with_header(header);
        msg.set_broadcast(true);
        for worker in self.workers() {
            if let Err(err) = worker.sender().push(msg.clone()) {
                warn!(worker = worker.id(), %err, "broadcast copy dropped");
            }
        }
    }

    /// Route a finished envelope: broadcast fan-out or unicast push, with
    /// routing-error behaviour toward the sender on failure.
    pub(crate) fn route(&self, msg: Message) {
        if msg.receiver() == 0 && msg.broadcast() {
            let sender = msg.sender();
            let kind = msg.kind();
            let header = msg.header().to_string();
            self.broadcast(sender, msg.payload().clone(), header, kind);
            return;
        }
        let sender = msg.sender();
        let receiver = msg.receiver();
        let session = msg.session();
        let index = worker_of(receiver);
        let outcome = match self.worker(index) {
            Some(worker) => worker.sender().push(msg),
            None => Err(RuntimeError::InvalidWorker(index)),
        };
        if let Err(err) = outcome {
            self.routing_failure(sender, receiver, session, err);
        }
    }

    /// Apply the routing-error policy: a pending request gets an
    /// `Error`-kind reply with the negated session, everything else is
    /// dropped with a warning.
    pub(crate) fn routing_failure(
        &self,
        sender: u32,
        receiver: u32,
        session: i32,
        err: RuntimeError,
    ) {
        if session > 0 && sender != 0 {
            self.respond(
                sender,
                err.to_string(),
                "routing",
                -session,
                MessageKind::Error,
            );
        } else {
            warn!(sender, receiver, session, %err, "message dropped");
        }
    }

    /// Request creation of a service. `worker_hint > 0` pins the hosting
    /// worker; otherwise placement round-robins over shared workers. The
    /// requester receives the new id (or 0 on failure) with `-session`.
    pub fn new_service(&self, req: NewService, worker_hint: u32, requester: u32, session: i32) {
        let worker = if worker_hint > 0 {
            self.worker(worker_hint).cloned()
        } else {
            self.next_worker()
        };
        let Some(worker) = worker else {
            self.creation_failure(requester, session, RuntimeError::InvalidWorker(worker_hint));
            return;
        };
        let ctl = Control::Create(CreateService {
            kind: req.kind,
            config: req.config,
            name: req.name,
            unique: req.unique,
            requester,
            session,
        });
        if let Err(err) = worker.sender().push_control(ctl) {
            self.creation_failure(requester, session, err);
        }
    }

    /// Reply to a failed creation: id 0 with an error payload.
    pub(crate) fn creation_failure(&self, requester: u32, session: i32, err: RuntimeError) {
        warn!(requester, %err, "service creation failed");
        self.respond(
            requester,
            "0",
            err.to_string(),
            -session,
            MessageKind::Error,
        );
    }

    /// Request removal of a service on its owning worker. Unknown ids
    /// answer the requester with routing-error behaviour (idempotence).
    pub fn remove_service(&self, id: u32, requester: u32, session: i32) {
        let index = worker_of(id);
        let outcome = match self.worker(index) {
            Some(worker) => worker.sender().push_control(Control::Remove {
                id,
                requester,
                session,
            }),
            None => Err(RuntimeError::InvalidWorker(index)),
        };
        if let Err(err) = outcome {
            self.routing_failure(requester, id, session, err);
        }
    }

    /// Round-robin over shared workers; over all workers when none is
    /// marked shared.
    pub(crate) fn next_worker(&self) -> Option<Arc<WorkerHandle>> {
        let workers = self.workers();
        if workers.is_empty() {
            return None;
        }
        let n = self.next.fetch_add(1, Ordering::Relaxed) as usize;
        let shared: Vec<&Arc<WorkerHandle>> = workers.iter().filter(|w| w.shared()).collect();
        if shared.is_empty() {
            Some(workers[n % workers.len()].clone())
        } else {
            Some(shared[n % shared.len()].clone())
        }
    }

    /// Register a unique name. Fails when the name is taken.
    pub fn register_unique(&self, name: impl Into<String>, id: u32) -> bool {
        let name = name.into();
        let mut names = self.names.lock();
        if names.contains_key(&name) {
            return false;
        }
        debug!(%name, service = id, "unique service registered");
        names.insert(name, id);
        true
    }

    /// Drop a unique name, but only while it still points at `id`.
    pub(crate) fn unregister_unique(&self, name: &str, id: u32) {
        let mut names = self.names.lock();
        if names.get(name) == Some(&id) {
            names.remove(name);
        }
    }

    /// Look up a unique name; 0 when absent.
    pub fn query_unique(&self, name: &str) -> u32 {
        self.names.lock().get(name).copied().unwrap_or(0)
    }

    pub fn set_env(&self, key: impl Into<String>, value: impl Into<String>) {
        self.env.insert(key.into(), value.into());
    }

    pub fn get_env(&self, key: &str) -> Option<String> {
        self.env.get(key).map(|v| v.value().clone())
    }

    /// Snapshot of one worker's counters.
    pub fn worker_info(&self, index: u32) -> Option<String> {
        self.worker(index).map(|w| w.info())
    }

    /// Live services across all workers.
    pub fn service_count(&self) -> u32 {
        self.workers().iter().map(|w| w.count()).sum()
    }

    /// Built-in administrative command set. The reply goes back to
    /// `sender` with the negated session; unknown commands get an
    /// `Error`-kind reply.
    pub fn runcmd(&self, sender: u32, cmd: &str, session: i32) {
        let reply = match cmd.trim().to_ascii_lowercase().as_str() {
            "ps" => {
                let lines: Vec<String> = self.workers().iter().map(|w| w.info()).collect();
                Ok(lines.join("\n"))
            }
            "gc" => {
                let now = self.core.now();
                for worker in self.workers() {
                    let _ = worker.sender().push_control(Control::Tick { now_ms: now });
                }
                Ok("OK".to_string())
            }
            "state" => Ok(format!(
                "state:{:?} now:{} services:{}",
                self.core.state(),
                self.core.now(),
                self.service_count()
            )),
            other => Err(RuntimeError::UnknownCommand(other.to_string())),
        };
        match reply {
            Ok(text) => {
                self.respond(sender, text, "runcmd", -session, MessageKind::System);
            }
            Err(err) => {
                warn!(sender, cmd, %err, "runcmd rejected");
                self.respond(sender, err.to_string(), "runcmd", -session, MessageKind::Error);
            }
        }
    }
}

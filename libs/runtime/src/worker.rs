//! Worker: an OS thread hosting a disjoint set of services.
//!
//! The thread owns its service table, mailbox consumer, timer wheel,
//! prefab table and reactor; nothing in that state is touched from
//! outside. The shared [`WorkerHandle`] carries only the mailbox producer
//! and atomic counters. Service ids embed the worker's 1-based index in
//! their high bits, so the router can find the owning worker without a
//! global table.

use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::RuntimeConfig;
use crate::error::{Result, RuntimeError};
use crate::mailbox::{mailbox, Control, CreateService, Envelope, Mailbox, MailboxSender};
use crate::message::{service_id, Message, MessageKind, WORKER_SHIFT};
use crate::reactor::Reactor;
use crate::router::Router;
use crate::server::UPDATE_INTERVAL;
use crate::service::{PrefabStore, ServiceContext, ServiceMeta, ServiceSlot};
use crate::timer::TimerWheel;

const SEQ_MASK: u32 = (1 << WORKER_SHIFT) - 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerStatus {
    Running = 0,
    Stopping = 1,
    Stopped = 2,
}

impl WorkerStatus {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => WorkerStatus::Stopping,
            2 => WorkerStatus::Stopped,
            _ => WorkerStatus::Running,
        }
    }
}

/// Shared face of a worker: mailbox producer plus counters. Everything
/// else lives on the worker thread.
pub struct WorkerHandle {
    id: u32,
    sender: MailboxSender,
    /// Live services hosted here.
    count: AtomicU32,
    /// Mailbox occupancy, refreshed on tick.
    mqsize: AtomicUsize,
    /// Cumulative dispatch time, microseconds.
    cpu_us: AtomicI64,
    /// Eligible for round-robin placement.
    shared: AtomicBool,
    status: AtomicU8,
    stop_requested: AtomicBool,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerHandle {
    /// 1-based worker index; also the high byte of every hosted service id.
    pub fn id(&self) -> u32 {
        self.id
    }

    pub(crate) fn sender(&self) -> &MailboxSender {
        &self.sender
    }

    pub fn count(&self) -> u32 {
        self.count.load(Ordering::Acquire)
    }

    pub fn shared(&self) -> bool {
        self.shared.load(Ordering::Acquire)
    }

    /// Opt this worker in or out of round-robin placement.
    pub fn set_shared(&self, shared: bool) {
        self.shared.store(shared, Ordering::Release);
    }

    pub fn status(&self) -> WorkerStatus {
        WorkerStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub fn is_stopped(&self) -> bool {
        self.status() == WorkerStatus::Stopped
    }

    /// Counter snapshot for `worker_info` and the `ps` command.
    pub fn info(&self) -> String {
        format!(
            "worker:{} state:{:?} services:{} mqsize:{} cpu:{}us shared:{}",
            self.id,
            self.status(),
            self.count(),
            self.mqsize.load(Ordering::Acquire),
            self.cpu_us.load(Ordering::Acquire),
            self.shared()
        )
    }

    /// Ask the thread to stop. Idempotent; the first call wins.
    pub(crate) fn request_stop(&self, graceful: bool) {
        if self.stop_requested.swap(true, Ordering::AcqRel) {
            return;
        }
        if self.sender.push_control(Control::Stop { graceful }).is_err() {
            debug!(worker = self.id, "stop requested on exited worker");
        }
    }

    /// Join the worker thread. Idempotent.
    pub(crate) fn join(&self) {
        let handle = self.join.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!(worker = self.id, "worker thread panicked");
            }
        }
    }
}

/// Spawn a worker thread and return its shared handle.
pub(crate) fn spawn(
    id: u32,
    router: Arc<Router>,
    config: &RuntimeConfig,
    reactor: Box<dyn Reactor>,
) -> Result<Arc<WorkerHandle>> {
    let (sender, inbox) = mailbox(id, config.mailbox);
    let handle = Arc::new(WorkerHandle {
        id,
        sender: sender.clone(),
        count: AtomicU32::new(0),
        mqsize: AtomicUsize::new(0),
        cpu_us: AtomicI64::new(0),
        shared: AtomicBool::new(true),
        status: AtomicU8::new(WorkerStatus::Running as u8),
        stop_requested: AtomicBool::new(false),
        join: Mutex::new(None),
    });

    let state = WorkerState {
        id,
        router,
        handle: handle.clone(),
        inbox,
        self_sender: sender,
        services: BTreeMap::new(),
        timer: TimerWheel::new(),
        prefabs: PrefabStore::default(),
        reactor,
        next_seq: 0,
        batch_quantum: config.batch_quantum,
        graceful_drain: Duration::from_millis(config.graceful_drain_ms),
        stopping: false,
        exited: false,
    };

    let thread = std::thread::Builder::new()
        .name(format!("worker-{id}"))
        .spawn(move || state.run())
        .map_err(|e| RuntimeError::init_failed(format!("spawn worker-{id}: {e}")))?;
    *handle.join.lock() = Some(thread);
    Ok(handle)
}

/// Thread-confined worker state.
struct WorkerState {
    id: u32,
    router: Arc<Router>,
    handle: Arc<WorkerHandle>,
    inbox: Mailbox,
    /// Producer into our own mailbox, used by timers and the reactor.
    self_sender: MailboxSender,
    /// Ascending id order matters: broadcast visits services in id order.
    services: BTreeMap<u32, ServiceSlot>,
    timer: TimerWheel,
    prefabs: PrefabStore,
    reactor: Box<dyn Reactor>,
    next_seq: u32,
    batch_quantum: usize,
    graceful_drain: Duration,
    stopping: bool,
    exited: bool,
}

impl WorkerState {
    fn run(mut self) {
        debug!(worker = self.id, "worker started");
        let mut batch: Vec<Envelope> = Vec::with_capacity(self.batch_quantum);
        while !self.exited {
            let Some(env) = self.inbox.recv_timeout(UPDATE_INTERVAL) else {
                continue;
            };
            self.process(env);
            while !self.exited {
                batch.clear();
                if self.inbox.drain_into(&mut batch, self.batch_quantum) == 0 {
                    break;
                }
                for env in batch.drain(..) {
                    self.process(env);
                    if self.exited {
                        break;
                    }
                }
            }
        }
        self.teardown();
    }

    fn process(&mut self, env: Envelope) {
        match env {
            Envelope::Post(msg) => self.deliver(msg),
            Envelope::Control(Control::Create(req)) => self.create_service(req),
            Envelope::Control(Control::Remove {
                id,
                requester,
                session,
            }) => self.remove_service(id, requester, session),
            Envelope::Control(Control::Tick { now_ms }) => self.tick(now_ms),
            Envelope::Control(Control::Stop { graceful }) => self.stop(graceful),
        }
    }

    fn deliver(&mut self, mut msg: Message) {
        if msg.receiver() == 0 && msg.broadcast() {
            let ids: Vec<u32> = self.services.keys().copied().collect();
            for id in ids {
                self.dispatch(id, &mut msg);
                if msg.receiver() != 0 {
                    // Redirecting a broadcast is a programming bug: the
                    // envelope is shared across every local service.
                    error!(
                        worker = self.id,
                        service = id,
                        "broadcast message redirected during dispatch"
                    );
                    std::process::abort();
                }
            }
            return;
        }

        let receiver = msg.receiver();
        let live = self
            .services
            .get(&receiver)
            .map(|slot| slot.meta.ok)
            .unwrap_or(false);
        if !live {
            self.router.routing_failure(
                msg.sender(),
                receiver,
                msg.session(),
                RuntimeError::UnknownService(receiver),
            );
            return;
        }

        self.dispatch(receiver, &mut msg);

        // A handler that changed the receiver asks for re-routing.
        if msg.receiver() != receiver {
            self.router.route(msg);
        }
    }

    /// The dispatch boundary: run the handler, charge wall time, contain
    /// panics. Never unwinds.
    fn dispatch(&mut self, id: u32, msg: &mut Message) {
        let Some(slot) = self.services.get_mut(&id) else {
            return;
        };
        if !slot.meta.ok {
            return;
        }
        let ServiceSlot { meta, handler } = &mut *slot;
        let mut ctx = ServiceContext {
            meta,
            router: &*self.router,
            timer: &mut self.timer,
            prefabs: &mut self.prefabs,
            worker_id: self.id,
        };
        let started = Instant::now();
        let outcome = catch_unwind(AssertUnwindSafe(|| handler.dispatch(&mut ctx, msg)));
        let spent = started.elapsed().as_micros() as i64;
        ctx.meta.cpu_us += spent;
        self.handle.cpu_us.fetch_add(spent, Ordering::Relaxed);

        if outcome.is_err() {
            error!(
                worker = self.id,
                service = id,
                session = msg.session(),
                "handler panicked, message dropped"
            );
            if msg.session() > 0 {
                self.router.respond(
                    msg.sender(),
                    format!("service {id:#010x} dispatch failed"),
                    "dispatch",
                    -msg.session(),
                    MessageKind::Error,
                );
            }
        }
    }

    fn create_service(&mut self, req: CreateService) {
        if self.stopping {
            self.router
                .creation_failure(req.requester, req.session, RuntimeError::Stopping(self.id));
            return;
        }
        let Some(mut handler) = self.router.factories().create(&req.kind) else {
            self.router.creation_failure(
                req.requester,
                req.session,
                RuntimeError::UnknownServiceType(req.kind),
            );
            return;
        };
        let Some(id) = self.alloc_id() else {
            self.router.creation_failure(
                req.requester,
                req.session,
                RuntimeError::init_failed(format!("worker {} service ids exhausted", self.id)),
            );
            return;
        };

        let name = if req.name.is_empty() {
            req.kind.clone()
        } else {
            req.name.clone()
        };
        let mut meta = ServiceMeta {
            id,
            name,
            unique: req.unique,
            ok: false,
            cpu_us: 0,
        };

        let init = {
            let mut ctx = ServiceContext {
                meta: &mut meta,
                router: &*self.router,
                timer: &mut self.timer,
                prefabs: &mut self.prefabs,
                worker_id: self.id,
            };
            catch_unwind(AssertUnwindSafe(|| handler.init(&mut ctx, &req.config)))
        };
        let failure = match init {
            Err(_) => Some(RuntimeError::init_failed(format!(
                "service type '{}' init panicked",
                req.kind
            ))),
            Ok(Err(e)) => Some(e),
            Ok(Ok(())) => {
                if meta.unique && !self.router.register_unique(&meta.name, id) {
                    Some(RuntimeError::NameTaken(meta.name.clone()))
                } else {
                    None
                }
            }
        };

        if let Some(err) = failure {
            // The half-built service is destroyed here, on its worker.
            drop(handler);
            self.router.creation_failure(req.requester, req.session, err);
            return;
        }

        meta.ok = true;
        info!(worker = self.id, service = id, name = %meta.name, "new service");
        self.services.insert(id, ServiceSlot { meta, handler });
        self.handle.count.fetch_add(1, Ordering::AcqRel);
        self.router.respond(
            req.requester,
            id.to_string(),
            "",
            -req.session,
            MessageKind::System,
        );
    }

    fn remove_service(&mut self, id: u32, requester: u32, session: i32) {
        match self.services.remove(&id) {
            Some(slot) => {
                if slot.meta.unique {
                    self.router.unregister_unique(&slot.meta.name, id);
                }
                self.handle.count.fetch_sub(1, Ordering::AcqRel);
                info!(worker = self.id, service = id, name = %slot.meta.name, "destroy service");
                drop(slot);
                self.router
                    .respond(requester, "OK", "", -session, MessageKind::System);
            }
            None => {
                self.router.routing_failure(
                    requester,
                    id,
                    session,
                    RuntimeError::UnknownService(id),
                );
            }
        }
    }

    fn tick(&mut self, now_ms: i64) {
        if self.stopping {
            self.handle.mqsize.store(self.inbox.len(), Ordering::Release);
            return;
        }
        let outbox = &self.self_sender;
        let worker = self.id;
        self.timer.advance(now_ms, |msg| {
            if let Err(err) = outbox.push(msg) {
                warn!(worker, %err, "timer expiry dropped");
            }
        });
        self.reactor.poll(&mut |msg| {
            if let Err(err) = outbox.push(msg) {
                warn!(worker, %err, "reactor completion dropped");
            }
        });
        self.handle.mqsize.store(self.inbox.len(), Ordering::Release);
    }

    fn stop(&mut self, graceful: bool) {
        if self.stopping {
            if !graceful {
                self.exited = true;
            }
            return;
        }
        self.stopping = true;
        self.handle
            .status
            .store(WorkerStatus::Stopping as u8, Ordering::Release);
        info!(worker = self.id, graceful, "worker stopping");

        if graceful {
            // Keep delivering what is already queued, up to a deadline.
            // Creations are refused from here on.
            let deadline = Instant::now() + self.graceful_drain;
            let mut batch: Vec<Envelope> = Vec::with_capacity(self.batch_quantum);
            while Instant::now() < deadline {
                batch.clear();
                if self.inbox.drain_into(&mut batch, self.batch_quantum) == 0 {
                    break;
                }
                for env in batch.drain(..) {
                    self.process(env);
                    if self.exited {
                        return;
                    }
                }
            }
        }
        self.exited = true;
    }

    fn teardown(&mut self) {
        self.reactor.stop();
        let services = std::mem::take(&mut self.services);
        for (id, slot) in services {
            if slot.meta.unique {
                self.router.unregister_unique(&slot.meta.name, id);
            }
            debug!(worker = self.id, service = id, "destroy service");
        }
        self.handle.count.store(0, Ordering::Release);
        self.handle.mqsize.store(0, Ordering::Release);
        self.handle
            .status
            .store(WorkerStatus::Stopped as u8, Ordering::Release);
        info!(worker = self.id, "worker stopped");
    }

    /// Allocate the next free service id with this worker's index in the
    /// high bits. None once the 24-bit sequence space is exhausted.
    fn alloc_id(&mut self) -> Option<u32> {
        for _ in 0..=SEQ_MASK {
            self.next_seq = (self.next_seq + 1) & SEQ_MASK;
            if self.next_seq == 0 {
                continue;
            }
            let id = service_id(self.id, self.next_seq);
            if !self.services.contains_key(&id) {
                return Some(id);
            }
        }
        None
    }
}

//! Top-level coordinator: owns the workers and the router, drives the
//! master tick, observes the shutdown signal word.
//!
//! The state machine is strictly monotonic:
//! `Uninit → Init → Ready → Stopping → Stopped`. Observers read with
//! acquire loads; no transition ever goes backwards.

use std::sync::atomic::{AtomicI32, AtomicI64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::{info, warn};

use crate::config::RuntimeConfig;
use crate::error::Result;
use crate::mailbox::Control;
use crate::reactor::{NullReactor, ReactorFactory};
use crate::router::Router;
use crate::worker::{self, WorkerHandle};

/// Master tick cadence; timers and housekeeping advance at this rate.
pub const UPDATE_INTERVAL: Duration = Duration::from_millis(10);

/// Server lifecycle states, in transition order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum State {
    Uninit = 0,
    Init = 1,
    Ready = 2,
    Stopping = 3,
    Stopped = 4,
}

impl State {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => State::Init,
            2 => State::Ready,
            3 => State::Stopping,
            4 => State::Stopped,
            _ => State::Uninit,
        }
    }
}

/// Wall clock in epoch milliseconds.
pub(crate) fn wall_now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// State shared between the server, the router and worker threads.
pub(crate) struct ServerCore {
    state: AtomicU8,
    /// Monotonic clock sampled once per tick; 0 before the first tick.
    now_ms: AtomicI64,
    /// Shutdown signal word: 0 none, > 0 graceful, < 0 abort.
    signal: AtomicI32,
}

impl ServerCore {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(State::Uninit as u8),
            now_ms: AtomicI64::new(0),
            signal: AtomicI32::new(0),
        }
    }

    pub fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Monotonic advance only; regressions are ignored.
    pub fn set_state(&self, next: State) {
        let mut current = self.state.load(Ordering::Acquire);
        while current < next as u8 {
            match self.state.compare_exchange(
                current,
                next as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }

    pub fn cas_state(&self, from: State, to: State) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Cached tick clock; falls back to the wall clock before the first
    /// tick.
    pub fn now(&self) -> i64 {
        let cached = self.now_ms.load(Ordering::Acquire);
        if cached == 0 {
            wall_now_ms()
        } else {
            cached
        }
    }

    pub fn sample_now(&self) -> i64 {
        let now = wall_now_ms();
        self.now_ms.store(now, Ordering::Release);
        now
    }

    pub fn signal(&self) -> i32 {
        self.signal.load(Ordering::Acquire)
    }

    pub fn set_signal(&self, code: i32) {
        self.signal.store(code, Ordering::Release);
    }
}

/// The runtime instance. `Send + Sync`; share it behind an `Arc` so other
/// threads (signal handlers included) can call [`Server::stop`] while
/// [`Server::run`] blocks.
pub struct Server {
    core: Arc<ServerCore>,
    router: Arc<Router>,
    workers: Vec<Arc<WorkerHandle>>,
}

impl Server {
    /// Start the worker pool with no-op reactors.
    pub fn init(config: RuntimeConfig) -> Result<Server> {
        Self::init_with(config, Box::new(|_| Box::new(NullReactor)))
    }

    /// Start the worker pool, building one reactor per worker.
    pub fn init_with(config: RuntimeConfig, reactors: ReactorFactory) -> Result<Server> {
        let config = config.validated()?;
        let core = Arc::new(ServerCore::new());
        let router = Arc::new(Router::new(core.clone()));

        let mut workers = Vec::with_capacity(config.workers as usize);
        for index in 1..=config.workers {
            match worker::spawn(index, router.clone(), &config, reactors(index)) {
                Ok(worker) => workers.push(worker),
                Err(err) => {
                    // Partial pool: tear down what already started.
                    for worker in workers.iter().rev() {
                        worker.request_stop(false);
                    }
                    for worker in workers.iter().rev() {
                        worker.join();
                    }
                    return Err(err);
                }
            }
        }
        router.install_workers(workers.clone());
        core.set_state(State::Init);
        info!(workers = config.workers, "runtime initialised");
        Ok(Server {
            core,
            router,
            workers,
        })
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn state(&self) -> State {
        self.core.state()
    }

    /// Cached tick clock in epoch milliseconds; `sync` forces a resample.
    pub fn now(&self, sync: bool) -> i64 {
        if sync {
            self.core.sample_now()
        } else {
            self.core.now()
        }
    }

    /// Store the shutdown signal word. `code > 0` requests a graceful
    /// shutdown, `code < 0` an immediate abort. The run loop observes it.
    pub fn stop(&self, code: i32) {
        self.core.set_signal(code);
    }

    /// Live services across the pool.
    pub fn service_count(&self) -> u32 {
        self.router.service_count()
    }

    /// Round-robin selector over shared workers; any worker when none is
    /// shared. Shares its cursor with service placement.
    pub fn next_worker(&self) -> Option<Arc<WorkerHandle>> {
        self.router.next_worker()
    }

    pub fn workers(&self) -> &[Arc<WorkerHandle>] {
        &self.workers
    }

    /// Drive the runtime until every worker has stopped. Blocks the
    /// calling thread; returns the signal code that ended the run.
    pub fn run(&self) -> i32 {
        self.core.set_state(State::Ready);
        info!("runtime ready");

        loop {
            let code = self.core.signal();
            if code < 0 {
                warn!(code, "abort requested, stopping workers immediately");
                for worker in self.workers.iter().rev() {
                    let _ = worker.sender().push_control(Control::Stop { graceful: false });
                }
                break;
            }
            if code > 0 && self.core.cas_state(State::Ready, State::Stopping) {
                warn!(code, "shutdown requested, stopping workers in reverse order");
            }

            let now = self.core.sample_now();

            if self.core.state() == State::Stopping {
                // Staged reverse shutdown: the highest-index worker stops
                // first, the next begins only once it has.
                if let Some(worker) = self.workers.iter().rev().find(|w| !w.is_stopped()) {
                    worker.request_stop(true);
                }
            }

            let mut alive = 0usize;
            for worker in &self.workers {
                if !worker.is_stopped() {
                    alive += 1;
                    let _ = worker.sender().push_control(Control::Tick { now_ms: now });
                }
            }
            if alive == 0 {
                break;
            }

            std::thread::sleep(UPDATE_INTERVAL);
        }

        self.wait();
        self.core.signal()
    }

    /// Join workers in reverse init order and flush state to `Stopped`.
    /// Idempotent.
    pub fn wait(&self) {
        for worker in self.workers.iter().rev() {
            worker.join();
        }
        self.core.set_state(State::Stopped);
        info!("runtime stopped");
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        // A dropped server must not leave detached worker threads behind.
        for worker in self.workers.iter().rev() {
            worker.request_stop(false);
        }
        self.wait();
    }
}

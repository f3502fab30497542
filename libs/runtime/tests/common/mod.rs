//! Shared harness for runtime integration tests.
//!
//! Spins up a real server on a background thread and observes traffic
//! through probe services that forward everything they receive into a
//! channel.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use runtime::{
    Message, MessageKind, NewService, Result, RuntimeConfig, Server, Service, ServiceContext,
};

pub const STEP: Duration = Duration::from_millis(5);
pub const WAIT: Duration = Duration::from_secs(5);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_test_writer()
        .try_init();
}

/// What a probe saw, detached from the live message.
#[derive(Debug, Clone)]
pub struct ProbeEvent {
    pub sender: u32,
    pub receiver: u32,
    pub session: i32,
    pub kind: MessageKind,
    pub header: String,
    pub payload: String,
}

/// Forwards every dispatched message to the test thread.
pub struct Probe {
    tx: Sender<ProbeEvent>,
}

impl Service for Probe {
    fn init(&mut self, _ctx: &mut ServiceContext, _config: &str) -> Result<()> {
        Ok(())
    }

    fn dispatch(&mut self, _ctx: &mut ServiceContext, msg: &mut Message) {
        let _ = self.tx.send(ProbeEvent {
            sender: msg.sender(),
            receiver: msg.receiver(),
            session: msg.session(),
            kind: msg.kind(),
            header: msg.header().to_string(),
            payload: msg.text().to_string(),
        });
    }
}

/// A running runtime plus the channel its probes report into.
pub struct TestRuntime {
    pub server: Arc<Server>,
    pub events: Receiver<ProbeEvent>,
    runner: Option<JoinHandle<i32>>,
}

impl TestRuntime {
    /// Boot `workers` workers, register the probe factory and create the
    /// root probe (unique name `probe0`, hosted on worker 1).
    pub fn start(workers: u32) -> (Self, u32) {
        init_tracing();
        let config = RuntimeConfig {
            workers,
            ..Default::default()
        };
        let server = Arc::new(Server::init(config).expect("server init"));

        let (tx, events) = crossbeam_channel::unbounded();
        let factory_tx = tx.clone();
        server.router().register_factory("probe", move || {
            Box::new(Probe {
                tx: factory_tx.clone(),
            })
        });

        let runner = {
            let server = server.clone();
            std::thread::spawn(move || server.run())
        };

        let rt = TestRuntime {
            server,
            events,
            runner: Some(runner),
        };
        rt.server.router().new_service(
            NewService::new("probe").name("probe0").unique(true),
            1,
            0,
            0,
        );
        let probe0 = rt.wait_unique("probe0");
        (rt, probe0)
    }

    /// Create a service and return the id from the creation reply sent to
    /// `requester` (a probe). Panics on a creation-failure reply.
    pub fn create(&self, req: NewService, hint: u32, requester: u32, session: i32) -> u32 {
        self.server.router().new_service(req, hint, requester, session);
        let reply = self.recv_session(-session);
        assert_eq!(
            reply.kind,
            MessageKind::System,
            "creation failed: {}",
            reply.header
        );
        reply.payload.parse().expect("creation reply carries an id")
    }

    /// Next probe event carrying exactly this session, discarding others.
    pub fn recv_session(&self, session: i32) -> ProbeEvent {
        let deadline = Instant::now() + WAIT;
        loop {
            let remaining = deadline
                .checked_duration_since(Instant::now())
                .expect("timed out waiting for probe event");
            let event = self
                .events
                .recv_timeout(remaining)
                .expect("timed out waiting for probe event");
            if event.session == session {
                return event;
            }
        }
    }

    /// Spin until a unique name resolves; returns the id.
    pub fn wait_unique(&self, name: &str) -> u32 {
        wait_for(WAIT, || {
            let id = self.server.router().query_unique(name);
            (id != 0).then_some(id)
        })
    }

    /// Stop with `code` and join the run thread, returning the code the
    /// run loop observed.
    pub fn shutdown(mut self, code: i32) -> i32 {
        self.server.stop(code);
        let observed = self
            .runner
            .take()
            .expect("runner already joined")
            .join()
            .expect("run thread panicked");
        self.server.wait();
        observed
    }
}

impl Drop for TestRuntime {
    fn drop(&mut self) {
        if let Some(runner) = self.runner.take() {
            self.server.stop(-1);
            let _ = runner.join();
        }
    }
}

/// Poll `f` until it yields a value or the timeout elapses.
pub fn wait_for<T>(timeout: Duration, mut f: impl FnMut() -> Option<T>) -> T {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(v) = f() {
            return v;
        }
        assert!(Instant::now() < deadline, "condition not met in time");
        std::thread::sleep(STEP);
    }
}

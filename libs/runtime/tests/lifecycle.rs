//! Service and server lifecycle: placement, unique names, shutdown order.

mod common;

use common::{wait_for, TestRuntime, WAIT};
use crossbeam_channel::Sender;
use runtime::{
    worker_of, Message, MessageKind, NewService, Result, Service, ServiceContext, State,
};

#[test]
fn round_robin_creation_alternates_workers() {
    let (rt, probe0) = TestRuntime::start(2);

    let mut hosts = Vec::new();
    for session in 1..=4 {
        let id = rt.create(NewService::new("probe"), 0, probe0, session);
        hosts.push(worker_of(id));
    }
    assert_eq!(hosts, vec![1, 2, 1, 2]);

    rt.shutdown(1);
}

#[test]
fn unique_name_collision_rejects_second_registration() {
    let (rt, probe0) = TestRuntime::start(2);

    let db = rt.create(NewService::new("probe").name("db").unique(true), 1, probe0, 10);
    assert_eq!(worker_of(db), 1);
    assert_eq!(rt.server.router().query_unique("db"), db);

    // Same unique name on the other worker: creation reply carries id 0.
    rt.server.router().new_service(
        NewService::new("probe").name("db").unique(true),
        2,
        probe0,
        11,
    );
    let reply = rt.recv_session(-11);
    assert_eq!(reply.kind, MessageKind::Error);
    assert_eq!(reply.payload, "0");
    assert_eq!(rt.server.router().query_unique("db"), db);

    // Removal releases the name.
    rt.server.router().remove_service(db, probe0, 12);
    let reply = rt.recv_session(-12);
    assert_eq!(reply.kind, MessageKind::System);
    wait_for(WAIT, || {
        (rt.server.router().query_unique("db") == 0).then_some(())
    });

    rt.shutdown(1);
}

#[test]
fn service_count_tracks_creation_and_removal() {
    let (rt, probe0) = TestRuntime::start(2);
    wait_for(WAIT, || (rt.server.service_count() == 1).then_some(()));

    let a = rt.create(NewService::new("probe"), 0, probe0, 1);
    let _b = rt.create(NewService::new("probe"), 0, probe0, 2);
    wait_for(WAIT, || (rt.server.service_count() == 3).then_some(()));

    rt.server.router().remove_service(a, probe0, 3);
    rt.recv_session(-3);
    wait_for(WAIT, || (rt.server.service_count() == 2).then_some(()));

    rt.shutdown(1);
}

#[test]
fn remove_service_is_idempotent() {
    let (rt, probe0) = TestRuntime::start(1);

    let victim = rt.create(NewService::new("probe"), 1, probe0, 1);
    rt.server.router().remove_service(victim, probe0, 2);
    assert_eq!(rt.recv_session(-2).kind, MessageKind::System);

    // Second removal: routing-error behaviour, no side effect.
    rt.server.router().remove_service(victim, probe0, 3);
    assert_eq!(rt.recv_session(-3).kind, MessageKind::Error);
    assert_eq!(rt.server.service_count(), 1);

    rt.shutdown(1);
}

#[test]
fn state_machine_progresses_in_order() {
    let (rt, _probe0) = TestRuntime::start(1);

    // The run thread is already up; we can only be Init or later.
    assert!(rt.server.state() >= State::Init);
    wait_for(WAIT, || (rt.server.state() == State::Ready).then_some(()));

    let observed = rt.shutdown(5);
    assert_eq!(observed, 5);
}

/// Reports its hosting worker when destroyed; destruction happens on the
/// worker thread during teardown.
struct DropReporter {
    worker: u32,
    tx: Sender<u32>,
}

impl Service for DropReporter {
    fn init(&mut self, ctx: &mut ServiceContext, _config: &str) -> Result<()> {
        self.worker = ctx.worker_id();
        Ok(())
    }

    fn dispatch(&mut self, _ctx: &mut ServiceContext, _msg: &mut Message) {}
}

impl Drop for DropReporter {
    fn drop(&mut self) {
        if self.worker != 0 {
            let _ = self.tx.send(self.worker);
        }
    }
}

#[test]
fn graceful_shutdown_stops_workers_in_reverse_order() {
    let (rt, probe0) = TestRuntime::start(3);

    let (drop_tx, drop_rx) = crossbeam_channel::unbounded();
    rt.server.router().register_factory("drop-reporter", move || {
        Box::new(DropReporter {
            worker: 0,
            tx: drop_tx.clone(),
        })
    });
    for hint in 1..=3 {
        rt.create(NewService::new("drop-reporter"), hint, probe0, hint as i32);
    }

    let observed = rt.shutdown(1);
    assert_eq!(observed, 1);

    let order: Vec<u32> = drop_rx.try_iter().collect();
    assert_eq!(order, vec![3, 2, 1]);
}

#[test]
fn abort_shutdown_skips_graceful_drain() {
    let (rt, _probe0) = TestRuntime::start(2);
    let observed = rt.shutdown(-1);
    assert_eq!(observed, -1);
}

#[test]
fn two_runtimes_coexist_in_one_process() {
    let (a, probe_a) = TestRuntime::start(1);
    let (b, probe_b) = TestRuntime::start(1);

    let id_a = a.create(NewService::new("probe").name("svc").unique(true), 1, probe_a, 1);
    let id_b = b.create(NewService::new("probe").name("svc").unique(true), 1, probe_b, 1);

    // Same unique name, different routers: no interference.
    assert_eq!(a.server.router().query_unique("svc"), id_a);
    assert_eq!(b.server.router().query_unique("svc"), id_b);

    a.shutdown(1);
    b.shutdown(1);
}

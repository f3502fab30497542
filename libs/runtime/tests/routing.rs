//! Message routing: timers, redirects, broadcast, error replies, prefabs.

mod common;

use std::time::Duration;

use common::{TestRuntime, WAIT};
use crossbeam_channel::Sender;
use runtime::{
    service_id, Message, MessageKind, NewService, Result, Service, ServiceContext,
};

#[test]
fn timer_fires_exactly_the_requested_count() {
    let (rt, probe0) = TestRuntime::start(1);

    let (tx, rx) = crossbeam_channel::unbounded::<i32>();
    rt.server.router().register_factory("ticker", move || {
        Box::new(Ticker { tx: tx.clone() })
    });
    rt.create(NewService::new("ticker"), 1, probe0, 1);

    // Init reports the timer id as a negative marker.
    let timer_id = -rx.recv_timeout(WAIT).expect("timer scheduled");
    assert!(timer_id > 0);

    for _ in 0..3 {
        let fired = rx.recv_timeout(WAIT).expect("timer expiry");
        assert_eq!(fired, timer_id);
    }
    // Three repeats requested; the timer must be gone now.
    assert!(rx.recv_timeout(Duration::from_millis(150)).is_err());

    rt.shutdown(1);
}

struct Ticker {
    tx: Sender<i32>,
}

impl Service for Ticker {
    fn init(&mut self, ctx: &mut ServiceContext, _config: &str) -> Result<()> {
        let id = ctx.repeat(10, 3);
        let _ = self.tx.send(-(id as i32));
        Ok(())
    }

    fn dispatch(&mut self, _ctx: &mut ServiceContext, msg: &mut Message) {
        if msg.kind() == MessageKind::Timer {
            let _ = self.tx.send(msg.session());
        }
    }
}

/// Points every text message at the service id given in its config.
struct Redirector {
    target: u32,
}

impl Service for Redirector {
    fn init(&mut self, _ctx: &mut ServiceContext, config: &str) -> Result<()> {
        self.target = config
            .parse()
            .map_err(|_| runtime::RuntimeError::init_failed("target id expected"))?;
        Ok(())
    }

    fn dispatch(&mut self, _ctx: &mut ServiceContext, msg: &mut Message) {
        if msg.kind() == MessageKind::Text {
            msg.redirect(self.target);
        }
    }
}

#[test]
fn redirect_forwards_with_sender_unchanged() {
    let (rt, probe0) = TestRuntime::start(2);

    rt.server
        .router()
        .register_factory("redirector", || Box::new(Redirector { target: 0 }));

    let target = rt.create(NewService::new("probe"), 2, probe0, 1);
    let via = rt.create(
        NewService::new("redirector").config(target.to_string()),
        1,
        probe0,
        2,
    );

    rt.server
        .router()
        .send(probe0, via, "hello", "h", 5, MessageKind::Text);

    let seen = rt.recv_session(5);
    assert_eq!(seen.sender, probe0);
    assert_eq!(seen.receiver, target);
    assert_eq!(seen.payload, "hello");
    assert_eq!(seen.header, "h");

    rt.shutdown(1);
}

#[test]
fn request_to_removed_service_yields_error_reply() {
    let (rt, probe0) = TestRuntime::start(1);

    let victim = rt.create(NewService::new("probe"), 1, probe0, 1);
    rt.server.router().remove_service(victim, probe0, 2);
    rt.recv_session(-2);

    rt.server
        .router()
        .send(probe0, victim, "late", "", 7, MessageKind::Text);
    let reply = rt.recv_session(-7);
    assert_eq!(reply.kind, MessageKind::Error);

    rt.shutdown(1);
}

#[test]
fn request_to_invalid_worker_yields_error_reply() {
    let (rt, probe0) = TestRuntime::start(2);

    let nowhere = service_id(99, 1);
    rt.server
        .router()
        .send(probe0, nowhere, "", "", 13, MessageKind::Text);
    let reply = rt.recv_session(-13);
    assert_eq!(reply.kind, MessageKind::Error);

    rt.shutdown(1);
}

#[test]
fn broadcast_reaches_services_on_every_worker() {
    let (rt, _probe0) = TestRuntime::start(2);

    // A second probe on worker 2; probe0 lives on worker 1.
    rt.server
        .router()
        .new_service(NewService::new("probe").name("p2").unique(true), 2, 0, 0);
    rt.wait_unique("p2");

    rt.server.router().broadcast(0, "ping", "", MessageKind::Text);

    let mut got = 0;
    while got < 2 {
        let event = rt.recv_session(0);
        if event.payload == "ping" {
            assert_eq!(event.receiver, 0);
            got += 1;
        }
    }

    rt.shutdown(1);
}

struct Panicky;

impl Service for Panicky {
    fn init(&mut self, _ctx: &mut ServiceContext, _config: &str) -> Result<()> {
        Ok(())
    }

    fn dispatch(&mut self, ctx: &mut ServiceContext, msg: &mut Message) {
        if msg.text() == "boom" {
            panic!("requested failure");
        }
        if msg.session() > 0 {
            ctx.respond(msg.sender(), "pong", "", -msg.session(), MessageKind::Text);
        }
    }
}

#[test]
fn handler_panic_is_contained_and_reported() {
    let (rt, probe0) = TestRuntime::start(1);

    rt.server
        .router()
        .register_factory("panicky", || Box::new(Panicky));
    let svc = rt.create(NewService::new("panicky"), 1, probe0, 1);

    rt.server
        .router()
        .send(probe0, svc, "boom", "", 9, MessageKind::Text);
    let failure = rt.recv_session(-9);
    assert_eq!(failure.kind, MessageKind::Error);

    // The worker and the service both survive the panic.
    rt.server
        .router()
        .send(probe0, svc, "ping", "", 10, MessageKind::Text);
    let reply = rt.recv_session(-10);
    assert_eq!(reply.payload, "pong");

    rt.shutdown(1);
}

/// Registers a prefab at init and answers every request with it.
struct PrefabKeeper {
    prefab: u32,
}

impl Service for PrefabKeeper {
    fn init(&mut self, ctx: &mut ServiceContext, _config: &str) -> Result<()> {
        self.prefab = ctx.make_prefab_with("cached payload", "ph", MessageKind::Text);
        Ok(())
    }

    fn dispatch(&mut self, ctx: &mut ServiceContext, msg: &mut Message) {
        if msg.kind() != MessageKind::Text || msg.session() <= 0 {
            return;
        }
        if msg.text() == "bad" {
            // Unknown prefab ids surface locally, not as routing errors.
            let err = ctx
                .send_prefab(msg.sender(), 999_999, "", -msg.session(), MessageKind::Unknown)
                .unwrap_err();
            ctx.respond(
                msg.sender(),
                err.to_string(),
                "prefab",
                -msg.session(),
                MessageKind::Error,
            );
            return;
        }
        ctx.send_prefab(msg.sender(), self.prefab, "", -msg.session(), MessageKind::Unknown)
            .expect("prefab registered in init");
    }
}

#[test]
fn prefab_send_reuses_registered_payload_and_defaults() {
    let (rt, probe0) = TestRuntime::start(1);

    rt.server
        .router()
        .register_factory("prefab-keeper", || Box::new(PrefabKeeper { prefab: 0 }));
    let keeper = rt.create(NewService::new("prefab-keeper"), 1, probe0, 1);

    rt.server
        .router()
        .send(probe0, keeper, "give", "", 21, MessageKind::Text);
    let reply = rt.recv_session(-21);
    assert_eq!(reply.payload, "cached payload");
    assert_eq!(reply.header, "ph");
    assert_eq!(reply.kind, MessageKind::Text);

    rt.server
        .router()
        .send(probe0, keeper, "bad", "", 22, MessageKind::Text);
    let failure = rt.recv_session(-22);
    assert_eq!(failure.kind, MessageKind::Error);
    assert!(failure.payload.contains("unknown prefab"));

    rt.shutdown(1);
}

#[test]
fn runcmd_answers_with_negated_session() {
    let (rt, probe0) = TestRuntime::start(2);

    rt.server.router().runcmd(probe0, "ps", 31);
    let reply = rt.recv_session(-31);
    assert_eq!(reply.kind, MessageKind::System);
    assert!(reply.payload.contains("worker:1"));
    assert!(reply.payload.contains("worker:2"));

    rt.server.router().runcmd(probe0, "state", 32);
    let reply = rt.recv_session(-32);
    assert!(reply.payload.contains("state:"));

    rt.server.router().runcmd(probe0, "gc", 33);
    assert_eq!(rt.recv_session(-33).payload, "OK");

    rt.server.router().runcmd(probe0, "bogus", 34);
    assert_eq!(rt.recv_session(-34).kind, MessageKind::Error);

    rt.shutdown(1);
}

#[test]
fn worker_info_snapshots_counters() {
    let (rt, _probe0) = TestRuntime::start(2);

    let info = rt.server.router().worker_info(1).expect("worker 1 exists");
    assert!(info.contains("worker:1"));
    assert!(info.contains("services:"));
    assert!(rt.server.router().worker_info(99).is_none());

    rt.shutdown(1);
}

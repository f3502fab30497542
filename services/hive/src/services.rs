//! Built-in service types registered by the host.

use runtime::{Message, MessageKind, Result, RuntimeError, Service, ServiceContext};
use tracing::info;

/// Answers every request with its own payload.
pub struct Echo;

impl Service for Echo {
    fn init(&mut self, _ctx: &mut ServiceContext, _config: &str) -> Result<()> {
        Ok(())
    }

    fn dispatch(&mut self, ctx: &mut ServiceContext, msg: &mut Message) {
        if msg.session() > 0 {
            ctx.respond(
                msg.sender(),
                msg.payload().clone(),
                msg.header(),
                -msg.session(),
                MessageKind::Text,
            );
        }
    }
}

/// Logs a liveness line on a repeating timer. Config is the interval in
/// milliseconds; empty means one second.
pub struct Heartbeat {
    beats: u64,
}

impl Heartbeat {
    pub fn new() -> Self {
        Self { beats: 0 }
    }
}

impl Service for Heartbeat {
    fn init(&mut self, ctx: &mut ServiceContext, config: &str) -> Result<()> {
        let interval_ms: i64 = if config.trim().is_empty() {
            1000
        } else {
            config
                .trim()
                .parse()
                .map_err(|_| RuntimeError::init_failed("heartbeat interval must be an integer"))?
        };
        ctx.repeat(interval_ms, 0);
        Ok(())
    }

    fn dispatch(&mut self, ctx: &mut ServiceContext, msg: &mut Message) {
        if msg.kind() == MessageKind::Timer {
            self.beats += 1;
            info!(
                service = ctx.id(),
                worker = ctx.worker_id(),
                beats = self.beats,
                hosted = ctx.service_count(),
                "heartbeat"
            );
        }
    }
}

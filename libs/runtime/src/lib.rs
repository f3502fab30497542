//! Multi-worker actor runtime.
//!
//! Hosts many independently scheduled services on a fixed pool of worker
//! threads communicating solely by asynchronous messages.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │ Server ── master tick, signal word, lifecycle            │
//! │   │                                                      │
//! │   ├─ Router ── id/name directory, env map, factories     │
//! │   │     │                                                │
//! │   │     ▼ mailbox push (MPSC)                            │
//! │   ├─ Worker 1 ── services ▪ timers ▪ prefabs ▪ reactor   │
//! │   ├─ Worker 2 ── services ▪ timers ▪ prefabs ▪ reactor   │
//! │   └─ Worker N ── ...                                     │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! A service id embeds its hosting worker index in the high bits, so
//! routing never needs a global service table. Handlers run to
//! completion on their worker thread; asynchrony is expressed with
//! sessions: a request carries a positive session, its reply the
//! negated one.
//!
//! # Example
//!
//! ```no_run
//! use runtime::{Message, MessageKind, NewService, RuntimeConfig, Server, Service, ServiceContext};
//!
//! struct Echo;
//!
//! impl Service for Echo {
//!     fn init(&mut self, _ctx: &mut ServiceContext, _config: &str) -> runtime::Result<()> {
//!         Ok(())
//!     }
//!
//!     fn dispatch(&mut self, ctx: &mut ServiceContext, msg: &mut Message) {
//!         if msg.session() > 0 {
//!             ctx.respond(
//!                 msg.sender(),
//!                 msg.payload().clone(),
//!                 "",
//!                 -msg.session(),
//!                 MessageKind::Text,
//!             );
//!         }
//!     }
//! }
//!
//! let server = Server::init(RuntimeConfig::default()).unwrap();
//! server.router().register_factory("echo", || Box::new(Echo));
//! server.router().new_service(NewService::new("echo"), 0, 0, 0);
//! server.run();
//! ```

pub mod config;
pub mod error;
pub mod factory;
pub mod mailbox;
pub mod message;
pub mod reactor;
pub mod router;
pub mod server;
pub mod service;
pub mod timer;
pub mod worker;

pub use config::{MailboxLimits, RuntimeConfig};
pub use error::{Result, RuntimeError};
pub use mailbox::{Control, CreateService, Envelope, Mailbox, MailboxSender};
pub use message::{service_id, worker_of, Message, MessageKind, MAX_HEADER_LEN, MAX_WORKERS, WORKER_SHIFT};
pub use reactor::{NullReactor, Reactor, ReactorFactory};
pub use router::{NewService, Router};
pub use server::{Server, State, UPDATE_INTERVAL};
pub use service::{Prefab, Service, ServiceContext};
pub use timer::{TimerId, TimerWheel};
pub use worker::{WorkerHandle, WorkerStatus};

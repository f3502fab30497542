//! Seam for the external I/O engine.
//!
//! The concrete socket machinery lives outside the core; a worker only
//! requires something it can poll without blocking during its tick.
//! Completions surface as `Socket`-kind messages addressed to the owning
//! service, errors included (an I/O failure never propagates into the
//! core).

use crate::message::Message;

/// One reactor instance per worker, driven on the worker thread.
pub trait Reactor: Send {
    /// Poll for ready completions without blocking, emitting one message
    /// per event.
    fn poll(&mut self, emit: &mut dyn FnMut(Message));

    /// Called once when the owning worker shuts down.
    fn stop(&mut self) {}
}

/// Default reactor for embeddings that do no socket I/O.
#[derive(Debug, Default)]
pub struct NullReactor;

impl Reactor for NullReactor {
    fn poll(&mut self, _emit: &mut dyn FnMut(Message)) {}
}

/// Builds one reactor per worker at server init, keyed by worker index.
pub type ReactorFactory = Box<dyn Fn(u32) -> Box<dyn Reactor> + Send + Sync>;

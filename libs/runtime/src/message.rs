//! Message envelope and service-id addressing.
//!
//! A message is built mutable by its producer and becomes logically
//! immutable once handed to the router: routing consumes the value, so the
//! only code that can still mutate it afterwards is the dispatching worker
//! (which is exactly what redirect needs).

use bytes::Bytes;

/// High bits of a service id encode the 1-based index of the hosting worker.
pub const WORKER_SHIFT: u32 = 24;
/// Mask applied after the shift when recovering the worker index.
pub const WORKER_MASK: u32 = 0xFF;
/// Largest worker pool addressable through the id embedding.
pub const MAX_WORKERS: u32 = WORKER_MASK;
/// Upper bound on header length in bytes.
pub const MAX_HEADER_LEN: usize = 255;

/// Recover the 1-based hosting worker index from a service id.
#[inline]
pub fn worker_of(id: u32) -> u32 {
    (id >> WORKER_SHIFT) & WORKER_MASK
}

/// Compose a service id from a worker index and a worker-local sequence.
#[inline]
pub fn service_id(worker: u32, seq: u32) -> u32 {
    (worker << WORKER_SHIFT) | (seq & ((1 << WORKER_SHIFT) - 1))
}

/// Message taxonomy tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    Unknown = 0,
    /// Ordinary user traffic.
    Text = 1,
    /// Runtime-generated notifications (creation replies, command output).
    System = 2,
    /// I/O reactor completion events.
    Socket = 3,
    /// Routing or dispatch failure reports.
    Error = 4,
    /// Timer expirations; `session` carries the timer id.
    Timer = 5,
}

impl MessageKind {
    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => MessageKind::Text,
            2 => MessageKind::System,
            3 => MessageKind::Socket,
            4 => MessageKind::Error,
            5 => MessageKind::Timer,
            _ => MessageKind::Unknown,
        }
    }
}

/// The envelope routed between services.
///
/// `session` is the correlation field: positive in a request that awaits a
/// reply, negated in the reply, zero for fire-and-forget. Cloning shares the
/// payload bytes by reference count; the clone's envelope fields are
/// independent.
#[derive(Debug, Clone)]
pub struct Message {
    sender: u32,
    receiver: u32,
    session: i32,
    kind: MessageKind,
    broadcast: bool,
    header: String,
    payload: Bytes,
}

impl Message {
    /// New envelope with zeroed routing fields and an empty header.
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            sender: 0,
            receiver: 0,
            session: 0,
            kind: MessageKind::Unknown,
            broadcast: false,
            header: String::new(),
            payload: payload.into(),
        }
    }

    pub fn sender(&self) -> u32 {
        self.sender
    }

    pub fn receiver(&self) -> u32 {
        self.receiver
    }

    pub fn session(&self) -> i32 {
        self.session
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn broadcast(&self) -> bool {
        self.broadcast
    }

    pub fn header(&self) -> &str {
        &self.header
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Payload as UTF-8, lossy. Convenience for text-protocol services.
    pub fn text(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }

    pub fn set_sender(&mut self, v: u32) {
        self.sender = v;
    }

    pub fn set_receiver(&mut self, v: u32) {
        self.receiver = v;
    }

    pub fn set_session(&mut self, v: i32) {
        self.session = v;
    }

    pub fn set_kind(&mut self, v: MessageKind) {
        self.kind = v;
    }

    pub(crate) fn set_broadcast(&mut self, v: bool) {
        self.broadcast = v;
    }

    /// Set the header, truncating to [`MAX_HEADER_LEN`] bytes on a char
    /// boundary with a warning.
    pub fn set_header(&mut self, header: impl Into<String>) {
        let mut header = header.into();
        if header.len() > MAX_HEADER_LEN {
            let mut end = MAX_HEADER_LEN;
            while !header.is_char_boundary(end) {
                end -= 1;
            }
            tracing::warn!(len = header.len(), "message header truncated to {end} bytes");
            header.truncate(end);
        }
        self.header = header;
    }

    pub fn set_payload(&mut self, payload: impl Into<Bytes>) {
        self.payload = payload.into();
    }

    /// Point the message at a new receiver during dispatch; the worker
    /// re-routes it after the handler returns. Not allowed for broadcast
    /// messages.
    pub fn redirect(&mut self, receiver: u32) {
        self.receiver = receiver;
    }

    pub fn with_sender(mut self, v: u32) -> Self {
        self.sender = v;
        self
    }

    pub fn with_receiver(mut self, v: u32) -> Self {
        self.receiver = v;
        self
    }

    pub fn with_session(mut self, v: i32) -> Self {
        self.session = v;
        self
    }

    pub fn with_kind(mut self, v: MessageKind) -> Self {
        self.kind = v;
        self
    }

    pub fn with_header(mut self, header: impl Into<String>) -> Self {
        self.set_header(header);
        self
    }
}

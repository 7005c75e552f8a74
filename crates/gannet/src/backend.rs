//! Reactor capability surface.
//!
//! Every backend — readiness or completion — implements [`Reactor`].
//! The engine facade is generic over it, so backend selection is a
//! type parameter, not a runtime branch.

use std::sync::Arc;

use gannet_core::{EngineConfig, ErrorKind, NetResult};

use crate::session::Session;

pub type AcceptCallback = Box<dyn Fn(&Arc<Session>) + Send + Sync>;
pub type ReceiveCallback = Box<dyn Fn(&Arc<Session>, &[u8]) + Send + Sync>;
pub type DisconnectCallback = Box<dyn Fn(&Arc<Session>) + Send + Sync>;
pub type ErrorCallback = Box<dyn Fn(Option<&Arc<Session>>, ErrorKind) + Send + Sync>;

/// The four application callback slots a backend dispatches into.
#[derive(Default)]
pub struct Callbacks {
    pub on_accept: Option<AcceptCallback>,
    pub on_receive: Option<ReceiveCallback>,
    pub on_disconnect: Option<DisconnectCallback>,
    pub on_error: Option<ErrorCallback>,
}

impl Callbacks {
    #[inline]
    pub fn accept(&self, session: &Arc<Session>) {
        if let Some(cb) = &self.on_accept {
            cb(session);
        }
    }

    #[inline]
    pub fn receive(&self, session: &Arc<Session>, data: &[u8]) {
        if let Some(cb) = &self.on_receive {
            cb(session, data);
        }
    }

    #[inline]
    pub fn disconnect(&self, session: &Arc<Session>) {
        if let Some(cb) = &self.on_disconnect {
            cb(session);
        }
    }

    #[inline]
    pub fn error(&self, session: Option<&Arc<Session>>, kind: ErrorKind) {
        if let Some(cb) = &self.on_error {
            cb(session, kind);
        }
    }
}

/// One event-loop engine instance.
///
/// **Contract:**
/// - Callbacks are installed before `initialize` and never change after.
/// - `poll` runs handlers synchronously on the calling thread and
///   blocks at most `timeout_ms`. A false return is fatal for the
///   backend; further calls are no-ops.
/// - `send` never blocks and never drops bytes silently: a full send
///   ring is reported as [`ErrorKind::SendOverflow`] with the ring
///   unchanged.
/// - `shutdown` closes every session without firing callbacks and is
///   idempotent.
pub trait Reactor: Default + Send + Sync {
    fn set_accept_callback(&mut self, cb: AcceptCallback);
    fn set_receive_callback(&mut self, cb: ReceiveCallback);
    fn set_disconnect_callback(&mut self, cb: DisconnectCallback);
    fn set_error_callback(&mut self, cb: ErrorCallback);

    /// Create the OS resources: multiplexer, listen socket, session
    /// table. Leaves the listen socket bound but not yet listening.
    fn initialize(&mut self, config: &EngineConfig) -> NetResult<()>;

    /// Start accepting: `listen()` plus backend-specific arming.
    fn start_listen(&mut self) -> NetResult<()>;

    /// Drive one poll cycle. Returns false when the backend is stopped
    /// or broken.
    fn poll(&self, timeout_ms: u32) -> bool;

    /// Queue `data` on the session's send ring and arm a write if none
    /// is outstanding.
    fn send(&self, session: &Arc<Session>, data: &[u8]) -> NetResult<()>;

    /// Tear down: close all sessions silently, the listen socket, and
    /// the multiplexer.
    fn shutdown(&self);
}

//! # gannet — a pluggable TCP reactor engine
//!
//! gannet accepts thousands of persistent TCP connections and drives
//! non-blocking receive/send on each through a platform-native event
//! mechanism, surfacing per-session bytes and lifecycle events to
//! application handlers. Framing is the application's business: bytes
//! in are bytes up.
//!
//! ## Backends
//!
//! | Reactor | Model | Platform |
//! |---|---|---|
//! | [`EpollReactor`] | readiness, edge-triggered | Linux |
//! | [`UringReactor`] | completion | Linux |
//! | [`IocpReactor`] | completion | Windows |
//! | [`RioReactor`] | completion, registered buffers | Windows |
//!
//! ## Shape
//!
//! An [`Engine`] binds one reactor to an application [`EventHandler`].
//! One or more application threads call `poll(timeout)` in a loop; each
//! call drains ready events and runs handlers synchronously on the
//! calling thread.
//!
//! ```ignore
//! struct Echo;
//! impl EventHandler for Echo { /* override on_receive, ... */ }
//!
//! let mut engine: Engine<DefaultReactor, Echo> = Engine::new(Echo);
//! engine.initialize(&EngineConfig::default());
//! engine.start();
//! while running {
//!     engine.poll(100);
//! }
//! engine.stop();
//! ```

pub mod backend;
pub mod engine;
pub mod session;
pub mod socket;
pub mod table;

#[cfg(target_os = "linux")]
pub mod epoll;
#[cfg(target_os = "linux")]
mod notify;
#[cfg(target_os = "linux")]
pub mod uring;

#[cfg(windows)]
pub mod iocp;
#[cfg(windows)]
pub mod rio;

pub use backend::{
    AcceptCallback, Callbacks, DisconnectCallback, ErrorCallback, Reactor, ReceiveCallback,
};
pub use engine::{Engine, EventHandler};
pub use session::Session;
pub use table::SessionTable;

pub use gannet_core::{
    EngineConfig, ErrorKind, NetResult, PacketBuffer, RingBuffer, SessionConfig, SessionId,
    SessionState, SocketHandle, DEFAULT_BUFFER_SIZE, INVALID_SESSION_ID,
};

#[cfg(target_os = "linux")]
pub use epoll::EpollReactor;
#[cfg(target_os = "linux")]
pub use uring::UringReactor;

#[cfg(windows)]
pub use iocp::IocpReactor;
#[cfg(windows)]
pub use rio::RioReactor;

/// The readiness backend on Linux, IOCP on Windows.
#[cfg(target_os = "linux")]
pub type DefaultReactor = EpollReactor;
#[cfg(windows)]
pub type DefaultReactor = IocpReactor;

//! # gannet-core — primitives for the gannet TCP engine
//!
//! Everything in this crate is dependency-free and platform-neutral:
//! identifiers and states, the error taxonomy, the session ring buffer,
//! the packet buffer, the spin lock, leveled logging, and configuration.
//!
//! The engine crate (`gannet`) builds the reactors and the session
//! machinery on top of these types.

pub mod config;
pub mod error;
pub mod netlog;
pub mod packet;
pub mod ring;
pub mod spinlock;
pub mod types;

pub use config::{EngineConfig, SessionConfig};
pub use error::{ErrorKind, NetResult};
pub use packet::PacketBuffer;
pub use ring::RingBuffer;
pub use spinlock::{SpinLock, SpinLockGuard};
pub use types::{
    IoOp, SessionId, SessionState, SocketHandle, DEFAULT_BUFFER_SIZE, INVALID_SESSION_ID,
    INVALID_SOCKET_HANDLE,
};

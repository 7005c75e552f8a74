//! Engine error taxonomy.

use std::fmt;

/// Every failure the engine reports, as a kind rather than a payload type.
///
/// OS error numbers travel alongside the kind where one exists; the
/// engine logs them at the failure site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    // Configuration / lifecycle
    InvalidConfig,
    NotInitialized,
    AlreadyInitialized,

    // Socket setup
    SocketCreate(i32),
    SocketBind(i32),
    SocketListen(i32),
    SocketOption(i32),

    // Per-session I/O
    SendFailed(i32),
    ReceiveFailed(i32),
    DisconnectObserved,

    // Completion backends
    QueueCreate(i32),
    QueueRegister(i32),
    QueueDequeue(i32),
    QueueCorrupt,
    BackendUnsupported,

    // Sessions
    SessionNotFound,
    SessionLimitReached,
    InvalidSessionState,

    // Buffers
    SendOverflow,
    InvalidBufferSize,

    // Generic
    InvalidParameter,
    OutOfMemory,
    Timeout,
    Unknown,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidConfig => write!(f, "invalid configuration"),
            Self::NotInitialized => write!(f, "engine not initialized"),
            Self::AlreadyInitialized => write!(f, "engine already initialized"),
            Self::SocketCreate(e) => write!(f, "socket create failed: errno {}", e),
            Self::SocketBind(e) => write!(f, "socket bind failed: errno {}", e),
            Self::SocketListen(e) => write!(f, "socket listen failed: errno {}", e),
            Self::SocketOption(e) => write!(f, "socket option failed: errno {}", e),
            Self::SendFailed(e) => write!(f, "send failed: errno {}", e),
            Self::ReceiveFailed(e) => write!(f, "receive failed: errno {}", e),
            Self::DisconnectObserved => write!(f, "peer disconnected"),
            Self::QueueCreate(e) => write!(f, "completion queue create failed: errno {}", e),
            Self::QueueRegister(e) => write!(f, "completion queue register failed: errno {}", e),
            Self::QueueDequeue(e) => write!(f, "completion queue dequeue failed: errno {}", e),
            Self::QueueCorrupt => write!(f, "completion queue corrupt"),
            Self::BackendUnsupported => write!(f, "backend not supported on this system"),
            Self::SessionNotFound => write!(f, "session not found"),
            Self::SessionLimitReached => write!(f, "session limit reached"),
            Self::InvalidSessionState => write!(f, "invalid session state"),
            Self::SendOverflow => write!(f, "send ring overflow"),
            Self::InvalidBufferSize => write!(f, "invalid buffer size"),
            Self::InvalidParameter => write!(f, "invalid parameter"),
            Self::OutOfMemory => write!(f, "out of memory"),
            Self::Timeout => write!(f, "operation timed out"),
            Self::Unknown => write!(f, "unknown error"),
        }
    }
}

impl std::error::Error for ErrorKind {}

pub type NetResult<T> = std::result::Result<T, ErrorKind>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_carries_errno() {
        let s = ErrorKind::SocketBind(98).to_string();
        assert!(s.contains("98"));
    }
}

//! Engine and session configuration.

use crate::error::{ErrorKind, NetResult};
use crate::types::{
    DEFAULT_BACKLOG, DEFAULT_MAX_SESSIONS, DEFAULT_PORT, DEFAULT_SOCKET_BUFFER_SIZE,
};

/// Per-session tuning, applied when the session is created.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Largest application packet the session is expected to carry.
    /// The send and receive rings are sized at twice this value.
    pub max_packet_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            max_packet_size: 1024 * 1024,
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> NetResult<()> {
        if self.max_packet_size < 1024 || self.max_packet_size > 16 * 1024 * 1024 {
            return Err(ErrorKind::InvalidBufferSize);
        }
        Ok(())
    }

    /// Capacity of each session ring.
    #[inline]
    pub fn ring_capacity(&self) -> usize {
        self.max_packet_size * 2
    }
}

/// Engine-wide configuration.
///
/// `validate()` rejects any out-of-range value before the engine
/// touches a socket.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// TCP port to bind (1024–65535).
    pub port: u16,
    /// Hard cap on concurrent sessions (1–100000).
    pub max_sessions: u32,
    /// `listen()` backlog (1–10000).
    pub backlog: u32,

    /// Per-socket kernel send buffer hint (1 KiB–10 MiB).
    pub send_buf_size: usize,
    /// Per-socket kernel receive buffer hint (1 KiB–10 MiB).
    pub recv_buf_size: usize,

    /// Disable Nagle's algorithm on accepted sockets.
    pub no_delay: bool,
    /// Enable TCP keep-alive on accepted sockets.
    pub keep_alive: bool,
    /// Keep-alive idle time before probes, in milliseconds.
    pub keep_alive_idle_ms: u32,
    /// Interval between keep-alive probes, in milliseconds.
    pub keep_alive_interval_ms: u32,

    /// Completion queue depth for completion-based backends (128–1e6).
    pub completion_queue_size: u32,
    /// Per-session outstanding receive cap (completion backends).
    pub outstanding_reads: u32,
    /// Per-session outstanding send cap (completion backends).
    pub outstanding_writes: u32,

    /// Tuning applied to each accepted session.
    pub session: SessionConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            port: DEFAULT_PORT,
            max_sessions: DEFAULT_MAX_SESSIONS,
            backlog: DEFAULT_BACKLOG,
            send_buf_size: DEFAULT_SOCKET_BUFFER_SIZE,
            recv_buf_size: DEFAULT_SOCKET_BUFFER_SIZE,
            no_delay: true,
            keep_alive: true,
            keep_alive_idle_ms: 7_200_000,
            keep_alive_interval_ms: 1000,
            completion_queue_size: 2048,
            outstanding_reads: 100,
            outstanding_writes: 100,
            session: SessionConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> NetResult<()> {
        if self.port < 1024 {
            return Err(ErrorKind::InvalidConfig);
        }
        if self.max_sessions == 0 || self.max_sessions > 100_000 {
            return Err(ErrorKind::InvalidConfig);
        }
        if self.backlog == 0 || self.backlog > 10_000 {
            return Err(ErrorKind::InvalidConfig);
        }
        if self.send_buf_size < 1024 || self.send_buf_size > 10 * 1024 * 1024 {
            return Err(ErrorKind::InvalidBufferSize);
        }
        if self.recv_buf_size < 1024 || self.recv_buf_size > 10 * 1024 * 1024 {
            return Err(ErrorKind::InvalidBufferSize);
        }
        if self.completion_queue_size < 128 || self.completion_queue_size > 1_000_000 {
            return Err(ErrorKind::InvalidConfig);
        }
        if self.outstanding_reads == 0 || self.outstanding_writes == 0 {
            return Err(ErrorKind::InvalidConfig);
        }
        self.session.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_out_of_range() {
        let mut c = EngineConfig::default();
        c.port = 80;
        assert_eq!(c.validate(), Err(ErrorKind::InvalidConfig));

        let mut c = EngineConfig::default();
        c.max_sessions = 0;
        assert!(c.validate().is_err());

        let mut c = EngineConfig::default();
        c.max_sessions = 100_001;
        assert!(c.validate().is_err());

        let mut c = EngineConfig::default();
        c.backlog = 20_000;
        assert!(c.validate().is_err());

        let mut c = EngineConfig::default();
        c.send_buf_size = 512;
        assert_eq!(c.validate(), Err(ErrorKind::InvalidBufferSize));

        let mut c = EngineConfig::default();
        c.recv_buf_size = 11 * 1024 * 1024;
        assert!(c.validate().is_err());

        let mut c = EngineConfig::default();
        c.completion_queue_size = 64;
        assert!(c.validate().is_err());

        let mut c = EngineConfig::default();
        c.session.max_packet_size = 0;
        assert!(c.validate().is_err());
    }
}

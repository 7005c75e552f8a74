//! Per-connection state.
//!
//! A `Session` is a passive data carrier: id, socket handle, lifecycle
//! state, the send/receive rings and the send-in-flight flag. It issues
//! no syscalls of its own; the reactors drive all I/O. Create only
//! through [`SessionTable`](crate::table::SessionTable).

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};

use gannet_core::{RingBuffer, SessionConfig, SessionId, SessionState, SocketHandle, SpinLock};

pub struct Session {
    id: SessionId,
    socket: SocketHandle,
    state: AtomicU8,
    send_ring: SpinLock<RingBuffer>,
    recv_ring: SpinLock<RingBuffer>,
    /// Application-owned cookie. The engine stores it and hands it back,
    /// nothing more.
    user_cookie: AtomicU64,
    sending: AtomicBool,
    config: SessionConfig,
}

impl Session {
    pub(crate) fn new(id: SessionId, socket: SocketHandle, config: &SessionConfig) -> Self {
        Session {
            id,
            socket,
            state: AtomicU8::new(SessionState::Idle as u8),
            send_ring: SpinLock::new(RingBuffer::new(config.ring_capacity())),
            recv_ring: SpinLock::new(RingBuffer::new(config.ring_capacity())),
            user_cookie: AtomicU64::new(0),
            sending: AtomicBool::new(false),
            config: config.clone(),
        }
    }

    #[inline]
    pub fn id(&self) -> SessionId {
        self.id
    }

    #[inline]
    pub fn socket(&self) -> SocketHandle {
        self.socket
    }

    #[inline]
    pub fn state(&self) -> SessionState {
        SessionState::from(self.state.load(Ordering::Acquire))
    }

    #[inline]
    pub(crate) fn set_state(&self, state: SessionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Claim the transition into `Disconnected`.
    ///
    /// Returns true for exactly one caller per session lifetime; every
    /// other caller (a second error in the same poll batch, a racing
    /// thread) sees false. The winner owns the disconnect path: handler,
    /// unregistration, socket close, table removal.
    pub(crate) fn transition_disconnected(&self) -> bool {
        let mut cur = self.state.load(Ordering::Acquire);
        loop {
            if SessionState::from(cur) == SessionState::Disconnected {
                return false;
            }
            match self.state.compare_exchange_weak(
                cur,
                SessionState::Disconnected as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => cur = actual,
            }
        }
    }

    #[inline]
    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Connected
    }

    #[inline]
    pub fn is_disconnected(&self) -> bool {
        self.state() == SessionState::Disconnected
    }

    /// Send ring plus its serializing lock. Writers (`send`) and the
    /// reactor's drainer take this lock; it is never held across a
    /// blocking call.
    #[inline]
    pub fn send_ring(&self) -> &SpinLock<RingBuffer> {
        &self.send_ring
    }

    /// Receive-side staging ring for the application. The reactors hand
    /// received bytes straight to the handler; this ring exists for
    /// handlers that want to accumulate partial frames.
    #[inline]
    pub fn recv_ring(&self) -> &SpinLock<RingBuffer> {
        &self.recv_ring
    }

    /// True while the reactor has one outstanding write operation.
    #[inline]
    pub fn is_sending(&self) -> bool {
        self.sending.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn set_sending(&self, sending: bool) {
        self.sending.store(sending, Ordering::Release);
    }

    pub fn set_user_cookie(&self, cookie: u64) {
        self.user_cookie.store(cookie, Ordering::Release);
    }

    pub fn user_cookie(&self) -> u64 {
        self.user_cookie.load(Ordering::Acquire)
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gannet_core::INVALID_SOCKET_HANDLE;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::thread;

    fn make_session() -> Session {
        Session::new(1, INVALID_SOCKET_HANDLE, &SessionConfig::default())
    }

    #[test]
    fn test_initial_state() {
        let s = make_session();
        assert_eq!(s.state(), SessionState::Idle);
        assert!(!s.is_sending());
        assert_eq!(s.user_cookie(), 0);
        assert_eq!(
            s.send_ring().lock().capacity(),
            SessionConfig::default().ring_capacity()
        );
    }

    #[test]
    fn test_disconnect_transition_is_exactly_once() {
        let s = make_session();
        s.set_state(SessionState::Connected);
        assert!(s.transition_disconnected());
        assert!(!s.transition_disconnected());
        assert!(s.is_disconnected());
    }

    #[test]
    fn test_disconnect_race_single_winner() {
        let s = Arc::new(make_session());
        s.set_state(SessionState::Connected);
        let wins = Arc::new(AtomicUsize::new(0));

        let mut handles = vec![];
        for _ in 0..8 {
            let s = Arc::clone(&s);
            let wins = Arc::clone(&wins);
            handles.push(thread::spawn(move || {
                if s.transition_disconnected() {
                    wins.fetch_add(1, Ordering::Relaxed);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(wins.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_user_cookie_roundtrip() {
        let s = make_session();
        s.set_user_cookie(0xDEAD_BEEF);
        assert_eq!(s.user_cookie(), 0xDEAD_BEEF);
    }

    // The receive ring is application staging: a handler accumulating
    // partial frames across receive callbacks.
    #[test]
    fn test_recv_ring_staging() {
        let s = make_session();
        {
            let mut ring = s.recv_ring().lock();
            ring.write(b"\x00\x05he");
        }
        {
            let mut ring = s.recv_ring().lock();
            ring.write(b"llo");
            assert_eq!(ring.available_read(), 7);
            let mut frame = [0u8; 7];
            ring.read(&mut frame);
            assert_eq!(&frame, b"\x00\x05hello");
        }
    }
}

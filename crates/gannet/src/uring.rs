//! io_uring reactor (Linux completion backend).
//!
//! Operations are submitted with a slab index plus operation kind
//! packed into the CQE `user_data`; each slab slot owns the operation's
//! buffer, so completions never chase freed memory.
//!
//! The submission queue belongs to the poll path. Application threads
//! calling `send` never touch it: they enqueue the session id on a
//! lock-free queue and write an eventfd the ring keeps a read armed on,
//! which both wakes the poller and hands it the pending work.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam_queue::ArrayQueue;
use io_uring::{opcode, types, IoUring};

use gannet_core::{net_debug, net_error, net_info, net_warn};
use gannet_core::{
    EngineConfig, ErrorKind, IoOp, NetResult, SessionId, SessionState, SocketHandle,
    DEFAULT_BUFFER_SIZE,
};

use crate::backend::{
    AcceptCallback, Callbacks, DisconnectCallback, ErrorCallback, Reactor, ReceiveCallback,
};
use crate::notify::EventFdNotifier;
use crate::session::Session;
use crate::socket;
use crate::table::SessionTable;

static SUPPORT_CHECKED: AtomicBool = AtomicBool::new(false);
static SUPPORTED: AtomicBool = AtomicBool::new(false);

const OP_SHIFT: u32 = 56;
const IDX_MASK: u64 = (1 << OP_SHIFT) - 1;

#[inline]
fn encode_op(kind: IoOp, idx: usize) -> u64 {
    ((kind as u64) << OP_SHIFT) | idx as u64
}

#[inline]
fn decode_op(user_data: u64) -> (IoOp, usize) {
    (
        IoOp::from((user_data >> OP_SHIFT) as u8),
        (user_data & IDX_MASK) as usize,
    )
}

/// Accept address storage; boxed so the kernel-visible pointers stay
/// put while the slab reallocates.
struct AcceptAddr {
    addr: libc::sockaddr_in,
    len: libc::socklen_t,
}

/// One in-flight operation. Owns the buffer the kernel writes/reads.
struct OpCtx {
    kind: IoOp,
    session: Option<Arc<Session>>,
    buf: Box<[u8]>,
    /// Bytes of `buf` carrying payload (send ops).
    len: usize,
    addr: Option<Box<AcceptAddr>>,
}

struct OpSlab {
    slots: Vec<Option<OpCtx>>,
    free: Vec<usize>,
}

impl OpSlab {
    fn new() -> Self {
        OpSlab {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }

    fn insert(&mut self, ctx: OpCtx) -> usize {
        match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = Some(ctx);
                idx
            }
            None => {
                self.slots.push(Some(ctx));
                self.slots.len() - 1
            }
        }
    }

    fn get_mut(&mut self, idx: usize) -> Option<&mut OpCtx> {
        self.slots.get_mut(idx)?.as_mut()
    }

    fn take(&mut self, idx: usize) -> Option<OpCtx> {
        let ctx = self.slots.get_mut(idx)?.take();
        if ctx.is_some() {
            self.free.push(idx);
        }
        ctx
    }
}

struct RingState {
    ring: IoUring,
    ops: OpSlab,
}

pub struct UringReactor {
    initialized: AtomicBool,
    running: AtomicBool,
    listen_fd: AtomicI32,
    config: EngineConfig,
    table: SessionTable,
    callbacks: Callbacks,
    ring: Mutex<Option<RingState>>,
    /// Sessions with newly armed sends, fed by application threads.
    pending_sends: ArrayQueue<SessionId>,
    notifier: Option<EventFdNotifier>,
}

impl Default for UringReactor {
    fn default() -> Self {
        UringReactor {
            initialized: AtomicBool::new(false),
            running: AtomicBool::new(false),
            listen_fd: AtomicI32::new(-1),
            config: EngineConfig::default(),
            table: SessionTable::new(0),
            callbacks: Callbacks::default(),
            ring: Mutex::new(None),
            pending_sends: ArrayQueue::new(1),
            notifier: None,
        }
    }
}

impl UringReactor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether this kernel can host the backend. Probes once per
    /// process by building a minimal ring; the outcome is cached.
    pub fn is_supported() -> bool {
        if SUPPORT_CHECKED.load(Ordering::Acquire) {
            return SUPPORTED.load(Ordering::Acquire);
        }
        let ok = IoUring::new(8).is_ok();
        SUPPORTED.store(ok, Ordering::Release);
        SUPPORT_CHECKED.store(true, Ordering::Release);
        ok
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn session_count(&self) -> usize {
        self.table.len()
    }

    fn push_sqe(st: &mut RingState, sqe: &io_uring::squeue::Entry) -> bool {
        // Safety: every SQE built here points into slab-owned storage
        // that lives until the matching CQE is reaped.
        unsafe {
            if st.ring.submission().push(sqe).is_ok() {
                return true;
            }
            // SQ full: kick the kernel and retry once
            let _ = st.ring.submit();
            if st.ring.submission().push(sqe).is_ok() {
                return true;
            }
        }
        net_error!("io_uring submission queue full");
        false
    }

    fn submit_accept(st: &mut RingState, listen_fd: SocketHandle, reuse: Option<usize>) -> bool {
        let idx = match reuse {
            Some(idx) => idx,
            None => st.ops.insert(OpCtx {
                kind: IoOp::Accept,
                session: None,
                buf: Vec::new().into_boxed_slice(),
                len: 0,
                addr: Some(Box::new(AcceptAddr {
                    addr: unsafe { std::mem::zeroed() },
                    len: std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
                })),
            }),
        };

        let ctx = match st.ops.get_mut(idx) {
            Some(c) => c,
            None => return false,
        };
        let store = ctx.addr.as_mut().expect("accept ctx without addr");
        store.len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
        let addr_ptr = &mut store.addr as *mut libc::sockaddr_in as *mut libc::sockaddr;
        let len_ptr = &mut store.len as *mut libc::socklen_t;

        let sqe = opcode::Accept::new(types::Fd(listen_fd), addr_ptr, len_ptr)
            .build()
            .user_data(encode_op(IoOp::Accept, idx));
        if !Self::push_sqe(st, &sqe) {
            st.ops.take(idx);
            return false;
        }
        true
    }

    fn submit_recv(st: &mut RingState, session: &Arc<Session>, reuse: Option<usize>) -> bool {
        let idx = match reuse {
            Some(idx) => idx,
            None => st.ops.insert(OpCtx {
                kind: IoOp::Receive,
                session: Some(Arc::clone(session)),
                buf: vec![0u8; DEFAULT_BUFFER_SIZE].into_boxed_slice(),
                len: 0,
                addr: None,
            }),
        };

        let ctx = match st.ops.get_mut(idx) {
            Some(c) => c,
            None => return false,
        };
        let sqe = opcode::Recv::new(
            types::Fd(session.socket()),
            ctx.buf.as_mut_ptr(),
            ctx.buf.len() as u32,
        )
        .build()
        .user_data(encode_op(IoOp::Receive, idx));
        if !Self::push_sqe(st, &sqe) {
            st.ops.take(idx);
            return false;
        }
        true
    }

    /// Submit one send chunk from the session ring, or clear the
    /// sending flag if the ring is already empty. The flag is only ever
    /// cleared under the ring lock, so a concurrent `send` either sees
    /// it set (and skips arming) or runs after the clear (and arms).
    fn submit_send_chunk(st: &mut RingState, session: &Arc<Session>) -> bool {
        let chunk: Option<Box<[u8]>> = {
            let mut ring = session.send_ring().lock();
            let avail = ring.available_read();
            if avail == 0 {
                session.set_sending(false);
                None
            } else {
                let n = avail.min(DEFAULT_BUFFER_SIZE);
                let mut buf = vec![0u8; n].into_boxed_slice();
                ring.peek(&mut buf);
                Some(buf)
            }
        };
        let chunk = match chunk {
            Some(c) => c,
            None => return true,
        };

        let len = chunk.len();
        let idx = st.ops.insert(OpCtx {
            kind: IoOp::Send,
            session: Some(Arc::clone(session)),
            len,
            buf: chunk,
            addr: None,
        });
        let ctx = st.ops.get_mut(idx).expect("send ctx just inserted");
        let sqe = opcode::Send::new(types::Fd(session.socket()), ctx.buf.as_ptr(), len as u32)
            .flags(libc::MSG_NOSIGNAL)
            .build()
            .user_data(encode_op(IoOp::Send, idx));
        if !Self::push_sqe(st, &sqe) {
            st.ops.take(idx);
            session.set_sending(false);
            return false;
        }
        true
    }

    fn submit_wake(st: &mut RingState, event_fd: i32, reuse: Option<usize>) -> bool {
        let idx = match reuse {
            Some(idx) => idx,
            None => st.ops.insert(OpCtx {
                kind: IoOp::Wake,
                session: None,
                buf: vec![0u8; 8].into_boxed_slice(),
                len: 0,
                addr: None,
            }),
        };
        let ctx = match st.ops.get_mut(idx) {
            Some(c) => c,
            None => return false,
        };
        let sqe = opcode::Read::new(types::Fd(event_fd), ctx.buf.as_mut_ptr(), 8)
            .build()
            .user_data(encode_op(IoOp::Wake, idx));
        if !Self::push_sqe(st, &sqe) {
            st.ops.take(idx);
            return false;
        }
        true
    }

    fn drain_pending_sends(&self, st: &mut RingState) {
        while let Some(id) = self.pending_sends.pop() {
            if let Some(session) = self.table.get(id) {
                if session.state().is_live() {
                    Self::submit_send_chunk(st, &session);
                } else {
                    session.set_sending(false);
                }
            }
        }
    }

    fn complete_accept(&self, st: &mut RingState, idx: usize, res: i32) {
        // The listen socket must never sit idle: re-arm before looking
        // at the result, reusing the context slot.
        if self.running.load(Ordering::Acquire) && res != -libc::ECANCELED {
            Self::submit_accept(st, self.listen_fd.load(Ordering::Acquire), Some(idx));
        } else {
            st.ops.take(idx);
        }

        if res < 0 {
            if res != -libc::ECANCELED {
                net_error!("accept failed. errno: {}", -res);
            }
            return;
        }

        let client = res as SocketHandle;
        socket::set_non_blocking(client, true);
        socket::apply_config(client, &self.config);

        let session = match self.table.add(client, &self.config.session) {
            Some(s) => s,
            None => {
                // Over capacity: close immediately, no callback
                socket::close(client);
                return;
            }
        };
        session.set_state(SessionState::Connected);

        if !Self::submit_recv(st, &session, None) {
            socket::shutdown_both(client);
            socket::close(client);
            self.table.remove(session.id());
            return;
        }

        self.callbacks.accept(&session);
        net_debug!("client accepted. session: {}", session.id());
    }

    fn complete_recv(&self, st: &mut RingState, idx: usize, res: i32) {
        let session = match st.ops.get_mut(idx).and_then(|c| c.session.clone()) {
            Some(s) => s,
            None => {
                st.ops.take(idx);
                return;
            }
        };
        if !session.state().is_live() {
            st.ops.take(idx);
            return;
        }

        if res > 0 {
            let n = res as usize;
            if let Some(ctx) = st.ops.get_mut(idx) {
                self.callbacks.receive(&session, &ctx.buf[..n]);
            }
            // Same slot, same buffer, next read
            Self::submit_recv(st, &session, Some(idx));
        } else if res == 0 {
            // Graceful peer close
            st.ops.take(idx);
            self.disconnect_session(&session);
        } else {
            st.ops.take(idx);
            if res != -libc::ECANCELED {
                net_error!("receive failed. session: {}, errno: {}", session.id(), -res);
            }
            self.disconnect_session(&session);
        }
    }

    fn complete_send(&self, st: &mut RingState, idx: usize, res: i32) {
        let ctx = match st.ops.take(idx) {
            Some(c) => c,
            None => return,
        };
        let session = match ctx.session {
            Some(s) => s,
            None => return,
        };

        if res > 0 {
            let more = {
                let mut ring = session.send_ring().lock();
                ring.skip(res as usize);
                if ring.available_read() > 0 {
                    true
                } else {
                    session.set_sending(false);
                    false
                }
            };
            if more {
                Self::submit_send_chunk(st, &session);
            }
        } else {
            session.set_sending(false);
            if res != -libc::ECANCELED {
                net_error!("send failed. session: {}, errno: {}", session.id(), -res);
            }
            self.disconnect_session(&session);
        }
    }

    fn complete_wake(&self, st: &mut RingState, idx: usize, event_fd: i32) {
        Self::submit_wake(st, event_fd, Some(idx));
        self.drain_pending_sends(st);
    }

    /// Idempotent disconnect. Outstanding operations on the closed
    /// socket finish with an error and are swallowed because the
    /// session is no longer live.
    fn disconnect_session(&self, session: &Arc<Session>) {
        if !session.transition_disconnected() {
            return;
        }

        self.callbacks.disconnect(session);
        net_debug!("client disconnected. session: {}", session.id());

        socket::close(session.socket());
        self.table.remove(session.id());
    }
}

impl Reactor for UringReactor {
    fn set_accept_callback(&mut self, cb: AcceptCallback) {
        self.callbacks.on_accept = Some(cb);
    }

    fn set_receive_callback(&mut self, cb: ReceiveCallback) {
        self.callbacks.on_receive = Some(cb);
    }

    fn set_disconnect_callback(&mut self, cb: DisconnectCallback) {
        self.callbacks.on_disconnect = Some(cb);
    }

    fn set_error_callback(&mut self, cb: ErrorCallback) {
        self.callbacks.on_error = Some(cb);
    }

    fn initialize(&mut self, config: &EngineConfig) -> NetResult<()> {
        if self.initialized.load(Ordering::Acquire) {
            net_error!("io_uring reactor already initialized");
            return Err(ErrorKind::AlreadyInitialized);
        }
        config.validate()?;

        if !Self::is_supported() {
            net_error!("io_uring is not supported on this system (requires Linux 5.1+)");
            self.callbacks.error(None, ErrorKind::BackendUnsupported);
            return Err(ErrorKind::BackendUnsupported);
        }

        socket::init_subsystem();

        let entries = config.completion_queue_size.next_power_of_two().min(32768);
        let ring = match IoUring::new(entries) {
            Ok(r) => r,
            Err(e) => {
                let errno = e.raw_os_error().unwrap_or(-1);
                net_error!("failed to initialize io_uring. errno: {}", errno);
                return Err(ErrorKind::QueueCreate(errno));
            }
        };

        let listen_fd = socket::create_tcp_socket()?;
        socket::set_reuse_address(listen_fd, true);
        socket::apply_config(listen_fd, config);
        socket::set_non_blocking(listen_fd, true);

        if let Err(kind) = socket::bind_any(listen_fd, config.port) {
            socket::close(listen_fd);
            return Err(kind);
        }

        let notifier = match EventFdNotifier::create() {
            Ok(n) => n,
            Err(kind) => {
                socket::close(listen_fd);
                return Err(kind);
            }
        };

        self.config = config.clone();
        self.table = SessionTable::new(config.max_sessions as usize);
        self.pending_sends = ArrayQueue::new(config.max_sessions as usize + 16);
        self.notifier = Some(notifier);
        *self.ring.lock().unwrap() = Some(RingState {
            ring,
            ops: OpSlab::new(),
        });
        self.listen_fd.store(listen_fd, Ordering::Release);
        self.initialized.store(true, Ordering::Release);

        net_info!("io_uring reactor initialized. port: {}", config.port);
        Ok(())
    }

    fn start_listen(&mut self) -> NetResult<()> {
        if !self.initialized.load(Ordering::Acquire) {
            net_error!("io_uring reactor not initialized");
            return Err(ErrorKind::NotInitialized);
        }
        if self.running.load(Ordering::Acquire) {
            net_warn!("io_uring reactor already running");
            return Ok(());
        }

        let listen_fd = self.listen_fd.load(Ordering::Acquire);
        socket::listen(listen_fd, self.config.backlog)?;

        let event_fd = self.notifier.as_ref().map(|n| n.fd()).unwrap_or(-1);
        {
            let mut guard = self.ring.lock().unwrap();
            let st = guard.as_mut().ok_or(ErrorKind::NotInitialized)?;
            if !Self::submit_accept(st, listen_fd, None) {
                return Err(ErrorKind::QueueRegister(socket::last_errno()));
            }
            Self::submit_wake(st, event_fd, None);
            if let Err(e) = st.ring.submit() {
                net_error!("io_uring submit failed: {}", e);
                return Err(ErrorKind::QueueRegister(e.raw_os_error().unwrap_or(-1)));
            }
        }

        self.running.store(true, Ordering::Release);
        net_info!("io_uring reactor listening");
        Ok(())
    }

    fn poll(&self, timeout_ms: u32) -> bool {
        if !self.running.load(Ordering::Acquire) {
            return false;
        }
        let mut guard = self.ring.lock().unwrap();
        let st = match guard.as_mut() {
            Some(s) => s,
            None => return false,
        };

        self.drain_pending_sends(st);

        // One enter: flush queued SQEs and wait for a completion up to
        // the timeout. Timeout and interrupt are not failures.
        let wait = if timeout_ms == 0 {
            st.ring.submit().map(|_| ())
        } else {
            let ts = types::Timespec::new()
                .sec((timeout_ms / 1000) as u64)
                .nsec((timeout_ms % 1000) * 1_000_000);
            let args = types::SubmitArgs::new().timespec(&ts);
            st.ring.submitter().submit_with_args(1, &args).map(|_| ())
        };
        if let Err(e) = wait {
            match e.raw_os_error() {
                Some(libc::ETIME) | Some(libc::EINTR) | Some(libc::EBUSY) => {}
                // Kernel without EXT_ARG: flush without waiting and let
                // the caller's loop pace us.
                Some(libc::EINVAL) | Some(libc::EOPNOTSUPP) => {
                    let _ = st.ring.submit();
                }
                _ => {
                    net_error!("io_uring enter failed: {}", e);
                    // Fatal for the backend: later polls are no-ops
                    self.running.store(false, Ordering::Release);
                    self.callbacks.error(None, ErrorKind::QueueCorrupt);
                    return false;
                }
            }
        }

        let completions: Vec<(u64, i32)> = st
            .ring
            .completion()
            .map(|cqe| (cqe.user_data(), cqe.result()))
            .collect();

        let event_fd = self.notifier.as_ref().map(|n| n.fd()).unwrap_or(-1);
        for (user_data, res) in completions {
            let (kind, idx) = decode_op(user_data);
            match kind {
                IoOp::Accept => self.complete_accept(st, idx, res),
                IoOp::Receive => self.complete_recv(st, idx, res),
                IoOp::Send => self.complete_send(st, idx, res),
                IoOp::Wake => self.complete_wake(st, idx, event_fd),
            }
        }

        true
    }

    fn send(&self, session: &Arc<Session>, data: &[u8]) -> NetResult<()> {
        if !self.running.load(Ordering::Acquire) {
            return Err(ErrorKind::NotInitialized);
        }
        if data.is_empty() {
            return Err(ErrorKind::InvalidParameter);
        }
        if !session.is_connected() {
            return Err(ErrorKind::InvalidSessionState);
        }

        let arm = {
            let mut ring = session.send_ring().lock();
            if ring.available_write() < data.len() {
                net_warn!("send ring overflow. session: {}", session.id());
                return Err(ErrorKind::SendOverflow);
            }
            ring.write(data);
            if session.is_sending() {
                false
            } else {
                session.set_sending(true);
                true
            }
        };

        if arm {
            if self.pending_sends.push(session.id()).is_err() {
                // Queue sized to max_sessions; only a shutdown race gets here
                session.set_sending(false);
                return Err(ErrorKind::SendFailed(0));
            }
            if let Some(n) = &self.notifier {
                let _ = n.notify();
            }
        }
        Ok(())
    }

    fn shutdown(&self) {
        if !self.initialized.swap(false, Ordering::AcqRel) {
            return;
        }
        self.running.store(false, Ordering::Release);

        // Wake a poller blocked in the ring wait before taking the lock
        if let Some(n) = &self.notifier {
            let _ = n.notify();
        }

        // Dropping the ring state reaps the queues and every in-flight
        // operation context
        *self.ring.lock().unwrap() = None;

        // Sessions are closed silently: no disconnect callbacks at shutdown
        self.table.for_each(|session| {
            socket::shutdown_both(session.socket());
            socket::close(session.socket());
        });
        self.table.clear();

        let listen_fd = self.listen_fd.swap(-1, Ordering::AcqRel);
        if listen_fd >= 0 {
            socket::close(listen_fd);
        }

        socket::shutdown_subsystem();
        net_info!("io_uring reactor shutdown complete");
    }
}

impl Drop for UringReactor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_op_encoding_roundtrip() {
        for (kind, idx) in [
            (IoOp::Accept, 0usize),
            (IoOp::Receive, 42),
            (IoOp::Send, 65535),
            (IoOp::Wake, 1),
        ] {
            let (k, i) = decode_op(encode_op(kind, idx));
            assert_eq!(k, kind);
            assert_eq!(i, idx);
        }
    }

    #[test]
    fn test_slab_reuses_slots() {
        let mut slab = OpSlab::new();
        let a = slab.insert(OpCtx {
            kind: IoOp::Receive,
            session: None,
            buf: Vec::new().into_boxed_slice(),
            len: 0,
            addr: None,
        });
        assert!(slab.take(a).is_some());
        assert!(slab.take(a).is_none());
        let b = slab.insert(OpCtx {
            kind: IoOp::Send,
            session: None,
            buf: Vec::new().into_boxed_slice(),
            len: 0,
            addr: None,
        });
        assert_eq!(a, b);
    }

    #[test]
    fn test_probe_is_cached() {
        let first = UringReactor::is_supported();
        let second = UringReactor::is_supported();
        assert_eq!(first, second);
    }

    #[test]
    fn test_poll_before_start_is_noop() {
        let r = UringReactor::new();
        assert!(!r.poll(0));
    }

    // End-to-end echo over loopback, skipped where the kernel lacks
    // io_uring (the probe decides).
    #[test]
    fn test_loopback_echo() {
        use crate::engine::{Engine, EventHandler};
        use std::io::{Read, Write};
        use std::sync::atomic::AtomicUsize;
        use std::sync::{OnceLock, Weak};
        use std::time::Duration;

        if !UringReactor::is_supported() {
            return;
        }

        type UringEngine = Engine<UringReactor, Echo>;

        struct Echo {
            engine: OnceLock<Weak<UringEngine>>,
            disconnects: AtomicUsize,
        }

        impl EventHandler for Echo {
            fn on_receive(&self, session: &Arc<Session>, data: &[u8]) {
                if let Some(engine) = self.engine.get().and_then(|w| w.upgrade()) {
                    let _ = engine.send(session, data);
                }
            }
            fn on_disconnect(&self, _session: &Arc<Session>) {
                self.disconnects.fetch_add(1, Ordering::SeqCst);
            }
        }

        let mut engine: UringEngine = Engine::new(Echo {
            engine: OnceLock::new(),
            disconnects: AtomicUsize::new(0),
        });
        let mut cfg = EngineConfig::default();
        cfg.port = 19200;
        engine.initialize(&cfg).unwrap();
        engine.start().unwrap();
        let engine = Arc::new(engine);
        engine
            .handler()
            .engine
            .set(Arc::downgrade(&engine))
            .ok()
            .unwrap();

        let stop = Arc::new(AtomicBool::new(false));
        let poller = {
            let engine = Arc::clone(&engine);
            let stop = Arc::clone(&stop);
            std::thread::spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    engine.poll(10);
                }
            })
        };

        let mut client = std::net::TcpStream::connect(("127.0.0.1", 19200)).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(10)))
            .unwrap();
        let payload: Vec<u8> = (0..100_000).map(|i| (i % 251) as u8).collect();
        client.write_all(&payload).unwrap();
        let mut echoed = vec![0u8; payload.len()];
        client.read_exact(&mut echoed).unwrap();
        assert_eq!(echoed, payload);

        drop(client);
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while engine.handler().disconnects.load(Ordering::SeqCst) == 0
            && std::time::Instant::now() < deadline
        {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(engine.handler().disconnects.load(Ordering::SeqCst), 1);

        stop.store(true, Ordering::Relaxed);
        poller.join().unwrap();
        engine.stop();
    }
}

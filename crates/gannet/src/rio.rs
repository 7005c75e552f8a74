//! Registered I/O reactor (Windows completion backend).
//!
//! RIO trades per-operation buffer locking for two pools registered
//! once at initialize: a receive pool of `outstanding_reads` slots of
//! `recv_buf_size` bytes and a send pool of `outstanding_writes` slots
//! of `send_buf_size` bytes. Operations reference pool slots by
//! `RIO_BUF` offset; completions return the slot through the request
//! context.
//!
//! RIO has no asynchronous accept, so `poll` drains a non-blocking
//! `accept` loop on the listen socket and uses `WSAPoll` on it to
//! bound the wait when the completion queue is empty.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam_queue::ArrayQueue;
use windows_sys::Win32::Networking::WinSock as ws;

use gannet_core::{net_debug, net_error, net_info, net_warn};
use gannet_core::{
    EngineConfig, ErrorKind, IoOp, NetResult, SessionId, SessionState, SocketHandle,
    INVALID_SOCKET_HANDLE,
};

use crate::backend::{
    AcceptCallback, Callbacks, DisconnectCallback, ErrorCallback, Reactor, ReceiveCallback,
};
use crate::session::Session;
use crate::socket;
use crate::table::SessionTable;

static SUPPORT_CHECKED: AtomicBool = AtomicBool::new(false);
static SUPPORTED: AtomicBool = AtomicBool::new(false);

/// Completions dequeued per poll cycle.
const DEQUEUE_BATCH: usize = 64;

const OP_SHIFT: u32 = 56;
const IDX_MASK: u64 = (1 << OP_SHIFT) - 1;

#[inline]
fn encode_ctx(kind: IoOp, slot: u32) -> u64 {
    ((kind as u64) << OP_SHIFT) | slot as u64
}

#[inline]
fn decode_ctx(ctx: u64) -> (IoOp, u32) {
    (IoOp::from((ctx >> OP_SHIFT) as u8), (ctx & IDX_MASK) as u32)
}

/// One registered buffer region divided into fixed slots.
struct BufferPool {
    id: ws::RIO_BUFFERID,
    storage: Box<[u8]>,
    slot_size: usize,
    free: Vec<u32>,
}

impl BufferPool {
    fn register(
        rio: &ws::RIO_EXTENSION_FUNCTION_TABLE,
        slot_size: usize,
        slot_count: usize,
    ) -> NetResult<Self> {
        let register_fn = rio.RIORegisterBuffer.ok_or(ErrorKind::BackendUnsupported)?;
        let mut storage = vec![0u8; slot_size * slot_count].into_boxed_slice();
        let id = unsafe { register_fn(storage.as_mut_ptr(), storage.len() as u32) };
        if id == ws::RIO_INVALID_BUFFERID {
            let e = socket::last_errno();
            net_error!("RIORegisterBuffer failed. error: {}", e);
            return Err(ErrorKind::QueueRegister(e));
        }
        Ok(BufferPool {
            id,
            storage,
            slot_size,
            free: (0..slot_count as u32).rev().collect(),
        })
    }

    fn acquire(&mut self) -> Option<u32> {
        self.free.pop()
    }

    fn release(&mut self, slot: u32) {
        self.free.push(slot);
    }

    fn rio_buf(&self, slot: u32, len: usize) -> ws::RIO_BUF {
        ws::RIO_BUF {
            BufferId: self.id,
            Offset: slot * self.slot_size as u32,
            Length: len as u32,
        }
    }

    fn slice(&self, slot: u32, len: usize) -> &[u8] {
        let start = slot as usize * self.slot_size;
        &self.storage[start..start + len]
    }

    fn slice_mut(&mut self, slot: u32, len: usize) -> &mut [u8] {
        let start = slot as usize * self.slot_size;
        &mut self.storage[start..start + len]
    }

    fn deregister(&mut self, rio: &ws::RIO_EXTENSION_FUNCTION_TABLE) {
        if let Some(dereg) = rio.RIODeregisterBuffer {
            if self.id != ws::RIO_INVALID_BUFFERID {
                unsafe { dereg(self.id) };
                self.id = ws::RIO_INVALID_BUFFERID;
            }
        }
    }
}

struct RioState {
    rio: ws::RIO_EXTENSION_FUNCTION_TABLE,
    cq: ws::RIO_CQ,
    recv_pool: BufferPool,
    send_pool: BufferPool,
    request_queues: HashMap<SessionId, ws::RIO_RQ>,
}

// Safety: the RIO handles are only touched under the state mutex.
unsafe impl Send for RioState {}

pub struct RioReactor {
    initialized: AtomicBool,
    running: AtomicBool,
    listen_socket: Mutex<SocketHandle>,
    config: EngineConfig,
    table: SessionTable,
    callbacks: Callbacks,
    state: Mutex<Option<RioState>>,
    /// Sessions with newly armed sends, fed by application threads and
    /// drained by `poll` so request queues stay single-writer.
    pending_sends: ArrayQueue<SessionId>,
}

impl Default for RioReactor {
    fn default() -> Self {
        RioReactor {
            initialized: AtomicBool::new(false),
            running: AtomicBool::new(false),
            listen_socket: Mutex::new(INVALID_SOCKET_HANDLE),
            config: EngineConfig::default(),
            table: SessionTable::new(0),
            callbacks: Callbacks::default(),
            state: Mutex::new(None),
            pending_sends: ArrayQueue::new(1),
        }
    }
}

impl RioReactor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the Winsock RIO extension table can be loaded. Probes
    /// once per process; the outcome is cached.
    pub fn is_supported() -> bool {
        if SUPPORT_CHECKED.load(Ordering::Acquire) {
            return SUPPORTED.load(Ordering::Acquire);
        }
        let ok = (|| {
            if !socket::init_subsystem() {
                return false;
            }
            let probe = match Self::create_rio_socket() {
                Ok(s) => s,
                Err(_) => {
                    socket::shutdown_subsystem();
                    return false;
                }
            };
            let loaded = Self::load_rio_table(probe).is_some();
            socket::close(probe);
            socket::shutdown_subsystem();
            loaded
        })();
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

    fn create_rio_socket() -> NetResult<SocketHandle> {
        let s = unsafe {
            ws::WSASocketW(
                ws::AF_INET as i32,
                ws::SOCK_STREAM as i32,
                ws::IPPROTO_TCP,
                std::ptr::null(),
                0,
                ws::WSA_FLAG_OVERLAPPED | ws::WSA_FLAG_REGISTERED_IO,
            )
        };
        if s == ws::INVALID_SOCKET {
            let e = socket::last_errno();
            net_error!("failed to create RIO socket. error: {}", e);
            return Err(ErrorKind::SocketCreate(e));
        }
        Ok(s)
    }

    fn load_rio_table(socket: SocketHandle) -> Option<ws::RIO_EXTENSION_FUNCTION_TABLE> {
        let guid = ws::WSAID_MULTIPLE_RIO;
        let mut table: ws::RIO_EXTENSION_FUNCTION_TABLE = unsafe { std::mem::zeroed() };
        table.cbSize = std::mem::size_of::<ws::RIO_EXTENSION_FUNCTION_TABLE>() as u32;
        let mut bytes: u32 = 0;
        let ret = unsafe {
            ws::WSAIoctl(
                socket,
                ws::SIO_GET_MULTIPLE_EXTENSION_FUNCTION_POINTER,
                &guid as *const _ as *const core::ffi::c_void,
                std::mem::size_of_val(&guid) as u32,
                &mut table as *mut _ as *mut core::ffi::c_void,
                std::mem::size_of::<ws::RIO_EXTENSION_FUNCTION_TABLE>() as u32,
                &mut bytes,
                std::ptr::null_mut(),
                None,
            )
        };
        if ret != 0 {
            return None;
        }
        Some(table)
    }

    /// Post one receive for the session, pulling a slot from the pool.
    fn post_receive(st: &mut RioState, session: &Arc<Session>) -> bool {
        let receive_fn = match st.rio.RIOReceive {
            Some(f) => f,
            None => return false,
        };
        let rq = match st.request_queues.get(&session.id()) {
            Some(rq) => *rq,
            None => return false,
        };
        let slot = match st.recv_pool.acquire() {
            Some(s) => s,
            None => {
                net_warn!("receive pool exhausted. session: {}", session.id());
                return false;
            }
        };

        let buf = st.recv_pool.rio_buf(slot, st.recv_pool.slot_size);
        let ok = unsafe {
            receive_fn(
                rq,
                &buf,
                1,
                0,
                encode_ctx(IoOp::Receive, slot) as *mut core::ffi::c_void,
            )
        };
        if ok == 0 {
            net_error!(
                "RIOReceive failed. session: {}, error: {}",
                session.id(),
                socket::last_errno()
            );
            st.recv_pool.release(slot);
            return false;
        }
        true
    }

    /// Post one send chunk from the session ring, or clear the sending
    /// flag under the ring lock if the ring is empty.
    fn post_send(st: &mut RioState, session: &Arc<Session>) -> bool {
        let send_fn = match st.rio.RIOSend {
            Some(f) => f,
            None => return false,
        };
        let rq = match st.request_queues.get(&session.id()) {
            Some(rq) => *rq,
            None => return false,
        };
        let slot = match st.send_pool.acquire() {
            Some(s) => s,
            None => {
                net_warn!("send pool exhausted. session: {}", session.id());
                session.set_sending(false);
                return false;
            }
        };

        let slot_size = st.send_pool.slot_size;
        let len = {
            let mut ring = session.send_ring().lock();
            let avail = ring.available_read();
            if avail == 0 {
                session.set_sending(false);
                st.send_pool.release(slot);
                return true;
            }
            let n = avail.min(slot_size);
            ring.peek(st.send_pool.slice_mut(slot, n));
            n
        };

        let buf = st.send_pool.rio_buf(slot, len);
        let ok = unsafe {
            send_fn(
                rq,
                &buf,
                1,
                0,
                encode_ctx(IoOp::Send, slot) as *mut core::ffi::c_void,
            )
        };
        if ok == 0 {
            net_error!(
                "RIOSend failed. session: {}, error: {}",
                session.id(),
                socket::last_errno()
            );
            st.send_pool.release(slot);
            session.set_sending(false);
            return false;
        }
        true
    }

    /// Accept until the listen socket reports would-block.
    fn drain_accept(&self, st: &mut RioState) {
        let listen = *self.listen_socket.lock().unwrap();
        loop {
            let mut addr: ws::SOCKADDR_IN = unsafe { std::mem::zeroed() };
            let mut addr_len = std::mem::size_of::<ws::SOCKADDR_IN>() as i32;
            let client = unsafe {
                ws::accept(
                    listen,
                    &mut addr as *mut ws::SOCKADDR_IN as *mut ws::SOCKADDR,
                    &mut addr_len,
                )
            };
            if client == ws::INVALID_SOCKET {
                let e = socket::last_errno();
                if e != ws::WSAEWOULDBLOCK {
                    net_error!("accept failed. error: {}", e);
                }
                break;
            }

            socket::apply_config(client, &self.config);

            let session = match self.table.add(client, &self.config.session) {
                Some(s) => s,
                None => {
                    // Over capacity: close immediately, no callback
                    socket::close(client);
                    continue;
                }
            };

            let create_rq = match st.rio.RIOCreateRequestQueue {
                Some(f) => f,
                None => {
                    socket::close(client);
                    self.table.remove(session.id());
                    continue;
                }
            };
            let rq = unsafe {
                create_rq(
                    client,
                    self.config.outstanding_reads,
                    1,
                    self.config.outstanding_writes,
                    1,
                    st.cq,
                    st.cq,
                    session.id() as *mut core::ffi::c_void,
                )
            };
            if rq == ws::RIO_INVALID_RQ {
                net_error!(
                    "RIOCreateRequestQueue failed. error: {}",
                    socket::last_errno()
                );
                socket::close(client);
                self.table.remove(session.id());
                continue;
            }

            session.set_state(SessionState::Connected);
            st.request_queues.insert(session.id(), rq);

            if !Self::post_receive(st, &session) {
                st.request_queues.remove(&session.id());
                socket::shutdown_both(client);
                socket::close(client);
                self.table.remove(session.id());
                continue;
            }

            self.callbacks.accept(&session);
            net_debug!("client accepted. session: {}", session.id());
        }
    }

    fn complete_receive(&self, st: &mut RioState, session_id: SessionId, slot: u32, result: &ws::RIORESULT) {
        let session = self.table.get(session_id);
        let bytes = result.BytesTransferred as usize;

        if result.Status != 0 || bytes == 0 {
            st.recv_pool.release(slot);
            if let Some(session) = session {
                if result.Status != 0 {
                    net_error!(
                        "receive failed. session: {}, status: {}",
                        session_id,
                        result.Status
                    );
                }
                self.disconnect_session(st, &session);
            }
            return;
        }

        let session = match session {
            Some(s) if s.state().is_live() => s,
            _ => {
                st.recv_pool.release(slot);
                return;
            }
        };

        self.callbacks
            .receive(&session, st.recv_pool.slice(slot, bytes));
        st.recv_pool.release(slot);

        if !Self::post_receive(st, &session) {
            self.disconnect_session(st, &session);
        }
    }

    fn complete_send(&self, st: &mut RioState, session_id: SessionId, slot: u32, result: &ws::RIORESULT) {
        st.send_pool.release(slot);
        let session = match self.table.get(session_id) {
            Some(s) => s,
            None => return,
        };

        if result.Status != 0 {
            session.set_sending(false);
            net_error!(
                "send failed. session: {}, status: {}",
                session_id,
                result.Status
            );
            self.disconnect_session(st, &session);
            return;
        }

        let more = {
            let mut ring = session.send_ring().lock();
            ring.skip(result.BytesTransferred as usize);
            if ring.available_read() > 0 {
                true
            } else {
                session.set_sending(false);
                false
            }
        };
        if more && !Self::post_send(st, &session) {
            self.disconnect_session(st, &session);
        }
    }

    fn drain_pending_sends(&self, st: &mut RioState) {
        while let Some(id) = self.pending_sends.pop() {
            if let Some(session) = self.table.get(id) {
                if session.state().is_live() {
                    Self::post_send(st, &session);
                } else {
                    session.set_sending(false);
                }
            }
        }
    }

    fn disconnect_session(&self, st: &mut RioState, session: &Arc<Session>) {
        if !session.transition_disconnected() {
            return;
        }

        self.callbacks.disconnect(session);
        net_debug!("client disconnected. session: {}", session.id());

        st.request_queues.remove(&session.id());
        socket::close(session.socket());
        self.table.remove(session.id());
    }

    /// Bounded wait on the listen socket when nothing was ready, so
    /// `poll` honors its timeout without spinning. Data completions
    /// dequeue on the next cycle.
    fn wait_for_activity(&self, timeout_ms: u32) {
        let listen = *self.listen_socket.lock().unwrap();
        if listen == INVALID_SOCKET_HANDLE {
            return;
        }
        let mut pollfd = ws::WSAPOLLFD {
            fd: listen,
            events: ws::POLLRDNORM,
            revents: 0,
        };
        unsafe {
            ws::WSAPoll(&mut pollfd, 1, timeout_ms as i32);
        }
    }
}

impl Reactor for RioReactor {
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
            net_error!("RIO reactor already initialized");
            return Err(ErrorKind::AlreadyInitialized);
        }
        config.validate()?;

        if !Self::is_supported() {
            net_error!("RIO is not supported on this system (requires Windows 8+)");
            self.callbacks.error(None, ErrorKind::BackendUnsupported);
            return Err(ErrorKind::BackendUnsupported);
        }

        if !socket::init_subsystem() {
            return Err(ErrorKind::QueueCreate(socket::last_errno()));
        }

        let listen = Self::create_rio_socket()?;
        socket::set_reuse_address(listen, true);
        socket::apply_config(listen, config);
        socket::set_non_blocking(listen, true);

        let rio = match Self::load_rio_table(listen) {
            Some(t) => t,
            None => {
                socket::close(listen);
                socket::shutdown_subsystem();
                return Err(ErrorKind::BackendUnsupported);
            }
        };

        let create_cq = rio
            .RIOCreateCompletionQueue
            .ok_or(ErrorKind::BackendUnsupported)?;
        let cq = unsafe { create_cq(config.completion_queue_size, std::ptr::null_mut()) };
        if cq == ws::RIO_INVALID_CQ {
            let e = socket::last_errno();
            net_error!("RIOCreateCompletionQueue failed. error: {}", e);
            socket::close(listen);
            socket::shutdown_subsystem();
            return Err(ErrorKind::QueueCreate(e));
        }

        let recv_pool = BufferPool::register(
            &rio,
            config.recv_buf_size,
            config.outstanding_reads as usize,
        )?;
        let send_pool = BufferPool::register(
            &rio,
            config.send_buf_size,
            config.outstanding_writes as usize,
        )?;

        if let Err(kind) = socket::bind_any(listen, config.port) {
            socket::close(listen);
            socket::shutdown_subsystem();
            return Err(kind);
        }

        self.config = config.clone();
        self.table = SessionTable::new(config.max_sessions as usize);
        self.pending_sends = ArrayQueue::new(config.max_sessions as usize + 16);
        *self.listen_socket.lock().unwrap() = listen;
        *self.state.lock().unwrap() = Some(RioState {
            rio,
            cq,
            recv_pool,
            send_pool,
            request_queues: HashMap::new(),
        });
        self.initialized.store(true, Ordering::Release);

        net_info!("RIO reactor initialized. port: {}", config.port);
        Ok(())
    }

    fn start_listen(&mut self) -> NetResult<()> {
        if !self.initialized.load(Ordering::Acquire) {
            net_error!("RIO reactor not initialized");
            return Err(ErrorKind::NotInitialized);
        }
        if self.running.load(Ordering::Acquire) {
            net_warn!("RIO reactor already running");
            return Ok(());
        }

        let listen = *self.listen_socket.lock().unwrap();
        socket::listen(listen, self.config.backlog)?;

        self.running.store(true, Ordering::Release);
        net_info!("RIO reactor listening");
        Ok(())
    }

    fn poll(&self, timeout_ms: u32) -> bool {
        if !self.running.load(Ordering::Acquire) {
            return false;
        }
        let mut guard = self.state.lock().unwrap();
        let st = match guard.as_mut() {
            Some(s) => s,
            None => return false,
        };

        self.drain_accept(st);
        self.drain_pending_sends(st);

        let dequeue_fn = match st.rio.RIODequeueCompletion {
            Some(f) => f,
            None => return false,
        };
        let mut results: [ws::RIORESULT; DEQUEUE_BATCH] = unsafe { std::mem::zeroed() };
        let count = unsafe { dequeue_fn(st.cq, results.as_mut_ptr(), DEQUEUE_BATCH as u32) };

        if count == ws::RIO_CORRUPT_CQ {
            net_error!("completion queue corrupt");
            // Fatal for the backend: later polls are no-ops
            self.running.store(false, Ordering::Release);
            self.callbacks.error(None, ErrorKind::QueueCorrupt);
            return false;
        }

        if count == 0 && timeout_ms > 0 {
            drop(guard);
            self.wait_for_activity(timeout_ms);
            return true;
        }

        for result in &results[..count as usize] {
            let session_id = result.SocketContext as SessionId;
            let (op, slot) = decode_ctx(result.RequestContext);
            match op {
                IoOp::Receive => self.complete_receive(st, session_id, slot, result),
                IoOp::Send => self.complete_send(st, session_id, slot, result),
                _ => {}
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

        if arm && self.pending_sends.push(session.id()).is_err() {
            session.set_sending(false);
            return Err(ErrorKind::SendFailed(0));
        }
        Ok(())
    }

    fn shutdown(&self) {
        if !self.initialized.swap(false, Ordering::AcqRel) {
            return;
        }
        self.running.store(false, Ordering::Release);

        if let Some(mut st) = self.state.lock().unwrap().take() {
            st.request_queues.clear();
            // Sessions are closed silently: no disconnect callbacks at shutdown
            self.table.for_each(|session| {
                socket::shutdown_both(session.socket());
                socket::close(session.socket());
            });
            self.table.clear();

            let rio = st.rio;
            st.recv_pool.deregister(&rio);
            st.send_pool.deregister(&rio);
            if let Some(close_cq) = rio.RIOCloseCompletionQueue {
                if st.cq != ws::RIO_INVALID_CQ {
                    unsafe { close_cq(st.cq) };
                }
            }
        }

        let listen = std::mem::replace(
            &mut *self.listen_socket.lock().unwrap(),
            INVALID_SOCKET_HANDLE,
        );
        socket::close(listen);

        socket::shutdown_subsystem();
        net_info!("RIO reactor shutdown complete");
    }
}

impl Drop for RioReactor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

//! I/O completion port reactor (Windows completion backend).
//!
//! Every operation owns an `OVERLAPPED` context carrying the operation
//! kind, the session id and the operation buffer. Contexts are boxed
//! into raw pointers for the kernel and reclaimed on dequeue. Accepts
//! use `AcceptEx` with a pre-created socket and are re-armed on every
//! accept completion so the listener never sits idle.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicIsize, Ordering};
use std::sync::{Arc, Mutex};

use windows_sys::Win32::Foundation::{
    CloseHandle, GetLastError, ERROR_IO_PENDING, HANDLE, INVALID_HANDLE_VALUE, WAIT_TIMEOUT,
};
use windows_sys::Win32::Networking::WinSock as ws;
use windows_sys::Win32::System::IO::{
    CreateIoCompletionPort, GetQueuedCompletionStatus, OVERLAPPED,
};

use gannet_core::{net_debug, net_error, net_info, net_warn};
use gannet_core::{
    EngineConfig, ErrorKind, IoOp, NetResult, SessionId, SessionState, SocketHandle,
    DEFAULT_BUFFER_SIZE, INVALID_SOCKET_HANDLE,
};

use crate::backend::{
    AcceptCallback, Callbacks, DisconnectCallback, ErrorCallback, Reactor, ReceiveCallback,
};
use crate::session::Session;
use crate::socket;
use crate::table::SessionTable;

/// AcceptEx wants room for local + remote address, each padded by 16.
const ACCEPT_ADDR_SPACE: usize = std::mem::size_of::<ws::SOCKADDR_IN>() + 16;

/// One in-flight overlapped operation. The `OVERLAPPED` must stay the
/// first field: the kernel hands back a pointer to it and we recover
/// the context from that address.
#[repr(C)]
struct OverlappedCtx {
    overlapped: OVERLAPPED,
    op: IoOp,
    session_id: SessionId,
    accept_socket: SocketHandle,
    buf: Box<[u8]>,
}

impl OverlappedCtx {
    fn new(op: IoOp, session_id: SessionId, buf_len: usize) -> Box<Self> {
        Box::new(OverlappedCtx {
            overlapped: unsafe { std::mem::zeroed() },
            op,
            session_id,
            accept_socket: INVALID_SOCKET_HANDLE,
            buf: vec![0u8; buf_len].into_boxed_slice(),
        })
    }

    fn into_overlapped(self: Box<Self>) -> *mut OVERLAPPED {
        Box::into_raw(self) as *mut OVERLAPPED
    }

    /// Safety: `ptr` must come from `into_overlapped` and be dequeued
    /// exactly once.
    unsafe fn from_overlapped(ptr: *mut OVERLAPPED) -> Box<Self> {
        Box::from_raw(ptr as *mut OverlappedCtx)
    }
}

pub struct IocpReactor {
    initialized: AtomicBool,
    running: AtomicBool,
    iocp: AtomicIsize,
    listen_socket: Mutex<SocketHandle>,
    accept_ex: Mutex<ws::LPFN_ACCEPTEX>,
    config: EngineConfig,
    table: SessionTable,
    by_id: Mutex<HashMap<SessionId, Arc<Session>>>,
    callbacks: Callbacks,
}

impl Default for IocpReactor {
    fn default() -> Self {
        IocpReactor {
            initialized: AtomicBool::new(false),
            running: AtomicBool::new(false),
            iocp: AtomicIsize::new(0),
            listen_socket: Mutex::new(INVALID_SOCKET_HANDLE),
            accept_ex: Mutex::new(None),
            config: EngineConfig::default(),
            table: SessionTable::new(0),
            by_id: Mutex::new(HashMap::new()),
            callbacks: Callbacks::default(),
        }
    }
}

impl IocpReactor {
    pub fn new() -> Self {
        Self::default()
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

    fn iocp_handle(&self) -> HANDLE {
        self.iocp.load(Ordering::Acquire) as HANDLE
    }

    fn load_accept_ex(listen: SocketHandle) -> Option<ws::LPFN_ACCEPTEX> {
        let guid = ws::WSAID_ACCEPTEX;
        let mut func: ws::LPFN_ACCEPTEX = None;
        let mut bytes: u32 = 0;
        let ret = unsafe {
            ws::WSAIoctl(
                listen,
                ws::SIO_GET_EXTENSION_FUNCTION_POINTER,
                &guid as *const _ as *const core::ffi::c_void,
                std::mem::size_of_val(&guid) as u32,
                &mut func as *mut _ as *mut core::ffi::c_void,
                std::mem::size_of::<ws::LPFN_ACCEPTEX>() as u32,
                &mut bytes,
                std::ptr::null_mut(),
                None,
            )
        };
        if ret != 0 {
            net_error!("failed to load AcceptEx. error: {}", socket::last_errno());
            return None;
        }
        Some(func)
    }

    fn associate(&self, socket: SocketHandle, key: usize) -> bool {
        let ret = unsafe {
            CreateIoCompletionPort(socket as HANDLE, self.iocp_handle(), key, 0)
        };
        if ret.is_null() {
            net_error!(
                "failed to associate socket with IOCP. error: {}",
                unsafe { GetLastError() }
            );
            return false;
        }
        true
    }

    fn post_accept(&self) -> bool {
        let listen = *self.listen_socket.lock().unwrap();
        let accept_ex = match *self.accept_ex.lock().unwrap() {
            Some(f) => f,
            None => return false,
        };

        let accept_socket = match socket::create_tcp_socket() {
            Ok(s) => s,
            Err(_) => return false,
        };

        let mut ctx = OverlappedCtx::new(IoOp::Accept, 0, ACCEPT_ADDR_SPACE * 2);
        ctx.accept_socket = accept_socket;
        let buf_ptr = ctx.buf.as_mut_ptr();
        let overlapped = ctx.into_overlapped();

        let mut bytes: u32 = 0;
        let ok = unsafe {
            accept_ex(
                listen,
                accept_socket,
                buf_ptr as *mut core::ffi::c_void,
                0, // accept completes on connection, not on first data
                ACCEPT_ADDR_SPACE as u32,
                ACCEPT_ADDR_SPACE as u32,
                &mut bytes,
                overlapped,
            )
        };
        if ok == 0 && socket::last_errno() != ERROR_IO_PENDING as i32 {
            net_error!("AcceptEx failed. error: {}", socket::last_errno());
            socket::close(accept_socket);
            drop(unsafe { OverlappedCtx::from_overlapped(overlapped) });
            return false;
        }
        true
    }

    fn post_receive(&self, session: &Arc<Session>) -> bool {
        let mut ctx = OverlappedCtx::new(IoOp::Receive, session.id(), DEFAULT_BUFFER_SIZE);
        let wsabuf = ws::WSABUF {
            len: ctx.buf.len() as u32,
            buf: ctx.buf.as_mut_ptr(),
        };
        let overlapped = ctx.into_overlapped();

        let mut flags: u32 = 0;
        let mut bytes: u32 = 0;
        let ret = unsafe {
            ws::WSARecv(
                session.socket(),
                &wsabuf,
                1,
                &mut bytes,
                &mut flags,
                overlapped,
                None,
            )
        };
        if ret == ws::SOCKET_ERROR && socket::last_errno() != ERROR_IO_PENDING as i32 {
            net_error!(
                "WSARecv failed. session: {}, error: {}",
                session.id(),
                socket::last_errno()
            );
            drop(unsafe { OverlappedCtx::from_overlapped(overlapped) });
            return false;
        }
        true
    }

    /// Submit one send chunk from the session ring, or clear the
    /// sending flag under the ring lock if the ring is empty.
    fn post_send(&self, session: &Arc<Session>) -> bool {
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

        let mut ctx = OverlappedCtx::new(IoOp::Send, session.id(), 0);
        ctx.buf = chunk;
        let wsabuf = ws::WSABUF {
            len: ctx.buf.len() as u32,
            buf: ctx.buf.as_mut_ptr(),
        };
        let overlapped = ctx.into_overlapped();

        let mut bytes: u32 = 0;
        let ret = unsafe {
            ws::WSASend(session.socket(), &wsabuf, 1, &mut bytes, 0, overlapped, None)
        };
        if ret == ws::SOCKET_ERROR && socket::last_errno() != ERROR_IO_PENDING as i32 {
            net_error!(
                "WSASend failed. session: {}, error: {}",
                session.id(),
                socket::last_errno()
            );
            session.set_sending(false);
            drop(unsafe { OverlappedCtx::from_overlapped(overlapped) });
            return false;
        }
        true
    }

    fn complete_accept(&self, ctx: &OverlappedCtx) {
        // Keep the listener armed before anything else
        if self.running.load(Ordering::Acquire) {
            self.post_accept();
        }

        let client = ctx.accept_socket;
        let listen = *self.listen_socket.lock().unwrap();
        // Inherit listener properties so shutdown()/getpeername() work
        unsafe {
            ws::setsockopt(
                client,
                ws::SOL_SOCKET,
                ws::SO_UPDATE_ACCEPT_CONTEXT,
                &listen as *const SocketHandle as *const u8,
                std::mem::size_of::<SocketHandle>() as i32,
            );
        }
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
        self.by_id
            .lock()
            .unwrap()
            .insert(session.id(), Arc::clone(&session));

        if !self.associate(client, session.id() as usize) {
            self.by_id.lock().unwrap().remove(&session.id());
            socket::close(client);
            self.table.remove(session.id());
            return;
        }

        if !self.post_receive(&session) {
            self.disconnect_session(&session);
            return;
        }

        self.callbacks.accept(&session);
        net_debug!("client accepted. session: {}", session.id());
    }

    fn complete_receive(&self, ctx: &OverlappedCtx, bytes: u32) {
        let session = match self.lookup(ctx.session_id) {
            Some(s) => s,
            None => return,
        };
        if !session.state().is_live() {
            return;
        }

        self.callbacks.receive(&session, &ctx.buf[..bytes as usize]);
        if !self.post_receive(&session) {
            self.disconnect_session(&session);
        }
    }

    fn complete_send(&self, ctx: &OverlappedCtx, bytes: u32) {
        let session = match self.lookup(ctx.session_id) {
            Some(s) => s,
            None => return,
        };

        let more = {
            let mut ring = session.send_ring().lock();
            ring.skip(bytes as usize);
            if ring.available_read() > 0 {
                true
            } else {
                session.set_sending(false);
                false
            }
        };
        if more && !self.post_send(&session) {
            self.disconnect_session(&session);
        }
    }

    fn lookup(&self, id: SessionId) -> Option<Arc<Session>> {
        self.by_id.lock().unwrap().get(&id).cloned()
    }

    fn disconnect_session(&self, session: &Arc<Session>) {
        if !session.transition_disconnected() {
            return;
        }

        self.callbacks.disconnect(session);
        net_debug!("client disconnected. session: {}", session.id());

        self.by_id.lock().unwrap().remove(&session.id());
        socket::close(session.socket());
        self.table.remove(session.id());
    }
}

impl Reactor for IocpReactor {
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
            net_error!("IOCP reactor already initialized");
            return Err(ErrorKind::AlreadyInitialized);
        }
        config.validate()?;

        if !socket::init_subsystem() {
            return Err(ErrorKind::QueueCreate(socket::last_errno()));
        }

        let iocp = unsafe { CreateIoCompletionPort(INVALID_HANDLE_VALUE, std::ptr::null_mut(), 0, 0) };
        if iocp.is_null() {
            let e = unsafe { GetLastError() };
            net_error!("failed to create IOCP. error: {}", e);
            socket::shutdown_subsystem();
            return Err(ErrorKind::QueueCreate(e as i32));
        }

        let listen = match socket::create_tcp_socket() {
            Ok(s) => s,
            Err(kind) => {
                unsafe { CloseHandle(iocp) };
                socket::shutdown_subsystem();
                return Err(kind);
            }
        };
        socket::set_reuse_address(listen, true);
        socket::apply_config(listen, config);

        let accept_ex = match Self::load_accept_ex(listen) {
            Some(f) => f,
            None => {
                socket::close(listen);
                unsafe { CloseHandle(iocp) };
                socket::shutdown_subsystem();
                return Err(ErrorKind::QueueRegister(socket::last_errno()));
            }
        };

        if let Err(kind) = socket::bind_any(listen, config.port) {
            socket::close(listen);
            unsafe { CloseHandle(iocp) };
            socket::shutdown_subsystem();
            return Err(kind);
        }

        self.config = config.clone();
        self.table = SessionTable::new(config.max_sessions as usize);
        *self.listen_socket.lock().unwrap() = listen;
        *self.accept_ex.lock().unwrap() = accept_ex;
        self.iocp.store(iocp as isize, Ordering::Release);
        self.initialized.store(true, Ordering::Release);

        net_info!("IOCP reactor initialized. port: {}", config.port);
        Ok(())
    }

    fn start_listen(&mut self) -> NetResult<()> {
        if !self.initialized.load(Ordering::Acquire) {
            net_error!("IOCP reactor not initialized");
            return Err(ErrorKind::NotInitialized);
        }
        if self.running.load(Ordering::Acquire) {
            net_warn!("IOCP reactor already running");
            return Ok(());
        }

        let listen = *self.listen_socket.lock().unwrap();
        socket::listen(listen, self.config.backlog)?;

        if !self.associate(listen, 0) {
            return Err(ErrorKind::QueueRegister(unsafe { GetLastError() } as i32));
        }

        self.running.store(true, Ordering::Release);
        if !self.post_accept() {
            self.running.store(false, Ordering::Release);
            return Err(ErrorKind::QueueRegister(socket::last_errno()));
        }

        net_info!("IOCP reactor listening");
        Ok(())
    }

    fn poll(&self, timeout_ms: u32) -> bool {
        if !self.running.load(Ordering::Acquire) {
            return false;
        }

        let mut bytes: u32 = 0;
        let mut key: usize = 0;
        let mut overlapped: *mut OVERLAPPED = std::ptr::null_mut();

        let ok = unsafe {
            GetQueuedCompletionStatus(
                self.iocp_handle(),
                &mut bytes,
                &mut key,
                &mut overlapped,
                timeout_ms,
            )
        };

        if overlapped.is_null() {
            if unsafe { GetLastError() } == WAIT_TIMEOUT {
                return true;
            }
            net_error!("GetQueuedCompletionStatus failed. error: {}", unsafe {
                GetLastError()
            });
            // Fatal for the backend: later polls are no-ops
            self.running.store(false, Ordering::Release);
            return false;
        }

        let ctx = unsafe { OverlappedCtx::from_overlapped(overlapped) };

        // A failed or zero-byte completion on a data operation means
        // the connection is gone. Accept failures just drop the
        // pre-created socket.
        if ok == 0 || (bytes == 0 && ctx.op != IoOp::Accept) {
            match ctx.op {
                IoOp::Accept => socket::close(ctx.accept_socket),
                _ => {
                    if let Some(session) = self.lookup(ctx.session_id) {
                        self.disconnect_session(&session);
                    }
                }
            }
            return true;
        }

        match ctx.op {
            IoOp::Accept => self.complete_accept(&ctx),
            IoOp::Receive => self.complete_receive(&ctx, bytes),
            IoOp::Send => self.complete_send(&ctx, bytes),
            IoOp::Wake => {}
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

        if arm && !self.post_send(session) {
            return Err(ErrorKind::SendFailed(socket::last_errno()));
        }
        Ok(())
    }

    fn shutdown(&self) {
        if !self.initialized.swap(false, Ordering::AcqRel) {
            return;
        }
        self.running.store(false, Ordering::Release);

        // Sessions are closed silently: no disconnect callbacks at shutdown
        self.table.for_each(|session| {
            socket::shutdown_both(session.socket());
            socket::close(session.socket());
        });
        self.table.clear();
        self.by_id.lock().unwrap().clear();

        let listen = std::mem::replace(
            &mut *self.listen_socket.lock().unwrap(),
            INVALID_SOCKET_HANDLE,
        );
        socket::close(listen);

        let iocp = self.iocp.swap(0, Ordering::AcqRel);
        if iocp != 0 {
            unsafe { CloseHandle(iocp as HANDLE) };
        }

        socket::shutdown_subsystem();
        net_info!("IOCP reactor shutdown complete");
    }
}

impl Drop for IocpReactor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

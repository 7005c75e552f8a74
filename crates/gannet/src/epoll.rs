//! Edge-triggered epoll reactor (Linux readiness backend).
//!
//! All sockets are registered `EPOLLET`. New sessions get read interest
//! only; write interest is added when a send is armed and removed once
//! the send ring drains. Being edge-triggered, every drain loops until
//! the socket reports would-block.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, RwLock};

use gannet_core::{net_debug, net_error, net_info, net_warn};
use gannet_core::{
    EngineConfig, ErrorKind, NetResult, SessionState, SocketHandle, DEFAULT_BUFFER_SIZE,
};

use crate::backend::{
    AcceptCallback, Callbacks, DisconnectCallback, ErrorCallback, Reactor, ReceiveCallback,
};
use crate::session::Session;
use crate::socket;
use crate::table::SessionTable;

/// Events drained per `poll` call.
const MAX_EVENTS: usize = 128;

pub struct EpollReactor {
    initialized: AtomicBool,
    running: AtomicBool,
    epoll_fd: AtomicI32,
    listen_fd: AtomicI32,
    config: EngineConfig,
    table: SessionTable,
    /// Reverse map for event dispatch: the epoll payload is the fd.
    by_socket: RwLock<HashMap<SocketHandle, Arc<Session>>>,
    callbacks: Callbacks,
}

impl Default for EpollReactor {
    fn default() -> Self {
        EpollReactor {
            initialized: AtomicBool::new(false),
            running: AtomicBool::new(false),
            epoll_fd: AtomicI32::new(-1),
            listen_fd: AtomicI32::new(-1),
            config: EngineConfig::default(),
            table: SessionTable::new(0),
            by_socket: RwLock::new(HashMap::new()),
            callbacks: Callbacks::default(),
        }
    }
}

impl EpollReactor {
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

    fn ctl(&self, op: i32, socket: SocketHandle, events: u32) -> bool {
        let epfd = self.epoll_fd.load(Ordering::Acquire);
        let mut ev = libc::epoll_event {
            events,
            u64: socket as u64,
        };
        let evp = if op == libc::EPOLL_CTL_DEL {
            std::ptr::null_mut()
        } else {
            &mut ev as *mut libc::epoll_event
        };
        let ret = unsafe { libc::epoll_ctl(epfd, op, socket, evp) };
        if ret < 0 {
            net_error!(
                "epoll_ctl failed. op: {}, fd: {}, errno: {}",
                op,
                socket,
                socket::last_errno()
            );
            return false;
        }
        true
    }

    fn register_socket(&self, socket: SocketHandle, events: u32) -> bool {
        self.ctl(libc::EPOLL_CTL_ADD, socket, events)
    }

    fn modify_socket(&self, socket: SocketHandle, events: u32) -> bool {
        self.ctl(libc::EPOLL_CTL_MOD, socket, events)
    }

    fn unregister_socket(&self, socket: SocketHandle) -> bool {
        self.ctl(libc::EPOLL_CTL_DEL, socket, 0)
    }

    fn lookup(&self, socket: SocketHandle) -> Option<Arc<Session>> {
        self.by_socket.read().unwrap().get(&socket).cloned()
    }

    /// Accept until the listen socket reports would-block.
    fn drain_accept(&self) {
        let listen_fd = self.listen_fd.load(Ordering::Acquire);
        loop {
            let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
            let mut addr_len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
            let client = unsafe {
                libc::accept(
                    listen_fd,
                    &mut addr as *mut libc::sockaddr_in as *mut libc::sockaddr,
                    &mut addr_len,
                )
            };
            if client < 0 {
                let e = socket::last_errno();
                if e == libc::EAGAIN || e == libc::EWOULDBLOCK {
                    break;
                }
                net_error!("accept failed. errno: {}", e);
                break;
            }

            socket::set_non_blocking(client, true);
            socket::apply_config(client, &self.config);

            let session = match self.table.add(client, &self.config.session) {
                Some(s) => s,
                None => {
                    // Over capacity: close immediately, no callback
                    socket::close(client);
                    continue;
                }
            };

            session.set_state(SessionState::Connected);
            self.by_socket
                .write()
                .unwrap()
                .insert(client, Arc::clone(&session));

            if !self.register_socket(client, (libc::EPOLLIN | libc::EPOLLET) as u32) {
                self.by_socket.write().unwrap().remove(&client);
                socket::close(client);
                self.table.remove(session.id());
                continue;
            }

            self.callbacks.accept(&session);
            net_debug!("client accepted. session: {}", session.id());
        }
    }

    /// Read until would-block, EOF or error.
    fn drain_receive(&self, session: &Arc<Session>) {
        if !session.state().is_live() {
            return;
        }
        let fd = session.socket();
        let mut scratch = [0u8; DEFAULT_BUFFER_SIZE];
        loop {
            let n = unsafe {
                libc::recv(
                    fd,
                    scratch.as_mut_ptr() as *mut libc::c_void,
                    scratch.len(),
                    0,
                )
            };
            if n > 0 {
                self.callbacks.receive(session, &scratch[..n as usize]);
            } else if n == 0 {
                // Graceful peer close
                self.disconnect_session(session);
                break;
            } else {
                let e = socket::last_errno();
                if e == libc::EAGAIN || e == libc::EWOULDBLOCK {
                    break;
                }
                net_error!("recv failed. session: {}, errno: {}", session.id(), e);
                self.disconnect_session(session);
                break;
            }
        }
    }

    /// Write from the send ring until it drains or the socket pushes back.
    ///
    /// Holds the session lock for the whole drain, including the
    /// interest downgrade, so the sending flag and the poll interest
    /// never disagree. Every socket call here is non-blocking.
    fn drain_send(&self, session: &Arc<Session>) {
        let fd = session.socket();
        let mut scratch = [0u8; DEFAULT_BUFFER_SIZE];
        let mut broken = false;
        {
            let mut ring = session.send_ring().lock();
            loop {
                if ring.available_read() == 0 {
                    session.set_sending(false);
                    self.modify_socket(fd, (libc::EPOLLIN | libc::EPOLLET) as u32);
                    break;
                }

                let chunk = ring.peek(&mut scratch);
                let sent = unsafe {
                    libc::send(
                        fd,
                        scratch.as_ptr() as *const libc::c_void,
                        chunk,
                        libc::MSG_NOSIGNAL,
                    )
                };
                if sent > 0 {
                    ring.skip(sent as usize);
                } else if sent == 0 {
                    broken = true;
                    break;
                } else {
                    let e = socket::last_errno();
                    if e == libc::EAGAIN || e == libc::EWOULDBLOCK {
                        // Write interest stays armed; the next EPOLLOUT resumes
                        break;
                    }
                    net_error!("send failed. session: {}, errno: {}", session.id(), e);
                    broken = true;
                    break;
                }
            }
        }
        if broken {
            self.disconnect_session(session);
        }
    }

    /// Idempotent disconnect: state transition, handler, unregister,
    /// close, table removal — in that order, on exactly one path.
    fn disconnect_session(&self, session: &Arc<Session>) {
        if !session.transition_disconnected() {
            return;
        }

        self.callbacks.disconnect(session);
        net_debug!("client disconnected. session: {}", session.id());

        let fd = session.socket();
        self.by_socket.write().unwrap().remove(&fd);
        self.unregister_socket(fd);
        socket::close(fd);
        self.table.remove(session.id());
    }
}

impl Reactor for EpollReactor {
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
            net_error!("epoll reactor already initialized");
            return Err(ErrorKind::AlreadyInitialized);
        }
        config.validate()?;

        socket::init_subsystem();

        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            let e = socket::last_errno();
            net_error!("failed to create epoll. errno: {}", e);
            return Err(ErrorKind::QueueCreate(e));
        }

        let listen_fd = match socket::create_tcp_socket() {
            Ok(fd) => fd,
            Err(kind) => {
                unsafe { libc::close(epfd) };
                return Err(kind);
            }
        };
        socket::set_reuse_address(listen_fd, true);
        socket::apply_config(listen_fd, config);
        socket::set_non_blocking(listen_fd, true);

        if let Err(kind) = socket::bind_any(listen_fd, config.port) {
            socket::close(listen_fd);
            unsafe { libc::close(epfd) };
            return Err(kind);
        }

        self.config = config.clone();
        self.table = SessionTable::new(config.max_sessions as usize);
        self.epoll_fd.store(epfd, Ordering::Release);
        self.listen_fd.store(listen_fd, Ordering::Release);
        self.initialized.store(true, Ordering::Release);

        net_info!("epoll reactor initialized. port: {}", config.port);
        Ok(())
    }

    fn start_listen(&mut self) -> NetResult<()> {
        if !self.initialized.load(Ordering::Acquire) {
            net_error!("epoll reactor not initialized");
            return Err(ErrorKind::NotInitialized);
        }
        if self.running.load(Ordering::Acquire) {
            net_warn!("epoll reactor already running");
            return Ok(());
        }

        let listen_fd = self.listen_fd.load(Ordering::Acquire);
        socket::listen(listen_fd, self.config.backlog)?;

        if !self.register_socket(listen_fd, (libc::EPOLLIN | libc::EPOLLET) as u32) {
            return Err(ErrorKind::QueueRegister(socket::last_errno()));
        }

        self.running.store(true, Ordering::Release);
        net_info!("epoll reactor listening");
        Ok(())
    }

    fn poll(&self, timeout_ms: u32) -> bool {
        if !self.running.load(Ordering::Acquire) {
            return false;
        }
        let epfd = self.epoll_fd.load(Ordering::Acquire);
        if epfd < 0 {
            return false;
        }

        let mut events: [libc::epoll_event; MAX_EVENTS] = unsafe { std::mem::zeroed() };
        let nfds = unsafe {
            libc::epoll_wait(
                epfd,
                events.as_mut_ptr(),
                MAX_EVENTS as i32,
                timeout_ms as i32,
            )
        };
        if nfds < 0 {
            let e = socket::last_errno();
            if e == libc::EINTR {
                return true;
            }
            net_error!("epoll_wait failed. errno: {}", e);
            // Fatal for the backend: later polls are no-ops
            self.running.store(false, Ordering::Release);
            return false;
        }

        let listen_fd = self.listen_fd.load(Ordering::Acquire);
        for ev in &events[..nfds as usize] {
            let fd = ev.u64 as SocketHandle;

            if fd == listen_fd {
                self.drain_accept();
                continue;
            }

            let session = match self.lookup(fd) {
                Some(s) => s,
                None => continue,
            };

            // Drain readable first even when error/hangup flags are set:
            // bytes queued ahead of a reset must reach the handler before
            // the disconnect fires. The recv loop hits EOF or the error
            // itself and takes the disconnect path from there.
            if ev.events & libc::EPOLLIN as u32 != 0 {
                self.drain_receive(&session);
            } else if ev.events & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0 {
                self.disconnect_session(&session);
                continue;
            }
            if ev.events & libc::EPOLLOUT as u32 != 0 && session.state().is_live() {
                self.drain_send(&session);
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

        let mut ring = session.send_ring().lock();
        if ring.available_write() < data.len() {
            net_warn!("send ring overflow. session: {}", session.id());
            return Err(ErrorKind::SendOverflow);
        }
        ring.write(data);

        if !session.is_sending() {
            session.set_sending(true);
            self.modify_socket(
                session.socket(),
                (libc::EPOLLIN | libc::EPOLLOUT | libc::EPOLLET) as u32,
            );
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
            let fd = session.socket();
            self.unregister_socket(fd);
            socket::shutdown_both(fd);
            socket::close(fd);
        });
        self.table.clear();
        self.by_socket.write().unwrap().clear();

        let listen_fd = self.listen_fd.swap(-1, Ordering::AcqRel);
        if listen_fd >= 0 {
            socket::close(listen_fd);
        }
        let epfd = self.epoll_fd.swap(-1, Ordering::AcqRel);
        if epfd >= 0 {
            unsafe { libc::close(epfd) };
        }

        socket::shutdown_subsystem();
        net_info!("epoll reactor shutdown complete");
    }
}

impl Drop for EpollReactor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_poll_before_start_is_noop() {
        let r = EpollReactor::new();
        assert!(!r.poll(0));
    }

    #[test]
    fn test_start_requires_initialize() {
        let mut r = EpollReactor::new();
        assert_eq!(r.start_listen(), Err(ErrorKind::NotInitialized));
    }

    #[test]
    fn test_double_initialize_rejected() {
        let mut r = EpollReactor::new();
        let mut cfg = EngineConfig::default();
        cfg.port = 19800;
        r.initialize(&cfg).unwrap();
        assert_eq!(r.initialize(&cfg), Err(ErrorKind::AlreadyInitialized));
        r.shutdown();
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let mut r = EpollReactor::new();
        let mut cfg = EngineConfig::default();
        cfg.port = 19801;
        r.initialize(&cfg).unwrap();
        r.shutdown();
        r.shutdown();
        assert!(!r.is_initialized());
    }
}

//! Engine facade: binds a reactor to application handlers.
//!
//! The reactor backend is a type parameter, so the application picks
//! its event mechanism at compile time and pays no dispatch cost:
//!
//! ```ignore
//! let mut engine: Engine<EpollReactor, MyHandler> = Engine::new(MyHandler::new());
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use gannet_core::net_info;
use gannet_core::{EngineConfig, ErrorKind, NetResult, PacketBuffer};

use crate::backend::Reactor;
use crate::session::Session;

/// Application-side event surface.
///
/// Every method has an empty default, so a handler overrides only what
/// it cares about. Handlers run synchronously on the polling thread;
/// they must not block, and must not call `stop` on the engine that is
/// dispatching them.
pub trait EventHandler: Send + Sync + 'static {
    /// A connection was accepted and its session registered.
    fn on_accept(&self, _session: &Arc<Session>) {}

    /// Bytes arrived. `data` is only valid for the duration of the
    /// call; copy it out (e.g. into the session's receive ring) to
    /// keep it.
    fn on_receive(&self, _session: &Arc<Session>, _data: &[u8]) {}

    /// The session disconnected — peer close, local close or fatal
    /// I/O error. Fires exactly once per session, never during
    /// engine shutdown.
    fn on_disconnect(&self, _session: &Arc<Session>) {}

    /// Engine-level failure (unsupported backend, corrupt completion
    /// queue). Per-session I/O errors surface as disconnects instead.
    fn on_error(&self, _session: Option<&Arc<Session>>, _kind: ErrorKind) {}
}

pub struct Engine<R: Reactor, H: EventHandler> {
    initialized: AtomicBool,
    running: AtomicBool,
    config: EngineConfig,
    reactor: R,
    handler: Arc<H>,
}

impl<R: Reactor, H: EventHandler> Engine<R, H> {
    pub fn new(handler: H) -> Self {
        Engine {
            initialized: AtomicBool::new(false),
            running: AtomicBool::new(false),
            config: EngineConfig::default(),
            reactor: R::default(),
            handler: Arc::new(handler),
        }
    }

    /// Validate the configuration, wire the handler into the reactor
    /// and create the OS resources. The engine is left clean on error.
    pub fn initialize(&mut self, config: &EngineConfig) -> NetResult<()> {
        if self.initialized.load(Ordering::Acquire) {
            return Err(ErrorKind::AlreadyInitialized);
        }
        config.validate()?;

        let h = Arc::clone(&self.handler);
        self.reactor
            .set_accept_callback(Box::new(move |session| h.on_accept(session)));
        let h = Arc::clone(&self.handler);
        self.reactor
            .set_receive_callback(Box::new(move |session, data| h.on_receive(session, data)));
        let h = Arc::clone(&self.handler);
        self.reactor
            .set_disconnect_callback(Box::new(move |session| h.on_disconnect(session)));
        let h = Arc::clone(&self.handler);
        self.reactor
            .set_error_callback(Box::new(move |session, kind| h.on_error(session, kind)));

        self.reactor.initialize(config)?;
        self.config = config.clone();
        self.initialized.store(true, Ordering::Release);
        net_info!("engine initialized. port: {}", config.port);
        Ok(())
    }

    /// Arm listening. `poll` does nothing until this succeeds.
    pub fn start(&mut self) -> NetResult<()> {
        if !self.initialized.load(Ordering::Acquire) {
            return Err(ErrorKind::NotInitialized);
        }
        if self.running.load(Ordering::Acquire) {
            return Ok(());
        }
        self.reactor.start_listen()?;
        self.running.store(true, Ordering::Release);
        Ok(())
    }

    /// Drive one poll cycle; handlers run on this thread before it
    /// returns. Any number of application threads may call this in a
    /// loop. Returns false once the engine is stopped or the backend
    /// has failed fatally.
    pub fn poll(&self, timeout_ms: u32) -> bool {
        if !self.running.load(Ordering::Acquire) {
            return false;
        }
        self.reactor.poll(timeout_ms)
    }

    /// Queue bytes on the session's send ring. Never blocks; a full
    /// ring returns [`ErrorKind::SendOverflow`] with nothing written
    /// and the session still connected.
    pub fn send(&self, session: &Arc<Session>, data: &[u8]) -> NetResult<()> {
        if !self.running.load(Ordering::Acquire) {
            return Err(ErrorKind::NotInitialized);
        }
        self.reactor.send(session, data)
    }

    /// [`send`](Self::send) for an assembled packet.
    pub fn send_packet(&self, session: &Arc<Session>, packet: &PacketBuffer) -> NetResult<()> {
        self.send(session, packet.as_slice())
    }

    /// Stop the engine: sessions are closed silently (no disconnect
    /// handlers), the listen socket and the multiplexer are torn down.
    /// Idempotent. Must not be called from inside a handler.
    pub fn stop(&self) {
        if !self.initialized.swap(false, Ordering::AcqRel) {
            return;
        }
        self.running.store(false, Ordering::Release);
        self.reactor.shutdown();
        net_info!("engine stopped");
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn handler(&self) -> &Arc<H> {
        &self.handler
    }
}

impl<R: Reactor, H: EventHandler> Drop for Engine<R, H> {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;
    use crate::epoll::EpollReactor;
    use std::io::{Read, Write};
    use std::net::TcpStream;
    use std::os::unix::io::AsRawFd;
    use std::sync::atomic::AtomicUsize;
    use std::sync::{Mutex, OnceLock, Weak};
    use std::thread;
    use std::time::{Duration, Instant};

    type EchoEngine = Engine<EpollReactor, EchoHandler>;

    /// Echoes every byte back and counts lifecycle events.
    struct EchoHandler {
        engine: OnceLock<Weak<EchoEngine>>,
        accepts: AtomicUsize,
        disconnects: AtomicUsize,
        bytes_received: AtomicUsize,
        last_session: Mutex<Option<Arc<Session>>>,
        echo: bool,
    }

    impl EchoHandler {
        fn new(echo: bool) -> Self {
            EchoHandler {
                engine: OnceLock::new(),
                accepts: AtomicUsize::new(0),
                disconnects: AtomicUsize::new(0),
                bytes_received: AtomicUsize::new(0),
                last_session: Mutex::new(None),
                echo,
            }
        }
    }

    impl EventHandler for EchoHandler {
        fn on_accept(&self, session: &Arc<Session>) {
            self.accepts.fetch_add(1, Ordering::SeqCst);
            *self.last_session.lock().unwrap() = Some(Arc::clone(session));
        }

        fn on_receive(&self, session: &Arc<Session>, data: &[u8]) {
            self.bytes_received.fetch_add(data.len(), Ordering::SeqCst);
            if self.echo {
                if let Some(engine) = self.engine.get().and_then(|w| w.upgrade()) {
                    let _ = engine.send(session, data);
                }
            }
        }

        fn on_disconnect(&self, _session: &Arc<Session>) {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Server {
        engine: Arc<EchoEngine>,
        stop_flag: Arc<AtomicBool>,
        thread: Option<thread::JoinHandle<()>>,
    }

    impl Server {
        fn spawn(port: u16, max_sessions: u32, echo: bool) -> Self {
            let mut engine = Engine::new(EchoHandler::new(echo));
            let mut cfg = EngineConfig::default();
            cfg.port = port;
            cfg.max_sessions = max_sessions;
            engine.initialize(&cfg).unwrap();
            engine.start().unwrap();

            let engine = Arc::new(engine);
            engine
                .handler()
                .engine
                .set(Arc::downgrade(&engine))
                .ok()
                .unwrap();

            let stop_flag = Arc::new(AtomicBool::new(false));
            let thread = {
                let engine = Arc::clone(&engine);
                let stop_flag = Arc::clone(&stop_flag);
                thread::spawn(move || {
                    while !stop_flag.load(Ordering::Relaxed) {
                        engine.poll(10);
                    }
                })
            };

            Server {
                engine,
                stop_flag,
                thread: Some(thread),
            }
        }

        fn handler(&self) -> &Arc<EchoHandler> {
            self.engine.handler()
        }
    }

    impl Drop for Server {
        fn drop(&mut self) {
            self.stop_flag.store(true, Ordering::Relaxed);
            if let Some(t) = self.thread.take() {
                let _ = t.join();
            }
            self.engine.stop();
        }
    }

    fn wait_until<F: Fn() -> bool>(cond: F, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    fn connect(port: u16) -> TcpStream {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            match TcpStream::connect(("127.0.0.1", port)) {
                Ok(s) => return s,
                Err(e) => {
                    if Instant::now() > deadline {
                        panic!("connect failed: {}", e);
                    }
                    thread::sleep(Duration::from_millis(10));
                }
            }
        }
    }

    fn read_exact_with_deadline(stream: &mut TcpStream, buf: &mut [u8]) {
        stream
            .set_read_timeout(Some(Duration::from_secs(10)))
            .unwrap();
        stream.read_exact(buf).unwrap();
    }

    #[test]
    fn test_echo_small() {
        let server = Server::spawn(19100, 16, true);
        let mut client = connect(19100);

        client.write_all(b"hello").unwrap();
        let mut buf = [0u8; 5];
        read_exact_with_deadline(&mut client, &mut buf);
        assert_eq!(&buf, b"hello");

        drop(client);
        assert!(wait_until(
            || server.handler().disconnects.load(Ordering::SeqCst) == 1,
            Duration::from_secs(5)
        ));
        assert_eq!(server.handler().accepts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_echo_boundary_sizes() {
        let server = Server::spawn(19107, 16, true);
        let mut client = connect(19107);

        // Around the scratch-buffer boundary and beyond it
        for size in [1usize, 127, 128, 8192, 8192 * 4] {
            let payload: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
            client.write_all(&payload).unwrap();
            let mut echoed = vec![0u8; size];
            read_exact_with_deadline(&mut client, &mut echoed);
            assert_eq!(echoed, payload, "mismatch at size {}", size);
        }
    }

    #[test]
    fn test_echo_large_in_order() {
        let server = Server::spawn(19101, 16, true);
        let payload: Vec<u8> = (0..1024 * 1024).map(|i| (i % 251) as u8).collect();

        let mut client = connect(19101);
        let writer = {
            let payload = payload.clone();
            let mut tx = client.try_clone().unwrap();
            thread::spawn(move || {
                tx.write_all(&payload).unwrap();
            })
        };

        let mut echoed = vec![0u8; payload.len()];
        read_exact_with_deadline(&mut client, &mut echoed);
        writer.join().unwrap();
        assert_eq!(echoed, payload);

        drop(client);
        assert!(wait_until(
            || server.handler().disconnects.load(Ordering::SeqCst) == 1,
            Duration::from_secs(5)
        ));
    }

    // Application-level fan-out on top of the engine: every byte a
    // client sends is forwarded to all connected sessions.
    #[test]
    fn test_fan_in_broadcast() {
        use std::collections::HashMap;
        use gannet_core::SessionId;

        type BroadcastEngine = Engine<EpollReactor, BroadcastHandler>;

        struct BroadcastHandler {
            engine: OnceLock<Weak<BroadcastEngine>>,
            roster: Mutex<HashMap<SessionId, Arc<Session>>>,
        }

        impl EventHandler for BroadcastHandler {
            fn on_accept(&self, session: &Arc<Session>) {
                self.roster
                    .lock()
                    .unwrap()
                    .insert(session.id(), Arc::clone(session));
            }
            fn on_receive(&self, _session: &Arc<Session>, data: &[u8]) {
                let engine = match self.engine.get().and_then(|w| w.upgrade()) {
                    Some(e) => e,
                    None => return,
                };
                let members: Vec<Arc<Session>> =
                    self.roster.lock().unwrap().values().cloned().collect();
                for member in &members {
                    let _ = engine.send(member, data);
                }
            }
            fn on_disconnect(&self, session: &Arc<Session>) {
                self.roster.lock().unwrap().remove(&session.id());
            }
        }

        let mut engine: BroadcastEngine = Engine::new(BroadcastHandler {
            engine: OnceLock::new(),
            roster: Mutex::new(HashMap::new()),
        });
        let mut cfg = EngineConfig::default();
        cfg.port = 19109;
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
            thread::spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    engine.poll(10);
                }
            })
        };

        let mut clients = vec![connect(19109), connect(19109), connect(19109)];
        assert!(wait_until(
            || engine.handler().roster.lock().unwrap().len() == 3,
            Duration::from_secs(5)
        ));

        for (client, byte) in clients.iter_mut().zip([b'A', b'B', b'C']) {
            client.write_all(&[byte]).unwrap();
        }

        // Every client sees A, B and C exactly once, in any order
        for client in &mut clients {
            let mut got = [0u8; 3];
            read_exact_with_deadline(client, &mut got);
            got.sort_unstable();
            assert_eq!(&got, b"ABC");
        }

        stop.store(true, Ordering::Relaxed);
        poller.join().unwrap();
        engine.stop();
    }

    #[test]
    fn test_capacity_cap_closes_extra_client() {
        let server = Server::spawn(19102, 2, true);

        let mut c1 = connect(19102);
        let mut c2 = connect(19102);
        assert!(wait_until(
            || server.handler().accepts.load(Ordering::SeqCst) == 2,
            Duration::from_secs(5)
        ));

        // Third connection completes at the TCP level but the engine
        // closes it without ever surfacing an accept
        let mut c3 = connect(19102);
        c3.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let mut buf = [0u8; 1];
        match c3.read(&mut buf) {
            Ok(0) => {}
            Ok(n) => panic!("expected close, read {} bytes", n),
            Err(e) => panic!("expected clean close, got {}", e),
        }
        assert_eq!(server.handler().accepts.load(Ordering::SeqCst), 2);

        // Existing sessions are unaffected
        c1.write_all(b"one").unwrap();
        let mut buf = [0u8; 3];
        read_exact_with_deadline(&mut c1, &mut buf);
        assert_eq!(&buf, b"one");
        c2.write_all(b"two").unwrap();
        read_exact_with_deadline(&mut c2, &mut buf);
        assert_eq!(&buf, b"two");
    }

    #[test]
    fn test_abrupt_peer_reset() {
        let server = Server::spawn(19103, 16, false);
        let client = connect(19103);

        let payload = [7u8; 16];
        (&client).write_all(&payload).unwrap();

        assert!(wait_until(
            || server.handler().bytes_received.load(Ordering::SeqCst) == 16,
            Duration::from_secs(5)
        ));

        // SO_LINGER with zero timeout turns close into a reset
        let linger = libc::linger {
            l_onoff: 1,
            l_linger: 0,
        };
        let ret = unsafe {
            libc::setsockopt(
                client.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_LINGER,
                &linger as *const libc::linger as *const libc::c_void,
                std::mem::size_of::<libc::linger>() as libc::socklen_t,
            )
        };
        assert_eq!(ret, 0);
        drop(client);

        assert!(wait_until(
            || server.handler().disconnects.load(Ordering::SeqCst) == 1,
            Duration::from_secs(5)
        ));
        // Exactly once, even though error and hangup arrive together
        thread::sleep(Duration::from_millis(100));
        assert_eq!(server.handler().disconnects.load(Ordering::SeqCst), 1);
        assert_eq!(server.engine.reactor.session_count(), 0);
    }

    #[test]
    fn test_send_overflow_keeps_session_connected() {
        let server = Server::spawn(19104, 16, false);
        let mut client = connect(19104);
        client.write_all(b"x").unwrap();

        assert!(wait_until(
            || server.handler().last_session.lock().unwrap().is_some(),
            Duration::from_secs(5)
        ));
        let session = server
            .handler()
            .last_session
            .lock()
            .unwrap()
            .clone()
            .unwrap();

        // The peer never reads: the ring plus kernel buffers must fill
        let chunk = vec![0xABu8; 64 * 1024];
        let mut overflowed = false;
        for _ in 0..1000 {
            match server.engine.send(&session, &chunk) {
                Ok(()) => {}
                Err(ErrorKind::SendOverflow) => {
                    overflowed = true;
                    break;
                }
                Err(e) => panic!("unexpected send error: {}", e),
            }
        }
        assert!(overflowed, "send ring never overflowed");
        assert!(session.is_connected());

        // Drain from the client side until the ring has room again
        client
            .set_read_timeout(Some(Duration::from_millis(200)))
            .unwrap();
        let mut sink = vec![0u8; 256 * 1024];
        let deadline = Instant::now() + Duration::from_secs(10);
        let mut recovered = false;
        while Instant::now() < deadline {
            let _ = client.read(&mut sink);
            if server.engine.send(&session, b"more").is_ok() {
                recovered = true;
                break;
            }
        }
        assert!(recovered, "send never recovered after peer drained");
        assert!(session.is_connected());
    }

    #[test]
    fn test_server_push_packet() {
        let server = Server::spawn(19108, 16, false);
        let mut client = connect(19108);
        client.write_all(b"x").unwrap();

        assert!(wait_until(
            || server.handler().last_session.lock().unwrap().is_some(),
            Duration::from_secs(5)
        ));
        let session = server
            .handler()
            .last_session
            .lock()
            .unwrap()
            .clone()
            .unwrap();

        let mut packet = PacketBuffer::new();
        packet.append(b"mo");
        packet.append(b"td");
        server.engine.send_packet(&session, &packet).unwrap();

        let mut buf = [0u8; 4];
        read_exact_with_deadline(&mut client, &mut buf);
        assert_eq!(&buf, b"motd");
    }

    #[test]
    fn test_send_to_disconnected_session_fails() {
        let server = Server::spawn(19105, 16, false);
        let client = connect(19105);

        assert!(wait_until(
            || server.handler().last_session.lock().unwrap().is_some(),
            Duration::from_secs(5)
        ));
        let session = server
            .handler()
            .last_session
            .lock()
            .unwrap()
            .clone()
            .unwrap();

        drop(client);
        assert!(wait_until(
            || server.handler().disconnects.load(Ordering::SeqCst) == 1,
            Duration::from_secs(5)
        ));

        assert_eq!(
            server.engine.send(&session, b"late"),
            Err(ErrorKind::InvalidSessionState)
        );
    }

    #[test]
    fn test_lifecycle_guards() {
        let mut engine: EchoEngine = Engine::new(EchoHandler::new(false));
        assert_eq!(engine.start(), Err(ErrorKind::NotInitialized));
        assert!(!engine.poll(0));

        let mut cfg = EngineConfig::default();
        cfg.port = 19106;
        engine.initialize(&cfg).unwrap();
        assert_eq!(
            engine.initialize(&cfg),
            Err(ErrorKind::AlreadyInitialized)
        );
        engine.start().unwrap();
        assert!(engine.is_running());

        engine.stop();
        assert!(!engine.is_initialized());
        assert!(!engine.poll(0));
        // A second stop is a no-op
        engine.stop();
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut engine: EchoEngine = Engine::new(EchoHandler::new(false));
        let mut cfg = EngineConfig::default();
        cfg.port = 80;
        assert_eq!(engine.initialize(&cfg), Err(ErrorKind::InvalidConfig));
        assert!(!engine.is_initialized());
    }
}

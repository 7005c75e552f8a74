//! gannet echo server
//!
//! Every byte received is sent straight back.
//!
//! Usage:
//!     gannet-echo [port] [max_sessions]
//!
//! Test with:
//!     echo "hello" | nc localhost 9000

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use gannet::{DefaultReactor, Engine, EngineConfig, EventHandler, Session};

type EchoEngine = Engine<DefaultReactor, EchoServer>;

struct EchoServer {
    engine: OnceLock<Weak<EchoEngine>>,
}

impl EchoServer {
    fn new() -> Self {
        EchoServer {
            engine: OnceLock::new(),
        }
    }

    fn attach(&self, engine: Weak<EchoEngine>) {
        let _ = self.engine.set(engine);
    }
}

impl EventHandler for EchoServer {
    fn on_accept(&self, session: &Arc<Session>) {
        println!("[accept] session: {}, socket: {}", session.id(), session.socket());
    }

    fn on_receive(&self, session: &Arc<Session>, data: &[u8]) {
        if let Some(engine) = self.engine.get().and_then(|w| w.upgrade()) {
            if let Err(kind) = engine.send(session, data) {
                eprintln!("[send error] session: {}, {}", session.id(), kind);
            }
        }
    }

    fn on_disconnect(&self, session: &Arc<Session>) {
        println!("[disconnect] session: {}", session.id());
    }

    fn on_error(&self, session: Option<&Arc<Session>>, kind: gannet::ErrorKind) {
        eprintln!(
            "[error] session: {}, {}",
            session.map(|s| s.id()).unwrap_or(0),
            kind
        );
    }
}

static RUNNING: AtomicBool = AtomicBool::new(true);

extern "C" fn handle_sigint(_sig: libc::c_int) {
    RUNNING.store(false, Ordering::Relaxed);
}

fn main() {
    let args: Vec<String> = std::env::args().collect();
    let port: u16 = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(9000);
    let max_sessions: u32 = args.get(2).and_then(|s| s.parse().ok()).unwrap_or(10000);

    unsafe {
        libc::signal(libc::SIGINT, handle_sigint as usize);
        libc::signal(libc::SIGTERM, handle_sigint as usize);
    }

    let mut config = EngineConfig::default();
    config.port = port;
    config.max_sessions = max_sessions;

    let mut engine = Engine::new(EchoServer::new());
    if let Err(kind) = engine.initialize(&config) {
        eprintln!("gannet-echo: initialize failed: {}", kind);
        std::process::exit(1);
    }
    if let Err(kind) = engine.start() {
        eprintln!("gannet-echo: start failed: {}", kind);
        std::process::exit(1);
    }

    let engine = Arc::new(engine);
    engine.handler().attach(Arc::downgrade(&engine));

    eprintln!(
        "gannet-echo: listening on 0.0.0.0:{} (max {} sessions)",
        port, max_sessions
    );

    while RUNNING.load(Ordering::Relaxed) {
        if !engine.poll(100) {
            break;
        }
    }

    eprintln!("gannet-echo: shutting down");
    engine.stop();
}

//! gannet chat server
//!
//! Fan-in broadcast built on top of the engine: every received byte is
//! forwarded to every connected session, including the sender. The
//! roster lives in the application; the engine knows nothing about
//! broadcast.
//!
//! Usage:
//!     gannet-chat [port]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};

use gannet::{DefaultReactor, Engine, EngineConfig, EventHandler, Session, SessionId};

type ChatEngine = Engine<DefaultReactor, ChatServer>;

struct ChatServer {
    engine: OnceLock<Weak<ChatEngine>>,
    roster: Mutex<HashMap<SessionId, Arc<Session>>>,
}

impl ChatServer {
    fn new() -> Self {
        ChatServer {
            engine: OnceLock::new(),
            roster: Mutex::new(HashMap::new()),
        }
    }

    fn attach(&self, engine: Weak<ChatEngine>) {
        let _ = self.engine.set(engine);
    }
}

impl EventHandler for ChatServer {
    fn on_accept(&self, session: &Arc<Session>) {
        println!("[join] session: {}", session.id());
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
        // Snapshot the roster so sends run without the roster lock held
        let members: Vec<Arc<Session>> = self.roster.lock().unwrap().values().cloned().collect();
        for member in &members {
            if let Err(kind) = engine.send(member, data) {
                eprintln!("[send error] session: {}, {}", member.id(), kind);
            }
        }
    }

    fn on_disconnect(&self, session: &Arc<Session>) {
        println!("[leave] session: {}", session.id());
        self.roster.lock().unwrap().remove(&session.id());
    }
}

static RUNNING: AtomicBool = AtomicBool::new(true);

extern "C" fn handle_sigint(_sig: libc::c_int) {
    RUNNING.store(false, Ordering::Relaxed);
}

fn main() {
    let args: Vec<String> = std::env::args().collect();
    let port: u16 = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(9000);

    unsafe {
        libc::signal(libc::SIGINT, handle_sigint as usize);
        libc::signal(libc::SIGTERM, handle_sigint as usize);
    }

    let mut config = EngineConfig::default();
    config.port = port;

    let mut engine = Engine::new(ChatServer::new());
    if let Err(kind) = engine.initialize(&config) {
        eprintln!("gannet-chat: initialize failed: {}", kind);
        std::process::exit(1);
    }
    if let Err(kind) = engine.start() {
        eprintln!("gannet-chat: start failed: {}", kind);
        std::process::exit(1);
    }

    let engine = Arc::new(engine);
    engine.handler().attach(Arc::downgrade(&engine));

    eprintln!("gannet-chat: listening on 0.0.0.0:{}", port);

    while RUNNING.load(Ordering::Relaxed) {
        if !engine.poll(100) {
            break;
        }
    }

    eprintln!("gannet-chat: shutting down");
    engine.stop();
}

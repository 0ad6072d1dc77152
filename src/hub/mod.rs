//! The broadcast hub: connection intake, accept loops and shutdown.
//!
//! A hub does nothing by itself. Streams are handed in directly with
//! [`Hub::add_connection`] or accepted from an endpoint registered with
//! [`Hub::add_listener`]; each one becomes a session that can identify
//! itself, list its peers and relay payloads to them.

use std::sync::{Arc, Mutex, RwLock};
use std::thread;
use std::time::Duration;

use crossbeam::channel;

use crate::conn::{Acceptor, Conn};

mod registry;
mod session;

use registry::{INDICATION_QUEUE_DEPTH, Registry, SessionHandle};

/// How often an accept loop polls the shutdown flag.
const ACCEPT_POLL: Duration = Duration::from_millis(25);

pub struct Hub {
    registry: Arc<Registry>,
    // Every acceptor registered through add_listener, so close can shut
    // the endpoints themselves down, not just gate new registrations.
    listeners: Mutex<Vec<Arc<dyn Acceptor>>>,
    // Shutdown gate. Deliberately separate from the registry lock: it
    // covers the add entry points, nothing else.
    closed: Arc<RwLock<bool>>,
}

impl Hub {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Registry::new()),
            listeners: Mutex::new(Vec::new()),
            closed: Arc::new(RwLock::new(false)),
        }
    }

    /// Accept connections from `acceptor` until it fails or the hub
    /// closes. The hub takes over closing the endpoint. Returns false
    /// once the hub is closed or the endpoint cannot be prepared.
    pub fn add_listener<A: Acceptor>(&self, acceptor: A) -> bool {
        // Held across the registration so close cannot slip between the
        // check and the listener becoming visible to it.
        let closed = self.closed.read().expect("closed flag lock poisoned");
        if *closed {
            return false;
        }
        if let Err(e) = acceptor.set_nonblocking() {
            tracing::error!("listener setup failed: {e}");
            return false;
        }

        let acceptor: Arc<dyn Acceptor> = Arc::new(acceptor);
        self.listeners
            .lock()
            .expect("listener list lock poisoned")
            .push(Arc::clone(&acceptor));

        let registry = Arc::clone(&self.registry);
        let closed_flag = Arc::clone(&self.closed);
        thread::spawn(move || run_accept_loop(acceptor, registry, closed_flag));
        true
    }

    /// Register one established stream as a new session. Returns false
    /// once the hub is closed.
    pub fn add_connection(&self, conn: Arc<dyn Conn>) -> bool {
        add_session(&self.registry, &self.closed, conn)
    }

    /// Close the hub: reject further listeners and connections, close
    /// every listening endpoint, then close every session's stream. The
    /// endpoints are released before this returns; the accept loops and
    /// session workers observe the closures and clean themselves up, and
    /// their completion is not awaited here.
    pub fn close(&self) {
        let mut closed = self.closed.write().expect("closed flag lock poisoned");
        *closed = true;
        for acceptor in self
            .listeners
            .lock()
            .expect("listener list lock poisoned")
            .iter()
        {
            acceptor.close();
        }
        self.registry.close_all();
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

fn add_session(
    registry: &Arc<Registry>,
    closed: &Arc<RwLock<bool>>,
    conn: Arc<dyn Conn>,
) -> bool {
    let closed = closed.read().expect("closed flag lock poisoned");
    if *closed {
        return false;
    }

    let cid = registry.mint();
    let (relay_tx, relay_rx) = channel::bounded(INDICATION_QUEUE_DEPTH);
    // Rendezvous: a handler's enqueue completes only when the sender takes
    // the response.
    let (response_tx, response_rx) = channel::bounded(0);

    registry.insert(
        cid,
        SessionHandle {
            conn: Arc::clone(&conn),
            relay_tx,
        },
    );
    session::spawn(
        Arc::clone(registry),
        conn,
        cid,
        response_tx,
        response_rx,
        relay_rx,
    );
    tracing::info!(client = %cid, "session added");
    true
}

fn run_accept_loop(
    acceptor: Arc<dyn Acceptor>,
    registry: Arc<Registry>,
    closed: Arc<RwLock<bool>>,
) {
    loop {
        if *closed.read().expect("closed flag lock poisoned") {
            break;
        }
        match acceptor.accept() {
            Ok(conn) => {
                if !add_session(&registry, &closed, conn) {
                    break;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL),
            Err(e) => {
                tracing::warn!("accept error: {e}");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::time::Instant;

    use super::*;
    use crate::conn::SocketAcceptor;
    use crate::proto::{Message, cbor};
    use crate::test_harness::pipe;

    fn wait_for_empty_registry(hub: &Hub) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while hub.registry.len() != 0 {
            assert!(Instant::now() < deadline, "sessions were not removed");
            thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn closed_hub_rejects_new_work() {
        let hub = Hub::new();
        hub.close();

        let (conn, _peer) = pipe();
        assert!(!hub.add_connection(Arc::new(conn)));

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        assert!(!hub.add_listener(SocketAcceptor::new(listener)));
    }

    #[test]
    fn close_closes_registered_acceptors() {
        let hub = Hub::new();
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        assert!(hub.add_listener(SocketAcceptor::new(listener)));

        hub.close();

        // close() acted on the acceptor itself, not just the gate.
        let listeners = hub.listeners.lock().unwrap();
        assert_eq!(listeners.len(), 1);
        assert!(listeners[0].accept().is_err());
    }

    #[test]
    fn disconnect_unregisters_the_session() {
        let hub = Hub::new();
        let (client_end, hub_end) = pipe();
        assert!(hub.add_connection(Arc::new(hub_end)));

        // Round-trip one request so the session is demonstrably live.
        let mut writer = client_end.writer().unwrap();
        writer
            .write_all(&cbor::encode(&Message::identify_request(1)).unwrap())
            .unwrap();
        let mut sd = cbor::StreamDecoder::new(client_end.reader().unwrap());
        let rsp = sd.decode_next().unwrap();
        assert!(rsp.identify_res.is_some());
        assert_eq!(hub.registry.len(), 1);

        client_end.shutdown();
        wait_for_empty_registry(&hub);
    }

    #[test]
    fn close_tears_down_live_sessions() {
        let hub = Hub::new();
        let (client_end, hub_end) = pipe();
        assert!(hub.add_connection(Arc::new(hub_end)));

        hub.close();

        let mut sd = cbor::StreamDecoder::new(client_end.reader().unwrap());
        assert!(sd.decode_next().is_none());
        wait_for_empty_registry(&hub);
    }
}

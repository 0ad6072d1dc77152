//! Client-side request/response multiplexer.
//!
//! One background receiver fans decoded envelopes either into the waiter
//! matching their message id or, for relay indications, into the
//! application-facing indication queue. Request operations are synchronous:
//! send, then wait on a one-shot delivery slot with a fixed deadline.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use thiserror::Error;

use crate::conn::Conn;
use crate::proto::{
    ClientId, ClientStatusMap, MAX_RELAY_DESTINATIONS, MAX_RELAY_PAYLOAD, Message,
    RelayIndication, Status, cbor,
};

/// Hard deadline for every request operation.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Capacity of the application-facing indication queue.
pub const INDICATION_QUEUE_DEPTH: usize = 10;

/// Why a request operation failed. Maps 1:1 onto the local (never
/// serialized) half of the protocol status codes.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ClientError {
    #[error("connection closed or broken")]
    Connection,
    #[error("message could not be encoded or the response was malformed")]
    Encoding,
    #[error("no response within the request deadline")]
    Timeout,
    #[error("payload of {payload} bytes to {dest} destinations exceeds protocol limits")]
    TooLong { payload: usize, dest: usize },
}

impl ClientError {
    pub fn status(&self) -> Status {
        match self {
            ClientError::Connection => Status::ConnectionError,
            ClientError::Encoding => Status::EncodingError,
            ClientError::Timeout => Status::Timeout,
            ClientError::TooLong { .. } => Status::TooLong,
        }
    }
}

/// Result of a relay: the hub's overall status plus the per-destination
/// failures (successes are omitted).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayOutcome {
    pub status: Status,
    pub status_map: ClientStatusMap,
}

impl RelayOutcome {
    /// True when every destination received the indication.
    pub fn fully_delivered(&self) -> bool {
        self.status == Status::Success && self.status_map.is_empty()
    }
}

type WaiterMap = Mutex<HashMap<u32, Sender<Message>>>;

/// A connected broadcast-hub client.
///
/// The indication queue must be drained continuously: once it is full the
/// receiver blocks, and with it all response processing. Dropping or
/// closing the client tears the connection down.
pub struct Client {
    conn: Arc<dyn Conn>,
    writer: Mutex<Box<dyn Write + Send>>,
    waiters: Arc<WaiterMap>,
    next_mid: AtomicU32,
    relays: Receiver<RelayIndication>,
}

impl Client {
    /// Take ownership of an established stream and start the receiver.
    pub fn new(conn: Arc<dyn Conn>) -> io::Result<Self> {
        let reader = conn.reader()?;
        let writer = conn.writer()?;
        let waiters: Arc<WaiterMap> = Arc::default();
        let (relay_tx, relay_rx) = channel::bounded(INDICATION_QUEUE_DEPTH);

        let recv_waiters = Arc::clone(&waiters);
        thread::spawn(move || run_receiver(reader, recv_waiters, relay_tx));

        Ok(Self {
            conn,
            writer: Mutex::new(writer),
            waiters,
            next_mid: AtomicU32::new(0),
            relays: relay_rx,
        })
    }

    /// Connect over TCP.
    pub fn connect<A: ToSocketAddrs>(addr: A) -> io::Result<Self> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        Self::new(Arc::new(stream))
    }

    /// Relay indications forwarded to this client by the hub.
    pub fn relays(&self) -> &Receiver<RelayIndication> {
        &self.relays
    }

    /// Ask the hub for this client's handle.
    pub fn identify(&self) -> Result<ClientId, ClientError> {
        let mid = self.next_mid();
        let rsp = self.request(Message::identify_request(mid), mid)?;
        match rsp.identify_res {
            Some(res) => Ok(res.id),
            None => Err(ClientError::Encoding),
        }
    }

    /// List every other client currently connected to the hub.
    pub fn list_others(&self) -> Result<Vec<ClientId>, ClientError> {
        let mid = self.next_mid();
        let rsp = self.request(Message::list_request(mid), mid)?;
        match rsp.list_res {
            Some(res) => Ok(res.others),
            None => Err(ClientError::Encoding),
        }
    }

    /// Relay `msg` to each destination. Limits are checked locally before
    /// anything is sent: at most [`MAX_RELAY_PAYLOAD`] bytes to at most
    /// [`MAX_RELAY_DESTINATIONS`] destinations.
    pub fn relay(&self, msg: Bytes, dest: Vec<ClientId>) -> Result<RelayOutcome, ClientError> {
        if msg.len() > MAX_RELAY_PAYLOAD || dest.len() > MAX_RELAY_DESTINATIONS {
            return Err(ClientError::TooLong {
                payload: msg.len(),
                dest: dest.len(),
            });
        }
        let mid = self.next_mid();
        let rsp = self.request(Message::relay_request(mid, dest, msg), mid)?;
        match rsp.relay_res {
            Some(res) => Ok(RelayOutcome {
                status: res.status,
                status_map: res.status_map,
            }),
            None => Err(ClientError::Encoding),
        }
    }

    /// Close the underlying stream. The receiver terminates and the
    /// indication queue disconnects; in-flight requests fail with
    /// [`ClientError::Connection`].
    pub fn close(&self) {
        self.conn.shutdown();
    }

    fn next_mid(&self) -> u32 {
        self.next_mid.fetch_add(1, Ordering::Relaxed)
    }

    fn request(&self, msg: Message, mid: u32) -> Result<Message, ClientError> {
        let encoded = cbor::encode(&msg).map_err(|_| ClientError::Encoding)?;

        let (tx, rx) = channel::bounded(1);
        self.waiters
            .lock()
            .expect("waiter table lock poisoned")
            .insert(mid, tx);

        let written = {
            let mut writer = self.writer.lock().expect("writer lock poisoned");
            writer.write_all(&encoded).and_then(|()| writer.flush())
        };

        let outcome = if written.is_err() {
            Err(ClientError::Connection)
        } else {
            match rx.recv_timeout(REQUEST_TIMEOUT) {
                Ok(rsp) => Ok(rsp),
                Err(RecvTimeoutError::Timeout) => Err(ClientError::Timeout),
                Err(RecvTimeoutError::Disconnected) => Err(ClientError::Connection),
            }
        };

        // The waiter is removed on every exit path; a response arriving
        // after a timeout finds no waiter and is dropped by the receiver.
        self.waiters
            .lock()
            .expect("waiter table lock poisoned")
            .remove(&mid);
        outcome
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.conn.shutdown();
    }
}

fn run_receiver(
    reader: Box<dyn Read + Send>,
    waiters: Arc<WaiterMap>,
    relay_tx: Sender<RelayIndication>,
) {
    let mut decoder = cbor::StreamDecoder::new(reader);
    while let Some(msg) = decoder.decode_next() {
        if let Some(ind) = msg.relay_ind {
            // Blocking by contract: an application that stops draining
            // indications stalls all receive processing, responses
            // included.
            if relay_tx.send(ind).is_err() {
                break;
            }
            continue;
        }

        let waiter = {
            let map = waiters.lock().expect("waiter table lock poisoned");
            map.get(&msg.message_id).cloned()
        };
        // Delivered outside the lock; no waiter means a late or unsolicited
        // response, which is dropped.
        if let Some(tx) = waiter {
            let _ = tx.try_send(msg);
        }
    }

    // End of stream: fail every outstanding waiter and close the
    // indication queue.
    waiters
        .lock()
        .expect("waiter table lock poisoned")
        .clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::cbor::StreamDecoder;
    use crate::test_harness::pipe;

    fn harness() -> (Client, crate::test_harness::PipeConn) {
        let (near, far) = pipe();
        let client = Client::new(Arc::new(near)).unwrap();
        (client, far)
    }

    #[test]
    fn identify_roundtrip() {
        let (client, hub_end) = harness();

        let hub = thread::spawn(move || {
            let mut sd = StreamDecoder::new(hub_end.reader().unwrap());
            let req = sd.decode_next().unwrap();
            assert_eq!(req.version, crate::proto::PROTOCOL_VERSION);
            assert_eq!(req.slot_count(), 1);
            assert!(req.identify_req.is_some());

            let rsp = Message::identify_response(req.message_id, ClientId(1234));
            let mut writer = hub_end.writer().unwrap();
            writer.write_all(&cbor::encode(&rsp).unwrap()).unwrap();
        });

        assert_eq!(client.identify().unwrap(), ClientId(1234));
        hub.join().unwrap();
    }

    #[test]
    fn list_roundtrip() {
        let (client, hub_end) = harness();
        let others: Vec<ClientId> = (1..=5).map(ClientId).collect();
        let expected = others.clone();

        let hub = thread::spawn(move || {
            let mut sd = StreamDecoder::new(hub_end.reader().unwrap());
            let req = sd.decode_next().unwrap();
            assert!(req.list_req.is_some());
            assert_eq!(req.slot_count(), 1);

            let rsp = Message::list_response(req.message_id, others);
            let mut writer = hub_end.writer().unwrap();
            writer.write_all(&cbor::encode(&rsp).unwrap()).unwrap();
        });

        assert_eq!(client.list_others().unwrap(), expected);
        hub.join().unwrap();
    }

    #[test]
    fn relay_roundtrip_carries_status_map() {
        let (client, hub_end) = harness();

        let hub = thread::spawn(move || {
            let mut sd = StreamDecoder::new(hub_end.reader().unwrap());
            let req = sd.decode_next().unwrap();
            let relay = req.relay_req.as_ref().unwrap();
            assert_eq!(relay.msg.as_ref(), &[0x00, 0x11, 0x22, 0x33]);
            assert_eq!(relay.dest, (1..=5).map(ClientId).collect::<Vec<_>>());

            let map = ClientStatusMap::from([
                (ClientId(2), Status::InvalidId),
                (ClientId(3), Status::ConnectionError),
            ]);
            let rsp = Message::relay_response(req.message_id, Status::Success, map);
            let mut writer = hub_end.writer().unwrap();
            writer.write_all(&cbor::encode(&rsp).unwrap()).unwrap();
        });

        let outcome = client
            .relay(
                Bytes::from_static(&[0x00, 0x11, 0x22, 0x33]),
                (1..=5).map(ClientId).collect(),
            )
            .unwrap();
        assert_eq!(outcome.status, Status::Success);
        assert_eq!(outcome.status_map.len(), 2);
        assert_eq!(outcome.status_map[&ClientId(2)], Status::InvalidId);
        assert_eq!(outcome.status_map[&ClientId(3)], Status::ConnectionError);
        hub.join().unwrap();
    }

    #[test]
    fn indications_reach_the_application_queue() {
        let (client, hub_end) = harness();

        let ind = Message::relay_indication(1, ClientId(888), Bytes::from_static(&[11, 22, 33]));
        let mut writer = hub_end.writer().unwrap();
        writer.write_all(&cbor::encode(&ind).unwrap()).unwrap();

        let got = client
            .relays()
            .recv_timeout(Duration::from_secs(1))
            .unwrap();
        assert_eq!(got.src, ClientId(888));
        assert_eq!(got.msg.as_ref(), &[11, 22, 33]);
    }

    #[test]
    fn oversize_relay_is_rejected_locally() {
        let (client, hub_end) = harness();

        let err = client
            .relay(Bytes::from(vec![0u8; MAX_RELAY_PAYLOAD + 1]), vec![ClientId(1)])
            .unwrap_err();
        assert!(matches!(err, ClientError::TooLong { .. }));
        assert_eq!(err.status(), Status::TooLong);

        let too_many: Vec<ClientId> = (0..=MAX_RELAY_DESTINATIONS as u64).map(ClientId).collect();
        let err = client.relay(Bytes::from_static(b"x"), too_many).unwrap_err();
        assert!(matches!(err, ClientError::TooLong { .. }));

        // Nothing went over the wire.
        let mut sd = StreamDecoder::new(hub_end.reader().unwrap());
        client.close();
        assert!(sd.decode_next().is_none());
    }

    #[test]
    fn broken_connection_fails_the_request() {
        let (client, hub_end) = harness();

        let hub = thread::spawn(move || {
            let mut sd = StreamDecoder::new(hub_end.reader().unwrap());
            sd.decode_next().unwrap();
            // Request received; drop the connection before any response.
            hub_end.shutdown();
        });

        assert_eq!(client.identify().unwrap_err(), ClientError::Connection);
        hub.join().unwrap();
    }

    #[test]
    fn close_during_request_fails_with_connection_error() {
        let (near, far) = pipe();
        let client = Arc::new(Client::new(Arc::new(near)).unwrap());

        let closer = Arc::clone(&client);
        let hub = thread::spawn(move || {
            let mut reader = far.reader().unwrap();
            let mut first = [0u8; 1];
            reader.read_exact(&mut first).unwrap();
            // One byte of the request is out; close the client mid-send.
            closer.close();
        });

        assert_eq!(client.identify().unwrap_err(), ClientError::Connection);
        hub.join().unwrap();
    }

    #[test]
    fn silent_hub_times_out_and_the_connection_stays_usable() {
        let (client, hub_end) = harness();

        let hub = thread::spawn(move || {
            let mut sd = StreamDecoder::new(hub_end.reader().unwrap());
            // Swallow the first request, then answer the retry.
            sd.decode_next().unwrap();
            let retry = sd.decode_next().unwrap();
            let rsp = Message::identify_response(retry.message_id, ClientId(42));
            let mut writer = hub_end.writer().unwrap();
            writer.write_all(&cbor::encode(&rsp).unwrap()).unwrap();
        });

        let start = std::time::Instant::now();
        assert_eq!(client.identify().unwrap_err(), ClientError::Timeout);
        assert!(start.elapsed() >= REQUEST_TIMEOUT);

        assert_eq!(client.identify().unwrap(), ClientId(42));
        hub.join().unwrap();
    }

    #[test]
    fn concurrent_requests_correlate_by_message_id() {
        let (client, hub_end) = harness();
        let client = Arc::new(client);

        // Two different requests are in flight at once and the hub answers
        // them in reverse arrival order; only id-based correlation routes
        // each response to the caller that can parse it.
        let hub = thread::spawn(move || {
            let mut sd = StreamDecoder::new(hub_end.reader().unwrap());
            let first = sd.decode_next().unwrap();
            let second = sd.decode_next().unwrap();
            let mut writer = hub_end.writer().unwrap();
            for req in [second, first] {
                let rsp = if req.identify_req.is_some() {
                    Message::identify_response(req.message_id, ClientId(7))
                } else {
                    Message::list_response(req.message_id, vec![ClientId(8)])
                };
                writer.write_all(&cbor::encode(&rsp).unwrap()).unwrap();
            }
        });

        let lister = Arc::clone(&client);
        let t = thread::spawn(move || lister.list_others());
        assert_eq!(client.identify().unwrap(), ClientId(7));
        assert_eq!(t.join().unwrap().unwrap(), vec![ClientId(8)]);
        hub.join().unwrap();
    }
}

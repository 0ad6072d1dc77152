//! Per-connection receive/send workers and request handlers.
//!
//! Each session runs two threads over one stream. The receiver decodes
//! envelopes and turns requests into responses; the sender serves the
//! outbound stream, always preferring responses over relay indications.
//! The sender is also the session's undertaker: it removes the registry
//! entry and reclaims anything left in the response queue before exiting.

use std::io::Write;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam::channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError};

use crate::conn::Conn;
use crate::proto::{
    ClientId, ClientStatusMap, MAX_RELAY_DESTINATIONS, MAX_RELAY_PAYLOAD, Message, RelayIndication,
    RelayRequest, Status, cbor,
};

use super::registry::Registry;

/// How long the exiting sender waits for the receiver to release the
/// response queue before declaring the session unrecoverable.
const RESPONSE_DRAIN_TIMEOUT: Duration = Duration::from_secs(15);

pub(crate) fn spawn(
    registry: Arc<Registry>,
    conn: Arc<dyn Conn>,
    cid: ClientId,
    response_tx: Sender<Message>,
    response_rx: Receiver<Message>,
    relay_rx: Receiver<RelayIndication>,
) {
    {
        let registry = Arc::clone(&registry);
        let conn = Arc::clone(&conn);
        thread::spawn(move || run_receiver(registry, conn, cid, response_tx));
    }
    thread::spawn(move || run_sender(registry, conn, cid, response_rx, relay_rx));
}

/// Decode envelopes until end-of-stream, handling every command slot
/// present independently. Response enqueues block until the sender takes
/// them; a failed enqueue means the sender is gone and the session is
/// over.
fn run_receiver(
    registry: Arc<Registry>,
    conn: Arc<dyn Conn>,
    cid: ClientId,
    response_tx: Sender<Message>,
) {
    if let Ok(reader) = conn.reader() {
        let mut decoder = cbor::StreamDecoder::new(reader);
        while let Some(msg) = decoder.decode_next() {
            if msg.identify_req.is_some() {
                let rsp = Message::identify_response(msg.message_id, cid);
                if response_tx.send(rsp).is_err() {
                    break;
                }
            }
            if msg.list_req.is_some() {
                let rsp = Message::list_response(msg.message_id, registry.others(cid));
                if response_tx.send(rsp).is_err() {
                    break;
                }
            }
            if let Some(req) = &msg.relay_req {
                let rsp = handle_relay(&registry, cid, msg.message_id, req);
                if response_tx.send(rsp).is_err() {
                    break;
                }
            }
        }
    }

    // Closing the stream tells the sender to wind down; dropping the
    // response sender is the queue-closure signal, and happens only here,
    // after the receiver has ceased producing.
    conn.shutdown();
}

/// Dispatch one relay request: non-blocking enqueue onto each
/// destination's indication queue, recording only the failures.
fn handle_relay(registry: &Registry, src: ClientId, mid: u32, req: &RelayRequest) -> Message {
    if req.dest.len() > MAX_RELAY_DESTINATIONS || req.msg.len() > MAX_RELAY_PAYLOAD {
        return Message::relay_response(mid, Status::TooLong, ClientStatusMap::new());
    }

    let ind = RelayIndication {
        src,
        msg: req.msg.clone(),
    };
    let mut status_map = ClientStatusMap::new();
    for &cid in &req.dest {
        let Some(relay_tx) = registry.relay_sender(cid) else {
            status_map.insert(cid, Status::InvalidId);
            continue;
        };
        // Never block here: a slow destination drops at its own queue
        // instead of stalling this session. Successes are omitted from
        // the map.
        match relay_tx.try_send(ind.clone()) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                status_map.insert(cid, Status::NoBuffer);
            }
            Err(TrySendError::Disconnected(_)) => {
                status_map.insert(cid, Status::InvalidId);
            }
        }
    }

    Message::relay_response(mid, Status::Success, status_map)
}

/// Serve the outbound stream until it fails or both queues close, then
/// remove the session and drain the response queue so the receiver is
/// never left blocked on it.
fn run_sender(
    registry: Arc<Registry>,
    conn: Arc<dyn Conn>,
    cid: ClientId,
    response_rx: Receiver<Message>,
    relay_rx: Receiver<RelayIndication>,
) {
    if let Ok(mut writer) = conn.writer() {
        // Indication ids are informational and per-session; they share
        // nothing with request message ids.
        let mut ind_mid: u32 = 0;
        loop {
            // Double select: take a ready response first, otherwise wait on
            // whichever queue delivers. A single fair select would let an
            // indication flood starve responses.
            let msg = match response_rx.try_recv() {
                Ok(msg) => msg,
                Err(TryRecvError::Empty) => {
                    crossbeam::select! {
                        recv(response_rx) -> msg => match msg {
                            Ok(msg) => msg,
                            Err(_) => break,
                        },
                        recv(relay_rx) -> ind => match ind {
                            Ok(ind) => {
                                let msg = Message::relay_indication(ind_mid, ind.src, ind.msg);
                                ind_mid = ind_mid.wrapping_add(1);
                                msg
                            }
                            Err(_) => break,
                        },
                    }
                }
                Err(TryRecvError::Disconnected) => break,
            };

            let Ok(encoded) = cbor::encode(&msg) else {
                break;
            };
            if writer.write_all(&encoded).and_then(|()| writer.flush()).is_err() {
                break;
            }
        }
    }

    // Removal precedes the close becoming visible to peers; the receiver
    // then observes end-of-stream and releases the response queue, which
    // the drain below waits for. Pending indications are discarded with
    // the queue.
    registry.remove(cid);
    conn.shutdown();
    drain_responses(&response_rx);
    tracing::info!(client = %cid, "session removed");
}

fn drain_responses(response_rx: &Receiver<Message>) {
    loop {
        match response_rx.recv_timeout(RESPONSE_DRAIN_TIMEOUT) {
            Ok(_discarded) => {}
            Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {
                panic!("session receiver failed to release the response queue");
            }
        }
    }
}

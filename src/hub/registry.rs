//! Process-wide table of active sessions.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crossbeam::channel::Sender;

use crate::conn::Conn;
use crate::proto::{ClientId, RelayIndication};

/// Capacity of each session's indication queue.
pub const INDICATION_QUEUE_DEPTH: usize = 3;

/// One registered session as the rest of the hub sees it: enough to push
/// into its indication queue and to close its stream on shutdown. The
/// session's own workers hold everything else.
pub(crate) struct SessionHandle {
    pub conn: Arc<dyn Conn>,
    pub relay_tx: Sender<RelayIndication>,
}

/// Handle table plus the handle mint. Reads (relay lookup, list snapshot)
/// never hold the lock across I/O; writes happen only at session add and
/// remove.
pub(crate) struct Registry {
    next_cid: AtomicU64,
    sessions: RwLock<HashMap<ClientId, SessionHandle>>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            next_cid: AtomicU64::new(1),
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Mint a fresh handle: monotonic, never zero, never reused within the
    /// hub's lifetime.
    pub fn mint(&self) -> ClientId {
        ClientId(self.next_cid.fetch_add(1, Ordering::Relaxed))
    }

    pub fn insert(&self, cid: ClientId, handle: SessionHandle) {
        self.sessions
            .write()
            .expect("registry lock poisoned")
            .insert(cid, handle);
    }

    /// Remove a session and close its stream. Removal precedes the close,
    /// so peers never observe a closing session in a list snapshot. Called
    /// only by the session's own sender, exactly once, on its way out.
    pub fn remove(&self, cid: ClientId) {
        let removed = self
            .sessions
            .write()
            .expect("registry lock poisoned")
            .remove(&cid);
        if let Some(handle) = removed {
            handle.conn.shutdown();
        }
    }

    /// Clone of the destination's indication queue sender. The lock is
    /// released before the caller enqueues anything.
    pub fn relay_sender(&self, cid: ClientId) -> Option<Sender<RelayIndication>> {
        self.sessions
            .read()
            .expect("registry lock poisoned")
            .get(&cid)
            .map(|handle| handle.relay_tx.clone())
    }

    /// Snapshot of every registered handle except `except`.
    pub fn others(&self, except: ClientId) -> Vec<ClientId> {
        self.sessions
            .read()
            .expect("registry lock poisoned")
            .keys()
            .filter(|cid| **cid != except)
            .copied()
            .collect()
    }

    /// Close every registered session's stream. The sessions' senders
    /// observe the closure and remove themselves.
    pub fn close_all(&self) {
        for handle in self
            .sessions
            .read()
            .expect("registry lock poisoned")
            .values()
        {
            handle.conn.shutdown();
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.sessions.read().expect("registry lock poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use crossbeam::channel;

    use super::*;
    use crate::test_harness::pipe;

    fn handle() -> (SessionHandle, crossbeam::channel::Receiver<RelayIndication>) {
        let (conn, _peer) = pipe();
        let (relay_tx, relay_rx) = channel::bounded(INDICATION_QUEUE_DEPTH);
        (
            SessionHandle {
                conn: Arc::new(conn),
                relay_tx,
            },
            relay_rx,
        )
    }

    #[test]
    fn minted_handles_are_monotonic_and_nonzero() {
        let registry = Registry::new();
        let first = registry.mint();
        assert_eq!(first, ClientId(1));
        let mut prev = first;
        for _ in 0..100 {
            let next = registry.mint();
            assert!(next.as_u64() > prev.as_u64());
            prev = next;
        }
    }

    #[test]
    fn others_excludes_the_caller() {
        let registry = Registry::new();
        let mut rxs = Vec::new();
        for _ in 0..5 {
            let cid = registry.mint();
            let (h, rx) = handle();
            registry.insert(cid, h);
            rxs.push(rx);
        }

        let mut others = registry.others(ClientId(3));
        others.sort();
        assert_eq!(
            others,
            vec![ClientId(1), ClientId(2), ClientId(4), ClientId(5)]
        );

        // A handle that was never registered excludes nothing.
        assert_eq!(registry.others(ClientId(99)).len(), 5);
    }

    #[test]
    fn remove_drops_the_entry_and_its_queue() {
        let registry = Registry::new();
        let cid = registry.mint();
        let (h, rx) = handle();
        registry.insert(cid, h);

        assert!(registry.relay_sender(cid).is_some());
        assert_eq!(registry.len(), 1);

        registry.remove(cid);
        assert!(registry.relay_sender(cid).is_none());
        assert_eq!(registry.len(), 0);
        // The registry held the only sender.
        assert!(rx.try_recv().is_err());
    }
}

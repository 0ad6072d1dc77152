//! Test support: an in-process synchronous duplex pipe.
//!
//! The pipe is unbuffered: every write rendezvouses with a read on the
//! other end, in chunks of at most [`PIPE_CHUNK`] bytes. That gives tests
//! byte-level flow control without touching the network: a peer that stops
//! reading makes the writer block, exactly like an exhausted socket.

use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crossbeam::channel::{self, Receiver, Sender};

use crate::conn::Conn;

/// Largest chunk handed across the pipe in one rendezvous.
pub const PIPE_CHUNK: usize = 64;

/// One end of an in-process duplex pipe. Implements [`Conn`].
pub struct PipeConn {
    tx: Sender<Vec<u8>>,
    rx: Receiver<Vec<u8>>,
    close_tx: Mutex<Option<Sender<()>>>,
    local_done: Receiver<()>,
    peer_done: Receiver<()>,
}

/// Create a connected pair of pipe ends.
pub fn pipe() -> (PipeConn, PipeConn) {
    let (a_tx, a_rx) = channel::bounded(0);
    let (b_tx, b_rx) = channel::bounded(0);
    let (a_close_tx, a_done) = channel::bounded::<()>(0);
    let (b_close_tx, b_done) = channel::bounded::<()>(0);

    let a = PipeConn {
        tx: a_tx,
        rx: b_rx,
        close_tx: Mutex::new(Some(a_close_tx)),
        local_done: a_done.clone(),
        peer_done: b_done.clone(),
    };
    let b = PipeConn {
        tx: b_tx,
        rx: a_rx,
        close_tx: Mutex::new(Some(b_close_tx)),
        local_done: b_done,
        peer_done: a_done,
    };
    (a, b)
}

impl Conn for PipeConn {
    fn reader(&self) -> io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(PipeReader {
            rx: self.rx.clone(),
            local_done: self.local_done.clone(),
            peer_done: self.peer_done.clone(),
            leftover: Vec::new(),
        }))
    }

    fn writer(&self) -> io::Result<Box<dyn Write + Send>> {
        Ok(Box::new(PipeWriter {
            tx: self.tx.clone(),
            local_done: self.local_done.clone(),
            peer_done: self.peer_done.clone(),
        }))
    }

    fn shutdown(&self) {
        // Dropping the close sender wakes both ends' blocked reads and
        // writes through the done channels.
        self.close_tx.lock().expect("pipe close lock poisoned").take();
    }
}

struct PipeReader {
    rx: Receiver<Vec<u8>>,
    local_done: Receiver<()>,
    peer_done: Receiver<()>,
    leftover: Vec<u8>,
}

impl Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.leftover.is_empty() {
            crossbeam::select! {
                recv(self.rx) -> chunk => match chunk {
                    Ok(chunk) => self.leftover = chunk,
                    Err(_) => return Ok(0),
                },
                recv(self.local_done) -> _ => return Ok(0),
                recv(self.peer_done) -> _ => return Ok(0),
            }
        }
        let n = buf.len().min(self.leftover.len());
        buf[..n].copy_from_slice(&self.leftover[..n]);
        self.leftover.drain(..n);
        Ok(n)
    }
}

struct PipeWriter {
    tx: Sender<Vec<u8>>,
    local_done: Receiver<()>,
    peer_done: Receiver<()>,
}

impl Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let n = buf.len().min(PIPE_CHUNK);
        let chunk = buf[..n].to_vec();
        crossbeam::select! {
            send(self.tx, chunk) -> res => match res {
                Ok(()) => Ok(n),
                Err(_) => Err(broken_pipe()),
            },
            recv(self.local_done) -> _ => Err(broken_pipe()),
            recv(self.peer_done) -> _ => Err(broken_pipe()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn broken_pipe() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed")
}

/// Wrap one pipe end behind forwarders that move at most 10 bytes per
/// iteration, sleeping `byte_time` per byte, simulating a slow link in
/// both directions. The returned end replaces `conn` for the slow party.
pub fn throttle(conn: PipeConn, byte_time: Duration) -> PipeConn {
    let (near, far) = pipe();
    let conn = Arc::new(conn);
    let near = Arc::new(near);

    for (src, dst) in [(Arc::clone(&conn), Arc::clone(&near)), (near, conn)] {
        thread::spawn(move || {
            let (Ok(mut reader), Ok(mut writer)) = (src.reader(), dst.writer()) else {
                return;
            };
            let mut buf = [0u8; 10];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) | Err(_) => {
                        dst.shutdown();
                        src.shutdown();
                        break;
                    }
                    Ok(n) => {
                        thread::sleep(byte_time * n as u32);
                        if writer.write_all(&buf[..n]).is_err() {
                            src.shutdown();
                            break;
                        }
                    }
                }
            }
        });
    }

    far
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipe_carries_bytes_both_ways() {
        let (a, b) = pipe();
        let mut aw = a.writer().unwrap();
        let mut br = b.reader().unwrap();

        let handle = thread::spawn(move || aw.write_all(b"ping"));
        let mut buf = [0u8; 16];
        let n = br.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"ping");
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn writes_block_until_read() {
        let (a, b) = pipe();
        let mut aw = a.writer().unwrap();
        let (done_tx, done_rx) = channel::bounded(1);

        thread::spawn(move || {
            let res = aw.write_all(b"x");
            let _ = done_tx.send(res);
        });

        assert!(done_rx.recv_timeout(Duration::from_millis(50)).is_err());

        let mut br = b.reader().unwrap();
        let mut buf = [0u8; 1];
        br.read_exact(&mut buf).unwrap();
        assert!(
            done_rx
                .recv_timeout(Duration::from_secs(1))
                .unwrap()
                .is_ok()
        );
    }

    #[test]
    fn shutdown_unblocks_reader_with_eof() {
        let (a, b) = pipe();
        let mut br = b.reader().unwrap();

        thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            a.shutdown();
        });

        let mut buf = [0u8; 4];
        assert_eq!(br.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn writes_after_peer_close_fail() {
        let (a, b) = pipe();
        b.shutdown();
        let mut aw = a.writer().unwrap();
        assert!(aw.write_all(b"x").is_err());
    }

    #[test]
    fn large_writes_are_chunked_through_the_rendezvous() {
        let (a, b) = pipe();
        let mut aw = a.writer().unwrap();
        let payload: Vec<u8> = (0..1000u32).map(|i| i as u8).collect();
        let expected = payload.clone();

        let handle = thread::spawn(move || aw.write_all(&expected));

        let mut br = b.reader().unwrap();
        let mut got = vec![0u8; payload.len()];
        br.read_exact(&mut got).unwrap();
        assert_eq!(got, payload);
        handle.join().unwrap().unwrap();
    }
}

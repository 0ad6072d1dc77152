//! Byte-stream abstraction consumed by the hub and the client.
//!
//! The protocol core never creates sockets; it is handed something that
//! behaves like an ordered, reliable, bidirectional stream. TCP and Unix
//! sockets are the production impls; the test harness provides an
//! in-process pipe.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::{Arc, Mutex};

/// One bidirectional byte stream. Reader and writer handles are
/// independent so a session's two workers can own one each.
pub trait Conn: Send + Sync {
    /// A read handle over the stream.
    fn reader(&self) -> io::Result<Box<dyn Read + Send>>;

    /// A write handle over the stream.
    fn writer(&self) -> io::Result<Box<dyn Write + Send>>;

    /// Close both directions. Idempotent; pending reads observe
    /// end-of-stream and pending writes fail.
    fn shutdown(&self);
}

impl Conn for TcpStream {
    fn reader(&self) -> io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(self.try_clone()?))
    }

    fn writer(&self) -> io::Result<Box<dyn Write + Send>> {
        Ok(Box::new(self.try_clone()?))
    }

    fn shutdown(&self) {
        let _ = TcpStream::shutdown(self, Shutdown::Both);
    }
}

impl Conn for UnixStream {
    fn reader(&self) -> io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(self.try_clone()?))
    }

    fn writer(&self) -> io::Result<Box<dyn Write + Send>> {
        Ok(Box::new(self.try_clone()?))
    }

    fn shutdown(&self) {
        let _ = UnixStream::shutdown(self, Shutdown::Both);
    }
}

/// A stream-accepting endpoint the hub can run an accept loop over.
///
/// The loop polls a shutdown flag between accepts, so endpoints are put
/// into non-blocking mode up front and `accept` surfaces `WouldBlock`.
pub trait Acceptor: Send + Sync + 'static {
    fn set_nonblocking(&self) -> io::Result<()>;

    fn accept(&self) -> io::Result<Arc<dyn Conn>>;

    /// Close the endpoint. Idempotent; subsequent accepts fail with an
    /// error other than `WouldBlock`.
    fn close(&self);
}

/// A listening socket behind a closable slot. `close` takes the socket
/// out and drops it, which releases the endpoint at once and makes the
/// owning accept loop's next accept fail.
pub struct SocketAcceptor<L> {
    inner: Mutex<Option<L>>,
}

impl<L> SocketAcceptor<L> {
    pub fn new(listener: L) -> Self {
        Self {
            inner: Mutex::new(Some(listener)),
        }
    }
}

fn closed_endpoint() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "listener closed")
}

impl Acceptor for SocketAcceptor<TcpListener> {
    fn set_nonblocking(&self) -> io::Result<()> {
        match self.inner.lock().expect("listener lock poisoned").as_ref() {
            Some(listener) => listener.set_nonblocking(true),
            None => Err(closed_endpoint()),
        }
    }

    fn accept(&self) -> io::Result<Arc<dyn Conn>> {
        let guard = self.inner.lock().expect("listener lock poisoned");
        let listener = guard.as_ref().ok_or_else(closed_endpoint)?;
        let (stream, _addr) = listener.accept()?;
        // Accepted sockets inherit the listener's non-blocking mode on some
        // platforms; the session workers need blocking I/O.
        stream.set_nonblocking(false)?;
        stream.set_nodelay(true)?;
        Ok(Arc::new(stream))
    }

    fn close(&self) {
        self.inner.lock().expect("listener lock poisoned").take();
    }
}

impl Acceptor for SocketAcceptor<UnixListener> {
    fn set_nonblocking(&self) -> io::Result<()> {
        match self.inner.lock().expect("listener lock poisoned").as_ref() {
            Some(listener) => listener.set_nonblocking(true),
            None => Err(closed_endpoint()),
        }
    }

    fn accept(&self) -> io::Result<Arc<dyn Conn>> {
        let guard = self.inner.lock().expect("listener lock poisoned");
        let listener = guard.as_ref().ok_or_else(closed_endpoint)?;
        let (stream, _addr) = listener.accept()?;
        stream.set_nonblocking(false)?;
        Ok(Arc::new(stream))
    }

    fn close(&self) {
        self.inner.lock().expect("listener lock poisoned").take();
    }
}

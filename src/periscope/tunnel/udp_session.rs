use std::{
    io,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex as StdMutex,
    },
    time::Duration,
};

use thiserror::Error;
use tokio::{
    net::UdpSocket,
    sync::{mpsc, Mutex, Notify},
    time::Instant,
};

/// Bounded depth of the per-peer inbound datagram queue.
pub const SESSION_QUEUE_DEPTH: usize = 100;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("udp session idle timeout")]
    TimedOut,
    #[error("udp session closed")]
    Closed,
}

/// Pseudo-stream over a shared listening UDP socket for one remote peer.
///
/// Incoming datagrams for the peer are pushed by the accept loop through the
/// paired sender. The idle deadline is a single absolute instant; every
/// successful write to the peer moves it forward, and `read` re-derives its
/// wait from it on each iteration. Closing the session never touches the
/// shared socket.
pub struct UdpSession {
    sock: Arc<UdpSocket>,
    peer: SocketAddr,
    queue: Mutex<mpsc::Receiver<Vec<u8>>>,
    wrote: Notify,
    closing: Notify,
    closed: AtomicBool,
    deadline: StdMutex<Instant>,
    idle_timeout: Duration,
}

impl UdpSession {
    /// Creates a session for `peer` plus the sender the accept loop uses to
    /// route that peer's datagrams in.
    pub fn new(
        sock: Arc<UdpSocket>,
        peer: SocketAddr,
        idle_timeout: Duration,
    ) -> (Arc<Self>, mpsc::Sender<Vec<u8>>) {
        let (tx, rx) = mpsc::channel(SESSION_QUEUE_DEPTH);
        let session = Arc::new(Self {
            sock,
            peer,
            queue: Mutex::new(rx),
            wrote: Notify::new(),
            closing: Notify::new(),
            closed: AtomicBool::new(false),
            deadline: StdMutex::new(Instant::now() + idle_timeout),
            idle_timeout,
        });
        (session, tx)
    }

    /// Blocks until a datagram arrives (copied into `buf`, truncating), the
    /// idle deadline elapses, or the session is closed.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, SessionError> {
        let mut queue = self.queue.lock().await;
        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(SessionError::Closed);
            }
            let deadline = *self.deadline.lock().unwrap();
            tokio::select! {
                datagram = queue.recv() => {
                    if self.closed.load(Ordering::Acquire) {
                        return Err(SessionError::Closed);
                    }
                    let Some(datagram) = datagram else {
                        return Err(SessionError::Closed);
                    };
                    let n = datagram.len().min(buf.len());
                    buf[..n].copy_from_slice(&datagram[..n]);
                    return Ok(n);
                }
                _ = self.wrote.notified() => {
                    // A write moved the deadline; loop to pick it up.
                }
                _ = self.closing.notified() => {
                    return Err(SessionError::Closed);
                }
                _ = tokio::time::sleep_until(deadline) => {
                    if *self.deadline.lock().unwrap() <= Instant::now() {
                        return Err(SessionError::TimedOut);
                    }
                }
            }
        }
    }

    /// Sends one datagram to the peer through the shared socket and defers
    /// the idle deadline.
    pub async fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let n = self.sock.send_to(buf, self.peer).await?;
        *self.deadline.lock().unwrap() = Instant::now() + self.idle_timeout;
        self.wrote.notify_one();
        Ok(n)
    }

    /// Idempotent. Parked reads fail promptly; queued datagrams are
    /// discarded, not delivered. The shared socket stays open.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.closing.notify_one();
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.sock.local_addr()
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }
}

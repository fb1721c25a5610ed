use std::{
    io,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc,
    },
};

use dashmap::DashMap;
use tokio::{
    io::AsyncWriteExt,
    net::{tcp::OwnedWriteHalf, UdpSocket},
    sync::{watch, Mutex},
};

use crate::periscope::tunnel::udp_session::UdpSession;

/// The writable side of one registered user or service connection.
///
/// Pumps select on `stopped()` so that closing an endpoint unparks the read
/// loop that owns the other half of the socket.
pub struct Endpoint {
    kind: EndpointKind,
    stop: watch::Sender<bool>,
    peer: SocketAddr,
}

enum EndpointKind {
    /// TCP write half; the paired read half lives in the stream's pump task.
    Tcp(Mutex<OwnedWriteHalf>),
    /// Edge-side UDP session over the shared user socket.
    UdpSession(Arc<UdpSession>),
    /// Proxy-side connected UDP socket to the service.
    UdpSocket(Arc<UdpSocket>),
}

impl Endpoint {
    pub fn tcp(writer: OwnedWriteHalf, peer: SocketAddr) -> Self {
        Self {
            kind: EndpointKind::Tcp(Mutex::new(writer)),
            stop: watch::channel(false).0,
            peer,
        }
    }

    pub fn udp_session(session: Arc<UdpSession>) -> Self {
        let peer = session.peer_addr();
        Self {
            kind: EndpointKind::UdpSession(session),
            stop: watch::channel(false).0,
            peer,
        }
    }

    pub fn udp_socket(sock: Arc<UdpSocket>, peer: SocketAddr) -> Self {
        Self {
            kind: EndpointKind::UdpSocket(sock),
            stop: watch::channel(false).0,
            peer,
        }
    }

    pub fn stopped(&self) -> watch::Receiver<bool> {
        self.stop.subscribe()
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Writes a whole payload to the endpoint (partial TCP writes retried by
    /// `write_all`; datagrams sent as one unit).
    pub async fn write(&self, buf: &[u8]) -> io::Result<()> {
        match &self.kind {
            EndpointKind::Tcp(writer) => {
                let mut w = writer.lock().await;
                w.write_all(buf).await
            }
            EndpointKind::UdpSession(session) => session.write(buf).await.map(|_| ()),
            EndpointKind::UdpSocket(sock) => sock.send(buf).await.map(|_| ()),
        }
    }

    /// Releases the endpoint and signals its pump to stop. Idempotent.
    pub async fn close(&self) {
        let _ = self.stop.send(true);
        match &self.kind {
            EndpointKind::Tcp(writer) => {
                let mut w = writer.lock().await;
                let _ = w.shutdown().await;
            }
            EndpointKind::UdpSession(session) => session.close(),
            EndpointKind::UdpSocket(_) => {
                // Dropping the last Arc releases the socket; the pump's stop
                // signal is what unparks it.
            }
        }
    }
}

/// Thread-safe CID -> endpoint map plus the Edge's monotonic CID allocator.
pub struct Registry {
    conns: DashMap<u32, Arc<Endpoint>>,
    next_cid: AtomicU32,
    exhausted: AtomicBool,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            conns: DashMap::new(),
            // CID 0 is reserved for non-stream control frames.
            next_cid: AtomicU32::new(1),
            exhausted: AtomicBool::new(false),
        }
    }

    /// Allocates the next CID. Returns `None` once the 32-bit space is
    /// exhausted; CIDs are never reused within a session.
    pub fn next_cid(&self) -> Option<u32> {
        if self.exhausted.load(Ordering::Relaxed) {
            return None;
        }
        let cid = self.next_cid.fetch_add(1, Ordering::Relaxed);
        if cid == 0 {
            self.exhausted.store(true, Ordering::Relaxed);
            return None;
        }
        Some(cid)
    }

    pub fn insert(&self, cid: u32, endpoint: Arc<Endpoint>) {
        self.conns.insert(cid, endpoint);
    }

    pub fn get(&self, cid: u32) -> Option<Arc<Endpoint>> {
        self.conns.get(&cid).map(|e| e.value().clone())
    }

    pub fn remove(&self, cid: u32) -> Option<Arc<Endpoint>> {
        self.conns.remove(&cid).map(|(_, ep)| ep)
    }

    /// Removes and releases one endpoint. Returns whether it was present.
    pub async fn remove_and_close(&self, cid: u32) -> bool {
        match self.remove(cid) {
            Some(ep) => {
                ep.close().await;
                true
            }
            None => false,
        }
    }

    /// Closes every endpoint and resets the map. Entries are collected first
    /// so no I/O happens while a map shard is locked.
    pub async fn close_all(&self) {
        let endpoints: Vec<Arc<Endpoint>> =
            self.conns.iter().map(|e| e.value().clone()).collect();
        self.conns.clear();
        for ep in endpoints {
            ep.close().await;
        }
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::{TcpListener, TcpStream};

    async fn tcp_pair() -> (TcpStream, TcpStream) {
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap();
        let (client, (server, _)) =
            tokio::join!(async { TcpStream::connect(addr).await.unwrap() }, async {
                ln.accept().await.unwrap()
            });
        (client, server)
    }

    #[test]
    fn cids_are_monotonic_from_one() {
        let reg = Registry::new();
        assert_eq!(reg.next_cid(), Some(1));
        assert_eq!(reg.next_cid(), Some(2));
        assert_eq!(reg.next_cid(), Some(3));
    }

    #[test]
    fn cid_space_exhaustion_is_terminal() {
        let reg = Registry::new();
        reg.next_cid.store(u32::MAX, Ordering::Relaxed);
        assert_eq!(reg.next_cid(), Some(u32::MAX));
        // The counter wrapped to the reserved value; allocation stops for good.
        assert_eq!(reg.next_cid(), None);
        assert_eq!(reg.next_cid(), None);
    }

    #[tokio::test]
    async fn insert_get_remove() {
        let reg = Registry::new();
        let (_client, server) = tcp_pair().await;
        let peer = server.peer_addr().unwrap();
        let (_, wr) = server.into_split();

        reg.insert(1, Arc::new(Endpoint::tcp(wr, peer)));
        assert!(reg.get(1).is_some());
        assert!(reg.get(2).is_none());

        assert!(reg.remove_and_close(1).await);
        assert!(reg.get(1).is_none());
        assert!(!reg.remove_and_close(1).await);
    }

    #[tokio::test]
    async fn close_all_releases_every_endpoint() {
        let reg = Registry::new();
        let mut clients = Vec::new();
        for cid in 1..=3u32 {
            let (client, server) = tcp_pair().await;
            let peer = server.peer_addr().unwrap();
            let (_, wr) = server.into_split();
            reg.insert(cid, Arc::new(Endpoint::tcp(wr, peer)));
            clients.push(client);
        }

        reg.close_all().await;
        assert!(reg.is_empty());

        // Every peer observes the shutdown.
        for mut client in clients {
            let mut buf = [0u8; 1];
            let n = client.read(&mut buf).await.unwrap();
            assert_eq!(n, 0);
        }
    }

    #[tokio::test]
    async fn close_signals_stop_watch() {
        let reg = Registry::new();
        let (_client, server) = tcp_pair().await;
        let peer = server.peer_addr().unwrap();
        let (_, wr) = server.into_split();
        let ep = Arc::new(Endpoint::tcp(wr, peer));
        let mut stop = ep.stopped();
        reg.insert(1, ep);

        assert!(!*stop.borrow());
        reg.close_all().await;
        stop.changed().await.unwrap();
        assert!(*stop.borrow());
    }
}

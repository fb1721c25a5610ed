use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use dashmap::DashMap;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite},
    net::{tcp::OwnedReadHalf, TcpListener, TcpStream, UdpSocket},
    sync::{mpsc, watch},
    task::JoinSet,
    time::timeout,
};

use crate::periscope::{
    config::{EdgeConfig, Protocol},
    net,
    tunnel::{
        link::{self, ControlWriter, HandshakeBroker},
        protocol::{
            read_frame, write_frame, Frame, FrameKind, ProtocolError, StatusCode, TCP_READ_CHUNK,
            UDP_READ_CHUNK,
        },
        registry::{Endpoint, Registry},
        udp_session::{SessionError, UdpSession},
    },
};

/// How long an unauthenticated proxy connection may take to present its Ping.
pub const AUTH_READ_TIMEOUT: Duration = Duration::from_secs(3);

/// One authenticated control link and the handles stream tasks need from it.
#[derive(Clone)]
struct ActiveLink {
    writer: ControlWriter,
    broker: Arc<HandshakeBroker>,
}

pub(crate) enum AuthOutcome {
    Accepted,
    BadCredentials,
    Busy,
    Failed(ProtocolError),
    TimedOut,
}

/// The publicly reachable side: owns the control listener, the user listener
/// for the configured protocol, and the CID registry.
pub struct Edge {
    cfg: EdgeConfig,
    registry: Registry,
    active: std::sync::Mutex<Option<ActiveLink>>,
    control_listener: TcpListener,
    control_addr: SocketAddr,
    user_tcp: Option<TcpListener>,
    user_udp: Option<Arc<UdpSocket>>,
    user_addr: SocketAddr,
    udp_peers: DashMap<SocketAddr, mpsc::Sender<Vec<u8>>>,
}

impl Edge {
    /// Binds both listeners. Bind failures are fatal for the process.
    pub async fn bind(cfg: EdgeConfig) -> anyhow::Result<Self> {
        let control_listener = TcpListener::bind(cfg.control_addr())
            .await
            .with_context(|| format!("edge: bind control listener {}", cfg.control_addr()))?;
        let control_addr = control_listener
            .local_addr()
            .context("edge: control listener address")?;

        let (user_tcp, user_udp, user_addr) = match cfg.protocol {
            Protocol::Tcp => {
                let ln = TcpListener::bind(cfg.user_addr())
                    .await
                    .with_context(|| format!("edge: bind user listener {}", cfg.user_addr()))?;
                let addr = ln.local_addr().context("edge: user listener address")?;
                (Some(ln), None, addr)
            }
            Protocol::Udp => {
                let sock = UdpSocket::bind(cfg.user_addr())
                    .await
                    .with_context(|| format!("edge: bind user socket {}", cfg.user_addr()))?;
                let addr = sock.local_addr().context("edge: user socket address")?;
                (None, Some(Arc::new(sock)), addr)
            }
        };

        Ok(Self {
            cfg,
            registry: Registry::new(),
            active: std::sync::Mutex::new(None),
            control_listener,
            control_addr,
            user_tcp,
            user_udp,
            user_addr,
            udp_peers: DashMap::new(),
        })
    }

    /// Actual bound address of the control listener.
    pub fn control_addr(&self) -> SocketAddr {
        self.control_addr
    }

    /// Actual bound address of the user listener.
    pub fn user_addr(&self) -> SocketAddr {
        self.user_addr
    }

    /// Serves until a fatal condition. Normal operation loops forever.
    pub async fn serve(self: Arc<Self>) -> anyhow::Result<()> {
        let mut tasks = JoinSet::new();
        {
            let edge = self.clone();
            tasks.spawn(async move { edge.control_loop().await });
        }
        match self.cfg.protocol {
            Protocol::Tcp => {
                let edge = self.clone();
                tasks.spawn(async move { edge.user_tcp_loop().await });
            }
            Protocol::Udp => {
                let edge = self.clone();
                tasks.spawn(async move { edge.user_udp_loop().await });
            }
        }
        while let Some(res) = tasks.join_next().await {
            res.context("edge: task panicked")??;
        }
        Ok(())
    }

    fn active_link(&self) -> Option<ActiveLink> {
        self.active.lock().unwrap().clone()
    }

    // -- control link ------------------------------------------------------

    async fn control_loop(self: Arc<Self>) -> anyhow::Result<()> {
        tracing::info!(addr = %self.control_addr, "edge: listening for proxy");
        loop {
            let (mut stream, peer) = match self.control_listener.accept().await {
                Ok(conn) => conn,
                Err(err) => {
                    tracing::warn!(err = %err, "edge: control accept failed");
                    continue;
                }
            };
            tracing::debug!(peer = %peer, "edge: proxy authentication attempt");

            let busy = self.active_link().is_some();
            match check_auth(&mut stream, &self.cfg.server_pwd, busy).await {
                AuthOutcome::Accepted => {
                    tracing::info!(peer = %peer, "edge: proxy authenticated");
                    self.clone().start_session(stream, peer);
                }
                AuthOutcome::Busy => {
                    tracing::warn!(peer = %peer, "edge: rejected proxy, another is connected");
                }
                AuthOutcome::BadCredentials => {
                    tracing::warn!(peer = %peer, "edge: rejected proxy, bad password");
                }
                AuthOutcome::TimedOut => {
                    tracing::warn!(peer = %peer, "edge: rejected proxy, authentication timed out");
                }
                AuthOutcome::Failed(err) => {
                    tracing::warn!(peer = %peer, err = %err, "edge: rejected proxy");
                }
            }
        }
    }

    /// Installs the authenticated link and spawns its serving tasks. Called
    /// from the accept loop before the next accept so the single-proxy
    /// invariant holds without a race.
    fn start_session(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        if let Err(err) = net::set_tcp_keepalive(&stream) {
            tracing::debug!(err = %err, "edge: could not enable keep-alive");
        }

        let (rd, wr) = stream.into_split();
        let (shutdown, _) = watch::channel(false);
        let writer = link::spawn_writer(wr, self.cfg.channel_depth, shutdown.clone());
        let broker = Arc::new(HandshakeBroker::new());
        let (user_tx, user_rx) = mpsc::channel(self.cfg.channel_depth);

        let link = ActiveLink {
            writer,
            broker: broker.clone(),
        };
        *self.active.lock().unwrap() = Some(link);

        let dispatcher = {
            let edge = self.clone();
            tokio::spawn(edge.dispatch_to_user(user_rx))
        };

        tokio::spawn(async move {
            let mut stop = shutdown.subscribe();
            let res = self.read_control(rd, &broker, &user_tx, &mut stop).await;
            match res {
                Ok(()) => tracing::info!(peer = %peer, "edge: proxy disconnected"),
                Err(err) => tracing::warn!(peer = %peer, err = %err, "edge: control link error"),
            }

            // Teardown. The active slot is cleared only after this session's
            // endpoints are released, so a replacement proxy cannot register
            // streams that the old close_all would sweep away. New users fail
            // their handshake in the meantime because the writer is gone.
            let _ = shutdown.send(true);
            broker.fail_all();
            drop(user_tx);
            self.registry.close_all().await;
            *self.active.lock().unwrap() = None;
            let _ = dispatcher.await;
            tracing::info!(peer = %peer, "edge: control link closed, listening again");
        });
    }

    async fn read_control(
        &self,
        mut rd: OwnedReadHalf,
        broker: &HandshakeBroker,
        user_tx: &mpsc::Sender<Frame>,
        stop: &mut watch::Receiver<bool>,
    ) -> Result<(), ProtocolError> {
        loop {
            tokio::select! {
                _ = stop.changed() => {
                    if *stop.borrow() {
                        return Ok(());
                    }
                }
                res = read_frame(&mut rd) => {
                    let frame = match res {
                        Ok(f) => f,
                        Err(ProtocolError::Closed) => return Ok(()),
                        Err(err) => return Err(err),
                    };
                    tracing::trace!(frame = ?frame, "edge: control frame received");
                    match frame.kind {
                        FrameKind::AcceptConn | FrameKind::RejectConn => {
                            let cid = frame.cid;
                            if !broker.complete(cid, frame) {
                                tracing::warn!(cid, "edge: handshake response for unknown cid");
                            }
                        }
                        // A disconnect racing the handshake resolves it as a
                        // failure instead of dangling the stream task.
                        FrameKind::Disconnect if broker.is_pending(frame.cid) => {
                            broker.complete(frame.cid, frame);
                        }
                        FrameKind::Forward | FrameKind::Disconnect => {
                            if user_tx.send(frame).await.is_err() {
                                return Ok(());
                            }
                        }
                        FrameKind::Ping | FrameKind::Pong | FrameKind::NewConn => {
                            tracing::warn!(kind = ?frame.kind, "edge: unexpected frame on control link");
                        }
                    }
                }
            }
        }
    }

    /// Consumes the to-user channel: Forward payloads go to their endpoint,
    /// Disconnect releases it. Unknown CIDs are dropped with a warning.
    async fn dispatch_to_user(self: Arc<Self>, mut rx: mpsc::Receiver<Frame>) {
        while let Some(frame) = rx.recv().await {
            match frame.kind {
                FrameKind::Forward => match self.registry.get(frame.cid) {
                    Some(ep) => {
                        if let Err(err) = ep.write(&frame.payload).await {
                            tracing::warn!(cid = frame.cid, peer = %ep.peer_addr(), err = %err, "edge: user write failed, dropping frame");
                        }
                    }
                    None => {
                        tracing::warn!(cid = frame.cid, "edge: no route for cid, dropping frame");
                    }
                },
                FrameKind::Disconnect => {
                    if self.registry.remove_and_close(frame.cid).await {
                        tracing::debug!(cid = frame.cid, reason = %frame.reason(), "edge: proxy disconnected user stream");
                    } else {
                        tracing::warn!(cid = frame.cid, "edge: disconnect for unknown cid");
                    }
                }
                _ => {}
            }
        }
    }

    // -- user acceptance (TCP) ---------------------------------------------

    async fn user_tcp_loop(self: Arc<Self>) -> anyhow::Result<()> {
        let Some(listener) = self.user_tcp.as_ref() else {
            return Ok(());
        };
        tracing::info!(addr = %self.user_addr, "edge: listening for tcp users");
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(conn) => conn,
                Err(err) => {
                    tracing::warn!(err = %err, "edge: user accept failed");
                    continue;
                }
            };
            let Some(link) = self.active_link() else {
                tracing::debug!(peer = %peer, "edge: no proxy connected, refusing user");
                continue;
            };
            let edge = self.clone();
            tokio::spawn(async move { edge.handle_user_tcp(stream, peer, link).await });
        }
    }

    async fn handle_user_tcp(self: Arc<Self>, stream: TcpStream, peer: SocketAddr, link: ActiveLink) {
        let Some(cid) = self.open_stream(&link, peer).await else {
            return;
        };

        if let Err(err) = net::set_tcp_keepalive(&stream) {
            tracing::debug!(cid, err = %err, "edge: could not enable keep-alive");
        }
        let (mut rd, wr) = stream.into_split();
        let endpoint = Arc::new(Endpoint::tcp(wr, peer));
        let mut stop = endpoint.stopped();
        self.registry.insert(cid, endpoint);
        tracing::debug!(cid, peer = %peer, "edge: user stream established");

        let mut buf = vec![0u8; TCP_READ_CHUNK];
        let reason = loop {
            tokio::select! {
                _ = stop.changed() => {
                    if *stop.borrow() {
                        break None;
                    }
                }
                res = rd.read(&mut buf) => match res {
                    Ok(0) => break Some("eof".to_string()),
                    Ok(n) => {
                        let frame = Frame::forward(cid, buf[..n].to_vec());
                        if link.writer.send(frame).await.is_err() {
                            break None;
                        }
                    }
                    Err(err) => break Some(err.to_string()),
                },
            }
        };

        self.finish_stream(cid, &link, reason, "edge: user stream ended")
            .await;
    }

    // -- user acceptance (UDP) ---------------------------------------------

    async fn user_udp_loop(self: Arc<Self>) -> anyhow::Result<()> {
        let Some(sock) = self.user_udp.clone() else {
            return Ok(());
        };
        tracing::info!(addr = %self.user_addr, "edge: listening for udp users");
        let mut buf = vec![0u8; UDP_READ_CHUNK];
        loop {
            let (n, peer) = match sock.recv_from(&mut buf).await {
                Ok(r) => r,
                Err(err) => {
                    tracing::warn!(err = %err, "edge: user socket receive failed");
                    continue;
                }
            };
            let mut datagram = buf[..n].to_vec();

            if let Some(entry) = self.udp_peers.get(&peer) {
                let tx = entry.value().clone();
                drop(entry);
                match tx.try_send(datagram) {
                    Ok(()) => continue,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        tracing::debug!(peer = %peer, "edge: session queue full, dropping datagram");
                        continue;
                    }
                    Err(mpsc::error::TrySendError::Closed(d)) => {
                        // Stale session; drop it and start a fresh one below.
                        self.udp_peers.remove_if(&peer, |_, v| v.same_channel(&tx));
                        datagram = d;
                    }
                }
            }

            let Some(link) = self.active_link() else {
                tracing::debug!(peer = %peer, "edge: no proxy connected, dropping datagram");
                continue;
            };
            let (session, tx) =
                UdpSession::new(sock.clone(), peer, self.cfg.udp_idle_timeout);
            // First datagram becomes the session's first read.
            let _ = tx.try_send(datagram);
            self.udp_peers.insert(peer, tx.clone());
            tracing::debug!(peer = %peer, "edge: new udp session");

            let edge = self.clone();
            tokio::spawn(async move { edge.handle_user_udp(session, tx, peer, link).await });
        }
    }

    async fn handle_user_udp(
        self: Arc<Self>,
        session: Arc<UdpSession>,
        tx: mpsc::Sender<Vec<u8>>,
        peer: SocketAddr,
        link: ActiveLink,
    ) {
        let Some(cid) = self.open_stream(&link, peer).await else {
            self.udp_peers.remove_if(&peer, |_, v| v.same_channel(&tx));
            session.close();
            return;
        };

        let endpoint = Arc::new(Endpoint::udp_session(session.clone()));
        let mut stop = endpoint.stopped();
        self.registry.insert(cid, endpoint);
        tracing::debug!(cid, peer = %peer, "edge: udp session established");

        let mut buf = vec![0u8; UDP_READ_CHUNK];
        let reason = loop {
            tokio::select! {
                _ = stop.changed() => {
                    if *stop.borrow() {
                        break None;
                    }
                }
                res = session.read(&mut buf) => match res {
                    Ok(n) => {
                        let frame = Frame::forward(cid, buf[..n].to_vec());
                        if link.writer.send(frame).await.is_err() {
                            break None;
                        }
                    }
                    Err(SessionError::TimedOut) => break Some("idle timeout".to_string()),
                    Err(SessionError::Closed) => break None,
                },
            }
        };

        self.udp_peers.remove_if(&peer, |_, v| v.same_channel(&tx));
        self.finish_stream(cid, &link, reason, "edge: udp session ended")
            .await;
    }

    // -- shared per-stream pieces ------------------------------------------

    /// Allocates a CID and runs the handshake with the proxy. Returns the CID
    /// once the proxy accepted the stream.
    async fn open_stream(&self, link: &ActiveLink, peer: SocketAddr) -> Option<u32> {
        let Some(cid) = self.registry.next_cid() else {
            tracing::error!(peer = %peer, "edge: connection id space exhausted, refusing user");
            return None;
        };

        let response = link.broker.register(cid);
        if link.writer.send(Frame::new_conn(cid)).await.is_err() {
            link.broker.cancel(cid);
            tracing::debug!(cid, peer = %peer, "edge: control link lost before handshake");
            return None;
        }
        tracing::debug!(cid, peer = %peer, "edge: requested stream from proxy");

        let response = match response.await {
            Ok(f) => f,
            Err(_) => {
                tracing::debug!(cid, peer = %peer, "edge: control link lost during handshake");
                return None;
            }
        };
        if response.kind != FrameKind::AcceptConn || response.code != StatusCode::Success {
            tracing::debug!(
                cid,
                peer = %peer,
                reason = %response.reason(),
                "edge: proxy rejected user stream"
            );
            return None;
        }
        Some(cid)
    }

    /// Removes the stream and, when the peer might not know about the end,
    /// tells the proxy to disconnect the CID. With `reason` absent the close
    /// came from the control side and no Disconnect is echoed back.
    async fn finish_stream(&self, cid: u32, link: &ActiveLink, reason: Option<String>, msg: &str) {
        let Some(ep) = self.registry.remove(cid) else {
            return;
        };
        if let Some(reason) = reason {
            tracing::debug!(cid, reason = %reason, "{msg}");
            let _ = link.writer.send(Frame::disconnect(cid, &reason)).await;
        }
        ep.close().await;
    }

    #[cfg(test)]
    pub(crate) fn has_active_link(&self) -> bool {
        self.active_link().is_some()
    }

    #[cfg(test)]
    pub(crate) fn registry_len(&self) -> usize {
        self.registry.len()
    }
}

/// Runs the Edge half of the password check on a fresh proxy connection.
/// On anything but success a Forbidden Pong is sent best-effort.
pub(crate) async fn check_auth<S>(stream: &mut S, secret: &str, busy: bool) -> AuthOutcome
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let res = timeout(AUTH_READ_TIMEOUT, read_frame(stream)).await;
    let frame = match res {
        Err(_) => {
            let _ = write_frame(stream, &Frame::pong(false)).await;
            return AuthOutcome::TimedOut;
        }
        Ok(Err(err)) => {
            let _ = write_frame(stream, &Frame::pong(false)).await;
            return AuthOutcome::Failed(err);
        }
        Ok(Ok(f)) => f,
    };

    let credentials_ok = frame.kind == FrameKind::Ping
        && frame.code == StatusCode::Success
        && frame.payload == secret.as_bytes();

    if !credentials_ok {
        let _ = write_frame(stream, &Frame::pong(false)).await;
        return AuthOutcome::BadCredentials;
    }
    if busy {
        let _ = write_frame(stream, &Frame::pong(false)).await;
        return AuthOutcome::Busy;
    }
    match write_frame(stream, &Frame::pong(true)).await {
        Ok(()) => AuthOutcome::Accepted,
        Err(err) => AuthOutcome::Failed(err),
    }
}

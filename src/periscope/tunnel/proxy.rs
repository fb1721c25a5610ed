use std::{
    io,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite},
    net::{tcp::OwnedReadHalf, TcpStream, UdpSocket},
    sync::watch,
    time::timeout,
};

use crate::periscope::{
    config::ProxyConfig,
    config::Protocol,
    net,
    tunnel::{
        link::{self, ControlWriter},
        protocol::{
            read_frame, write_frame, Frame, FrameKind, ProtocolError, StatusCode, TCP_READ_CHUNK,
            UDP_READ_CHUNK,
        },
        registry::{Endpoint, Registry},
    },
};

/// How long to wait for the Edge's Pong after presenting the secret.
pub const AUTH_READ_TIMEOUT: Duration = Duration::from_secs(5);

struct Proxy {
    cfg: ProxyConfig,
    registry: Registry,
    writer: ControlWriter,
}

/// Dials the Edge, authenticates, and serves until the control link is lost.
/// Every exit path is fatal for the process.
pub async fn run(cfg: ProxyConfig) -> anyhow::Result<()> {
    let server_addr = cfg.server_addr();
    let mut stream = TcpStream::connect(server_addr)
        .await
        .with_context(|| format!("proxy: dial edge {server_addr}"))?;

    authenticate(&mut stream, &cfg.server_pwd).await?;
    if let Err(err) = net::set_tcp_keepalive(&stream) {
        tracing::debug!(err = %err, "proxy: could not enable keep-alive");
    }
    tracing::info!(
        edge = %server_addr,
        service = %cfg.service_addr(),
        protocol = %cfg.protocol,
        "proxy: control link established"
    );

    let (rd, wr) = stream.into_split();
    let (shutdown, _) = watch::channel(false);
    let writer = link::spawn_writer(wr, cfg.channel_depth, shutdown.clone());
    let proxy = Arc::new(Proxy {
        cfg,
        registry: Registry::new(),
        writer,
    });

    let res = proxy.clone().read_control(rd, shutdown.subscribe()).await;
    let _ = shutdown.send(true);
    proxy.registry.close_all().await;

    match res {
        Ok(()) => anyhow::bail!("proxy: edge closed the control link"),
        Err(err) => Err(err).context("proxy: control link error"),
    }
}

/// Presents the shared secret and verifies the Edge's answer. A timeout,
/// decode failure, or Forbidden Pong is fatal.
async fn authenticate<S>(stream: &mut S, secret: &str) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    write_frame(stream, &Frame::ping(secret))
        .await
        .context("proxy: send authentication")?;
    tracing::debug!("proxy: authentication sent, waiting for response");

    let pong = timeout(AUTH_READ_TIMEOUT, read_frame(stream))
        .await
        .map_err(|_| anyhow::anyhow!("proxy: authentication timed out"))?
        .context("proxy: read authentication response")?;

    if pong.kind != FrameKind::Pong || pong.code != StatusCode::Success {
        anyhow::bail!("proxy: edge rejected authentication: {}", pong.reason());
    }
    Ok(())
}

impl Proxy {
    async fn read_control(
        self: Arc<Self>,
        mut rd: OwnedReadHalf,
        mut stop: watch::Receiver<bool>,
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
                    tracing::trace!(frame = ?frame, "proxy: control frame received");
                    match frame.kind {
                        FrameKind::NewConn => {
                            let cid = frame.cid;
                            tracing::debug!(cid, "proxy: stream requested");
                            let proxy = self.clone();
                            match proxy.cfg.protocol {
                                Protocol::Tcp => {
                                    tokio::spawn(async move { proxy.handle_stream_tcp(cid).await });
                                }
                                Protocol::Udp => {
                                    tokio::spawn(async move { proxy.handle_stream_udp(cid).await });
                                }
                            }
                        }
                        FrameKind::Forward => match self.registry.get(frame.cid) {
                            Some(ep) => {
                                if let Err(err) = ep.write(&frame.payload).await {
                                    tracing::warn!(cid = frame.cid, service = %ep.peer_addr(), err = %err, "proxy: service write failed, dropping frame");
                                }
                            }
                            None => {
                                tracing::warn!(cid = frame.cid, "proxy: no route for cid, dropping frame");
                            }
                        },
                        FrameKind::Disconnect => {
                            if self.registry.remove_and_close(frame.cid).await {
                                tracing::debug!(cid = frame.cid, reason = %frame.reason(), "proxy: edge disconnected stream");
                            } else {
                                tracing::warn!(cid = frame.cid, "proxy: disconnect for unknown cid");
                            }
                        }
                        FrameKind::Ping | FrameKind::Pong | FrameKind::AcceptConn | FrameKind::RejectConn => {
                            tracing::warn!(kind = ?frame.kind, "proxy: unexpected frame on control link");
                        }
                    }
                }
            }
        }
    }

    async fn handle_stream_tcp(self: Arc<Self>, cid: u32) {
        let service_addr = self.cfg.service_addr();
        let stream = match TcpStream::connect(service_addr).await {
            Ok(s) => s,
            Err(err) => {
                tracing::debug!(cid, service = %service_addr, err = %err, "proxy: service dial failed");
                let _ = self
                    .writer
                    .send(Frame::reject_conn(cid, &err.to_string()))
                    .await;
                return;
            }
        };

        if self.writer.send(Frame::accept_conn(cid)).await.is_err() {
            return;
        }
        if let Err(err) = net::set_tcp_keepalive(&stream) {
            tracing::debug!(cid, err = %err, "proxy: could not enable keep-alive");
        }

        let (mut rd, wr) = stream.into_split();
        let endpoint = Arc::new(Endpoint::tcp(wr, service_addr));
        let mut stop = endpoint.stopped();
        self.registry.insert(cid, endpoint);
        tracing::debug!(cid, service = %service_addr, "proxy: service stream established");

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
                        if self.writer.send(frame).await.is_err() {
                            break None;
                        }
                    }
                    Err(err) => break Some(err.to_string()),
                },
            }
        };

        self.finish_stream(cid, reason, "proxy: service stream ended")
            .await;
    }

    async fn handle_stream_udp(self: Arc<Self>, cid: u32) {
        let service_addr = self.cfg.service_addr();
        let sock = match dial_udp(service_addr).await {
            Ok(s) => s,
            Err(err) => {
                tracing::debug!(cid, service = %service_addr, err = %err, "proxy: service dial failed");
                let _ = self
                    .writer
                    .send(Frame::disconnect(cid, &err.to_string()))
                    .await;
                return;
            }
        };

        if self.writer.send(Frame::accept_conn(cid)).await.is_err() {
            return;
        }

        let sock = Arc::new(sock);
        let endpoint = Arc::new(Endpoint::udp_socket(sock.clone(), service_addr));
        let mut stop = endpoint.stopped();
        self.registry.insert(cid, endpoint);
        tracing::debug!(cid, service = %service_addr, "proxy: service socket established");

        let mut buf = vec![0u8; UDP_READ_CHUNK];
        let reason = loop {
            tokio::select! {
                _ = stop.changed() => {
                    if *stop.borrow() {
                        break None;
                    }
                }
                res = timeout(self.cfg.udp_idle_timeout, sock.recv(&mut buf)) => match res {
                    Err(_) => break Some("idle timeout".to_string()),
                    Ok(Err(err)) => break Some(err.to_string()),
                    Ok(Ok(n)) => {
                        let frame = Frame::forward(cid, buf[..n].to_vec());
                        if self.writer.send(frame).await.is_err() {
                            break None;
                        }
                    }
                },
            }
        };

        self.finish_stream(cid, reason, "proxy: service socket ended")
            .await;
    }

    /// Removes the stream and, when the edge might not know about the end,
    /// sends a Disconnect for the CID. With `reason` absent the close came
    /// from the control side and no Disconnect is echoed back.
    async fn finish_stream(&self, cid: u32, reason: Option<String>, msg: &str) {
        let Some(ep) = self.registry.remove(cid) else {
            return;
        };
        if let Some(reason) = reason {
            tracing::debug!(cid, reason = %reason, "{msg}");
            let _ = self.writer.send(Frame::disconnect(cid, &reason)).await;
        }
        ep.close().await;
    }
}

/// Binds an ephemeral socket of the right family and connects it to the
/// service so plain `send`/`recv` apply.
async fn dial_udp(service_addr: SocketAddr) -> io::Result<UdpSocket> {
    let bind_addr = if service_addr.is_ipv4() {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
    } else {
        SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0)
    };
    let sock = UdpSocket::bind(bind_addr).await?;
    sock.connect(service_addr).await?;
    Ok(sock)
}

pub mod edge;
pub mod link;
pub mod protocol;
pub mod proxy;
pub mod registry;
pub mod udp_session;

#[cfg(test)]
mod tests {
    use std::{net::IpAddr, sync::Arc, time::Duration};

    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::{TcpListener, TcpStream, UdpSocket},
        sync::mpsc,
        time::timeout,
    };

    use crate::periscope::{
        config::{EdgeConfig, Protocol, ProxyConfig, DEFAULT_PASSWORD},
        tunnel::{
            edge::Edge,
            protocol::{read_frame, write_frame, Frame, FrameKind, StatusCode},
            proxy,
        },
    };

    const IDLE: Duration = Duration::from_secs(180);

    fn localhost() -> IpAddr {
        "127.0.0.1".parse().unwrap()
    }

    async fn spawn_edge(protocol: Protocol, udp_idle_timeout: Duration) -> Arc<Edge> {
        let cfg = EdgeConfig {
            client_ip: localhost(),
            client_port: 0,
            server_ip: localhost(),
            user_port: 0,
            server_pwd: DEFAULT_PASSWORD.into(),
            protocol,
            udp_idle_timeout,
            channel_depth: 100,
        };
        let edge = Arc::new(Edge::bind(cfg).await.unwrap());
        let serving = edge.clone();
        tokio::spawn(async move {
            let _ = serving.serve().await;
        });
        edge
    }

    fn proxy_cfg(
        edge: &Edge,
        service_port: u16,
        protocol: Protocol,
        pwd: &str,
        udp_idle_timeout: Duration,
    ) -> ProxyConfig {
        ProxyConfig {
            server_ip: localhost(),
            server_port: edge.control_addr().port(),
            service_ip: localhost(),
            service_port,
            server_pwd: pwd.into(),
            protocol,
            udp_idle_timeout,
            channel_depth: 100,
        }
    }

    async fn wait_until(what: &str, cond: impl Fn() -> bool) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for {what}"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn tcp_request_reaches_service_and_reply_returns() {
        let service = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let service_port = service.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut conn, _) = service.accept().await.unwrap();
            let mut req = vec![0u8; 9];
            conn.read_exact(&mut req).await.unwrap();
            assert_eq!(&req, b"GET /\r\n\r\n");
            conn.write_all(b"HTTP/1.0 200 OK\r\n\r\nhi").await.unwrap();
        });

        let edge = spawn_edge(Protocol::Tcp, IDLE).await;
        let cfg = proxy_cfg(&edge, service_port, Protocol::Tcp, DEFAULT_PASSWORD, IDLE);
        tokio::spawn(async move {
            let _ = proxy::run(cfg).await;
        });
        wait_until("proxy authentication", || edge.has_active_link()).await;

        let mut user = TcpStream::connect(edge.user_addr()).await.unwrap();
        user.write_all(b"GET /\r\n\r\n").await.unwrap();

        let mut resp = Vec::new();
        timeout(Duration::from_secs(5), user.read_to_end(&mut resp))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(resp, b"HTTP/1.0 200 OK\r\n\r\nhi");
    }

    #[tokio::test]
    async fn wrong_password_is_rejected_and_edge_keeps_serving() {
        let edge = spawn_edge(Protocol::Tcp, IDLE).await;

        let bad = proxy_cfg(&edge, 1, Protocol::Tcp, "wrong", IDLE);
        let err = proxy::run(bad).await.unwrap_err();
        assert!(err.to_string().contains("rejected"));
        assert!(!edge.has_active_link());

        let good = proxy_cfg(&edge, 1, Protocol::Tcp, DEFAULT_PASSWORD, IDLE);
        tokio::spawn(async move {
            let _ = proxy::run(good).await;
        });
        wait_until("second proxy authentication", || edge.has_active_link()).await;
    }

    #[tokio::test]
    async fn second_proxy_is_rejected_while_first_is_active() {
        let edge = spawn_edge(Protocol::Tcp, IDLE).await;

        let first = proxy_cfg(&edge, 1, Protocol::Tcp, DEFAULT_PASSWORD, IDLE);
        tokio::spawn(async move {
            let _ = proxy::run(first).await;
        });
        wait_until("first proxy authentication", || edge.has_active_link()).await;

        let second = proxy_cfg(&edge, 1, Protocol::Tcp, DEFAULT_PASSWORD, IDLE);
        let err = proxy::run(second).await.unwrap_err();
        assert!(err.to_string().contains("rejected"));
        assert!(edge.has_active_link());
    }

    #[tokio::test]
    async fn service_refusal_closes_user_and_empties_registry() {
        // Grab a port with nothing listening behind it.
        let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_port = dead.local_addr().unwrap().port();
        drop(dead);

        let edge = spawn_edge(Protocol::Tcp, IDLE).await;
        let cfg = proxy_cfg(&edge, dead_port, Protocol::Tcp, DEFAULT_PASSWORD, IDLE);
        tokio::spawn(async move {
            let _ = proxy::run(cfg).await;
        });
        wait_until("proxy authentication", || edge.has_active_link()).await;

        let mut user = TcpStream::connect(edge.user_addr()).await.unwrap();
        let mut buf = Vec::new();
        let n = timeout(Duration::from_secs(5), user.read_to_end(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
        wait_until("registry to empty", || edge.registry_len() == 0).await;
    }

    #[tokio::test]
    async fn concurrent_streams_do_not_corrupt_each_other() {
        const STREAM_LEN: usize = 1024 * 1024;

        let service = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let service_port = service.local_addr().unwrap().port();
        let (results_tx, mut results_rx) = mpsc::channel::<Vec<u8>>(2);
        tokio::spawn(async move {
            for _ in 0..2 {
                let (mut conn, _) = service.accept().await.unwrap();
                let tx = results_tx.clone();
                tokio::spawn(async move {
                    let mut data = Vec::new();
                    conn.read_to_end(&mut data).await.unwrap();
                    tx.send(data).await.unwrap();
                });
            }
        });

        let edge = spawn_edge(Protocol::Tcp, IDLE).await;
        let cfg = proxy_cfg(&edge, service_port, Protocol::Tcp, DEFAULT_PASSWORD, IDLE);
        tokio::spawn(async move {
            let _ = proxy::run(cfg).await;
        });
        wait_until("proxy authentication", || edge.has_active_link()).await;

        let user_addr = edge.user_addr();
        let mut writers = Vec::new();
        for fill in [b'a', b'b'] {
            writers.push(tokio::spawn(async move {
                let mut user = TcpStream::connect(user_addr).await.unwrap();
                user.write_all(&vec![fill; STREAM_LEN]).await.unwrap();
                // Dropping sends FIN; the edge turns it into a Disconnect
                // that trails every Forward for this CID.
            }));
        }
        for w in writers {
            w.await.unwrap();
        }

        let mut received = Vec::new();
        for _ in 0..2 {
            let data = timeout(Duration::from_secs(30), results_rx.recv())
                .await
                .unwrap()
                .unwrap();
            received.push(data);
        }
        received.sort_by_key(|d| d.first().copied());

        assert_eq!(received[0].len(), STREAM_LEN);
        assert!(received[0].iter().all(|&b| b == b'a'));
        assert_eq!(received[1].len(), STREAM_LEN);
        assert!(received[1].iter().all(|&b| b == b'b'));
    }

    async fn udp_echo_service() -> (u16, tokio::task::JoinHandle<()>) {
        let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = sock.local_addr().unwrap().port();
        let task = tokio::spawn(async move {
            let mut buf = vec![0u8; 65536];
            loop {
                let Ok((n, peer)) = sock.recv_from(&mut buf).await else {
                    break;
                };
                let _ = sock.send_to(&buf[..n], peer).await;
            }
        });
        (port, task)
    }

    /// Sends `payload` until an echo comes back; UDP setup is lossy while the
    /// stream handshake is in flight.
    async fn echo_roundtrip(
        user: &UdpSocket,
        target: std::net::SocketAddr,
        payload: &[u8],
    ) -> (Vec<u8>, std::net::SocketAddr) {
        for _ in 0..20 {
            user.send_to(payload, target).await.unwrap();
            let mut buf = vec![0u8; 65536];
            if let Ok(Ok((n, from))) =
                timeout(Duration::from_millis(500), user.recv_from(&mut buf)).await
            {
                return (buf[..n].to_vec(), from);
            }
        }
        panic!("no echo from service through the tunnel");
    }

    #[tokio::test]
    async fn udp_datagram_relayed_and_echo_returns_to_source_port() {
        let (service_port, _svc) = udp_echo_service().await;

        let edge = spawn_edge(Protocol::Udp, IDLE).await;
        let cfg = proxy_cfg(&edge, service_port, Protocol::Udp, DEFAULT_PASSWORD, IDLE);
        tokio::spawn(async move {
            let _ = proxy::run(cfg).await;
        });
        wait_until("proxy authentication", || edge.has_active_link()).await;

        let user = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let payload = vec![0x5a; 200];
        let (echoed, from) = echo_roundtrip(&user, edge.user_addr(), &payload).await;

        assert_eq!(echoed, payload);
        assert_eq!(from, edge.user_addr());
    }

    #[tokio::test]
    async fn idle_udp_session_closes_and_next_datagram_starts_fresh() {
        let idle = Duration::from_millis(250);
        let (service_port, _svc) = udp_echo_service().await;

        let edge = spawn_edge(Protocol::Udp, idle).await;
        let cfg = proxy_cfg(&edge, service_port, Protocol::Udp, DEFAULT_PASSWORD, idle);
        tokio::spawn(async move {
            let _ = proxy::run(cfg).await;
        });
        wait_until("proxy authentication", || edge.has_active_link()).await;

        let user = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let (echoed, _) = echo_roundtrip(&user, edge.user_addr(), b"first").await;
        assert_eq!(echoed, b"first");

        // Silence past the idle deadline tears the session down.
        wait_until("idle session to close", || edge.registry_len() == 0).await;

        // The same user peer gets a brand new session.
        let (echoed, _) = echo_roundtrip(&user, edge.user_addr(), b"second").await;
        assert_eq!(echoed, b"second");
    }

    #[tokio::test]
    async fn unknown_cids_are_dropped_without_desync() {
        let edge = spawn_edge(Protocol::Tcp, IDLE).await;

        // Act as the proxy on a raw control connection.
        let mut ctl = TcpStream::connect(edge.control_addr()).await.unwrap();
        write_frame(&mut ctl, &Frame::ping(DEFAULT_PASSWORD))
            .await
            .unwrap();
        let pong = read_frame(&mut ctl).await.unwrap();
        assert_eq!(pong.code, StatusCode::Success);
        wait_until("link activation", || edge.has_active_link()).await;

        write_frame(&mut ctl, &Frame::forward(99, b"junk".to_vec()))
            .await
            .unwrap();
        write_frame(&mut ctl, &Frame::disconnect(123, "nope"))
            .await
            .unwrap();

        // The link is still in sync: a user shows up as NewConn with cid 1.
        let mut user = TcpStream::connect(edge.user_addr()).await.unwrap();
        let req = timeout(Duration::from_secs(5), read_frame(&mut ctl))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(req.kind, FrameKind::NewConn);
        assert_eq!(req.cid, 1);

        write_frame(&mut ctl, &Frame::reject_conn(1, "not today"))
            .await
            .unwrap();
        let mut buf = Vec::new();
        let n = timeout(Duration::from_secs(5), user.read_to_end(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn control_link_loss_closes_every_user_stream() {
        let edge = spawn_edge(Protocol::Tcp, IDLE).await;

        let mut ctl = TcpStream::connect(edge.control_addr()).await.unwrap();
        write_frame(&mut ctl, &Frame::ping(DEFAULT_PASSWORD))
            .await
            .unwrap();
        assert_eq!(
            read_frame(&mut ctl).await.unwrap().code,
            StatusCode::Success
        );
        wait_until("link activation", || edge.has_active_link()).await;

        let mut user = TcpStream::connect(edge.user_addr()).await.unwrap();
        let req = timeout(Duration::from_secs(5), read_frame(&mut ctl))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(req.kind, FrameKind::NewConn);
        write_frame(&mut ctl, &Frame::accept_conn(req.cid))
            .await
            .unwrap();
        wait_until("stream registration", || edge.registry_len() == 1).await;

        drop(ctl);

        wait_until("teardown", || {
            edge.registry_len() == 0 && !edge.has_active_link()
        })
        .await;
        let mut buf = Vec::new();
        let n = timeout(Duration::from_secs(5), user.read_to_end(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn user_is_refused_when_no_proxy_is_connected() {
        let edge = spawn_edge(Protocol::Tcp, IDLE).await;

        let mut user = TcpStream::connect(edge.user_addr()).await.unwrap();
        let mut buf = Vec::new();
        let n = timeout(Duration::from_secs(5), user.read_to_end(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
    }
}

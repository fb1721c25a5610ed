use std::{io, time::Duration};

use socket2::{SockRef, TcpKeepalive};
use tokio::net::TcpStream;

/// Enables TCP keep-alive on a long-lived stream. Used on the control link
/// and on user/service sockets so half-dead peers are noticed without
/// application-level traffic.
pub fn set_tcp_keepalive(stream: &TcpStream) -> io::Result<()> {
    let sock = SockRef::from(stream);
    sock.set_keepalive(true)?;
    sock.set_tcp_keepalive(&TcpKeepalive::new().with_time(Duration::from_secs(30)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn keepalive_applies_to_live_stream() {
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap();
        let (stream, _accepted) =
            tokio::join!(async { TcpStream::connect(addr).await.unwrap() }, async {
                ln.accept().await.unwrap()
            });
        set_tcp_keepalive(&stream).unwrap();
    }
}

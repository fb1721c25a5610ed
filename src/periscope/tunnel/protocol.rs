use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Hard ceiling on a frame payload. Large enough for a maximum UDP payload;
/// anything above it is a malformed or hostile frame.
pub const MAX_PAYLOAD_BYTES: u32 = 64 * 1024;

/// Read chunk for TCP endpoints, sized to the Ethernet MTU so a single
/// `Forward` stays below the common path MTU.
pub const TCP_READ_CHUNK: usize = 1500;

/// Read chunk for UDP endpoints: the maximum UDP payload over IPv4.
pub const UDP_READ_CHUNK: usize = 65507;

/// Wire bytes carried in the auth Pong.
pub const PONG_ACCEPT: &[u8] = b"accept";
pub const PONG_REJECT: &[u8] = b"reject";

#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The peer closed the link cleanly between frames.
    #[error("control link closed")]
    Closed,
    #[error("truncated frame")]
    Truncated,
    #[error("unknown status code {0}")]
    BadStatus(u8),
    #[error("unknown frame kind {0}")]
    BadKind(u8),
    #[error("payload too large: {0}")]
    PayloadTooLarge(u32),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StatusCode {
    Success = 1,
    Forbidden = 2,
}

impl TryFrom<u8> for StatusCode {
    type Error = ProtocolError;

    fn try_from(v: u8) -> Result<Self, ProtocolError> {
        match v {
            1 => Ok(Self::Success),
            2 => Ok(Self::Forbidden),
            other => Err(ProtocolError::BadStatus(other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// Proxy -> Edge auth request; payload is the shared secret.
    Ping = 1,
    /// Edge -> Proxy auth result.
    Pong = 2,
    /// Edge -> Proxy: a new user stream with this CID has arrived.
    NewConn = 3,
    /// Proxy -> Edge: handshake accepted.
    AcceptConn = 4,
    /// Proxy -> Edge: handshake rejected; payload may carry a reason.
    RejectConn = 5,
    /// Opaque bytes for this CID, either direction.
    Forward = 6,
    /// Close this CID; payload may carry a reason.
    Disconnect = 7,
}

impl TryFrom<u8> for FrameKind {
    type Error = ProtocolError;

    fn try_from(v: u8) -> Result<Self, ProtocolError> {
        match v {
            1 => Ok(Self::Ping),
            2 => Ok(Self::Pong),
            3 => Ok(Self::NewConn),
            4 => Ok(Self::AcceptConn),
            5 => Ok(Self::RejectConn),
            6 => Ok(Self::Forward),
            7 => Ok(Self::Disconnect),
            other => Err(ProtocolError::BadKind(other)),
        }
    }
}

/// The atomic unit on the control link: 1-byte status, 1-byte kind, u32-BE
/// CID (0 for frames that are not per-stream), u32-BE payload length,
/// payload verbatim.
#[derive(Clone, PartialEq, Eq)]
pub struct Frame {
    pub code: StatusCode,
    pub kind: FrameKind,
    pub cid: u32,
    pub payload: Vec<u8>,
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("code", &self.code)
            .field("kind", &self.kind)
            .field("cid", &self.cid)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

impl Frame {
    pub fn ping(secret: &str) -> Self {
        Self {
            code: StatusCode::Success,
            kind: FrameKind::Ping,
            cid: 0,
            payload: secret.as_bytes().to_vec(),
        }
    }

    pub fn pong(accepted: bool) -> Self {
        let (code, payload) = if accepted {
            (StatusCode::Success, PONG_ACCEPT)
        } else {
            (StatusCode::Forbidden, PONG_REJECT)
        };
        Self {
            code,
            kind: FrameKind::Pong,
            cid: 0,
            payload: payload.to_vec(),
        }
    }

    pub fn new_conn(cid: u32) -> Self {
        Self {
            code: StatusCode::Success,
            kind: FrameKind::NewConn,
            cid,
            payload: Vec::new(),
        }
    }

    pub fn accept_conn(cid: u32) -> Self {
        Self {
            code: StatusCode::Success,
            kind: FrameKind::AcceptConn,
            cid,
            payload: Vec::new(),
        }
    }

    pub fn reject_conn(cid: u32, reason: &str) -> Self {
        Self {
            code: StatusCode::Forbidden,
            kind: FrameKind::RejectConn,
            cid,
            payload: reason.as_bytes().to_vec(),
        }
    }

    pub fn forward(cid: u32, payload: Vec<u8>) -> Self {
        Self {
            code: StatusCode::Success,
            kind: FrameKind::Forward,
            cid,
            payload,
        }
    }

    pub fn disconnect(cid: u32, reason: &str) -> Self {
        Self {
            code: StatusCode::Success,
            kind: FrameKind::Disconnect,
            cid,
            payload: reason.as_bytes().to_vec(),
        }
    }

    /// The reject/disconnect reason, when one was carried.
    pub fn reason(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }

    /// Encodes the frame into one contiguous buffer so a single `write_all`
    /// keeps headers and payload together on the wire.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(10 + self.payload.len());
        buf.push(self.code as u8);
        buf.push(self.kind as u8);
        buf.extend_from_slice(&self.cid.to_be_bytes());
        buf.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }
}

/// Reads one frame, blocking until it is complete.
///
/// EOF before the first header byte surfaces as [`ProtocolError::Closed`] so
/// the caller can tell an orderly peer close from a truncated frame.
pub async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> Result<Frame, ProtocolError> {
    let code = match r.read_u8().await {
        Ok(b) => b,
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(ProtocolError::Closed);
        }
        Err(err) => return Err(err.into()),
    };
    let code = StatusCode::try_from(code)?;

    let mut rest = [0u8; 9];
    r.read_exact(&mut rest).await.map_err(eof_as_truncated)?;

    let kind = FrameKind::try_from(rest[0])?;
    let cid = u32::from_be_bytes([rest[1], rest[2], rest[3], rest[4]]);
    let len = u32::from_be_bytes([rest[5], rest[6], rest[7], rest[8]]);
    if len > MAX_PAYLOAD_BYTES {
        return Err(ProtocolError::PayloadTooLarge(len));
    }

    let mut payload = vec![0u8; len as usize];
    r.read_exact(&mut payload).await.map_err(eof_as_truncated)?;

    Ok(Frame {
        code,
        kind,
        cid,
        payload,
    })
}

pub async fn write_frame<W: AsyncWrite + Unpin>(
    w: &mut W,
    frame: &Frame,
) -> Result<(), ProtocolError> {
    w.write_all(&frame.encode()).await?;
    w.flush().await?;
    Ok(())
}

fn eof_as_truncated(err: std::io::Error) -> ProtocolError {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        ProtocolError::Truncated
    } else {
        ProtocolError::Io(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn roundtrip() {
        let frames = vec![
            Frame::ping("default_password"),
            Frame::pong(true),
            Frame::pong(false),
            Frame::new_conn(1),
            Frame::accept_conn(7),
            Frame::reject_conn(8, "connection refused"),
            Frame::forward(42, b"GET /\r\n\r\n".to_vec()),
            Frame::disconnect(42, ""),
        ];
        for f in frames {
            let buf = f.encode();
            let got = read_frame(&mut buf.as_slice()).await.unwrap();
            assert_eq!(got, f);
        }
    }

    #[tokio::test]
    async fn concatenated_frames_stay_aligned() {
        let seq = vec![
            Frame::forward(1, vec![0xaa; 1500]),
            Frame::disconnect(1, "done"),
            Frame::forward(2, Vec::new()),
            Frame::new_conn(3),
        ];
        let mut wire = Vec::new();
        for f in &seq {
            wire.extend_from_slice(&f.encode());
        }

        let mut r = wire.as_slice();
        for f in &seq {
            assert_eq!(&read_frame(&mut r).await.unwrap(), f);
        }
        assert!(matches!(
            read_frame(&mut r).await.unwrap_err(),
            ProtocolError::Closed
        ));
    }

    #[tokio::test]
    async fn rejects_oversized_without_reading_payload() {
        let (mut a, mut b) = tokio::io::duplex(64);

        tokio::spawn(async move {
            let mut hdr = Vec::new();
            hdr.push(StatusCode::Success as u8);
            hdr.push(FrameKind::Forward as u8);
            hdr.extend_from_slice(&1u32.to_be_bytes());
            hdr.extend_from_slice(&(MAX_PAYLOAD_BYTES + 1).to_be_bytes());
            a.write_all(&hdr).await.unwrap();
            // No payload follows; decode must fail on the header alone.
        });

        match read_frame(&mut b).await.unwrap_err() {
            ProtocolError::PayloadTooLarge(n) => assert_eq!(n, MAX_PAYLOAD_BYTES + 1),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn empty_input_is_closed() {
        let empty: &[u8] = &[];
        assert!(matches!(
            read_frame(&mut &*empty).await.unwrap_err(),
            ProtocolError::Closed
        ));
    }

    #[tokio::test]
    async fn partial_header_is_truncated() {
        let partial: &[u8] = &[1, 6, 0, 0];
        assert!(matches!(
            read_frame(&mut &*partial).await.unwrap_err(),
            ProtocolError::Truncated
        ));
    }

    #[tokio::test]
    async fn unknown_kind_rejected() {
        let mut wire = Frame::new_conn(1).encode();
        wire[1] = 0xff;
        assert!(matches!(
            read_frame(&mut wire.as_slice()).await.unwrap_err(),
            ProtocolError::BadKind(0xff)
        ));
    }

    #[tokio::test]
    async fn zero_length_payload_is_legal() {
        let f = Frame::accept_conn(9);
        assert_eq!(f.encode().len(), 10);
        let got = read_frame(&mut f.encode().as_slice()).await.unwrap();
        assert!(got.payload.is_empty());
    }
}

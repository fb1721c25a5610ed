use dashmap::DashMap;
use thiserror::Error;
use tokio::{
    io::AsyncWrite,
    sync::{mpsc, oneshot, watch},
};

use crate::periscope::tunnel::protocol::{write_frame, Frame};

#[derive(Debug, Error)]
#[error("control link closed")]
pub struct LinkClosed;

/// Clonable producer handle for the control link.
///
/// All outbound frames funnel through one spawned writer task, so headers and
/// payloads from concurrent producers never interleave on the wire and a slow
/// peer backs up the channel rather than the producers' sockets.
#[derive(Clone)]
pub struct ControlWriter {
    tx: mpsc::Sender<Frame>,
}

impl ControlWriter {
    pub async fn send(&self, frame: Frame) -> Result<(), LinkClosed> {
        self.tx.send(frame).await.map_err(|_| LinkClosed)
    }
}

/// Spawns the single writer task for a control-link write half.
///
/// A write failure flips the session's shutdown watch so the read loop and
/// every pump observe the loss. The task also exits once the shutdown watch
/// fires or every producer handle is dropped.
pub fn spawn_writer<W>(mut writer: W, depth: usize, shutdown: watch::Sender<bool>) -> ControlWriter
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<Frame>(depth);
    tokio::spawn(async move {
        let mut stop = shutdown.subscribe();
        loop {
            tokio::select! {
                _ = stop.changed() => {
                    if *stop.borrow() {
                        break;
                    }
                }
                frame = rx.recv() => {
                    let Some(frame) = frame else { break };
                    if let Err(err) = write_frame(&mut writer, &frame).await {
                        tracing::warn!(err = %err, "control link write failed");
                        let _ = shutdown.send(true);
                        break;
                    }
                    tracing::trace!(frame = ?frame, "control frame sent");
                }
            }
        }
    });
    ControlWriter { tx }
}

/// Per-CID rendezvous between a stream task waiting on its handshake outcome
/// and the control-link reader that delivers it.
///
/// Each slot is consumed exactly once; there is no shared queue to re-scan.
pub struct HandshakeBroker {
    pending: DashMap<u32, oneshot::Sender<Frame>>,
}

impl HandshakeBroker {
    pub fn new() -> Self {
        Self {
            pending: DashMap::new(),
        }
    }

    /// Registers a rendezvous slot for `cid` and returns the waiting side.
    pub fn register(&self, cid: u32) -> oneshot::Receiver<Frame> {
        let (tx, rx) = oneshot::channel();
        self.pending.insert(cid, tx);
        rx
    }

    /// Delivers the handshake outcome for `cid`, consuming the slot.
    /// Returns false when no stream task is waiting on that CID.
    pub fn complete(&self, cid: u32, frame: Frame) -> bool {
        match self.pending.remove(&cid) {
            Some((_, tx)) => tx.send(frame).is_ok(),
            None => false,
        }
    }

    pub fn is_pending(&self, cid: u32) -> bool {
        self.pending.contains_key(&cid)
    }

    /// Drops a slot whose stream task gave up before the outcome arrived.
    pub fn cancel(&self, cid: u32) {
        self.pending.remove(&cid);
    }

    /// Fails every pending rendezvous; waiting tasks observe the link loss
    /// through their dropped sender.
    pub fn fail_all(&self) {
        self.pending.clear();
    }
}

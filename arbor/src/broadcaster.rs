//! Fan-out of encoded envelopes to every connected peer.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, PoisonError, RwLock,
    },
};

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::{error::PeerError, protocol::Frame};

pub type PeerId = u64;

/// Anything that can accept frames and be closed.
pub trait Peer: Send + Sync {
    /// Hands a frame to the peer without waiting on the network.
    fn write(&self, frame: &Frame) -> Result<(), PeerError>;

    /// Releases the peer. Later writes fail with [`PeerError::Closed`].
    fn close(&self);
}

/// The set of connected peers.
///
/// A peer whose write fails is evicted and closed after the current send
/// finishes iterating, and never sees another frame.
pub struct Broadcaster {
    peers: RwLock<HashMap<PeerId, Arc<dyn Peer>>>,
    next_id: AtomicU64,
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl Broadcaster {
    pub fn new() -> Self {
        Self {
            peers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn add(&self, peer: Arc<dyn Peer>) -> PeerId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.peers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, peer);
        id
    }

    /// Removes and closes the peer. Returns whether it was still registered.
    pub fn remove(&self, id: PeerId) -> bool {
        let removed = self
            .peers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        match removed {
            Some(peer) => {
                peer.close();
                true
            }
            None => false,
        }
    }

    /// Writes the frame to every peer, returning how many accepted it.
    pub fn send(&self, frame: &Frame) -> usize {
        self.send_filtered(frame, None)
    }

    /// Like [`Broadcaster::send`] but skips `origin`.
    pub fn send_except(&self, frame: &Frame, origin: PeerId) -> usize {
        self.send_filtered(frame, Some(origin))
    }

    /// Writes the frame to a single peer, evicting it on failure.
    pub fn send_to(&self, frame: &Frame, id: PeerId) -> bool {
        let peer = self
            .peers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned();
        let Some(peer) = peer else {
            return false;
        };
        match peer.write(frame) {
            Ok(()) => true,
            Err(error) => {
                warn!(peer = id, %error, "error writing to peer, removing");
                self.remove(id);
                false
            }
        }
    }

    fn send_filtered(&self, frame: &Frame, skip: Option<PeerId>) -> usize {
        let mut delivered = 0;
        let mut failed = Vec::new();
        {
            let peers = self.peers.read().unwrap_or_else(PoisonError::into_inner);
            for (&id, peer) in peers.iter() {
                if Some(id) == skip {
                    continue;
                }
                match peer.write(frame) {
                    Ok(()) => delivered += 1,
                    Err(error) => {
                        warn!(peer = id, %error, "error writing to peer, removing");
                        failed.push(id);
                    }
                }
            }
        }

        // Eviction needs the write lock, so it waits until the read guard is gone.
        for id in failed {
            self.remove(id);
        }
        delivered
    }

    pub fn len(&self) -> usize {
        self.peers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes and closes every peer.
    pub fn close_all(&self) {
        let peers: Vec<_> = self
            .peers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();
        debug!(count = peers.len(), "closing all peers");
        for (_, peer) in peers {
            peer.close();
        }
    }
}

/// A peer backed by a bounded queue drained by its connection's writer.
///
/// A full queue counts as a failed write, so one stalled connection is
/// dropped instead of holding up the rest.
pub struct ConnectionPeer {
    outbound: Mutex<Option<mpsc::Sender<Frame>>>,
}

impl ConnectionPeer {
    /// Returns the peer and the receiving end its connection should drain.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Frame>) {
        let (outbound, inbox) = mpsc::channel(capacity.max(1));
        (
            Self {
                outbound: Mutex::new(Some(outbound)),
            },
            inbox,
        )
    }
}

impl Peer for ConnectionPeer {
    fn write(&self, frame: &Frame) -> Result<(), PeerError> {
        let outbound = self.outbound.lock().unwrap_or_else(PoisonError::into_inner);
        let sender = outbound.as_ref().ok_or(PeerError::Closed)?;
        sender.try_send(frame.clone()).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => PeerError::Full,
            mpsc::error::TrySendError::Closed(_) => PeerError::Closed,
        })
    }

    fn close(&self) {
        self.outbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

//! File transfer: download queue bookkeeping and the chunk coordinator.

pub mod coordinator;
pub mod files;

pub use coordinator::Coordinator;

use crate::types::{PeerId, now};
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::mpsc;

/// One queued download: what to fetch and what we were told about it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedDownload {
    pub share_dir: String,
    pub file_name: String,
    pub file_size: u64,
    pub file_mtime: u64,
}

/// A finished download, kept until the user clears the list.
#[derive(Debug, Clone)]
pub struct CompletedDownload {
    pub time: u64,
    pub peer_id: PeerId,
    pub share_dir: String,
    pub file_name: String,
    pub file_size: u64,
}

/// Ask from a peer to send one chunk out of a share (callee side).
#[derive(Debug)]
pub struct OutgoingChunkRequest {
    pub peer_id: PeerId,
    pub share_dir: String,
    pub file_name: String,
    pub offset: u64,
    pub chunk_id: String,
}

/// Chunk bytes arriving for one of our downloads.
#[derive(Debug)]
pub struct IncomingChunk {
    pub peer_id: PeerId,
    pub chunk_id: String,
    pub data: Vec<u8>,
}

/// Ack (or refusal) for a chunk request we issued.
#[derive(Debug)]
pub struct ChunkAck {
    pub peer_id: PeerId,
    pub chunk_id: String,
    pub ok: bool,
}

/// Sending ends of the coordinator's three inboxes, used by the command
/// layer. The receiving ends live inside the coordinator task.
#[derive(Clone)]
pub struct TransferSenders {
    pub outgoing: mpsc::UnboundedSender<OutgoingChunkRequest>,
    pub incoming: mpsc::UnboundedSender<IncomingChunk>,
    pub ack: mpsc::UnboundedSender<ChunkAck>,
}

pub struct TransferReceivers {
    pub outgoing: mpsc::UnboundedReceiver<OutgoingChunkRequest>,
    pub incoming: mpsc::UnboundedReceiver<IncomingChunk>,
    pub ack: mpsc::UnboundedReceiver<ChunkAck>,
}

pub fn transfer_channels() -> (TransferSenders, TransferReceivers) {
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let (in_tx, in_rx) = mpsc::unbounded_channel();
    let (ack_tx, ack_rx) = mpsc::unbounded_channel();
    (
        TransferSenders {
            outgoing: out_tx,
            incoming: in_tx,
            ack: ack_tx,
        },
        TransferReceivers {
            outgoing: out_rx,
            incoming: in_rx,
            ack: ack_rx,
        },
    )
}

/// The per-peer download queue plus the completed list. The head of each
/// peer's list is the transfer the coordinator works on.
pub struct DownloadQueue {
    queues: Mutex<HashMap<PeerId, Vec<QueuedDownload>>>,
    completed: Mutex<Vec<CompletedDownload>>,
}

impl DownloadQueue {
    pub fn new() -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            completed: Mutex::new(Vec::new()),
        }
    }

    /// Append unless the identical item is already queued for that peer.
    pub fn add(&self, peer_id: &str, item: QueuedDownload) -> bool {
        let mut queues = self.queues.lock().unwrap();
        let queue = queues.entry(peer_id.to_string()).or_default();
        if queue.contains(&item) {
            return false;
        }
        queue.push(item);
        true
    }

    pub fn remove(&self, peer_id: &str, index: usize) -> bool {
        let mut queues = self.queues.lock().unwrap();
        let Some(queue) = queues.get_mut(peer_id) else {
            return false;
        };
        if index >= queue.len() {
            return false;
        }
        queue.remove(index);
        if queue.is_empty() {
            queues.remove(peer_id);
        }
        true
    }

    /// Reorder one entry within a peer's queue.
    pub fn move_item(&self, peer_id: &str, from: usize, to: usize) -> bool {
        let mut queues = self.queues.lock().unwrap();
        let Some(queue) = queues.get_mut(peer_id) else {
            return false;
        };
        if from >= queue.len() || to >= queue.len() {
            return false;
        }
        let item = queue.remove(from);
        queue.insert(to, item);
        true
    }

    pub fn get(&self) -> HashMap<PeerId, Vec<QueuedDownload>> {
        self.queues.lock().unwrap().clone()
    }

    pub fn peers_with_work(&self) -> Vec<PeerId> {
        self.queues.lock().unwrap().keys().cloned().collect()
    }

    pub fn head(&self, peer_id: &str) -> Option<QueuedDownload> {
        self.queues
            .lock()
            .unwrap()
            .get(peer_id)
            .and_then(|q| q.first().cloned())
    }

    /// Pop the head if it still matches what the coordinator finished.
    pub fn pop_head(&self, peer_id: &str, expected: &QueuedDownload) -> bool {
        let mut queues = self.queues.lock().unwrap();
        let Some(queue) = queues.get_mut(peer_id) else {
            return false;
        };
        if queue.first() != Some(expected) {
            return false;
        }
        queue.remove(0);
        if queue.is_empty() {
            queues.remove(peer_id);
        }
        true
    }

    pub fn push_completed(&self, peer_id: &str, item: &QueuedDownload) {
        self.completed.lock().unwrap().push(CompletedDownload {
            time: now(),
            peer_id: peer_id.to_string(),
            share_dir: item.share_dir.clone(),
            file_name: item.file_name.clone(),
            file_size: item.file_size,
        });
    }

    pub fn completed(&self) -> Vec<CompletedDownload> {
        self.completed.lock().unwrap().clone()
    }

    pub fn clear_completed(&self) {
        self.completed.lock().unwrap().clear();
    }
}

impl Default for DownloadQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::fresh_id;

    fn item(name: &str) -> QueuedDownload {
        QueuedDownload {
            share_dir: "/docs".into(),
            file_name: name.into(),
            file_size: 1000,
            file_mtime: 0,
        }
    }

    #[test]
    fn add_dedupes_and_head_is_first() {
        let q = DownloadQueue::new();
        let peer = fresh_id();
        assert!(q.add(&peer, item("a")));
        assert!(!q.add(&peer, item("a")));
        assert!(q.add(&peer, item("b")));
        assert_eq!(q.head(&peer).unwrap().file_name, "a");
    }

    #[test]
    fn move_and_remove_reorder_the_queue() {
        let q = DownloadQueue::new();
        let peer = fresh_id();
        q.add(&peer, item("a"));
        q.add(&peer, item("b"));
        q.add(&peer, item("c"));
        assert!(q.move_item(&peer, 2, 0));
        assert_eq!(q.head(&peer).unwrap().file_name, "c");
        assert!(q.remove(&peer, 0));
        assert_eq!(q.head(&peer).unwrap().file_name, "a");
    }

    #[test]
    fn pop_head_requires_matching_item() {
        let q = DownloadQueue::new();
        let peer = fresh_id();
        q.add(&peer, item("a"));
        assert!(!q.pop_head(&peer, &item("b")));
        assert!(q.pop_head(&peer, &item("a")));
        assert!(q.head(&peer).is_none());
        // Emptied peers disappear from the work list.
        assert!(q.peers_with_work().is_empty());
    }

    #[test]
    fn completed_is_append_and_clear_only() {
        let q = DownloadQueue::new();
        let peer = fresh_id();
        q.push_completed(&peer, &item("a"));
        q.push_completed(&peer, &item("b"));
        assert_eq!(q.completed().len(), 2);
        q.clear_completed();
        assert!(q.completed().is_empty());
    }
}

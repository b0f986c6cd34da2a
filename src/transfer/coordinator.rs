//! The chunk transfer coordinator.
//!
//! Downloader side: for each peer whose download queue has a head, keep a
//! chunk plan (pending + requested), issue up to [`CREDIT_MAX`]
//! outstanding requests through the peer's file queue, append arriving
//! chunk data to the partial file, and finalize when the size matches.
//!
//! Serving side: answer queued get-file-chunk asks by reading the chunk
//! out of the share and pushing a give-file-chunk request onto the
//! asking peer's low-priority queue.
//!
//! All file handles are cached and TTL-purged. A transfer that stops
//! making progress for [`DATA_TIMEOUT`] is reset: the head stays queued
//! and the plan is rebuilt from whatever the partial file already holds.

use crate::commands::Commands;
use crate::constants::{
    CACHE_PURGE_INTERVAL, CHUNK_SIZE, COORDINATOR_TICK, CREDIT_MAX, DATA_TIMEOUT,
    DOWNLOAD_Q_CHECK_TIME, ROLLCALL_TIMEOUT,
};
use crate::net::session::{Priority, SessionState};
use crate::node::SharedState;
use crate::shares;
use crate::transfer::files::{ReadCache, WriteCache, finalize_partial, partial_path, partial_size};
use crate::transfer::{QueuedDownload, TransferReceivers};
use crate::types::{PeerId, fresh_id};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tracing::{debug, info, warn};

struct ChunkState {
    sent: Option<Instant>,
    acked: Option<Instant>,
    offset: u64,
}

/// In-memory plan for the transfer at the head of one peer's queue.
struct ActiveDownload {
    item: QueuedDownload,
    partial: PathBuf,
    final_path: PathBuf,
    /// Reversed at build time so `pop()` yields the lowest offset first.
    pending: Vec<(String, u64)>,
    requested: HashSet<String>,
    status: HashMap<String, ChunkState>,
    last_chunk_received: Instant,
}

/// Offsets `current_size, +CHUNK, ..., file_size` inclusive, each with a
/// fresh chunk id, reversed for pop-lowest-first.
///
/// TODO: a file size that lands exactly on the chunk grid plans a
/// zero-length tail chunk the serving side never answers; it only clears
/// through the stall reset and a rescan.
fn build_chunk_plan(current_size: u64, file_size: u64) -> Vec<(String, u64)> {
    let mut plan: Vec<(String, u64)> = (current_size..=file_size)
        .step_by(CHUNK_SIZE as usize)
        .map(|offset| (fresh_id(), offset))
        .collect();
    plan.reverse();
    plan
}

pub struct Coordinator {
    state: Arc<SharedState>,
    commands: Commands,
    rx: TransferReceivers,
    stop: watch::Receiver<bool>,
    active: HashMap<PeerId, ActiveDownload>,
    read_cache: ReadCache,
    write_cache: WriteCache,
    next_queue_check: Instant,
    next_cache_purge: Instant,
}

impl Coordinator {
    pub fn new(
        state: Arc<SharedState>,
        commands: Commands,
        rx: TransferReceivers,
        stop: watch::Receiver<bool>,
    ) -> Self {
        Self {
            state,
            commands,
            rx,
            stop,
            active: HashMap::new(),
            read_cache: ReadCache::new(),
            write_cache: WriteCache::new(),
            next_queue_check: Instant::now(),
            next_cache_purge: Instant::now() + CACHE_PURGE_INTERVAL,
        }
    }

    pub async fn run(mut self) {
        info!("transfer coordinator started");
        loop {
            tokio::select! {
                _ = self.state.wake_transfer.notified() => {}
                _ = tokio::time::sleep(COORDINATOR_TICK) => {}
                _ = self.stop.changed() => {}
            }
            if *self.stop.borrow() {
                break;
            }

            self.drain_acks();
            self.drain_incoming();
            self.check_stalls();

            if Instant::now() >= self.next_queue_check {
                self.next_queue_check = Instant::now() + DOWNLOAD_Q_CHECK_TIME;
                self.scan_download_queue();
            }

            self.issue_requests();
            self.serve_outgoing();

            if Instant::now() >= self.next_cache_purge {
                self.next_cache_purge = Instant::now() + CACHE_PURGE_INTERVAL;
                self.read_cache.purge();
                self.write_cache.purge();
                self.state.listings.purge();
            }
        }
        self.write_cache.close_all();
        info!("transfer coordinator stopped");
    }

    /// Both directions of the peer relationship must be fresh before a
    /// transfer may make progress.
    fn peer_responsive(&self, peer_id: &str) -> bool {
        let client_ok = self
            .state
            .session(peer_id)
            .and_then(|s| s.last_reply_age())
            .map(|age| age <= ROLLCALL_TIMEOUT)
            .unwrap_or(false);
        let server_ok = self
            .state
            .server_seen_age(peer_id)
            .map(|age| age <= ROLLCALL_TIMEOUT)
            .unwrap_or(false);
        client_ok && server_ok
    }

    // =========================================================================
    // DOWNLOAD QUEUE SCAN
    // =========================================================================

    fn scan_download_queue(&mut self) {
        let download_dir = self.state.settings.read().unwrap().download_location.clone();

        for peer_id in self.state.downloads.peers_with_work() {
            let Some(head) = self.state.downloads.head(&peer_id) else {
                self.active.remove(&peer_id);
                continue;
            };

            if !self.peer_responsive(&peer_id) {
                debug!(
                    "downloads queued for {} but the peer is not responsive",
                    peer_id
                );
                continue;
            }

            let head_matches = self
                .active
                .get(&peer_id)
                .map(|a| a.item == head)
                .unwrap_or(false);

            if head_matches {
                self.try_finalize(&peer_id);
                continue;
            }

            // Head changed (or first sighting): build the chunk plan.
            if let Err(e) = std::fs::create_dir_all(&download_dir) {
                warn!("cannot create download directory {:?}: {}", download_dir, e);
                continue;
            }
            let partial = partial_path(&download_dir, &head.file_name);
            let final_path = download_dir.join(&head.file_name);
            let mut current = partial_size(&partial);

            if current > head.file_size {
                // Leftover from a different file of the same name.
                warn!(
                    "partial {:?} is larger than the advertised size, starting over",
                    partial
                );
                self.write_cache.close(&partial);
                if std::fs::remove_file(&partial).is_err() {
                    continue;
                }
                current = 0;
            }

            if current == head.file_size {
                self.finalize(&peer_id, &head, &partial, &final_path);
                continue;
            }

            debug!(
                "planning transfer of {}/{} from {} ({} of {} bytes present)",
                head.share_dir, head.file_name, peer_id, current, head.file_size
            );
            let pending = build_chunk_plan(current, head.file_size);
            let status = pending
                .iter()
                .map(|(id, offset)| {
                    (
                        id.clone(),
                        ChunkState {
                            sent: None,
                            acked: None,
                            offset: *offset,
                        },
                    )
                })
                .collect();
            self.active.insert(
                peer_id.clone(),
                ActiveDownload {
                    item: head,
                    partial,
                    final_path,
                    pending,
                    requested: HashSet::new(),
                    status,
                    last_chunk_received: Instant::now(),
                },
            );
        }

        // Transfers whose peer left the queue entirely.
        let with_work: HashSet<PeerId> = self.state.downloads.peers_with_work().into_iter().collect();
        self.active.retain(|peer_id, _| with_work.contains(peer_id));
    }

    fn try_finalize(&mut self, peer_id: &str) {
        let Some(active) = self.active.get(peer_id) else {
            return;
        };
        if !active.pending.is_empty() || !active.requested.is_empty() {
            return;
        }
        if partial_size(&active.partial) != active.item.file_size {
            return;
        }
        let (item, partial, final_path) = (
            active.item.clone(),
            active.partial.clone(),
            active.final_path.clone(),
        );
        self.active.remove(peer_id);
        self.finalize(peer_id, &item, &partial, &final_path);
    }

    fn finalize(
        &mut self,
        peer_id: &str,
        item: &QueuedDownload,
        partial: &PathBuf,
        final_path: &PathBuf,
    ) {
        self.write_cache.close(partial);
        match finalize_partial(partial, final_path) {
            Ok(landed) => {
                info!(
                    "download of {}/{} from {} complete -> {:?}",
                    item.share_dir, item.file_name, peer_id, landed
                );
                self.state.downloads.push_completed(peer_id, item);
                self.state.downloads.pop_head(peer_id, item);
                self.active.remove(peer_id);
            }
            Err(e) => warn!("failed to finalize {:?}: {}", partial, e),
        }
    }

    // =========================================================================
    // CREDIT-BASED ISSUING
    // =========================================================================

    fn issue_requests(&mut self) {
        let mut woke = false;
        let peers: Vec<PeerId> = self.active.keys().cloned().collect();

        for peer_id in peers {
            if !self.peer_responsive(&peer_id) {
                continue;
            }
            let Some(session) = self.state.session(&peer_id) else {
                continue;
            };
            if session.state() != SessionState::Connected {
                continue;
            }
            let Some(active) = self.active.get_mut(&peer_id) else {
                continue;
            };

            while !active.pending.is_empty() && active.requested.len() < CREDIT_MAX {
                let (chunk_id, offset) = active.pending.pop().unwrap();
                let request = self.commands.request_get_file_chunk(
                    &active.item.share_dir,
                    &active.item.file_name,
                    offset,
                    &chunk_id,
                );
                if !session.enqueue(Priority::File, request) {
                    // Transport vanished mid-burst; put the chunk back.
                    active.pending.push((chunk_id, offset));
                    break;
                }
                if let Some(state) = active.status.get_mut(&chunk_id) {
                    state.sent = Some(Instant::now());
                }
                active.requested.insert(chunk_id);
                woke = true;
            }
        }
        if woke {
            self.state.wake_client.notify_one();
        }
    }

    // =========================================================================
    // ACKS, DATA, STALLS
    // =========================================================================

    fn drain_acks(&mut self) {
        while let Ok(ack) = self.rx.ack.try_recv() {
            let Some(active) = self.active.get_mut(&ack.peer_id) else {
                debug!("ack from {} with no active transfer", ack.peer_id);
                continue;
            };
            if !active.requested.contains(&ack.chunk_id) {
                debug!("ack for unknown chunk {} from {}", ack.chunk_id, ack.peer_id);
                continue;
            }
            if ack.ok {
                if let Some(state) = active.status.get_mut(&ack.chunk_id) {
                    state.acked = Some(Instant::now());
                }
            } else {
                // The peer refused the chunk; rebuild from the partial on
                // the next queue scan.
                warn!(
                    "{} refused chunk {}, resetting the transfer",
                    ack.peer_id, ack.chunk_id
                );
                self.active.remove(&ack.peer_id);
            }
        }
    }

    fn drain_incoming(&mut self) {
        while let Ok(chunk) = self.rx.incoming.try_recv() {
            let Some(active) = self.active.get_mut(&chunk.peer_id) else {
                warn!("chunk from {} with no active transfer, dropping", chunk.peer_id);
                continue;
            };
            if !active.requested.contains(&chunk.chunk_id) {
                warn!(
                    "unknown chunk {} from {}, dropping",
                    chunk.chunk_id, chunk.peer_id
                );
                continue;
            }

            let new_size = match self.write_cache.append(&active.partial, &chunk.data) {
                Ok(size) => size,
                Err(e) => {
                    warn!("cannot write to {:?}: {}", active.partial, e);
                    self.active.remove(&chunk.peer_id);
                    continue;
                }
            };

            active.last_chunk_received = Instant::now();
            active.requested.remove(&chunk.chunk_id);
            active.status.remove(&chunk.chunk_id);

            if new_size >= active.item.file_size {
                self.write_cache.close(&active.partial);
            }
            if new_size == active.item.file_size
                && active.pending.is_empty()
                && active.requested.is_empty()
            {
                let peer_id = chunk.peer_id.clone();
                self.try_finalize(&peer_id);
            }
        }
    }

    fn check_stalls(&mut self) {
        let stalled: Vec<PeerId> = self
            .active
            .iter()
            .filter(|(_, a)| a.last_chunk_received.elapsed() > DATA_TIMEOUT)
            .map(|(peer, _)| peer.clone())
            .collect();
        for peer_id in stalled {
            warn!("transfer from {} stalled, resetting", peer_id);
            self.active.remove(&peer_id);
        }
    }

    // =========================================================================
    // SERVING
    // =========================================================================

    fn serve_outgoing(&mut self) {
        let mut woke = false;
        while let Ok(request) = self.rx.outgoing.try_recv() {
            let shares = self.state.settings.read().unwrap().shares.clone();
            let path = match shares::resolve_file(&shares, &request.share_dir, &request.file_name)
            {
                Ok(p) => p,
                Err(e) => {
                    warn!(
                        "{} asked for {}/{}: {}",
                        request.peer_id, request.share_dir, request.file_name, e
                    );
                    continue;
                }
            };

            let data = match self.read_cache.read_chunk(&path, request.offset) {
                Ok(d) => d,
                Err(e) => {
                    warn!("cannot read chunk from {:?}: {}", path, e);
                    continue;
                }
            };
            if data.is_empty() {
                // Past end of file; nothing to send.
                continue;
            }

            let reply = self
                .commands
                .request_give_file_chunk(&request.chunk_id, data);
            match self.state.session(&request.peer_id) {
                Some(session) if session.enqueue(Priority::Low, reply) => {
                    woke = true;
                }
                _ => warn!(
                    "no live session for {}, dropping outgoing chunk",
                    request.peer_id
                ),
            }
        }
        if woke {
            self.state.wake_client.notify_one();
        }
    }
}

//! The session supervisor.
//!
//! [`Node`] owns everything with a lifetime: the settings document, the
//! key store, the peer sessions, the chat log, the download queues and
//! the three long-running loops. The engines receive an [`Arc`] of
//! [`SharedState`] and a stop signal; `restart` tears the client and
//! server engines down and rebuilds them (the transfer coordinator rides
//! across restarts), `shutdown` stops the world.
//!
//! Everything the UI may call lives here as inherent methods.

use crate::chat::ChatLog;
use crate::codec::ShareEntry;
use crate::commands::Commands;
use crate::constants::ROLLCALL_TIMEOUT;
use crate::keystore::{KeyStore, KeyStoreError};
use crate::limiter::RateCounter;
use crate::net::authenticator::Authenticator;
use crate::net::client::ClientEngine;
use crate::net::server::ServerEngine;
use crate::net::session::{Priority, Session, SessionStatus};
use crate::settings::{PeerRecord, Settings, SettingsError, Share};
use crate::shares::ListingCache;
use crate::transfer::{
    Coordinator, CompletedDownload, DownloadQueue, QueuedDownload, TransferReceivers,
    TransferSenders, transfer_channels,
};
use crate::types::{PeerId, fresh_id, now, valid_chat_text};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("settings error: {0}")]
    Settings(#[from] SettingsError),

    #[error("key store error: {0}")]
    KeyStore(#[from] KeyStoreError),

    #[error("cannot bind server socket: {0}")]
    Bind(std::io::Error),

    #[error("no live session for peer {0}")]
    NoSession(PeerId),

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

/// State shared between the supervisor and the three engines. Lock order
/// when more than one is needed: settings, then sessions, then an
/// individual queue; never the reverse.
pub struct SharedState {
    pub data_dir: PathBuf,
    pub settings: RwLock<Settings>,
    /// Bumped on every settings save; consumers compare and refresh.
    pub settings_version: AtomicU64,
    pub chat: ChatLog,
    pub listings: ListingCache,
    pub sessions: Mutex<HashMap<PeerId, Arc<Session>>>,
    pub upload_limiter: RateCounter,
    pub download_limiter: RateCounter,
    /// Last time the server answered a request per peer identity.
    pub server_seen: Mutex<HashMap<PeerId, Instant>>,
    pub downloads: DownloadQueue,
    pub transfer_tx: TransferSenders,
    transfer_rx: Mutex<Option<TransferReceivers>>,
    pub wake_client: Notify,
    pub wake_transfer: Notify,
}

impl SharedState {
    fn new(data_dir: PathBuf, settings: Settings) -> Arc<Self> {
        let (transfer_tx, transfer_rx) = transfer_channels();
        Arc::new(Self {
            data_dir,
            settings: RwLock::new(settings),
            settings_version: AtomicU64::new(1),
            chat: ChatLog::new(),
            listings: ListingCache::new(),
            sessions: Mutex::new(HashMap::new()),
            upload_limiter: RateCounter::new(),
            download_limiter: RateCounter::new(),
            server_seen: Mutex::new(HashMap::new()),
            downloads: DownloadQueue::new(),
            transfer_tx,
            transfer_rx: Mutex::new(Some(transfer_rx)),
            wake_client: Notify::new(),
            wake_transfer: Notify::new(),
        })
    }

    /// Persist the settings and bump the version token. Callers already
    /// hold the settings lock; disk trouble is logged, not fatal.
    pub fn save_settings(&self, settings: &Settings) {
        if let Err(e) = settings.save(&self.data_dir) {
            error!("failed to save settings: {}", e);
        }
        self.settings_version.fetch_add(1, Ordering::AcqRel);
    }

    pub fn session(&self, peer_id: &str) -> Option<Arc<Session>> {
        self.sessions.lock().unwrap().get(peer_id).cloned()
    }

    /// Enqueue on one peer's session. False when there is no live
    /// session; nothing is buffered for absent peers.
    pub fn enqueue(&self, peer_id: &str, data: Vec<u8>, priority: Priority) -> bool {
        let ok = self
            .session(peer_id)
            .map(|s| s.enqueue(priority, data))
            .unwrap_or(false);
        if ok {
            self.wake_client.notify_one();
        } else {
            warn!("dropping message for {}: no live session", peer_id);
        }
        ok
    }

    /// Fan-out to every live session; returns how many accepted it.
    pub fn enqueue_all(&self, data: &[u8], priority: Priority) -> usize {
        let sessions: Vec<Arc<Session>> =
            self.sessions.lock().unwrap().values().cloned().collect();
        let mut count = 0;
        for session in sessions {
            if session.enqueue(priority, data.to_vec()) {
                count += 1;
            }
        }
        if count > 0 {
            self.wake_client.notify_one();
        }
        count
    }

    /// Peers the client engine has heard from inside the liveness window.
    pub fn reachable_peers(&self) -> Vec<PeerId> {
        self.sessions
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, s)| {
                s.last_reply_age()
                    .map(|age| age <= ROLLCALL_TIMEOUT)
                    .unwrap_or(false)
            })
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn mark_server_seen(&self, peer_id: &str) {
        self.server_seen
            .lock()
            .unwrap()
            .insert(peer_id.to_string(), Instant::now());
    }

    pub fn server_seen_age(&self, peer_id: &str) -> Option<Duration> {
        self.server_seen
            .lock()
            .unwrap()
            .get(peer_id)
            .map(|t| t.elapsed())
    }

    /// Bare state for unit tests: default settings persisted under `dir`,
    /// transfer receivers kept alive.
    #[cfg(test)]
    pub fn for_tests(dir: &Path) -> Arc<Self> {
        let settings = Settings::load(dir).expect("test settings");
        Self::new(dir.to_path_buf(), settings)
    }
}

struct Engines {
    stop: watch::Sender<bool>,
    client: JoinHandle<()>,
    server: JoinHandle<()>,
}

struct CoordinatorTask {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// One line of the `peer_status` answer.
#[derive(Debug, Clone)]
pub struct PeerStatus {
    pub peer_id: PeerId,
    pub nickname: String,
    pub localnick: String,
    pub enabled: bool,
    pub session: Option<SessionStatus>,
}

#[derive(Debug, Clone)]
pub struct ThreadStatus {
    pub client_running: bool,
    pub server_running: bool,
    pub coordinator_running: bool,
}

pub struct Node {
    pub state: Arc<SharedState>,
    commands: Commands,
    keystore: KeyStore,
    authenticator: Arc<Authenticator>,
    engines: Mutex<Option<Engines>>,
    coordinator: Mutex<Option<CoordinatorTask>>,
}

impl Node {
    /// Load settings and keys from `data_dir`. Key store trouble here is
    /// the one startup error that is fatal by design.
    pub fn new(data_dir: &Path) -> Result<Self, NodeError> {
        let settings = Settings::load(data_dir)?;

        let cert_store = if settings.cert_store.is_absolute() {
            settings.cert_store.clone()
        } else {
            data_dir.join(&settings.cert_store)
        };
        let keystore = KeyStore::open(&cert_store, &settings.local_id)?;
        keystore.reconcile(&settings.peers)?;
        let authenticator = Arc::new(Authenticator::new(keystore.public_dir().to_path_buf()));

        info!(
            "node {} ready ({} peers, {} enabled)",
            settings.local_id,
            settings.peers.len(),
            settings.enabled_peers().len()
        );

        let state = SharedState::new(data_dir.to_path_buf(), settings);
        let commands = Commands::new(state.clone());

        Ok(Self {
            state,
            commands,
            keystore,
            authenticator,
            engines: Mutex::new(None),
            coordinator: Mutex::new(None),
        })
    }

    /// Public halves of this node's key pairs, for export via the UI.
    pub fn public_keys(&self) -> (String, String) {
        (
            self.keystore.client.public_hex(),
            self.keystore.server.public_hex(),
        )
    }

    pub fn local_id(&self) -> PeerId {
        self.state.settings.read().unwrap().local_id.clone()
    }

    // =========================================================================
    // LIFECYCLE
    // =========================================================================

    pub async fn start(&self) -> Result<(), NodeError> {
        self.start_coordinator();
        self.start_engines().await
    }

    fn start_coordinator(&self) {
        let Some(rx) = self.state.transfer_rx.lock().unwrap().take() else {
            return;
        };
        let (stop_tx, stop_rx) = watch::channel(false);
        let coordinator =
            Coordinator::new(self.state.clone(), self.commands.clone(), rx, stop_rx);
        let task = tokio::spawn(coordinator.run());
        *self.coordinator.lock().unwrap() = Some(CoordinatorTask {
            stop: stop_tx,
            task,
        });
    }

    async fn start_engines(&self) -> Result<(), NodeError> {
        // Fresh engines always see the current peer table.
        {
            let settings = self.state.settings.read().unwrap();
            self.keystore.reconcile(&settings.peers)?;
        }
        self.authenticator.configure();

        let (stop_tx, stop_rx) = watch::channel(false);

        let server = ServerEngine::bind(
            self.state.clone(),
            self.commands.clone(),
            self.keystore.server.clone(),
            self.authenticator.clone(),
            stop_rx.clone(),
        )
        .await
        .map_err(NodeError::Bind)?;
        let server_task = tokio::spawn(server.run());

        let client = ClientEngine::new(
            self.state.clone(),
            self.commands.clone(),
            self.keystore.client.clone(),
            stop_rx,
        );
        let client_task = tokio::spawn(client.run());

        *self.engines.lock().unwrap() = Some(Engines {
            stop: stop_tx,
            client: client_task,
            server: server_task,
        });
        Ok(())
    }

    async fn stop_engines(&self) {
        let engines = self.engines.lock().unwrap().take();
        if let Some(engines) = engines {
            let _ = engines.stop.send(true);
            self.state.wake_client.notify_one();
            let _ = engines.client.await;
            let _ = engines.server.await;
        }
        // Sessions belong to the stopped generation.
        let sessions: Vec<Arc<Session>> = {
            let mut map = self.state.sessions.lock().unwrap();
            map.drain().map(|(_, s)| s).collect()
        };
        for session in sessions {
            session.mark_disconnected();
        }
        self.state.upload_limiter.reset();
        self.state.download_limiter.reset();
    }

    /// Stop and rebuild the client and server engines. Used after peer
    /// table changes; the transfer coordinator keeps running.
    pub async fn restart(&self) -> Result<(), NodeError> {
        info!("restarting engines");
        self.stop_engines().await;
        self.start_engines().await
    }

    /// Full stop: engines, coordinator, files.
    pub async fn shutdown(&self) {
        info!("shutting down");
        self.stop_engines().await;
        let coordinator = self.coordinator.lock().unwrap().take();
        if let Some(coordinator) = coordinator {
            let _ = coordinator.stop.send(true);
            self.state.wake_transfer.notify_one();
            let _ = coordinator.task.await;
        }
        info!("clean exit");
    }

    // =========================================================================
    // UI BOUNDARY
    // =========================================================================

    pub fn enqueue(
        &self,
        peer_id: &str,
        data: Vec<u8>,
        priority: Priority,
    ) -> Result<(), NodeError> {
        if self.state.enqueue(peer_id, data, priority) {
            Ok(())
        } else {
            Err(NodeError::NoSession(peer_id.to_string()))
        }
    }

    pub fn enqueue_all(&self, data: &[u8], priority: Priority) -> usize {
        self.state.enqueue_all(data, priority)
    }

    pub fn download_queue_add(&self, peer_id: &str, item: QueuedDownload) -> bool {
        let added = self.state.downloads.add(peer_id, item);
        if added {
            self.state.wake_transfer.notify_one();
        }
        added
    }

    pub fn download_queue_remove(&self, peer_id: &str, index: usize) -> bool {
        self.state.downloads.remove(peer_id, index)
    }

    pub fn download_queue_move(&self, peer_id: &str, from: usize, to: usize) -> bool {
        self.state.downloads.move_item(peer_id, from, to)
    }

    pub fn download_queue_get(&self) -> HashMap<PeerId, Vec<QueuedDownload>> {
        self.state.downloads.get()
    }

    pub fn completed_queue_get(&self) -> Vec<CompletedDownload> {
        self.state.downloads.completed()
    }

    pub fn completed_queue_clear(&self) {
        self.state.downloads.clear_completed()
    }

    /// Ask a peer for a directory listing; the handle identifies the
    /// eventual result in the cache.
    pub fn browse(&self, peer_id: &str, share_dir: &str) -> Result<String, NodeError> {
        let handle = fresh_id();
        self.state.listings.track_pending(&handle);
        let request = self.commands.request_share_listing(share_dir, &handle);
        self.enqueue(peer_id, request, Priority::Medium)?;
        Ok(handle)
    }

    pub fn browse_result(&self, peer_id: &str, share_dir: &str) -> Option<Vec<ShareEntry>> {
        self.state.listings.get(peer_id, share_dir)
    }

    /// Append to the local log and fan the line out at medium priority.
    pub fn send_chat(&self, text: &str) -> Result<usize, NodeError> {
        if !valid_chat_text(text) {
            return Err(NodeError::InvalidInput("chat text".into()));
        }
        let timestamp = now();
        let local_id = self.local_id();
        self.state.chat.append(&local_id, timestamp, text);
        let request = self.commands.request_chat(timestamp, text);
        Ok(self.state.enqueue_all(&request, Priority::Medium))
    }

    pub fn get_chat(&self) -> Vec<crate::chat::ChatEntry> {
        self.state.chat.entries()
    }

    pub fn chat_version(&self) -> String {
        self.state.chat.version()
    }

    pub fn peer_status(&self) -> Vec<PeerStatus> {
        let settings = self.state.settings.read().unwrap();
        let sessions = self.state.sessions.lock().unwrap();
        settings
            .peers
            .iter()
            .map(|(id, record)| PeerStatus {
                peer_id: id.clone(),
                nickname: record.nickname.clone(),
                localnick: record.localnick.clone(),
                enabled: record.enabled,
                session: sessions.get(id).map(|s| s.status()),
            })
            .collect()
    }

    pub fn thread_status(&self) -> ThreadStatus {
        let engines = self.engines.lock().unwrap();
        let coordinator = self.coordinator.lock().unwrap();
        ThreadStatus {
            client_running: engines
                .as_ref()
                .map(|e| !e.client.is_finished())
                .unwrap_or(false),
            server_running: engines
                .as_ref()
                .map(|e| !e.server.is_finished())
                .unwrap_or(false),
            coordinator_running: coordinator
                .as_ref()
                .map(|c| !c.task.is_finished())
                .unwrap_or(false),
        }
    }

    /// Current (upload, download) rates in bytes per second.
    pub fn speed(&self) -> (f64, f64) {
        (
            self.state.upload_limiter.rate(),
            self.state.download_limiter.rate(),
        )
    }

    /// Apply and persist a settings mutation.
    pub fn save_settings(&self, mutate: impl FnOnce(&mut Settings)) {
        let mut settings = self.state.settings.write().unwrap();
        mutate(&mut settings);
        self.state.save_settings(&settings);
    }

    pub fn save_shares(&self, shares: Vec<Share>) {
        let shares: Vec<Share> = shares
            .into_iter()
            .filter(|Share(name, path)| {
                let ok = crate::types::valid_share_name(name) && path.is_dir();
                if !ok {
                    warn!("refusing share {:?} -> {:?}", name, path);
                }
                ok
            })
            .collect();
        self.save_settings(|s| s.shares = shares);
    }

    /// Replace the peer table; reconciles keys and restarts the engines.
    pub async fn save_peers(
        &self,
        peers: BTreeMap<PeerId, PeerRecord>,
    ) -> Result<(), NodeError> {
        self.save_settings(|s| s.peers = peers);
        self.restart().await
    }
}

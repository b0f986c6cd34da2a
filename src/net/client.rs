//! The client engine: one outbound session per enabled peer.
//!
//! A single loop drives everything. Each tick it reconciles the session
//! table against the peer table, absorbs finished connect attempts, then
//! visits every live link in randomized order:
//!
//! 1. drain high, then medium, unconditionally;
//! 2. at most one file-queue send, paced by download-rate utilization;
//! 3. at most one low-queue send, gated by the upload cap;
//! 4. a rollcall when the heartbeat clock says so;
//! 5. a non-blocking receive drain feeding the command layer.
//!
//! Connecting (resolve + TCP + handshake) happens in spawned tasks so a
//! slow host never stalls the tick; results come back over a channel.

use crate::constants::{
    FILE_REQUEST_INTERVAL, FILE_REQUEST_INTERVAL_FLOOR, TICK_INTERVAL,
};
use crate::commands::Commands;
use crate::keystore::{KeyPair, decode_hex_key};
use crate::net::encrypted::{EncryptedStream, EncryptedWriter};
use crate::net::session::{Priority, Session, SessionState};
use crate::node::SharedState;
use crate::types::{PeerId, PublicKeyBytes};
use rand::seq::SliceRandom;
use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// A live outbound transport: writer owned by the engine, reader pumped
/// by its own task into `incoming`.
struct PeerLink {
    writer: EncryptedWriter,
    incoming: mpsc::UnboundedReceiver<Vec<u8>>,
    reader_task: JoinHandle<()>,
}

type ConnectResult = (PeerId, Result<EncryptedStream, String>);

pub struct ClientEngine {
    state: Arc<SharedState>,
    commands: Commands,
    client_pair: KeyPair,
    stop: watch::Receiver<bool>,
    links: HashMap<PeerId, PeerLink>,
    connecting: HashSet<PeerId>,
    connect_tx: mpsc::UnboundedSender<ConnectResult>,
    connect_rx: mpsc::UnboundedReceiver<ConnectResult>,
    /// Earliest next file-queue send, engine-wide.
    next_file_send: Instant,
}

impl ClientEngine {
    pub fn new(
        state: Arc<SharedState>,
        commands: Commands,
        client_pair: KeyPair,
        stop: watch::Receiver<bool>,
    ) -> Self {
        let (connect_tx, connect_rx) = mpsc::unbounded_channel();
        Self {
            state,
            commands,
            client_pair,
            stop,
            links: HashMap::new(),
            connecting: HashSet::new(),
            connect_tx,
            connect_rx,
            next_file_send: Instant::now(),
        }
    }

    pub async fn run(mut self) {
        info!("client engine started");
        loop {
            tokio::select! {
                _ = self.state.wake_client.notified() => {}
                _ = tokio::time::sleep(TICK_INTERVAL) => {}
                _ = self.stop.changed() => {}
            }
            if *self.stop.borrow() {
                break;
            }
            self.absorb_connects();
            self.reconcile_sessions();
            self.tick().await;
        }

        // Zero linger: unsent queue contents die with the links.
        for (peer_id, link) in self.links.drain() {
            link.reader_task.abort();
            if let Some(session) = self.state.session(&peer_id) {
                session.mark_disconnected();
            }
        }
        info!("client engine stopped");
    }

    // =========================================================================
    // CONNECTION LIFECYCLE
    // =========================================================================

    /// Bring the session table in line with the peer table and kick off
    /// connect attempts that are due.
    fn reconcile_sessions(&mut self) {
        let enabled: Vec<(PeerId, String, u16, String)> = {
            let settings = self.state.settings.read().unwrap();
            settings
                .peers
                .iter()
                .filter(|(_, p)| p.enabled)
                .map(|(id, p)| (id.clone(), p.hostname.clone(), p.port, p.serverkey.clone()))
                .collect()
        };
        let enabled_ids: HashSet<&PeerId> = enabled.iter().map(|(id, ..)| id).collect();

        // Disabled or removed peers lose their session outright.
        let stale: Vec<PeerId> = {
            let sessions = self.state.sessions.lock().unwrap();
            sessions
                .keys()
                .filter(|id| !enabled_ids.contains(id))
                .cloned()
                .collect()
        };
        for peer_id in stale {
            info!("dropping session for disabled peer {}", peer_id);
            if let Some(link) = self.links.remove(&peer_id) {
                link.reader_task.abort();
            }
            let mut sessions = self.state.sessions.lock().unwrap();
            if let Some(session) = sessions.remove(&peer_id) {
                session.mark_disconnected();
            }
        }

        for (peer_id, hostname, port, serverkey_hex) in enabled {
            let session = {
                let mut sessions = self.state.sessions.lock().unwrap();
                sessions
                    .entry(peer_id.clone())
                    .or_insert_with(|| Arc::new(Session::new(peer_id.clone())))
                    .clone()
            };

            if self.links.contains_key(&peer_id)
                || self.connecting.contains(&peer_id)
                || !session.due_for_connect()
            {
                continue;
            }

            let Some(server_key) = decode_hex_key(&serverkey_hex) else {
                warn!("peer {} has an unusable server key, cannot connect", peer_id);
                session.mark_failed();
                continue;
            };

            session.mark_connecting();
            self.connecting.insert(peer_id.clone());
            self.spawn_connect(peer_id, hostname, port, server_key);
        }
    }

    fn spawn_connect(
        &self,
        peer_id: PeerId,
        hostname: String,
        port: u16,
        server_key: PublicKeyBytes,
    ) {
        let tx = self.connect_tx.clone();
        let pair = self.client_pair.clone();
        tokio::spawn(async move {
            let result = connect_peer(&hostname, port, &pair, server_key).await;
            let _ = tx.send((peer_id, result));
        });
    }

    fn absorb_connects(&mut self) {
        while let Ok((peer_id, result)) = self.connect_rx.try_recv() {
            self.connecting.remove(&peer_id);
            let Some(session) = self.state.session(&peer_id) else {
                // Peer disabled while the connect was in flight.
                continue;
            };
            match result {
                Ok(stream) => {
                    info!("connected to {} at {}", peer_id, stream.peer_addr);
                    let (mut reader, writer) = stream.split();
                    let (tx, rx) = mpsc::unbounded_channel();
                    let reader_task = tokio::spawn(async move {
                        loop {
                            match reader.read().await {
                                Ok(frame) => {
                                    if tx.send(frame).is_err() {
                                        break;
                                    }
                                }
                                Err(_) => break,
                            }
                        }
                    });
                    self.links.insert(
                        peer_id,
                        PeerLink {
                            writer,
                            incoming: rx,
                            reader_task,
                        },
                    );
                    session.mark_connected();
                }
                Err(e) => {
                    warn!("connect to {} failed: {}", peer_id, e);
                    session.mark_failed();
                }
            }
        }
    }

    fn teardown(&mut self, peer_id: &str, reason: &str) {
        warn!("stopping client for {}: {}", peer_id, reason);
        if let Some(link) = self.links.remove(peer_id) {
            link.reader_task.abort();
        }
        if let Some(session) = self.state.session(peer_id) {
            session.mark_failed();
        }
    }

    // =========================================================================
    // PER-TICK WORK
    // =========================================================================

    async fn tick(&mut self) {
        // Randomized traversal so no peer can starve the others.
        let mut order: Vec<PeerId> = self.links.keys().cloned().collect();
        order.shuffle(&mut rand::thread_rng());

        for peer_id in order {
            let Some(session) = self.state.session(&peer_id) else {
                self.teardown(&peer_id, "session vanished");
                continue;
            };
            if session.state() != SessionState::Connected {
                self.teardown(&peer_id, "session no longer connected");
                continue;
            }
            if session.liveness_expired() {
                self.teardown(&peer_id, "haven't seen communications");
                continue;
            }
            if let Err(e) = self.peer_tick(&peer_id, &session).await {
                self.teardown(&peer_id, &e.to_string());
            }
        }
    }

    async fn peer_tick(&mut self, peer_id: &str, session: &Arc<Session>) -> io::Result<()> {
        // High and medium drain fully.
        while let Some(data) = session.pop(Priority::High) {
            self.send(peer_id, &data).await?;
        }
        while let Some(data) = session.pop(Priority::Medium) {
            self.send(peer_id, &data).await?;
        }

        // One file-queue send, paced so chunk requests slow down as the
        // download rate approaches its cap.
        if Instant::now() >= self.next_file_send && self.below_download_cap() {
            if let Some(data) = session.pop(Priority::File) {
                self.send(peer_id, &data).await?;
                self.next_file_send = Instant::now() + self.file_send_delay();
            }
        }

        // One low-priority send, only while uploads are under the cap.
        if self.below_upload_cap() {
            if let Some(data) = session.pop(Priority::Low) {
                self.send(peer_id, &data).await?;
            }
        }

        // Heartbeat.
        if session.rollcall_due() {
            debug!("rollcall to {}", peer_id);
            let data = self.commands.request_rollcall();
            self.send(peer_id, &data).await?;
            session.schedule_rollcall();
        }

        // Receive drain.
        let link = self
            .links
            .get_mut(peer_id)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "link missing"))?;
        loop {
            match link.incoming.try_recv() {
                Ok(frame) => {
                    self.state.download_limiter.add(frame.len());
                    session.mark_reply();
                    if let Some(follow_up) = self.commands.process_reply(peer_id, &frame) {
                        session.enqueue(Priority::Medium, follow_up);
                    }
                }
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    return Err(io::Error::new(io::ErrorKind::ConnectionReset, "reader gone"));
                }
            }
        }

        Ok(())
    }

    async fn send(&mut self, peer_id: &str, data: &[u8]) -> io::Result<()> {
        let link = self
            .links
            .get_mut(peer_id)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "link missing"))?;
        link.writer.write(data).await?;
        self.state.upload_limiter.add(data.len());
        Ok(())
    }

    fn below_upload_cap(&self) -> bool {
        match self.state.settings.read().unwrap().upload_cap_bytes() {
            Some(cap) => self.state.upload_limiter.rate() < cap,
            None => true,
        }
    }

    fn below_download_cap(&self) -> bool {
        match self.state.settings.read().unwrap().download_cap_bytes() {
            Some(cap) => self.state.download_limiter.rate() < cap,
            None => true,
        }
    }

    /// Pacing between chunk requests: the base interval scaled by how
    /// much of the download cap is already in use.
    fn file_send_delay(&self) -> Duration {
        let delay = match self.state.settings.read().unwrap().download_cap_bytes() {
            Some(cap) if cap > 0.0 => {
                let utilization = self.state.download_limiter.rate() / cap;
                FILE_REQUEST_INTERVAL.mul_f64(utilization)
            }
            _ => FILE_REQUEST_INTERVAL_FLOOR,
        };
        delay.max(FILE_REQUEST_INTERVAL_FLOOR)
    }
}

async fn connect_peer(
    hostname: &str,
    port: u16,
    pair: &KeyPair,
    server_key: PublicKeyBytes,
) -> Result<EncryptedStream, String> {
    let mut addrs = tokio::net::lookup_host((hostname, port))
        .await
        .map_err(|e| format!("resolve {hostname}: {e}"))?;
    let addr = addrs
        .next()
        .ok_or_else(|| format!("resolve {hostname}: no addresses"))?;
    let stream = TcpStream::connect(addr)
        .await
        .map_err(|e| format!("connect {addr}: {e}"))?;
    EncryptedStream::connect(stream, pair, server_key)
        .await
        .map_err(|e| format!("handshake with {addr}: {e}"))
}

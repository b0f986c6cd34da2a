//! The request/reply command layer.
//!
//! For every exchange this module holds the three sides of the
//! conversation: building the request (caller), building the reply
//! (callee), and digesting the reply (caller, possibly producing a
//! follow-up request). [`Commands::process_request`] is the server
//! engine's dispatch; [`Commands::process_reply`] is the client
//! engine's. Anything malformed is logged and swallowed — a bad frame
//! never takes a loop down.

use crate::codec::{
    ChunkStatus, Command, DecodeError, ListingStatus, Packet, PacketBody, PeerCert, Response,
};
use crate::node::SharedState;
use crate::settings::PeerRecord;
use crate::shares;
use crate::transfer::{ChunkAck, IncomingChunk, OutgoingChunkRequest};
use crate::types::{PeerId, valid_chat_text, valid_identity, valid_nickname};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct Commands {
    state: Arc<SharedState>,
}

impl Commands {
    pub fn new(state: Arc<SharedState>) -> Self {
        Self { state }
    }

    fn local_id(&self) -> PeerId {
        self.state.settings.read().unwrap().local_id.clone()
    }

    // =========================================================================
    // REQUEST BUILDERS (caller side)
    // =========================================================================

    pub fn request_rollcall(&self) -> Vec<u8> {
        Packet::request(&self.local_id(), Command::Rollcall).encode()
    }

    pub fn request_certs(&self, peers: Vec<PeerId>) -> Vec<u8> {
        Packet::request(&self.local_id(), Command::Certs { peers }).encode()
    }

    pub fn request_chat(&self, timestamp: u64, text: &str) -> Vec<u8> {
        Packet::request(
            &self.local_id(),
            Command::Chat {
                timestamp,
                text: text.to_string(),
            },
        )
        .encode()
    }

    pub fn request_share_listing(&self, share_dir: &str, results_id: &str) -> Vec<u8> {
        Packet::request(
            &self.local_id(),
            Command::ShareListing {
                share_dir: share_dir.to_string(),
                results_id: results_id.to_string(),
            },
        )
        .encode()
    }

    pub fn request_get_file_chunk(
        &self,
        share_dir: &str,
        file_name: &str,
        offset: u64,
        chunk_id: &str,
    ) -> Vec<u8> {
        Packet::request(
            &self.local_id(),
            Command::GetFileChunk {
                share_dir: share_dir.to_string(),
                file_name: file_name.to_string(),
                offset,
                chunk_id: chunk_id.to_string(),
            },
        )
        .encode()
    }

    pub fn request_give_file_chunk(&self, chunk_id: &str, data: Vec<u8>) -> Vec<u8> {
        Packet::request(
            &self.local_id(),
            Command::GiveFileChunk {
                chunk_id: chunk_id.to_string(),
                data,
            },
        )
        .encode()
    }

    // =========================================================================
    // SERVER DISPATCH
    // =========================================================================

    /// Handle one inbound request frame. Returns the sender's identity
    /// (when one could be established) and the serialized reply (when one
    /// should be sent).
    pub fn process_request(&self, data: &[u8]) -> (Option<PeerId>, Option<Vec<u8>>) {
        let packet = match Packet::decode(data) {
            Ok(p) => p,
            Err(e) => {
                warn!("dropping undecodable request: {}", e);
                return (None, None);
            }
        };
        let identity = packet.identity.clone();
        debug!("request {} from {}", packet.command_name(), identity);
        let PacketBody::Request(command) = packet.body else {
            warn!("{} sent a reply on the request channel", identity);
            return (Some(identity), None);
        };

        let response = match command {
            Command::Rollcall => self.reply_rollcall(),
            Command::Certs { peers } => self.reply_certs(&identity, peers),
            Command::Chat { timestamp, text } => self.reply_chat(&identity, timestamp, &text),
            Command::ShareListing {
                share_dir,
                results_id,
            } => self.reply_share_listing(&share_dir, &results_id),
            Command::GetFileChunk {
                share_dir,
                file_name,
                offset,
                chunk_id,
            } => self.reply_get_file_chunk(&identity, share_dir, file_name, offset, chunk_id),
            Command::GiveFileChunk { chunk_id, data } => {
                self.reply_give_file_chunk(&identity, chunk_id, data)
            }
        };

        match response {
            Some(r) => (
                Some(identity.clone()),
                Some(Packet::reply(&self.local_id(), r).encode()),
            ),
            None => (Some(identity), None),
        }
    }

    // =========================================================================
    // REPLY BUILDERS (callee side)
    // =========================================================================

    fn reply_rollcall(&self) -> Option<Response> {
        let nickname = self.state.settings.read().unwrap().nickname.clone();
        Some(Response::Rollcall {
            nickname,
            reachable: self.state.reachable_peers(),
        })
    }

    /// Return the records we hold for the requested ids. The requester's
    /// own record is never echoed back.
    fn reply_certs(&self, requester: &str, wanted: Vec<PeerId>) -> Option<Response> {
        let settings = self.state.settings.read().unwrap();
        let mut peers = BTreeMap::new();
        for id in wanted {
            if id == requester {
                continue;
            }
            if let Some(record) = settings.peers.get(&id) {
                peers.insert(
                    id,
                    PeerCert {
                        nickname: record.nickname.clone(),
                        hostname: record.hostname.clone(),
                        port: record.port,
                        clientkey: record.clientkey.clone(),
                        serverkey: record.serverkey.clone(),
                        dynamic: record.dynamic,
                    },
                );
            }
        }
        Some(Response::Certs { peers })
    }

    fn reply_chat(&self, peer_id: &str, timestamp: u64, text: &str) -> Option<Response> {
        if !valid_chat_text(text) {
            warn!("{} sent an invalid chat line, ignoring", peer_id);
            return Some(Response::Chat);
        }
        self.state.chat.append(peer_id, timestamp, text);
        Some(Response::Chat)
    }

    fn reply_share_listing(&self, share_dir: &str, results_id: &str) -> Option<Response> {
        let shares = self.state.settings.read().unwrap().shares.clone();
        let (result, entries, message) = shares::list_virtual_dir(&shares, share_dir);
        if result == ListingStatus::Error {
            info!("refused listing of {:?}: {}", share_dir, message);
        }
        Some(Response::ShareListing {
            result,
            share_dir: share_dir.to_string(),
            results_id: results_id.to_string(),
            entries,
            message,
        })
    }

    /// Ack immediately; the chunk itself travels later as a
    /// give-file-chunk request built by the coordinator.
    fn reply_get_file_chunk(
        &self,
        peer_id: &str,
        share_dir: String,
        file_name: String,
        offset: u64,
        chunk_id: String,
    ) -> Option<Response> {
        let ok = self
            .state
            .transfer_tx
            .outgoing
            .send(OutgoingChunkRequest {
                peer_id: peer_id.to_string(),
                share_dir,
                file_name,
                offset,
                chunk_id: chunk_id.clone(),
            })
            .is_ok();
        self.state.wake_transfer.notify_one();
        Some(Response::GetFileChunk {
            chunk_id,
            status: if ok { ChunkStatus::Ok } else { ChunkStatus::Error },
        })
    }

    fn reply_give_file_chunk(
        &self,
        peer_id: &str,
        chunk_id: String,
        data: Vec<u8>,
    ) -> Option<Response> {
        debug!("chunk {} arrived from {} ({} bytes)", chunk_id, peer_id, data.len());
        let _ = self.state.transfer_tx.incoming.send(IncomingChunk {
            peer_id: peer_id.to_string(),
            chunk_id,
            data,
        });
        self.state.wake_transfer.notify_one();
        Some(Response::GiveFileChunk)
    }

    // =========================================================================
    // CLIENT DISPATCH
    // =========================================================================

    /// Digest one inbound reply frame. May return a follow-up request to
    /// enqueue at medium priority.
    pub fn process_reply(&self, peer_id: &str, data: &[u8]) -> Option<Vec<u8>> {
        let packet = match Packet::decode(data) {
            Ok(p) => p,
            Err(e) => {
                if !matches!(e, DecodeError::Malformed(_)) {
                    warn!("dropping undecodable reply from {}: {}", peer_id, e);
                } else {
                    debug!("bad reply from {}: {}", peer_id, e);
                }
                return None;
            }
        };
        let PacketBody::Reply(response) = packet.body else {
            warn!("{} sent a request on the reply channel", peer_id);
            return None;
        };

        match response {
            Response::Rollcall {
                nickname,
                reachable,
            } => self.process_reply_rollcall(peer_id, nickname, reachable),
            Response::Certs { peers } => {
                self.process_reply_certs(peer_id, peers);
                None
            }
            Response::ShareListing {
                result,
                share_dir,
                results_id,
                entries,
                message,
            } => {
                self.process_reply_share_listing(
                    peer_id, result, &share_dir, &results_id, entries, &message,
                );
                None
            }
            Response::GetFileChunk { chunk_id, status } => {
                let _ = self.state.transfer_tx.ack.send(ChunkAck {
                    peer_id: peer_id.to_string(),
                    chunk_id,
                    ok: status == ChunkStatus::Ok,
                });
                self.state.wake_transfer.notify_one();
                None
            }
            Response::Chat | Response::GiveFileChunk => None,
        }
    }

    /// Heartbeat answer: maybe learn a nickname, and turn unknown gossiped
    /// ids into a certs request. This is the discovery mechanism.
    fn process_reply_rollcall(
        &self,
        peer_id: &str,
        nickname: String,
        reachable: Vec<PeerId>,
    ) -> Option<Vec<u8>> {
        let mut unknown = Vec::new();
        {
            let mut settings = self.state.settings.write().unwrap();
            let local_id = settings.local_id.clone();
            let mut dirty = false;

            if let Some(record) = settings.peers.get_mut(peer_id) {
                if record.nickname != nickname {
                    if valid_nickname(&nickname) {
                        info!("{} is now known as {:?}", peer_id, nickname);
                        record.nickname = nickname;
                        dirty = true;
                    } else {
                        debug!("{} reported an invalid nickname, keeping the old one", peer_id);
                    }
                }
            }

            for id in reachable {
                if valid_identity(&id) && id != local_id && !settings.peers.contains_key(&id) {
                    unknown.push(id);
                }
            }

            if dirty {
                self.state.save_settings(&settings);
            }
        }

        if unknown.is_empty() {
            None
        } else {
            debug!("asking {} about {} unknown peers", peer_id, unknown.len());
            Some(self.request_certs(unknown))
        }
    }

    /// Discovery answers: add new peers disabled; never silently rewrite
    /// an existing record.
    fn process_reply_certs(&self, peer_id: &str, peers: BTreeMap<PeerId, PeerCert>) {
        let mut settings = self.state.settings.write().unwrap();
        let local_id = settings.local_id.clone();
        let mut dirty = false;

        for (id, cert) in peers {
            if !valid_identity(&id) || id == local_id {
                continue;
            }
            match settings.peers.get(&id) {
                None => {
                    info!(
                        "discovered peer {} ({:?} @ {}:{}) via {}, awaiting approval",
                        id, cert.nickname, cert.hostname, cert.port, peer_id
                    );
                    settings.peers.insert(
                        id,
                        PeerRecord {
                            hostname: cert.hostname,
                            port: cert.port,
                            enabled: false,
                            dynamic: cert.dynamic,
                            localnick: String::new(),
                            nickname: cert.nickname,
                            clientkey: cert.clientkey,
                            serverkey: cert.serverkey,
                        },
                    );
                    dirty = true;
                }
                Some(existing) => {
                    if existing.hostname != cert.hostname
                        || existing.port != cert.port
                        || existing.clientkey != cert.clientkey
                        || existing.serverkey != cert.serverkey
                    {
                        warn!(
                            "{} reported diverging record for {}, keeping ours",
                            peer_id, id
                        );
                    }
                }
            }
        }

        if dirty {
            self.state.save_settings(&settings);
        }
    }

    fn process_reply_share_listing(
        &self,
        peer_id: &str,
        result: ListingStatus,
        share_dir: &str,
        results_id: &str,
        entries: Vec<crate::codec::ShareEntry>,
        message: &str,
    ) {
        if result == ListingStatus::Error {
            warn!("{} refused listing of {:?}: {}", peer_id, share_dir, message);
            return;
        }
        if !self.state.listings.store(peer_id, share_dir, results_id, entries) {
            warn!("unsolicited listing result from {} for {:?}", peer_id, share_dir);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::Share;
    use crate::types::fresh_id;
    use std::path::PathBuf;

    fn test_state() -> Arc<SharedState> {
        let dir = std::env::temp_dir().join(format!("taconet_cmd_{}", fresh_id()));
        std::fs::create_dir_all(&dir).unwrap();
        SharedState::for_tests(&dir)
    }

    fn peer_record(enabled: bool) -> PeerRecord {
        PeerRecord {
            hostname: "127.0.0.1".into(),
            port: 5440,
            enabled,
            dynamic: false,
            localnick: String::new(),
            nickname: "old-nick".into(),
            clientkey: "aa".repeat(32),
            serverkey: "bb".repeat(32),
        }
    }

    #[test]
    fn garbage_requests_produce_no_reply() {
        let commands = Commands::new(test_state());
        let (identity, reply) = commands.process_request(&[1, 2, 3, 4]);
        assert!(identity.is_none());
        assert!(reply.is_none());
    }

    #[test]
    fn rollcall_round_trip_reports_nickname() {
        let state = test_state();
        state.settings.write().unwrap().nickname = "testnode".into();
        let commands = Commands::new(state);

        let request = commands.request_rollcall();
        let (identity, reply) = commands.process_request(&request);
        assert!(identity.is_some());
        let packet = Packet::decode(&reply.unwrap()).unwrap();
        match packet.body {
            PacketBody::Reply(Response::Rollcall { nickname, reachable }) => {
                assert_eq!(nickname, "testnode");
                assert!(reachable.is_empty());
            }
            other => panic!("unexpected reply {other:?}"),
        }
    }

    #[test]
    fn rollcall_reply_discovers_unknown_peers() {
        let state = test_state();
        let known = fresh_id();
        state
            .settings
            .write()
            .unwrap()
            .peers
            .insert(known.clone(), peer_record(true));
        let local = state.settings.read().unwrap().local_id.clone();
        let commands = Commands::new(state);

        let stranger = fresh_id();
        let reply = Packet::reply(
            &known,
            Response::Rollcall {
                nickname: "friendly".into(),
                // Our own id and the already-known id must be filtered out.
                reachable: vec![stranger.clone(), known.clone(), local, "bogus".into()],
            },
        )
        .encode();

        let follow_up = commands.process_reply(&known, &reply).unwrap();
        let packet = Packet::decode(&follow_up).unwrap();
        match packet.body {
            PacketBody::Request(Command::Certs { peers }) => {
                assert_eq!(peers, vec![stranger]);
            }
            other => panic!("unexpected follow-up {other:?}"),
        }
    }

    #[test]
    fn rollcall_reply_learns_valid_nicknames() {
        let state = test_state();
        let peer = fresh_id();
        state
            .settings
            .write()
            .unwrap()
            .peers
            .insert(peer.clone(), peer_record(true));
        let commands = Commands::new(state.clone());

        let reply = Packet::reply(
            &peer,
            Response::Rollcall {
                nickname: "new nick".into(),
                reachable: vec![],
            },
        )
        .encode();
        commands.process_reply(&peer, &reply);
        assert_eq!(
            state.settings.read().unwrap().peers[&peer].nickname,
            "new nick"
        );

        // Invalid names are refused.
        let reply = Packet::reply(
            &peer,
            Response::Rollcall {
                nickname: "x".into(),
                reachable: vec![],
            },
        )
        .encode();
        commands.process_reply(&peer, &reply);
        assert_eq!(
            state.settings.read().unwrap().peers[&peer].nickname,
            "new nick"
        );
    }

    #[test]
    fn certs_reply_adds_peers_disabled_and_never_mutates() {
        let state = test_state();
        let known = fresh_id();
        state
            .settings
            .write()
            .unwrap()
            .peers
            .insert(known.clone(), peer_record(true));
        let commands = Commands::new(state.clone());

        let newcomer = fresh_id();
        let mut peers = BTreeMap::new();
        peers.insert(
            newcomer.clone(),
            PeerCert {
                nickname: "somebody".into(),
                hostname: "far.example".into(),
                port: 7000,
                clientkey: "cc".repeat(32),
                serverkey: "dd".repeat(32),
                dynamic: true,
            },
        );
        // A diverging record for the known peer must be ignored.
        peers.insert(
            known.clone(),
            PeerCert {
                nickname: "evil".into(),
                hostname: "evil.example".into(),
                port: 6666,
                clientkey: "ee".repeat(32),
                serverkey: "ff".repeat(32),
                dynamic: false,
            },
        );

        let reply = Packet::reply(&known, Response::Certs { peers }).encode();
        commands.process_reply(&known, &reply);

        let settings = state.settings.read().unwrap();
        let added = &settings.peers[&newcomer];
        assert!(!added.enabled);
        assert_eq!(added.hostname, "far.example");
        assert!(added.dynamic);
        let kept = &settings.peers[&known];
        assert_eq!(kept.hostname, "127.0.0.1");
        assert_eq!(kept.port, 5440);
    }

    #[test]
    fn certs_request_omits_the_requester() {
        let state = test_state();
        let requester = fresh_id();
        let other = fresh_id();
        {
            let mut settings = state.settings.write().unwrap();
            settings.peers.insert(requester.clone(), peer_record(true));
            settings.peers.insert(other.clone(), peer_record(false));
        }
        let commands = Commands::new(state);

        let request = Packet::request(
            &requester,
            Command::Certs {
                peers: vec![requester.clone(), other.clone()],
            },
        )
        .encode();
        let (_, reply) = commands.process_request(&request);
        let packet = Packet::decode(&reply.unwrap()).unwrap();
        match packet.body {
            PacketBody::Reply(Response::Certs { peers }) => {
                assert!(!peers.contains_key(&requester));
                assert!(peers.contains_key(&other));
            }
            other => panic!("unexpected reply {other:?}"),
        }
    }

    #[test]
    fn chat_request_appends_with_sender_identity() {
        let state = test_state();
        let commands = Commands::new(state.clone());
        let peer = fresh_id();

        let request = Packet::request(
            &peer,
            Command::Chat {
                timestamp: 42,
                text: "hello".into(),
            },
        )
        .encode();
        let v0 = state.chat.version();
        let (_, reply) = commands.process_request(&request);
        assert!(reply.is_some());
        assert_ne!(state.chat.version(), v0);
        let entries = state.chat.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].sender, peer);
        assert_eq!(entries[0].text, "hello");
    }

    #[test]
    fn share_listing_rejects_traversal() {
        let state = test_state();
        let dir = std::env::temp_dir().join(format!("taconet_share_cmd_{}", fresh_id()));
        std::fs::create_dir_all(&dir).unwrap();
        state
            .settings
            .write()
            .unwrap()
            .shares
            .push(Share("docs".into(), PathBuf::from(&dir)));
        let commands = Commands::new(state);

        let peer = fresh_id();
        let request = Packet::request(
            &peer,
            Command::ShareListing {
                share_dir: "/docs/../etc".into(),
                results_id: fresh_id(),
            },
        )
        .encode();
        let (_, reply) = commands.process_request(&request);
        let packet = Packet::decode(&reply.unwrap()).unwrap();
        match packet.body {
            PacketBody::Reply(Response::ShareListing { result, message, .. }) => {
                assert_eq!(result, ListingStatus::Error);
                assert!(!message.is_empty());
            }
            other => panic!("unexpected reply {other:?}"),
        }
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn get_file_chunk_is_acked_and_forwarded() {
        let state = test_state();
        let commands = Commands::new(state.clone());
        let peer = fresh_id();
        let chunk = fresh_id();

        let request = Packet::request(
            &peer,
            Command::GetFileChunk {
                share_dir: "/docs".into(),
                file_name: "a.bin".into(),
                offset: 0,
                chunk_id: chunk.clone(),
            },
        )
        .encode();
        let (_, reply) = commands.process_request(&request);
        let packet = Packet::decode(&reply.unwrap()).unwrap();
        match packet.body {
            PacketBody::Reply(Response::GetFileChunk { chunk_id, status }) => {
                assert_eq!(chunk_id, chunk);
                assert_eq!(status, ChunkStatus::Ok);
            }
            other => panic!("unexpected reply {other:?}"),
        }
    }
}

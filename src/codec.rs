//! Wire records.
//!
//! Every logical message is a [`Packet`]: the sender's identity plus either
//! a request [`Command`] or a [`Response`]. Encoding is postcard — varint
//! lengths, no self-allocation surprises on hostile input. The command set
//! is a closed enumeration; dispatch is a match, not a table.

use crate::constants::MAX_FRAME_SIZE;
use crate::types::{PeerId, valid_identity};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed packet: {0}")]
    Malformed(#[from] postcard::Error),

    #[error("oversized packet: {0} bytes")]
    Oversized(usize),

    #[error("invalid sender identity {0:?}")]
    BadIdentity(String),
}

/// Peer record as exchanged by the certs command:
/// everything needed to provision a newly discovered peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerCert {
    pub nickname: String,
    pub hostname: String,
    pub port: u16,
    pub clientkey: String,
    pub serverkey: String,
    pub dynamic: bool,
}

/// One entry of a share listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareEntry {
    pub name: String,
    /// Virtual path ("/share/sub/dir"); local paths never cross the wire.
    pub path: String,
    pub kind: EntryKind,
    pub size: u64,
    pub mtime: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    Dir,
    File,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ListingStatus {
    Ok,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChunkStatus {
    Ok,
    Error,
}

/// Requests, caller → callee.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    /// Heartbeat; doubles as the discovery gossip carrier.
    Rollcall,
    /// Ask for the records of the listed peer ids.
    Certs { peers: Vec<PeerId> },
    /// Fan-out chat line.
    Chat { timestamp: u64, text: String },
    /// Ask for a directory listing under a virtual share path.
    ShareListing { share_dir: String, results_id: String },
    /// Ask the callee to send one chunk of a shared file.
    GetFileChunk {
        share_dir: String,
        file_name: String,
        offset: u64,
        chunk_id: String,
    },
    /// Carry chunk bytes back to the downloader.
    GiveFileChunk { chunk_id: String, data: Vec<u8> },
}

/// Replies, callee → caller, paired one-to-one with [`Command`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    Rollcall {
        nickname: String,
        /// Peers the callee has heard from within the rollcall timeout.
        reachable: Vec<PeerId>,
    },
    Certs {
        peers: BTreeMap<PeerId, PeerCert>,
    },
    Chat,
    ShareListing {
        result: ListingStatus,
        share_dir: String,
        results_id: String,
        entries: Vec<ShareEntry>,
        message: String,
    },
    GetFileChunk {
        chunk_id: String,
        status: ChunkStatus,
    },
    GiveFileChunk,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PacketBody {
    Request(Command),
    Reply(Response),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Packet {
    pub identity: PeerId,
    pub body: PacketBody,
}

impl Packet {
    pub fn request(identity: &str, command: Command) -> Self {
        Self {
            identity: identity.to_string(),
            body: PacketBody::Request(command),
        }
    }

    pub fn reply(identity: &str, response: Response) -> Self {
        Self {
            identity: identity.to_string(),
            body: PacketBody::Reply(response),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        // Packets are built from our own typed data; serialization cannot
        // fail for these shapes.
        postcard::to_allocvec(self).unwrap_or_default()
    }

    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        if data.len() > MAX_FRAME_SIZE {
            return Err(DecodeError::Oversized(data.len()));
        }
        let packet: Packet = postcard::from_bytes(data)?;
        if !valid_identity(&packet.identity) {
            return Err(DecodeError::BadIdentity(packet.identity));
        }
        Ok(packet)
    }

    /// Short name of the carried command, for logs.
    pub fn command_name(&self) -> &'static str {
        match &self.body {
            PacketBody::Request(c) => match c {
                Command::Rollcall => "rollcall",
                Command::Certs { .. } => "certs",
                Command::Chat { .. } => "chat",
                Command::ShareListing { .. } => "share-listing",
                Command::GetFileChunk { .. } => "get-file-chunk",
                Command::GiveFileChunk { .. } => "give-file-chunk",
            },
            PacketBody::Reply(r) => match r {
                Response::Rollcall { .. } => "rollcall-reply",
                Response::Certs { .. } => "certs-reply",
                Response::Chat => "chat-reply",
                Response::ShareListing { .. } => "share-listing-reply",
                Response::GetFileChunk { .. } => "get-file-chunk-reply",
                Response::GiveFileChunk => "give-file-chunk-reply",
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::fresh_id;

    fn sample_packets() -> Vec<Packet> {
        let id = fresh_id();
        vec![
            Packet::request(&id, Command::Rollcall),
            Packet::request(
                &id,
                Command::Certs {
                    peers: vec![fresh_id(), fresh_id()],
                },
            ),
            Packet::request(
                &id,
                Command::Chat {
                    timestamp: 1_700_000_000,
                    text: "hello out there".into(),
                },
            ),
            Packet::request(
                &id,
                Command::GetFileChunk {
                    share_dir: "/docs".into(),
                    file_name: "report.pdf".into(),
                    offset: 131_072,
                    chunk_id: fresh_id(),
                },
            ),
            Packet::request(
                &id,
                Command::GiveFileChunk {
                    chunk_id: fresh_id(),
                    data: vec![7u8; 1024],
                },
            ),
            Packet::reply(
                &id,
                Response::Rollcall {
                    nickname: "scott".into(),
                    reachable: vec![fresh_id()],
                },
            ),
            Packet::reply(
                &id,
                Response::ShareListing {
                    result: ListingStatus::Ok,
                    share_dir: "/docs".into(),
                    results_id: fresh_id(),
                    entries: vec![ShareEntry {
                        name: "report.pdf".into(),
                        path: "/docs/report.pdf".into(),
                        kind: EntryKind::File,
                        size: 400 * 1024,
                        mtime: 1_700_000_000,
                    }],
                    message: String::new(),
                },
            ),
            Packet::reply(
                &id,
                Response::GetFileChunk {
                    chunk_id: fresh_id(),
                    status: ChunkStatus::Ok,
                },
            ),
        ]
    }

    #[test]
    fn every_packet_round_trips() {
        for packet in sample_packets() {
            let decoded = Packet::decode(&packet.encode()).unwrap();
            assert_eq!(packet, decoded);
        }
    }

    #[test]
    fn truncated_data_fails() {
        let data = Packet::request(&fresh_id(), Command::Rollcall).encode();
        assert!(matches!(
            Packet::decode(&data[..data.len() - 1]),
            Err(DecodeError::Malformed(_))
        ));
    }

    #[test]
    fn garbage_fails() {
        assert!(Packet::decode(&[0xff, 0xff, 0xff, 0xff]).is_err());
    }

    #[test]
    fn bad_identity_is_rejected() {
        let packet = Packet::request("not-a-peer-id", Command::Rollcall);
        assert!(matches!(
            Packet::decode(&packet.encode()),
            Err(DecodeError::BadIdentity(_))
        ));
    }
}

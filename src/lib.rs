//! TacoNET: a friend-to-friend overlay for chat and file sharing.
//!
//! Every node is simultaneously a server (answering requests from known
//! peers) and a client (dialing every enabled peer). Trust is a
//! whitelist: a peer exists only once its public keys are provisioned.

pub mod chat;
pub mod codec;
pub mod commands;
pub mod constants;
pub mod keystore;
pub mod limiter;
pub mod net;
pub mod node;
pub mod settings;
pub mod shares;
pub mod transfer;
pub mod types;

pub use chat::{ChatEntry, ChatLog};
pub use codec::{Command, DecodeError, Packet, PacketBody, Response};
pub use commands::Commands;
pub use keystore::{KeyPair, KeyStore, KeyStoreError};
pub use limiter::RateCounter;
pub use net::{ClientEngine, Priority, ServerEngine, Session, SessionState};
pub use node::{Node, NodeError, PeerStatus, SharedState, ThreadStatus};
pub use settings::{PeerRecord, Settings, SettingsError, Share};
pub use transfer::{CompletedDownload, Coordinator, DownloadQueue, QueuedDownload};
pub use types::{PeerId, now};

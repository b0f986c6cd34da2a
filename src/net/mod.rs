//! Peer networking: transport, per-peer sessions, and the two engines.

pub mod authenticator;
pub mod client;
pub mod encrypted;
pub mod handshake;
pub mod server;
pub mod session;

pub use authenticator::Authenticator;
pub use client::ClientEngine;
pub use encrypted::{EncryptedError, EncryptedReader, EncryptedStream, EncryptedWriter};
pub use handshake::{HandshakeError, Initiator, Responder, SessionKeys};
pub use server::ServerEngine;
pub use session::{Priority, Session, SessionState, SessionStatus};

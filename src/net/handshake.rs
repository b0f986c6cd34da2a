//! CURVE-style mutual-authentication handshake.
//!
//! Both sides hold long-term x25519 pairs; the connecting side knows the
//! listening side's public key in advance, and the listening side accepts
//! only client keys present in its whitelist. Two messages negotiate the
//! session:
//!
//! ```text
//! initiator -> responder:  e_i  ||  seal(k_auth1, S_i_pub)
//! responder -> initiator:  e_r  ||  seal(k_auth2, [])
//! ```
//!
//! `k_auth1` needs DH(e_i, S_r): only the real server can read message 1,
//! which carries the initiator's long-term key for whitelisting.
//! `k_auth2` mixes DH(e_i, S_r), DH(e_i, e_r) and DH(S_i, e_r): producing
//! it proves possession of the server secret, and verifying it binds the
//! initiator's long-term key into the session. The directional transport
//! keys hash in the whole transcript.
//!
//! This is the key-exchange core only; framing and timeouts live in
//! [`super::encrypted`].

use crate::keystore::KeyPair;
use crate::types::PublicKeyBytes;
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::rngs::OsRng;
use sha3::{Digest, Sha3_256};
use thiserror::Error;
use x25519_dalek::{PublicKey, StaticSecret};

/// Domain separator; changing it breaks wire compatibility on purpose.
const PROTOCOL_NAME: &[u8] = b"taconet-curve-x25519-sha3-chacha20poly1305";

/// initiator ephemeral (32) + sealed static key (32 + 16 tag)
pub const MSG1_LEN: usize = 80;
/// responder ephemeral (32) + tag-only box (16)
pub const MSG2_LEN: usize = 48;

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("handshake message has wrong length")]
    BadLength,

    #[error("handshake authentication failed")]
    AuthFailed,
}

/// Directional session keys. `send`/`recv` are already oriented for the
/// side that produced them.
pub struct SessionKeys {
    pub send: [u8; 32],
    pub recv: [u8; 32],
}

fn hash(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha3_256::new();
    for p in parts {
        hasher.update(p);
    }
    hasher.finalize().into()
}

fn seal(key: &[u8; 32], plaintext: &[u8], aad: &[u8; 32]) -> Vec<u8> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    // Fresh key per handshake message, so the all-zero nonce is single-use.
    cipher
        .encrypt(&Nonce::default(), Payload { msg: plaintext, aad })
        .unwrap_or_default()
}

fn open(key: &[u8; 32], ciphertext: &[u8], aad: &[u8; 32]) -> Result<Vec<u8>, HandshakeError> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .decrypt(
            &Nonce::default(),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| HandshakeError::AuthFailed)
}

fn derive_keys(master: &[u8; 32], transcript: &[u8; 32]) -> ([u8; 32], [u8; 32]) {
    let i2r = hash(&[b"i2r", master, transcript]);
    let r2i = hash(&[b"r2i", master, transcript]);
    (i2r, r2i)
}

/// Connecting side of the handshake.
pub struct Initiator {
    ephemeral: StaticSecret,
    ephemeral_pub: PublicKeyBytes,
    static_pair: KeyPair,
    server_static: PublicKeyBytes,
}

impl Initiator {
    pub fn new(static_pair: &KeyPair, server_static: PublicKeyBytes) -> Self {
        let ephemeral = StaticSecret::random_from_rng(OsRng);
        let ephemeral_pub = PublicKey::from(&ephemeral).to_bytes();
        Self {
            ephemeral,
            ephemeral_pub,
            static_pair: static_pair.clone(),
            server_static,
        }
    }

    pub fn write_msg1(&self) -> Vec<u8> {
        let dh1 = self
            .ephemeral
            .diffie_hellman(&PublicKey::from(self.server_static));
        let k_auth1 = hash(&[b"auth1", dh1.as_bytes()]);
        let h1 = hash(&[PROTOCOL_NAME, &self.server_static, &self.ephemeral_pub]);

        let sealed = seal(&k_auth1, &self.static_pair.public(), &h1);
        let mut msg = Vec::with_capacity(MSG1_LEN);
        msg.extend_from_slice(&self.ephemeral_pub);
        msg.extend_from_slice(&sealed);
        msg
    }

    /// Verify message 2 and derive the session keys.
    pub fn read_msg2(self, msg1: &[u8], msg2: &[u8]) -> Result<SessionKeys, HandshakeError> {
        if msg2.len() != MSG2_LEN {
            return Err(HandshakeError::BadLength);
        }
        let server_eph: PublicKeyBytes = msg2[..32].try_into().unwrap();
        let tag_box = &msg2[32..];

        let dh1 = self
            .ephemeral
            .diffie_hellman(&PublicKey::from(self.server_static));
        let dh2 = self.ephemeral.diffie_hellman(&PublicKey::from(server_eph));
        let dh3 = self
            .static_pair
            .secret()
            .diffie_hellman(&PublicKey::from(server_eph));

        let master = hash(&[b"master", dh1.as_bytes(), dh2.as_bytes(), dh3.as_bytes()]);
        let h1 = hash(&[PROTOCOL_NAME, &self.server_static, &self.ephemeral_pub]);
        let h2 = hash(&[&h1, &msg1[32..], &server_eph]);

        let k_auth2 = hash(&[b"auth2", &master]);
        open(&k_auth2, tag_box, &h2)?;

        let transcript = hash(&[&h2, tag_box]);
        let (i2r, r2i) = derive_keys(&master, &transcript);
        Ok(SessionKeys {
            send: i2r,
            recv: r2i,
        })
    }
}

/// Listening side of the handshake.
pub struct Responder {
    ephemeral: StaticSecret,
    ephemeral_pub: PublicKeyBytes,
    static_pair: KeyPair,
}

/// Result of reading message 1: the initiator's long-term key (for the
/// whitelist check) plus what is needed to finish.
pub struct ResponderState {
    responder: Responder,
    msg1: Vec<u8>,
    pub initiator_static: PublicKeyBytes,
    initiator_eph: PublicKeyBytes,
}

impl Responder {
    pub fn new(static_pair: &KeyPair) -> Self {
        let ephemeral = StaticSecret::random_from_rng(OsRng);
        let ephemeral_pub = PublicKey::from(&ephemeral).to_bytes();
        Self {
            ephemeral,
            ephemeral_pub,
            static_pair: static_pair.clone(),
        }
    }

    /// Decrypt message 1 and recover the initiator's long-term key. The
    /// caller must check that key against the whitelist before answering.
    pub fn read_msg1(self, msg1: &[u8]) -> Result<ResponderState, HandshakeError> {
        if msg1.len() != MSG1_LEN {
            return Err(HandshakeError::BadLength);
        }
        let initiator_eph: PublicKeyBytes = msg1[..32].try_into().unwrap();
        let sealed = &msg1[32..];

        let dh1 = self
            .static_pair
            .secret()
            .diffie_hellman(&PublicKey::from(initiator_eph));
        let k_auth1 = hash(&[b"auth1", dh1.as_bytes()]);
        let h1 = hash(&[
            PROTOCOL_NAME,
            &self.static_pair.public(),
            &initiator_eph,
        ]);

        let opened = open(&k_auth1, sealed, &h1)?;
        let initiator_static: PublicKeyBytes =
            opened.try_into().map_err(|_| HandshakeError::BadLength)?;

        Ok(ResponderState {
            responder: self,
            msg1: msg1.to_vec(),
            initiator_static,
            initiator_eph,
        })
    }
}

impl ResponderState {
    /// Produce message 2 and the session keys.
    pub fn write_msg2(self) -> (Vec<u8>, SessionKeys) {
        let r = &self.responder;
        let dh1 = r
            .static_pair
            .secret()
            .diffie_hellman(&PublicKey::from(self.initiator_eph));
        let dh2 = r
            .ephemeral
            .diffie_hellman(&PublicKey::from(self.initiator_eph));
        let dh3 = r
            .ephemeral
            .diffie_hellman(&PublicKey::from(self.initiator_static));

        let master = hash(&[b"master", dh1.as_bytes(), dh2.as_bytes(), dh3.as_bytes()]);
        let h1 = hash(&[
            PROTOCOL_NAME,
            &r.static_pair.public(),
            &self.initiator_eph,
        ]);
        let h2 = hash(&[&h1, &self.msg1[32..], &r.ephemeral_pub]);

        let k_auth2 = hash(&[b"auth2", &master]);
        let tag_box = seal(&k_auth2, &[], &h2);

        let transcript = hash(&[&h2, &tag_box]);
        let (i2r, r2i) = derive_keys(&master, &transcript);

        let mut msg = Vec::with_capacity(MSG2_LEN);
        msg.extend_from_slice(&r.ephemeral_pub);
        msg.extend_from_slice(&tag_box);

        (
            msg,
            SessionKeys {
                send: r2i,
                recv: i2r,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_handshake_agrees_on_keys() {
        let client = KeyPair::generate();
        let server = KeyPair::generate();

        let initiator = Initiator::new(&client, server.public());
        let msg1 = initiator.write_msg1();

        let state = Responder::new(&server).read_msg1(&msg1).unwrap();
        assert_eq!(state.initiator_static, client.public());
        let (msg2, server_keys) = state.write_msg2();

        let client_keys = initiator.read_msg2(&msg1, &msg2).unwrap();
        assert_eq!(client_keys.send, server_keys.recv);
        assert_eq!(client_keys.recv, server_keys.send);
        assert_ne!(client_keys.send, client_keys.recv);
    }

    #[test]
    fn wrong_server_key_cannot_read_msg1() {
        let client = KeyPair::generate();
        let server = KeyPair::generate();
        let impostor = KeyPair::generate();

        // Client thinks it is talking to `server`; `impostor` answers.
        let initiator = Initiator::new(&client, server.public());
        let msg1 = initiator.write_msg1();
        assert!(matches!(
            Responder::new(&impostor).read_msg1(&msg1),
            Err(HandshakeError::AuthFailed)
        ));
    }

    #[test]
    fn impostor_server_cannot_finish_msg2() {
        let client = KeyPair::generate();
        let server = KeyPair::generate();
        let impostor = KeyPair::generate();

        let initiator = Initiator::new(&client, server.public());
        let msg1 = initiator.write_msg1();

        // An impostor who knows the client's public key still cannot build
        // a valid message 2 without the server secret. Re-seal msg1 toward
        // the impostor so it can parse one at all.
        let fake_msg1 = Initiator::new(&client, impostor.public()).write_msg1();
        let forged_state = Responder::new(&impostor).read_msg1(&fake_msg1);
        let (forged_msg2, _) = forged_state.unwrap().write_msg2();

        assert!(matches!(
            initiator.read_msg2(&msg1, &forged_msg2),
            Err(HandshakeError::AuthFailed)
        ));
    }

    #[test]
    fn short_messages_are_rejected() {
        let client = KeyPair::generate();
        let server = KeyPair::generate();
        assert!(matches!(
            Responder::new(&server).read_msg1(&[0u8; 10]),
            Err(HandshakeError::BadLength)
        ));
        let initiator = Initiator::new(&client, server.public());
        let msg1 = initiator.write_msg1();
        assert!(matches!(
            initiator.read_msg2(&msg1, &[0u8; 5]),
            Err(HandshakeError::BadLength)
        ));
    }
}

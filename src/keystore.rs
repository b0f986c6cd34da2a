//! Long-term key management.
//!
//! Layout under the certificate store root:
//!
//! ```text
//! {store}/{local-id}/private/taconet-client.key_secret   32 raw bytes
//! {store}/{local-id}/private/taconet-server.key_secret   32 raw bytes
//! {store}/{local-id}/public/{peer-id}-client.key         hex text
//! {store}/{local-id}/public/{peer-id}-server.key         hex text
//! ```
//!
//! The private directory holds this node's two x25519 pairs, generated on
//! first start. The public directory mirrors the peer table: after
//! [`KeyStore::reconcile`] it contains exactly one client and one server key
//! file per enabled peer. The server's authenticator treats that directory
//! as its whitelist.

use crate::constants::{
    KEY_CLIENT_PUBLIC_SUFFIX, KEY_CLIENT_SECRET_SUFFIX, KEY_FILE_PREFIX,
    KEY_SERVER_PUBLIC_SUFFIX, KEY_SERVER_SECRET_SUFFIX,
};
use crate::settings::PeerRecord;
use crate::types::{PeerId, PublicKeyBytes};
use rand::rngs::OsRng;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};
use x25519_dalek::{PublicKey, StaticSecret};

#[derive(Debug, Error)]
pub enum KeyStoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid key file {0:?}: expected 32 bytes")]
    InvalidKeyFile(PathBuf),

    #[error("invalid hex key for peer {0}")]
    InvalidHexKey(PeerId),
}

/// A long-term x25519 pair.
#[derive(Clone)]
pub struct KeyPair {
    secret: [u8; 32],
    public: PublicKeyBytes,
}

impl KeyPair {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self {
            secret: secret.to_bytes(),
            public: public.to_bytes(),
        }
    }

    pub fn from_secret(secret: [u8; 32]) -> Self {
        let s = StaticSecret::from(secret);
        let public = PublicKey::from(&s);
        Self {
            secret,
            public: public.to_bytes(),
        }
    }

    pub fn secret(&self) -> StaticSecret {
        StaticSecret::from(self.secret)
    }

    pub fn public(&self) -> PublicKeyBytes {
        self.public
    }

    pub fn public_hex(&self) -> String {
        hex::encode(self.public)
    }
}

/// Short fingerprint for logging; never log full keys.
pub fn fingerprint(pubkey: &PublicKeyBytes) -> String {
    hex::encode(&pubkey[..8])
}

/// Decode a hex public key as stored in settings and key files.
pub fn decode_hex_key(s: &str) -> Option<PublicKeyBytes> {
    let bytes = hex::decode(s.trim()).ok()?;
    bytes.try_into().ok()
}

pub struct KeyStore {
    local_id: PeerId,
    private_dir: PathBuf,
    public_dir: PathBuf,
    pub client: KeyPair,
    pub server: KeyPair,
}

impl KeyStore {
    /// Open the store, generating both local pairs on first start.
    /// Failure here is fatal to node startup.
    pub fn open(store_root: &Path, local_id: &str) -> Result<Self, KeyStoreError> {
        let base = store_root.join(local_id);
        let private_dir = base.join("private");
        let public_dir = base.join("public");
        std::fs::create_dir_all(&private_dir)?;
        std::fs::create_dir_all(&public_dir)?;

        let client = load_or_generate(
            &private_dir.join(format!("{KEY_FILE_PREFIX}-{KEY_CLIENT_SECRET_SUFFIX}")),
        )?;
        let server = load_or_generate(
            &private_dir.join(format!("{KEY_FILE_PREFIX}-{KEY_SERVER_SECRET_SUFFIX}")),
        )?;

        info!(
            "key store ready (client {}, server {})",
            fingerprint(&client.public()),
            fingerprint(&server.public())
        );

        Ok(Self {
            local_id: local_id.to_string(),
            private_dir,
            public_dir,
            client,
            server,
        })
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn public_dir(&self) -> &Path {
        &self.public_dir
    }

    pub fn private_dir(&self) -> &Path {
        &self.private_dir
    }

    /// Rewrite the public directory to contain exactly the keys of the
    /// currently enabled peers. Idempotent; unknown files are removed.
    pub fn reconcile(&self, peers: &BTreeMap<PeerId, PeerRecord>) -> Result<(), KeyStoreError> {
        let mut keep: Vec<String> = Vec::new();

        for (peer_id, record) in peers {
            if !record.enabled {
                continue;
            }
            for (key_hex, suffix) in [
                (&record.clientkey, KEY_CLIENT_PUBLIC_SUFFIX),
                (&record.serverkey, KEY_SERVER_PUBLIC_SUFFIX),
            ] {
                let Some(key) = decode_hex_key(key_hex) else {
                    warn!("peer {} has an undecodable {} entry, skipping", peer_id, suffix);
                    continue;
                };
                let file_name = format!("{peer_id}-{suffix}");
                let path = self.public_dir.join(&file_name);
                std::fs::write(&path, hex::encode(key))?;
                keep.push(file_name);
            }
        }

        for entry in std::fs::read_dir(&self.public_dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if !keep.contains(&name) {
                debug!("removing stale key file {}", name);
                std::fs::remove_file(entry.path())?;
            }
        }

        Ok(())
    }
}

fn load_or_generate(path: &Path) -> Result<KeyPair, KeyStoreError> {
    if path.is_file() {
        let data = std::fs::read(path)?;
        let secret: [u8; 32] = data
            .try_into()
            .map_err(|_| KeyStoreError::InvalidKeyFile(path.to_path_buf()))?;
        debug!("loaded key from {:?}", path);
        return Ok(KeyPair::from_secret(secret));
    }

    let pair = KeyPair::generate();
    std::fs::write(path, pair.secret)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = std::fs::metadata(path)?.permissions();
        perms.set_mode(0o600);
        std::fs::set_permissions(path, perms)?;
    }
    info!(
        "generated key pair at {:?} (public {})",
        path,
        fingerprint(&pair.public())
    );
    Ok(pair)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::fresh_id;

    fn scratch_store() -> (PathBuf, PeerId) {
        let dir = std::env::temp_dir().join(format!("taconet_keys_{}", fresh_id()));
        (dir, fresh_id())
    }

    fn record(enabled: bool) -> PeerRecord {
        let ck = KeyPair::generate();
        let sk = KeyPair::generate();
        PeerRecord {
            hostname: "localhost".into(),
            port: 5440,
            enabled,
            dynamic: false,
            localnick: String::new(),
            nickname: String::new(),
            clientkey: ck.public_hex(),
            serverkey: sk.public_hex(),
        }
    }

    #[test]
    fn keys_persist_across_open() {
        let (dir, id) = scratch_store();
        let a = KeyStore::open(&dir, &id).unwrap();
        let b = KeyStore::open(&dir, &id).unwrap();
        assert_eq!(a.client.public(), b.client.public());
        assert_eq!(a.server.public(), b.server.public());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn reconcile_is_exact() {
        let (dir, id) = scratch_store();
        let store = KeyStore::open(&dir, &id).unwrap();

        let mut peers = BTreeMap::new();
        let on = fresh_id();
        let off = fresh_id();
        peers.insert(on.clone(), record(true));
        peers.insert(off.clone(), record(false));
        store.reconcile(&peers).unwrap();

        let listed: Vec<String> = std::fs::read_dir(store.public_dir())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(listed.len(), 2);
        assert!(listed.contains(&format!("{on}-client.key")));
        assert!(listed.contains(&format!("{on}-server.key")));

        // Disable the peer; its files must disappear.
        peers.get_mut(&on).unwrap().enabled = false;
        store.reconcile(&peers).unwrap();
        assert_eq!(std::fs::read_dir(store.public_dir()).unwrap().count(), 0);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn hex_keys_round_trip() {
        let pair = KeyPair::generate();
        let decoded = decode_hex_key(&pair.public_hex()).unwrap();
        assert_eq!(decoded, pair.public());
        assert!(decode_hex_key("zz").is_none());
    }
}

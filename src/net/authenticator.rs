//! Inbound-connection whitelist.
//!
//! The server accepts a handshake only when the client's long-term key is
//! present in the public key directory maintained by the key store. The
//! directory is re-read whenever the settings version moves past the one
//! this authenticator last saw, so a peer-table edit takes effect without
//! restarting the listener.

use crate::constants::KEY_CLIENT_PUBLIC_SUFFIX;
use crate::keystore::{decode_hex_key, fingerprint};
use crate::types::PublicKeyBytes;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

pub struct Authenticator {
    public_dir: PathBuf,
    keys: RwLock<HashSet<PublicKeyBytes>>,
    seen_version: AtomicU64,
}

impl Authenticator {
    pub fn new(public_dir: PathBuf) -> Self {
        let auth = Self {
            public_dir,
            keys: RwLock::new(HashSet::new()),
            seen_version: AtomicU64::new(0),
        };
        auth.configure();
        auth
    }

    /// Re-read the public key directory. Only `*-client.key` files matter
    /// here; server-role keys are what *we* dial out to.
    pub fn configure(&self) -> usize {
        let mut keys = HashSet::new();
        match std::fs::read_dir(&self.public_dir) {
            Ok(entries) => {
                for entry in entries.flatten() {
                    let name = entry.file_name().to_string_lossy().into_owned();
                    if !name.ends_with(KEY_CLIENT_PUBLIC_SUFFIX) {
                        continue;
                    }
                    match std::fs::read_to_string(entry.path())
                        .ok()
                        .and_then(|text| decode_hex_key(&text))
                    {
                        Some(key) => {
                            debug!("whitelisting client key {}", fingerprint(&key));
                            keys.insert(key);
                        }
                        None => warn!("unreadable key file {:?}", entry.path()),
                    }
                }
            }
            Err(e) => warn!("cannot read key directory {:?}: {}", self.public_dir, e),
        }

        let count = keys.len();
        *self.keys.write().unwrap() = keys;
        info!("authenticator configured with {} client keys", count);
        count
    }

    /// Reconfigure when the settings version has moved since we last
    /// looked. Cheap no-op otherwise.
    pub fn refresh_if_stale(&self, current_version: u64) {
        let seen = self.seen_version.load(Ordering::Acquire);
        if current_version != seen {
            self.seen_version.store(current_version, Ordering::Release);
            self.configure();
        }
    }

    pub fn is_allowed(&self, key: &PublicKeyBytes) -> bool {
        self.keys.read().unwrap().contains(key)
    }

    pub fn len(&self) -> usize {
        self.keys.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keystore::KeyPair;
    use crate::types::fresh_id;

    #[test]
    fn reads_only_client_role_keys() {
        let dir = std::env::temp_dir().join(format!("taconet_auth_{}", fresh_id()));
        std::fs::create_dir_all(&dir).unwrap();

        let client_key = KeyPair::generate();
        let server_key = KeyPair::generate();
        let peer = fresh_id();
        std::fs::write(dir.join(format!("{peer}-client.key")), client_key.public_hex()).unwrap();
        std::fs::write(dir.join(format!("{peer}-server.key")), server_key.public_hex()).unwrap();

        let auth = Authenticator::new(dir.clone());
        assert_eq!(auth.len(), 1);
        assert!(auth.is_allowed(&client_key.public()));
        assert!(!auth.is_allowed(&server_key.public()));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn refresh_picks_up_directory_changes() {
        let dir = std::env::temp_dir().join(format!("taconet_auth_{}", fresh_id()));
        std::fs::create_dir_all(&dir).unwrap();

        let auth = Authenticator::new(dir.clone());
        assert!(auth.is_empty());

        let key = KeyPair::generate();
        std::fs::write(dir.join(format!("{}-client.key", fresh_id())), key.public_hex()).unwrap();

        // Same version: no reload.
        auth.refresh_if_stale(0);
        assert!(auth.is_empty());

        // Bumped version: reload.
        auth.refresh_if_stale(1);
        assert!(auth.is_allowed(&key.public()));
        std::fs::remove_dir_all(&dir).ok();
    }
}

//! The on-disk settings document.
//!
//! A single JSON file holds everything the node needs to come back up:
//! identity, bind addresses, rate caps, the share table and the peer
//! table. Field names are part of the on-disk contract and never change.

use crate::constants::SETTINGS_FILENAME;
use crate::types::{PeerId, fresh_id};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("settings document is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),
}

/// One entry in the peer table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeerRecord {
    pub hostname: String,
    pub port: u16,
    pub enabled: bool,
    pub dynamic: bool,
    /// Nickname assigned locally by the user.
    #[serde(default)]
    pub localnick: String,
    /// Nickname the peer reported about itself via rollcall.
    #[serde(default)]
    pub nickname: String,
    /// Hex-encoded long-term public keys.
    pub clientkey: String,
    pub serverkey: String,
}

/// One declared share: a virtual name mapped to a local directory.
/// Peers only ever see the name.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Share(pub String, pub PathBuf);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Settings {
    #[serde(rename = "Local UUID")]
    pub local_id: PeerId,

    #[serde(rename = "Nickname")]
    pub nickname: String,

    #[serde(rename = "Application IP")]
    pub app_ip: String,

    #[serde(rename = "Application Port")]
    pub app_port: u16,

    #[serde(rename = "Web IP")]
    pub web_ip: String,

    #[serde(rename = "Web Port")]
    pub web_port: u16,

    #[serde(rename = "Download Location")]
    pub download_location: PathBuf,

    /// KB/s; 0 disables the cap.
    #[serde(rename = "Upload Limit")]
    pub upload_limit: u64,

    /// KB/s; 0 disables the cap.
    #[serde(rename = "Download Limit")]
    pub download_limit: u64,

    #[serde(rename = "TacoNET Certificates Store")]
    pub cert_store: PathBuf,

    #[serde(rename = "Shares")]
    pub shares: Vec<Share>,

    #[serde(rename = "Peers")]
    pub peers: BTreeMap<PeerId, PeerRecord>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            local_id: fresh_id(),
            nickname: "Your Nickname Here".into(),
            app_ip: "0.0.0.0".into(),
            app_port: 5440,
            web_ip: "127.0.0.1".into(),
            web_port: 5340,
            download_location: PathBuf::from("downloads/"),
            upload_limit: 50,
            download_limit: 50,
            cert_store: PathBuf::from("certstore/"),
            shares: Vec::new(),
            peers: BTreeMap::new(),
        }
    }
}

impl Settings {
    /// Load from `dir/settings.json`, falling back to defaults (and writing
    /// them out) when the file is missing.
    pub fn load(dir: &Path) -> Result<Self, SettingsError> {
        let path = dir.join(SETTINGS_FILENAME);
        if !path.is_file() {
            info!("no settings document at {:?}, creating defaults", path);
            let settings = Settings::default();
            settings.save(dir)?;
            return Ok(settings);
        }
        let data = std::fs::read_to_string(&path)?;
        let settings: Settings = serde_json::from_str(&data)?;
        debug!(
            "loaded settings: {} peers, {} shares",
            settings.peers.len(),
            settings.shares.len()
        );
        Ok(settings)
    }

    /// Write to `dir/settings.json` (pretty-printed, stable key order).
    pub fn save(&self, dir: &Path) -> Result<(), SettingsError> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(SETTINGS_FILENAME);
        let data = serde_json::to_string_pretty(self)?;
        std::fs::write(&path, data)?;
        debug!("settings saved to {:?}", path);
        Ok(())
    }

    /// Upload cap in bytes/sec; `None` when uncapped.
    pub fn upload_cap_bytes(&self) -> Option<f64> {
        (self.upload_limit > 0).then(|| (self.upload_limit * 1024) as f64)
    }

    /// Download cap in bytes/sec; `None` when uncapped.
    pub fn download_cap_bytes(&self) -> Option<f64> {
        (self.download_limit > 0).then(|| (self.download_limit * 1024) as f64)
    }

    /// Ids of peers currently enabled.
    pub fn enabled_peers(&self) -> Vec<PeerId> {
        self.peers
            .iter()
            .filter(|(_, p)| p.enabled)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Local path for a declared share name.
    pub fn share_path(&self, name: &str) -> Option<&Path> {
        self.shares
            .iter()
            .find(|Share(n, _)| n == name)
            .map(|Share(_, p)| p.as_path())
    }
}

//! Share table resolution and directory listings.
//!
//! A share maps a virtual root name to a local directory. Peers address
//! content by virtual paths (`/share-name/sub/dir`); resolution joins the
//! remainder under the share's local root and refuses anything that would
//! escape it. Local paths never cross the wire.

use crate::codec::{EntryKind, ListingStatus, ShareEntry};
use crate::constants::{CACHE_TIMEOUT, LISTING_TIMEOUT};
use crate::settings::Share;
use crate::types::PeerId;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Instant;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum ShareError {
    #[error("unknown share {0:?}")]
    UnknownShare(String),

    #[error("path escapes the share root")]
    Traversal,

    #[error("not a directory")]
    NotADirectory,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Split a virtual path into clean segments. Empty segments collapse;
/// any `.`/`..`/separator tricks are rejected outright.
fn segments(virtual_path: &str) -> Result<Vec<&str>, ShareError> {
    let mut out = Vec::new();
    for seg in virtual_path.split('/') {
        if seg.is_empty() {
            continue;
        }
        if seg == "." || seg == ".." || seg.contains('\\') || seg.contains('\0') {
            return Err(ShareError::Traversal);
        }
        out.push(seg);
    }
    Ok(out)
}

/// Resolve a virtual directory path to a local one. `"/"` is not
/// resolvable here — the top level is the share table itself.
pub fn resolve_dir(shares: &[Share], virtual_dir: &str) -> Result<PathBuf, ShareError> {
    let segs = segments(virtual_dir)?;
    let (share_name, rest) = segs
        .split_first()
        .ok_or_else(|| ShareError::UnknownShare("/".into()))?;

    let root = shares
        .iter()
        .find(|Share(name, _)| name == share_name)
        .map(|Share(_, path)| path.clone())
        .ok_or_else(|| ShareError::UnknownShare(share_name.to_string()))?;

    let mut local = root.clone();
    for seg in rest {
        local.push(seg);
    }
    confine(&root, &local)?;
    Ok(local)
}

/// Resolve a file inside a virtual directory.
pub fn resolve_file(
    shares: &[Share],
    virtual_dir: &str,
    file_name: &str,
) -> Result<PathBuf, ShareError> {
    if file_name.contains('/') || file_name.contains('\\') || file_name.contains('\0') {
        return Err(ShareError::Traversal);
    }
    if file_name == "." || file_name == ".." {
        return Err(ShareError::Traversal);
    }
    let dir = resolve_dir(shares, virtual_dir)?;
    Ok(dir.join(file_name))
}

/// Second line of defense after segment filtering: the canonical form of
/// the resolved path must stay under the canonical share root.
fn confine(root: &Path, resolved: &Path) -> Result<(), ShareError> {
    let canon_root = root.canonicalize()?;
    let canon = resolved.canonicalize()?;
    if canon.starts_with(&canon_root) {
        Ok(())
    } else {
        warn!("traversal attempt: {:?} is outside {:?}", resolved, root);
        Err(ShareError::Traversal)
    }
}

/// Produce the listing for a virtual directory. The top level (`"/"`)
/// lists the declared share names; anything deeper stats the local
/// directory. Sorted: directories first, then files, each by name.
pub fn list_virtual_dir(
    shares: &[Share],
    virtual_dir: &str,
) -> (ListingStatus, Vec<ShareEntry>, String) {
    let is_root = segments(virtual_dir)
        .map(|s| s.is_empty())
        .unwrap_or(false);

    if is_root {
        let mut entries: Vec<ShareEntry> = shares
            .iter()
            .map(|Share(name, _)| ShareEntry {
                name: name.clone(),
                path: format!("/{name}"),
                kind: EntryKind::Dir,
                size: 0,
                mtime: 0,
            })
            .collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        return (ListingStatus::Ok, entries, String::new());
    }

    let local = match resolve_dir(shares, virtual_dir) {
        Ok(p) => p,
        Err(e) => return (ListingStatus::Error, Vec::new(), e.to_string()),
    };
    if !local.is_dir() {
        return (
            ListingStatus::Error,
            Vec::new(),
            ShareError::NotADirectory.to_string(),
        );
    }

    let virtual_base = {
        // Re-normalize so "/docs//sub/" comes back as "/docs/sub".
        let segs = segments(virtual_dir).unwrap_or_default();
        format!("/{}", segs.join("/"))
    };

    let mut dirs = Vec::new();
    let mut files = Vec::new();
    let read = match std::fs::read_dir(&local) {
        Ok(r) => r,
        Err(e) => return (ListingStatus::Error, Vec::new(), e.to_string()),
    };
    for entry in read.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        let Ok(meta) = entry.metadata() else { continue };
        let mtime = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let item = ShareEntry {
            path: format!("{virtual_base}/{name}"),
            kind: if meta.is_dir() {
                EntryKind::Dir
            } else {
                EntryKind::File
            },
            size: if meta.is_dir() { 0 } else { meta.len() },
            mtime,
            name,
        };
        if item.kind == EntryKind::Dir {
            dirs.push(item);
        } else {
            files.push(item);
        }
    }
    dirs.sort_by(|a, b| a.name.cmp(&b.name));
    files.sort_by(|a, b| a.name.cmp(&b.name));
    dirs.extend(files);
    (ListingStatus::Ok, dirs, String::new())
}

// =============================================================================
// REMOTE LISTING CACHE
// =============================================================================

/// Listings received from peers, keyed by (peer, virtual dir), plus the
/// browse handles still waiting for an answer. Both sides are TTL-bounded.
pub struct ListingCache {
    inner: Mutex<CacheInner>,
}

struct CacheInner {
    listings: HashMap<(PeerId, String), (Instant, Vec<ShareEntry>)>,
    /// results_id → issue time; an id not present here is not ours.
    pending: HashMap<String, Instant>,
}

impl ListingCache {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                listings: HashMap::new(),
                pending: HashMap::new(),
            }),
        }
    }

    /// Register a browse handle we just sent out.
    pub fn track_pending(&self, results_id: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.pending.insert(results_id.to_string(), Instant::now());
    }

    /// Store a listing if its handle is one of ours. Returns false for
    /// unsolicited results.
    pub fn store(&self, peer: &str, share_dir: &str, results_id: &str, entries: Vec<ShareEntry>) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.pending.remove(results_id).is_none() {
            return false;
        }
        inner.listings.insert(
            (peer.to_string(), share_dir.to_string()),
            (Instant::now(), entries),
        );
        true
    }

    pub fn get(&self, peer: &str, share_dir: &str) -> Option<Vec<ShareEntry>> {
        let inner = self.inner.lock().unwrap();
        inner
            .listings
            .get(&(peer.to_string(), share_dir.to_string()))
            .map(|(_, entries)| entries.clone())
    }

    /// Drop expired listings and stale pending handles.
    pub fn purge(&self) {
        let mut inner = self.inner.lock().unwrap();
        let now = Instant::now();
        inner
            .listings
            .retain(|_, (t, _)| now.duration_since(*t) <= CACHE_TIMEOUT);
        inner
            .pending
            .retain(|_, t| now.duration_since(*t) <= LISTING_TIMEOUT);
    }
}

impl Default for ListingCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::fresh_id;

    fn scratch_share() -> (PathBuf, Vec<Share>) {
        let dir = std::env::temp_dir().join(format!("taconet_share_{}", fresh_id()));
        std::fs::create_dir_all(dir.join("sub")).unwrap();
        std::fs::write(dir.join("a.txt"), b"hello").unwrap();
        std::fs::write(dir.join("sub/b.txt"), b"world").unwrap();
        let shares = vec![Share("docs".into(), dir.clone())];
        (dir, shares)
    }

    #[test]
    fn root_lists_share_names() {
        let (dir, shares) = scratch_share();
        let (status, entries, _) = list_virtual_dir(&shares, "/");
        assert_eq!(status, ListingStatus::Ok);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "docs");
        assert_eq!(entries[0].kind, EntryKind::Dir);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn listing_sorts_dirs_before_files() {
        let (dir, shares) = scratch_share();
        let (status, entries, _) = list_virtual_dir(&shares, "/docs");
        assert_eq!(status, ListingStatus::Ok);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "sub");
        assert_eq!(entries[0].kind, EntryKind::Dir);
        assert_eq!(entries[1].name, "a.txt");
        assert_eq!(entries[1].size, 5);
        assert_eq!(entries[1].path, "/docs/a.txt");
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn traversal_is_rejected() {
        let (dir, shares) = scratch_share();
        assert!(matches!(
            resolve_dir(&shares, "/docs/../etc"),
            Err(ShareError::Traversal)
        ));
        let (status, entries, message) = list_virtual_dir(&shares, "/docs/../etc");
        assert_eq!(status, ListingStatus::Error);
        assert!(entries.is_empty());
        assert!(!message.is_empty());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn unknown_share_is_an_error() {
        let (dir, shares) = scratch_share();
        assert!(matches!(
            resolve_dir(&shares, "/music"),
            Err(ShareError::UnknownShare(_))
        ));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn file_name_cannot_carry_separators() {
        let (dir, shares) = scratch_share();
        assert!(resolve_file(&shares, "/docs", "sub/b.txt").is_err());
        assert!(resolve_file(&shares, "/docs", "..").is_err());
        assert!(resolve_file(&shares, "/docs", "a.txt").is_ok());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn cache_ignores_unsolicited_results() {
        let cache = ListingCache::new();
        let peer = fresh_id();
        assert!(!cache.store(&peer, "/docs", "nobody-asked", Vec::new()));
        let handle = fresh_id();
        cache.track_pending(&handle);
        assert!(cache.store(&peer, "/docs", &handle, Vec::new()));
        assert!(cache.get(&peer, "/docs").is_some());
    }
}

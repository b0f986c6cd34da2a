//! File handles for chunk serving and receiving.
//!
//! Both sides of a transfer touch the same file many times in a burst and
//! then go quiet, so handles are cached by path and closed after
//! [`CACHE_TIMEOUT`] of inactivity. Read and write caches are separate:
//! serving never mixes with receiving.

use crate::constants::{CACHE_TIMEOUT, CHUNK_SIZE, IN_PROGRESS_SUFFIX};
use crate::types::fresh_id;
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::debug;

/// Cached read handles for serving chunks out of shares.
pub struct ReadCache {
    files: HashMap<PathBuf, (File, Instant)>,
}

impl ReadCache {
    pub fn new() -> Self {
        Self {
            files: HashMap::new(),
        }
    }

    /// Read up to [`CHUNK_SIZE`] bytes at `offset`. Returns an empty
    /// vector at or past end of file.
    pub fn read_chunk(&mut self, path: &Path, offset: u64) -> io::Result<Vec<u8>> {
        let entry = match self.files.entry(path.to_path_buf()) {
            Entry::Occupied(e) => e.into_mut(),
            Entry::Vacant(v) => {
                debug!("opening {:?} for chunk serving", path);
                let file = File::open(path)?;
                v.insert((file, Instant::now()))
            }
        };
        entry.1 = Instant::now();

        let len = entry.0.metadata()?.len();
        if offset >= len {
            return Ok(Vec::new());
        }
        entry.0.seek(SeekFrom::Start(offset))?;
        let want = CHUNK_SIZE.min(len - offset) as usize;
        let mut buf = vec![0u8; want];
        entry.0.read_exact(&mut buf)?;
        Ok(buf)
    }

    pub fn purge(&mut self) {
        let now = Instant::now();
        self.files
            .retain(|path, (_, last)| {
                let keep = now.duration_since(*last) <= CACHE_TIMEOUT;
                if !keep {
                    debug!("closing idle read handle {:?}", path);
                }
                keep
            });
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

impl Default for ReadCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Cached append handles for partial downloads.
pub struct WriteCache {
    files: HashMap<PathBuf, (File, Instant)>,
}

impl WriteCache {
    pub fn new() -> Self {
        Self {
            files: HashMap::new(),
        }
    }

    /// Append `data` and return the resulting file size.
    pub fn append(&mut self, path: &Path, data: &[u8]) -> io::Result<u64> {
        let entry = match self.files.entry(path.to_path_buf()) {
            Entry::Occupied(e) => e.into_mut(),
            Entry::Vacant(v) => {
                debug!("opening {:?} for receiving", path);
                let file = OpenOptions::new().create(true).append(true).open(path)?;
                v.insert((file, Instant::now()))
            }
        };
        entry.1 = Instant::now();
        entry.0.write_all(data)?;
        entry.0.flush()?;
        entry.0.stream_position()
    }

    pub fn close(&mut self, path: &Path) {
        self.files.remove(path);
    }

    pub fn close_all(&mut self) {
        self.files.clear();
    }

    pub fn purge(&mut self) {
        let now = Instant::now();
        self.files
            .retain(|path, (_, last)| {
                let keep = now.duration_since(*last) <= CACHE_TIMEOUT;
                if !keep {
                    debug!("closing idle write handle {:?}", path);
                }
                keep
            });
    }
}

impl Default for WriteCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Path of the in-progress copy for a download target.
pub fn partial_path(download_dir: &Path, file_name: &str) -> PathBuf {
    download_dir.join(format!("{file_name}{IN_PROGRESS_SUFFIX}"))
}

/// Size of the partial file, zero when absent.
pub fn partial_size(partial: &Path) -> u64 {
    std::fs::metadata(partial).map(|m| m.len()).unwrap_or(0)
}

/// Rename a completed partial onto its final name. If the target exists a
/// fresh id is inserted before the extension instead of overwriting.
pub fn finalize_partial(partial: &Path, final_path: &Path) -> io::Result<PathBuf> {
    let target = if final_path.exists() {
        let stem = final_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let ext = final_path
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default();
        let parent = final_path.parent().unwrap_or_else(|| Path::new("."));
        parent.join(format!("{stem}.{}{ext}", fresh_id()))
    } else {
        final_path.to_path_buf()
    };
    std::fs::rename(partial, &target)?;
    Ok(target)
}

//! Bounded chat history.

use crate::constants::CHAT_LOG_MAXSIZE;
use crate::types::{PeerId, fresh_id};
use std::collections::VecDeque;
use std::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatEntry {
    pub sender: PeerId,
    pub timestamp: u64,
    pub text: String,
}

/// Append-only log capped at [`CHAT_LOG_MAXSIZE`] entries. The version
/// token is re-rolled on every mutation so the UI can poll for changes
/// without diffing the log.
pub struct ChatLog {
    inner: Mutex<Inner>,
}

struct Inner {
    entries: VecDeque<ChatEntry>,
    version: String,
}

impl ChatLog {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: VecDeque::with_capacity(CHAT_LOG_MAXSIZE),
                version: fresh_id(),
            }),
        }
    }

    pub fn append(&self, sender: &str, timestamp: u64, text: &str) {
        let mut inner = self.inner.lock().unwrap();
        if inner.entries.len() >= CHAT_LOG_MAXSIZE {
            inner.entries.pop_front();
        }
        inner.entries.push_back(ChatEntry {
            sender: sender.to_string(),
            timestamp,
            text: text.to_string(),
        });
        inner.version = fresh_id();
    }

    pub fn entries(&self) -> Vec<ChatEntry> {
        self.inner.lock().unwrap().entries.iter().cloned().collect()
    }

    pub fn version(&self) -> String {
        self.inner.lock().unwrap().version.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ChatLog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_bumps_version() {
        let log = ChatLog::new();
        let v0 = log.version();
        log.append("a".repeat(32).as_str(), 1, "hi");
        assert_ne!(v0, log.version());
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn log_is_capped() {
        let log = ChatLog::new();
        let sender = "b".repeat(32);
        for i in 0..(CHAT_LOG_MAXSIZE + 10) {
            log.append(&sender, i as u64, &format!("msg {i}"));
        }
        assert_eq!(log.len(), CHAT_LOG_MAXSIZE);
        // Oldest entries dropped, newest kept.
        let entries = log.entries();
        assert_eq!(entries.first().unwrap().text, "msg 10");
        assert_eq!(
            entries.last().unwrap().text,
            format!("msg {}", CHAT_LOG_MAXSIZE + 9)
        );
    }
}

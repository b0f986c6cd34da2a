//! Shared types and small helpers.

use crate::constants::{
    IDENTITY_LEN, MAX_CHAT_MESSAGE_LENGTH, MAX_NICKNAME_LENGTH, MIN_NICKNAME_LENGTH,
};
use std::time::{SystemTime, UNIX_EPOCH};

/// A peer identity: uuid4 in simple form, 32 lowercase hex characters.
pub type PeerId = String;

/// Raw x25519 public key.
pub type PublicKeyBytes = [u8; 32];

/// Wall-clock seconds since the epoch.
pub fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Wall-clock milliseconds since the epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Fresh uuid4 in simple (32-hex) form. Used for node identities, chunk
/// ids, browse handles and version tokens.
pub fn fresh_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// True when `s` is a well-formed peer identity.
pub fn valid_identity(s: &str) -> bool {
    s.len() == IDENTITY_LEN
        && s.bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

/// Nickname rule: 3..=48 chars of letters, digits, `_ . - ( )` and space.
pub fn valid_nickname(s: &str) -> bool {
    let n = s.chars().count();
    if !(MIN_NICKNAME_LENGTH..=MAX_NICKNAME_LENGTH).contains(&n) {
        return false;
    }
    s.chars()
        .all(|c| c.is_alphanumeric() || matches!(c, '_' | '.' | '-' | '(' | ')' | ' '))
}

/// Chat text rule: 1..=512 printable ASCII characters or space.
pub fn valid_chat_text(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= MAX_CHAT_MESSAGE_LENGTH
        && s.bytes().all(|b| (0x20..=0x7e).contains(&b))
}

/// Share and directory name rule: must start and end with a word
/// character, `_ . - ` and space allowed inside, 3..=128 chars.
pub fn valid_share_name(s: &str) -> bool {
    let chars: Vec<char> = s.chars().collect();
    if !(3..=128).contains(&chars.len()) {
        return false;
    }
    let word = |c: char| c.is_alphanumeric() || c == '_';
    let inner = |c: char| word(c) || matches!(c, ' ' | '-' | '.');
    word(chars[0]) && word(*chars.last().unwrap()) && chars.iter().all(|&c| inner(c))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_shape() {
        assert!(valid_identity(&fresh_id()));
        assert!(!valid_identity("short"));
        assert!(!valid_identity("XYZ00000000000000000000000000000"));
        assert!(!valid_identity(&"a".repeat(33)));
    }

    #[test]
    fn nickname_rules() {
        assert!(valid_nickname("Scott (work)"));
        assert!(valid_nickname("a.b-c_d"));
        assert!(!valid_nickname("ab"));
        assert!(!valid_nickname(&"x".repeat(49)));
        assert!(!valid_nickname("bad\nname"));
    }

    #[test]
    fn chat_rules() {
        assert!(valid_chat_text("hi there!"));
        assert!(!valid_chat_text(""));
        assert!(!valid_chat_text("tab\there"));
        assert!(!valid_chat_text(&"y".repeat(513)));
    }

    #[test]
    fn share_name_rules() {
        assert!(valid_share_name("docs"));
        assert!(valid_share_name("my stuff.v2"));
        assert!(!valid_share_name("ab"));
        assert!(!valid_share_name(".hidden"));
        assert!(!valid_share_name("trailing "));
    }
}

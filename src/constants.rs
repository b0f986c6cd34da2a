//! Protocol-wide constants.
//!
//! Timings are the contract between the client engine, the server engine and
//! the transfer coordinator: ROLLCALL_TIMEOUT is what every liveness check
//! compares against, and the reconnect ladder is MIN + k*STEP capped at MAX.

use std::time::Duration;

pub const KB: u64 = 1 << 10;
pub const MB: u64 = 1 << 20;

// =============================================================================
// IDENTITY AND TEXT LIMITS
// =============================================================================

/// Node identity length: a uuid4 in simple (32 lowercase hex) form.
pub const IDENTITY_LEN: usize = 32;

pub const MAX_NICKNAME_LENGTH: usize = 48;
pub const MIN_NICKNAME_LENGTH: usize = 3;
pub const MAX_CHAT_MESSAGE_LENGTH: usize = 512;

/// Bounded chat history; oldest entries fall off on append.
pub const CHAT_LOG_MAXSIZE: usize = 128;

// =============================================================================
// RECONNECT LADDER
// =============================================================================

/// Wait before the very first connect attempt.
pub const RECONNECT_MIN: Duration = Duration::ZERO;

/// Added to the current backoff after every failed session.
pub const RECONNECT_STEP: Duration = Duration::from_secs(2);

/// Backoff cap.
pub const RECONNECT_MAX: Duration = Duration::from_secs(16);

// =============================================================================
// HEARTBEAT
// =============================================================================

/// A rollcall is scheduled uniformly inside [ROLLCALL_MIN, ROLLCALL_MAX]
/// after the previous one.
pub const ROLLCALL_MIN_SECS: u64 = 2;
pub const ROLLCALL_MAX_SECS: u64 = 5;

/// No inbound traffic for this long means the peer session is dead.
pub const ROLLCALL_TIMEOUT: Duration = Duration::from_secs(ROLLCALL_MAX_SECS * 2);

// =============================================================================
// LOOP CADENCE
// =============================================================================

/// Client engine tick; also the upper bound on enqueue-to-send latency
/// when the wake event is missed.
pub const TICK_INTERVAL: Duration = Duration::from_millis(100);

/// Transfer coordinator tick.
pub const COORDINATOR_TICK: Duration = Duration::from_millis(200);

/// How often the coordinator re-scans the download queue heads.
pub const DOWNLOAD_Q_CHECK_TIME: Duration = Duration::from_secs(2);

// =============================================================================
// FILE TRANSFER
// =============================================================================

/// Fixed chunk granularity for file transfers.
pub const CHUNK_SIZE: u64 = 128 * KB;

/// Maximum outstanding chunk requests per peer.
pub const CREDIT_MAX: usize = 35;

/// Partial downloads carry this suffix until finalized.
pub const IN_PROGRESS_SUFFIX: &str = ".filepart";

/// An active transfer with no chunk received for this long is stalled and
/// its chunk plan is rebuilt from the partial size.
pub const DATA_TIMEOUT: Duration = Duration::from_secs(300);

/// Base pacing between chunk requests; scaled up by download-rate
/// utilization, floored at 10 ms.
pub const FILE_REQUEST_INTERVAL: Duration = Duration::from_millis(100);
pub const FILE_REQUEST_INTERVAL_FLOOR: Duration = Duration::from_millis(10);

// =============================================================================
// CACHES
// =============================================================================

/// Idle read/write file handles and cached listings expire after this.
pub const CACHE_TIMEOUT: Duration = Duration::from_secs(120);

/// Cache sweep period.
pub const CACHE_PURGE_INTERVAL: Duration = Duration::from_secs(30);

/// A browse handle with no answer expires after this.
pub const LISTING_TIMEOUT: Duration = Duration::from_secs(300);

// =============================================================================
// RATE MEASUREMENT
// =============================================================================

/// Sliding window for the byte-rate counters.
pub const RATE_WINDOW: Duration = Duration::from_secs(5);

// =============================================================================
// WIRE LIMITS
// =============================================================================

/// Hard cap on a single logical wire message (chunk payload + envelope
/// fits comfortably).
pub const MAX_FRAME_SIZE: usize = 2 * MB as usize;

// =============================================================================
// KEY STORE
// =============================================================================

/// Private key files are `{KEY_FILE_PREFIX}-client.key_secret` and
/// `{KEY_FILE_PREFIX}-server.key_secret` under the private directory.
pub const KEY_FILE_PREFIX: &str = "taconet";

pub const KEY_CLIENT_SECRET_SUFFIX: &str = "client.key_secret";
pub const KEY_SERVER_SECRET_SUFFIX: &str = "server.key_secret";

/// Per-peer public key files in the public directory: `{id}-client.key`,
/// `{id}-server.key`.
pub const KEY_CLIENT_PUBLIC_SUFFIX: &str = "client.key";
pub const KEY_SERVER_PUBLIC_SUFFIX: &str = "server.key";

/// Settings document file name.
pub const SETTINGS_FILENAME: &str = "settings.json";

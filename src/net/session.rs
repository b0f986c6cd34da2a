//! Per-peer session state: the four output queues and the health machine.
//!
//! One `Session` exists per enabled peer, owned by the supervisor and
//! shared with the client engine. Queues accept traffic only while the
//! session is connected; on any failure they are discarded wholesale, so
//! nothing from one transport generation can leak into the next.
//!
//! Health transitions:
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> ReconnectWait -> Connecting ...
//! ```
//!
//! Backoff: first attempt at `RECONNECT_MIN`, then +`RECONNECT_STEP` per
//! failed generation, capped at `RECONNECT_MAX`. Any inbound traffic
//! resets the ladder.

use crate::constants::{
    RECONNECT_MAX, RECONNECT_MIN, RECONNECT_STEP, ROLLCALL_MAX_SECS, ROLLCALL_MIN_SECS,
    ROLLCALL_TIMEOUT,
};
use crate::types::PeerId;
use rand::Rng;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    High,
    Medium,
    Low,
    File,
}

impl Priority {
    fn index(self) -> usize {
        match self {
            Priority::High => 0,
            Priority::Medium => 1,
            Priority::Low => 2,
            Priority::File => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    ReconnectWait,
}

struct Health {
    state: SessionState,
    connect_at: Instant,
    backoff: Duration,
    last_reply: Option<Instant>,
    next_rollcall: Instant,
}

/// Status snapshot handed to the UI.
#[derive(Debug, Clone)]
pub struct SessionStatus {
    pub peer_id: PeerId,
    pub state: SessionState,
    pub backoff: Duration,
    pub last_reply_age: Option<Duration>,
    pub queued: [usize; 4],
}

pub struct Session {
    pub peer_id: PeerId,
    // One named lock per priority queue; at most one is held at a time.
    queues: [Mutex<VecDeque<Vec<u8>>>; 4],
    health: Mutex<Health>,
}

impl Session {
    pub fn new(peer_id: PeerId) -> Self {
        let now = Instant::now();
        Self {
            peer_id,
            queues: Default::default(),
            health: Mutex::new(Health {
                state: SessionState::Disconnected,
                connect_at: now + RECONNECT_MIN,
                backoff: RECONNECT_MIN,
                last_reply: None,
                next_rollcall: now,
            }),
        }
    }

    // =========================================================================
    // QUEUES
    // =========================================================================

    /// Enqueue for sending. Refused (false) unless the session is
    /// connected; there is no backlog across transport generations.
    pub fn enqueue(&self, priority: Priority, data: Vec<u8>) -> bool {
        if self.state() != SessionState::Connected {
            return false;
        }
        self.queues[priority.index()].lock().unwrap().push_back(data);
        true
    }

    pub fn pop(&self, priority: Priority) -> Option<Vec<u8>> {
        self.queues[priority.index()].lock().unwrap().pop_front()
    }

    pub fn queue_len(&self, priority: Priority) -> usize {
        self.queues[priority.index()].lock().unwrap().len()
    }

    fn clear_queues(&self) {
        for q in &self.queues {
            q.lock().unwrap().clear();
        }
    }

    // =========================================================================
    // HEALTH
    // =========================================================================

    pub fn state(&self) -> SessionState {
        self.health.lock().unwrap().state
    }

    /// True when a connect attempt may start now.
    pub fn due_for_connect(&self) -> bool {
        let h = self.health.lock().unwrap();
        matches!(
            h.state,
            SessionState::Disconnected | SessionState::ReconnectWait
        ) && Instant::now() >= h.connect_at
    }

    pub fn mark_connecting(&self) {
        let mut h = self.health.lock().unwrap();
        h.state = SessionState::Connecting;
    }

    /// Transport established: fresh queues, immediate rollcall, liveness
    /// clock starts now.
    pub fn mark_connected(&self) {
        self.clear_queues();
        let mut h = self.health.lock().unwrap();
        let now = Instant::now();
        h.state = SessionState::Connected;
        h.last_reply = Some(now);
        h.next_rollcall = now;
        debug!("session {} connected", self.peer_id);
    }

    /// Transport failed or timed out: drop queues, climb the backoff
    /// ladder, schedule the next attempt.
    pub fn mark_failed(&self) {
        self.clear_queues();
        let mut h = self.health.lock().unwrap();
        h.state = SessionState::ReconnectWait;
        h.backoff = (h.backoff + RECONNECT_STEP).min(RECONNECT_MAX);
        h.connect_at = Instant::now() + h.backoff;
        h.last_reply = None;
        debug!(
            "session {} failed, retrying in {:?}",
            self.peer_id, h.backoff
        );
    }

    /// Peer disabled or removed: terminal until a new session is built.
    pub fn mark_disconnected(&self) {
        self.clear_queues();
        let mut h = self.health.lock().unwrap();
        h.state = SessionState::Disconnected;
        h.last_reply = None;
    }

    /// Inbound traffic observed: liveness refreshed, ladder reset.
    pub fn mark_reply(&self) {
        let mut h = self.health.lock().unwrap();
        h.last_reply = Some(Instant::now());
        h.backoff = RECONNECT_MIN;
    }

    /// Wall-clock age of the last inbound byte, while connected.
    pub fn last_reply_age(&self) -> Option<Duration> {
        let h = self.health.lock().unwrap();
        h.last_reply.map(|t| t.elapsed())
    }

    /// True when the peer has been silent past the rollcall timeout.
    pub fn liveness_expired(&self) -> bool {
        let h = self.health.lock().unwrap();
        match (h.state, h.last_reply) {
            (SessionState::Connected, Some(t)) => t.elapsed() > ROLLCALL_TIMEOUT,
            (SessionState::Connected, None) => true,
            _ => false,
        }
    }

    pub fn rollcall_due(&self) -> bool {
        let h = self.health.lock().unwrap();
        h.state == SessionState::Connected && Instant::now() >= h.next_rollcall
    }

    /// Schedule the next heartbeat uniformly inside the rollcall window.
    pub fn schedule_rollcall(&self) {
        let secs = rand::thread_rng().gen_range(ROLLCALL_MIN_SECS..=ROLLCALL_MAX_SECS);
        let mut h = self.health.lock().unwrap();
        h.next_rollcall = Instant::now() + Duration::from_secs(secs);
    }

    pub fn status(&self) -> SessionStatus {
        let h = self.health.lock().unwrap();
        SessionStatus {
            peer_id: self.peer_id.clone(),
            state: h.state,
            backoff: h.backoff,
            last_reply_age: h.last_reply.map(|t| t.elapsed()),
            queued: [
                self.queue_len(Priority::High),
                self.queue_len(Priority::Medium),
                self.queue_len(Priority::Low),
                self.queue_len(Priority::File),
            ],
        }
    }
}

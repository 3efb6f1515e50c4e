//! Session layer: participants, the two-party room state machine, the
//! process-wide room registry, and the solo pipeline instance.

pub mod registry;
pub mod room;
pub mod solo;

pub use registry::RoomRegistry;
pub use room::{Phase, Room, RoomConn, RoomRouter};
pub use solo::{SoloConn, SoloOptions, SoloRouter};

use crate::defaults::{DEFAULT_NAME, MAX_NAME_LEN};
use crate::wire::outbound::OutboundQueue;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Room role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The room creator; the only role allowed to drive start/end.
    Host,
    Guest,
}

/// One connected user inside a room.
///
/// The participant's audio state (decoder, segmenter, generation counter)
/// lives in its connection's read task; this struct only carries what other
/// tasks need to reach it: the outbound queue, the mute flag, and the
/// echo-suppression lock deadline.
pub struct Participant {
    pub id: u64,
    pub name: String,
    pub role: Role,
    /// Language this user speaks; never reassigned after joining.
    pub language: String,
    pub outbound: OutboundQueue,
    muted: AtomicBool,
    lock_until: Mutex<Option<Instant>>,
}

impl Participant {
    pub fn new(id: u64, name: String, role: Role, language: String, outbound: OutboundQueue) -> Self {
        Self {
            id,
            name,
            role,
            language,
            outbound,
            muted: AtomicBool::new(false),
            lock_until: Mutex::new(None),
        }
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::SeqCst)
    }

    /// Sets the mute flag. Returns true if the state changed.
    pub fn set_muted(&self, muted: bool) -> bool {
        self.muted.swap(muted, Ordering::SeqCst) != muted
    }

    /// Arms the server-side echo-suppression window.
    pub fn lock_mic(&self, duration: Duration) {
        let mut lock = self.lock_until.lock().expect("lock poisoned");
        *lock = Some(Instant::now() + duration);
    }

    /// True while inside the echo-suppression window.
    pub fn mic_locked(&self) -> bool {
        let lock = self.lock_until.lock().expect("lock poisoned");
        matches!(*lock, Some(deadline) if Instant::now() < deadline)
    }
}

/// Trims and bounds a client-supplied display name.
pub fn clean_name(raw: Option<&str>) -> String {
    let trimmed = raw.unwrap_or("").trim();
    if trimmed.is_empty() {
        return DEFAULT_NAME.to_string();
    }
    trimmed.chars().take(MAX_NAME_LEN).collect()
}

/// Session identifier for logs and diagnostic recordings.
pub fn session_id(participant_id: u64) -> String {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    format!("{}_{:06}_{}", now.as_secs(), now.subsec_micros(), participant_id)
}

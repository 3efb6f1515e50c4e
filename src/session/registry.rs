//! Process-wide directory of conversation rooms.

use crate::config::RoomConfig;
use crate::defaults::{ROOM_CODE_ALPHABET, ROOM_CODE_LEN};
use crate::error::{ParlanceError, Result};
use crate::session::room::{JoinInfo, Room, RoomSnapshot};
use crate::session::{clean_name, Participant, Role};
use crate::wire::outbound::OutboundQueue;
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Registry of live rooms keyed by their short code.
pub struct RoomRegistry {
    rooms: Mutex<HashMap<String, Arc<Room>>>,
    next_participant_id: AtomicU64,
    code_len: usize,
    idle_ttl: Duration,
}

impl RoomRegistry {
    pub fn new(config: &RoomConfig) -> Self {
        Self {
            rooms: Mutex::new(HashMap::new()),
            next_participant_id: AtomicU64::new(1),
            code_len: if config.code_len > 0 {
                config.code_len
            } else {
                ROOM_CODE_LEN
            },
            idle_ttl: Duration::from_secs(config.idle_ttl_secs),
        }
    }

    /// Allocates a process-unique participant id.
    pub fn allocate_participant_id(&self) -> u64 {
        self.next_participant_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Creates a room with the given language pair and seats the host.
    pub fn create(
        &self,
        host_language: &str,
        guest_language: &str,
        host_name: Option<&str>,
        outbound: OutboundQueue,
    ) -> Result<(Arc<Room>, Arc<Participant>)> {
        if !crate::defaults::is_supported_language(host_language) {
            return Err(ParlanceError::BadRequest {
                message: format!("unknown language code: {}", host_language),
            });
        }
        if !crate::defaults::is_supported_language(guest_language) {
            return Err(ParlanceError::BadRequest {
                message: format!("unknown language code: {}", guest_language),
            });
        }
        if host_language == guest_language {
            return Err(ParlanceError::BadRequest {
                message: "language pair must differ".to_string(),
            });
        }

        let host = Arc::new(Participant::new(
            self.allocate_participant_id(),
            clean_name(host_name),
            Role::Host,
            host_language.to_string(),
            outbound,
        ));

        let mut rooms = self.rooms.lock().expect("registry lock poisoned");
        let code = Self::allocate_code(&rooms, self.code_len);
        let room = Arc::new(Room::new(
            code.clone(),
            host_language.to_string(),
            guest_language.to_string(),
            host.clone(),
        ));
        rooms.insert(code.clone(), room.clone());

        info!(
            room = %code,
            host = %host.name,
            pair = %format!("{}<->{}", host_language, guest_language),
            "room created"
        );
        Ok((room, host))
    }

    /// Seats a guest in an existing room. The guest's language is the
    /// remaining member of the pair; lookup is case-insensitive.
    pub fn join(
        &self,
        code: &str,
        guest_name: Option<&str>,
        outbound: OutboundQueue,
    ) -> Result<(Arc<Room>, Arc<Participant>, JoinInfo)> {
        let code = code.trim().to_uppercase();
        let room = self
            .get(&code)
            .filter(|room| !room.is_ended())
            .ok_or(ParlanceError::RoomNotFound { code: code.clone() })?;

        let guest = Arc::new(Participant::new(
            self.allocate_participant_id(),
            clean_name(guest_name),
            Role::Guest,
            room.lang_guest().to_string(),
            outbound,
        ));
        let info = room.join(guest.clone())?;

        Ok((room, guest, info))
    }

    pub fn get(&self, code: &str) -> Option<Arc<Room>> {
        self.rooms
            .lock()
            .expect("registry lock poisoned")
            .get(code)
            .cloned()
    }

    /// Removes a departing participant; the room itself is dropped once
    /// empty or ended.
    pub fn leave(&self, room: &Arc<Room>, participant_id: u64) {
        let empty = room.leave(participant_id);
        if empty || room.is_ended() {
            let mut rooms = self.rooms.lock().expect("registry lock poisoned");
            // Rooms ended with a participant still connected stay listed
            // until that connection drains; empty ones go now.
            if empty {
                rooms.remove(room.code());
                debug!(room = %room.code(), "room removed");
            }
        }
    }

    pub fn room_count(&self) -> usize {
        self.rooms.lock().expect("registry lock poisoned").len()
    }

    pub fn snapshots(&self) -> Vec<RoomSnapshot> {
        self.rooms
            .lock()
            .expect("registry lock poisoned")
            .values()
            .map(|room| room.snapshot())
            .collect()
    }

    /// One sweeper pass: expires idle rooms and drops ended ones.
    /// Returns the number of rooms removed.
    pub fn sweep_once(&self, now: Instant) -> usize {
        let candidates: Vec<Arc<Room>> = {
            let rooms = self.rooms.lock().expect("registry lock poisoned");
            rooms.values().cloned().collect()
        };

        let mut expired = Vec::new();
        for room in candidates {
            if room.is_ended() {
                expired.push(room);
            } else if room.idle_for(now) > self.idle_ttl {
                room.expire();
                expired.push(room);
            }
        }

        let mut rooms = self.rooms.lock().expect("registry lock poisoned");
        let mut removed = 0;
        for room in expired {
            if rooms.remove(room.code()).is_some() {
                info!(room = %room.code(), "room swept");
                removed += 1;
            }
        }
        removed
    }

    /// Spawns the background sweeper task.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                registry.sweep_once(Instant::now());
            }
        })
    }

    /// Rejection-samples a code not currently held by any live room.
    fn allocate_code(rooms: &HashMap<String, Arc<Room>>, len: usize) -> String {
        let mut rng = rand::thread_rng();
        loop {
            let code: String = (0..len)
                .map(|_| {
                    let idx = rng.gen_range(0..ROOM_CODE_ALPHABET.len());
                    ROOM_CODE_ALPHABET[idx] as char
                })
                .collect();
            if !rooms.contains_key(&code) {
                return code;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::room::Phase;

    fn registry() -> RoomRegistry {
        RoomRegistry::new(&RoomConfig::default())
    }

    fn outbound() -> OutboundQueue {
        OutboundQueue::new(32).0
    }

    #[test]
    fn test_create_allocates_valid_code() {
        let reg = registry();
        let (room, host) = reg.create("en", "es", Some("Alice"), outbound()).unwrap();

        assert_eq!(room.code().len(), 6);
        assert!(room
            .code()
            .bytes()
            .all(|b| ROOM_CODE_ALPHABET.contains(&b)));
        assert_eq!(host.role, Role::Host);
        assert_eq!(host.language, "en");
        assert_eq!(room.phase(), Phase::Waiting);
        assert_eq!(reg.room_count(), 1);
    }

    #[test]
    fn test_create_rejects_equal_languages() {
        let reg = registry();
        let err = reg.create("en", "en", None, outbound()).unwrap_err();
        assert!(matches!(err, ParlanceError::BadRequest { .. }));
        assert_eq!(reg.room_count(), 0);
    }

    #[test]
    fn test_create_rejects_unknown_language() {
        let reg = registry();
        assert!(reg.create("de", "en", None, outbound()).is_err());
        assert!(reg.create("en", "xx", None, outbound()).is_err());
    }

    #[test]
    fn test_codes_are_unique() {
        let reg = registry();
        let mut codes = std::collections::HashSet::new();
        for _ in 0..50 {
            let (room, _) = reg.create("en", "es", None, outbound()).unwrap();
            assert!(codes.insert(room.code().to_string()), "duplicate code");
        }
    }

    #[test]
    fn test_join_assigns_remaining_language() {
        let reg = registry();
        let (room, _host) = reg.create("en", "pt", Some("Alice"), outbound()).unwrap();

        let (joined, guest, info) = reg
            .join(room.code(), Some("Bob"), outbound())
            .unwrap();
        assert_eq!(joined.code(), room.code());
        assert_eq!(guest.language, "pt");
        assert_eq!(guest.role, Role::Guest);
        assert_eq!(info.partner_name, "Alice");
        assert_eq!(info.partner_language, "en");
    }

    #[test]
    fn test_join_is_case_insensitive() {
        let reg = registry();
        let (room, _host) = reg.create("en", "es", None, outbound()).unwrap();

        let lowercase = room.code().to_lowercase();
        assert!(reg.join(&lowercase, None, outbound()).is_ok());
    }

    #[test]
    fn test_join_missing_room() {
        let reg = registry();
        let err = reg.join("ZZZZZZ", Some("Bob"), outbound()).unwrap_err();
        assert!(matches!(err, ParlanceError::RoomNotFound { .. }));
    }

    #[test]
    fn test_join_full_room() {
        let reg = registry();
        let (room, _host) = reg.create("en", "es", None, outbound()).unwrap();
        reg.join(room.code(), Some("Bob"), outbound()).unwrap();

        let err = reg.join(room.code(), Some("Carol"), outbound()).unwrap_err();
        assert!(matches!(err, ParlanceError::RoomFull { .. }));
    }

    #[test]
    fn test_leave_removes_empty_room() {
        let reg = registry();
        let (room, host) = reg.create("en", "es", None, outbound()).unwrap();
        let (_, guest, _) = reg.join(room.code(), None, outbound()).unwrap();

        reg.leave(&room, guest.id);
        assert_eq!(reg.room_count(), 1);

        reg.leave(&room, host.id);
        assert_eq!(reg.room_count(), 0);
    }

    #[test]
    fn test_host_leave_then_join_fails() {
        let reg = registry();
        let (room, host) = reg.create("en", "es", None, outbound()).unwrap();
        let code = room.code().to_string();
        let (_, _guest, _) = reg.join(&code, None, outbound()).unwrap();

        reg.leave(&room, host.id);
        assert!(room.is_ended());

        let err = reg.join(&code, Some("Late"), outbound()).unwrap_err();
        assert!(matches!(err, ParlanceError::RoomNotFound { .. }));
    }

    #[test]
    fn test_sweep_removes_idle_rooms() {
        let reg = RoomRegistry::new(&RoomConfig {
            idle_ttl_secs: 60,
            ..Default::default()
        });
        let (_room, _host) = reg.create("en", "es", None, outbound()).unwrap();

        // Fresh room survives a sweep
        assert_eq!(reg.sweep_once(Instant::now()), 0);
        assert_eq!(reg.room_count(), 1);

        // Well past the TTL it is expired and removed
        let later = Instant::now() + Duration::from_secs(120);
        assert_eq!(reg.sweep_once(later), 1);
        assert_eq!(reg.room_count(), 0);
    }

    #[test]
    fn test_sweep_keeps_recently_touched_rooms() {
        let reg = RoomRegistry::new(&RoomConfig {
            idle_ttl_secs: 60,
            ..Default::default()
        });
        let (room, _host) = reg.create("en", "es", None, outbound()).unwrap();

        room.touch();
        assert_eq!(reg.sweep_once(Instant::now()), 0);
        assert_eq!(reg.room_count(), 1);
    }

    #[test]
    fn test_snapshots_reflect_rooms() {
        let reg = registry();
        reg.create("en", "es", Some("Alice"), outbound()).unwrap();
        reg.create("pt", "en", Some("Pedro"), outbound()).unwrap();

        let snaps = reg.snapshots();
        assert_eq!(snaps.len(), 2);
        assert!(snaps.iter().all(|s| s.participants.len() == 1));
    }

    #[test]
    fn test_participant_ids_are_unique() {
        let reg = registry();
        let a = reg.allocate_participant_id();
        let b = reg.allocate_participant_id();
        assert_ne!(a, b);
    }
}

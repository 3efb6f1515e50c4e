//! Two-participant room session.
//!
//! A room binds two participant pipelines under a shared phase state
//! machine. Phase mutation, slot assignment, and status broadcast all
//! happen under the single room lock; model calls never do.

use crate::audio::decoder::{ContainerCodec, OpusWebmCodec};
use crate::audio::ingest::{AudioIngest, IngestEvent};
use crate::audio::wav;
use crate::defaults;
use crate::error::{ParlanceError, Result};
use crate::pipeline::{OutputKind, StageOutput, StagePipeline, UtteranceRouter};
use crate::session::Participant;
use crate::wire::message::{ControlMarker, ServerMessage, SPEAKER_PARTNER, SPEAKER_SELF};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, info};

/// Session-level phase controlling mic capture and marker acceptance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Waiting,
    Ready,
    Active,
    Ended,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Phase::Waiting => "waiting",
            Phase::Ready => "ready",
            Phase::Active => "active",
            Phase::Ended => "ended",
        };
        f.write_str(s)
    }
}

/// What a joiner learns about the room.
#[derive(Debug, Clone)]
pub struct JoinInfo {
    pub partner_name: String,
    pub partner_language: String,
}

/// Read-only view of a room for the debug listing.
#[derive(Debug, Clone, Serialize)]
pub struct RoomSnapshot {
    pub room_id: String,
    pub language_host: String,
    pub language_guest: String,
    pub phase: Phase,
    pub participants: Vec<ParticipantSnapshot>,
    pub created_at_unix: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParticipantSnapshot {
    pub name: String,
    pub language: String,
}

struct RoomState {
    phase: Phase,
    host: Option<Arc<Participant>>,
    guest: Option<Arc<Participant>>,
    last_activity: Instant,
    /// Bumped whenever the phase leaves `active`; read tasks reset their
    /// audio state when they observe a new epoch.
    activation_epoch: u64,
}

/// A conversation room. The language pair is fixed at creation; the host
/// slot's language is never reassigned, and the guest is auto-assigned the
/// remaining member of the pair.
pub struct Room {
    code: String,
    lang_host: String,
    lang_guest: String,
    created_at: SystemTime,
    inner: Mutex<RoomState>,
}

impl Room {
    pub fn new(code: String, lang_host: String, lang_guest: String, host: Arc<Participant>) -> Self {
        Self {
            code,
            lang_host,
            lang_guest,
            created_at: SystemTime::now(),
            inner: Mutex::new(RoomState {
                phase: Phase::Waiting,
                host: Some(host),
                guest: None,
                last_activity: Instant::now(),
                activation_epoch: 0,
            }),
        }
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn lang_host(&self) -> &str {
        &self.lang_host
    }

    pub fn lang_guest(&self) -> &str {
        &self.lang_guest
    }

    pub fn phase(&self) -> Phase {
        self.inner.lock().expect("room lock poisoned").phase
    }

    pub fn is_ended(&self) -> bool {
        self.phase() == Phase::Ended
    }

    pub fn activation_epoch(&self) -> u64 {
        self.inner.lock().expect("room lock poisoned").activation_epoch
    }

    /// Records activity for the idle sweeper.
    pub fn touch(&self) {
        self.inner.lock().expect("room lock poisoned").last_activity = Instant::now();
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        let state = self.inner.lock().expect("room lock poisoned");
        now.saturating_duration_since(state.last_activity)
    }

    /// Seats the guest. The host is told who joined and both participants
    /// observe the `ready` transition in the same order.
    pub fn join(&self, guest: Arc<Participant>) -> Result<JoinInfo> {
        let mut state = self.inner.lock().expect("room lock poisoned");

        if state.phase == Phase::Ended {
            return Err(ParlanceError::RoomNotFound {
                code: self.code.clone(),
            });
        }
        if state.guest.is_some() {
            return Err(ParlanceError::RoomFull {
                code: self.code.clone(),
            });
        }
        let host = state.host.clone().ok_or_else(|| ParlanceError::RoomNotFound {
            code: self.code.clone(),
        })?;

        let info = JoinInfo {
            partner_name: host.name.clone(),
            partner_language: host.language.clone(),
        };

        // The joiner learns the room details before any status broadcast.
        guest.outbound.send_json(&ServerMessage::RoomJoined {
            room_id: self.code.clone(),
            language: guest.language.clone(),
            partner_name: info.partner_name.clone(),
            partner_language: info.partner_language.clone(),
        });
        host.outbound.send_json(&ServerMessage::PartnerJoined {
            name: guest.name.clone(),
            language: guest.language.clone(),
        });

        state.guest = Some(guest);
        if state.phase == Phase::Waiting {
            state.phase = Phase::Ready;
        }
        state.last_activity = Instant::now();
        Self::broadcast_status(&state);

        info!(room = %self.code, "guest joined, phase {}", state.phase);
        Ok(info)
    }

    /// Host-only: waiting|ready -> active.
    pub fn start(&self, requester: u64) -> bool {
        let mut state = self.inner.lock().expect("room lock poisoned");
        if !Self::is_host(&state, requester) {
            debug!(room = %self.code, "ignoring START from non-host");
            return false;
        }
        if !matches!(state.phase, Phase::Waiting | Phase::Ready) {
            return false;
        }
        state.phase = Phase::Active;
        state.last_activity = Instant::now();
        Self::broadcast_status(&state);
        info!(room = %self.code, "session started");
        true
    }

    /// Host-only: active -> ready. Mics stop; the room stays alive.
    pub fn end(&self, requester: u64) -> bool {
        let mut state = self.inner.lock().expect("room lock poisoned");
        if !Self::is_host(&state, requester) {
            debug!(room = %self.code, "ignoring END from non-host");
            return false;
        }
        if state.phase != Phase::Active {
            return false;
        }
        state.phase = Phase::Ready;
        state.activation_epoch += 1;
        state.last_activity = Instant::now();
        Self::broadcast_status(&state);
        info!(room = %self.code, "session ended by host");
        true
    }

    /// Toggles a participant's mute flag and notifies the partner. Returns
    /// true if the state changed.
    pub fn set_muted(&self, participant_id: u64, muted: bool) -> bool {
        let state = self.inner.lock().expect("room lock poisoned");
        let Some(me) = Self::find(&state, participant_id) else {
            return false;
        };
        if !me.set_muted(muted) {
            return false;
        }
        if let Some(partner) = Self::partner(&state, participant_id) {
            let message = if muted {
                ServerMessage::PartnerMuted
            } else {
                ServerMessage::PartnerUnmuted
            };
            partner.outbound.send_json(&message);
        }
        true
    }

    /// The other participant, if connected.
    pub fn partner_of(&self, participant_id: u64) -> Option<Arc<Participant>> {
        let state = self.inner.lock().expect("room lock poisoned");
        Self::partner(&state, participant_id)
    }

    /// Removes a departing participant and drives the phase machine:
    /// host departure ends the room, guest departure returns it to
    /// `waiting`. Returns true when the room is empty.
    pub fn leave(&self, participant_id: u64) -> bool {
        let mut state = self.inner.lock().expect("room lock poisoned");

        let is_host = state
            .host
            .as_ref()
            .map(|p| p.id == participant_id)
            .unwrap_or(false);
        let is_guest = state
            .guest
            .as_ref()
            .map(|p| p.id == participant_id)
            .unwrap_or(false);

        if is_host {
            state.host = None;
            if state.phase != Phase::Ended {
                if state.phase == Phase::Active {
                    state.activation_epoch += 1;
                }
                state.phase = Phase::Ended;
                if let Some(guest) = &state.guest {
                    guest.outbound.send_json(&ServerMessage::PartnerLeft);
                }
                Self::broadcast_status(&state);
                if let Some(guest) = &state.guest {
                    guest.outbound.close();
                }
            }
            info!(room = %self.code, "host left, room ended");
        } else if is_guest {
            state.guest = None;
            if state.phase != Phase::Ended {
                if state.phase == Phase::Active {
                    state.activation_epoch += 1;
                }
                state.phase = Phase::Waiting;
                if let Some(host) = &state.host {
                    host.outbound.send_json(&ServerMessage::PartnerLeft);
                }
                Self::broadcast_status(&state);
            }
            info!(room = %self.code, "guest left, phase {}", state.phase);
        }

        state.host.is_none() && state.guest.is_none()
    }

    /// Ends an idle room: both participants observe `ended` and their
    /// connections close gracefully.
    pub fn expire(&self) {
        let mut state = self.inner.lock().expect("room lock poisoned");
        if state.phase == Phase::Ended {
            return;
        }
        if state.phase == Phase::Active {
            state.activation_epoch += 1;
        }
        state.phase = Phase::Ended;
        Self::broadcast_status(&state);
        for participant in state.host.iter().chain(state.guest.iter()) {
            participant.outbound.close();
        }
        info!(room = %self.code, "room expired");
    }

    pub fn snapshot(&self) -> RoomSnapshot {
        let state = self.inner.lock().expect("room lock poisoned");
        let participants = state
            .host
            .iter()
            .chain(state.guest.iter())
            .map(|p| ParticipantSnapshot {
                name: p.name.clone(),
                language: p.language.clone(),
            })
            .collect();
        RoomSnapshot {
            room_id: self.code.clone(),
            language_host: self.lang_host.clone(),
            language_guest: self.lang_guest.clone(),
            phase: state.phase,
            participants,
            created_at_unix: self
                .created_at
                .duration_since(SystemTime::UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
        }
    }

    fn is_host(state: &RoomState, participant_id: u64) -> bool {
        state
            .host
            .as_ref()
            .map(|p| p.id == participant_id)
            .unwrap_or(false)
    }

    fn find(state: &RoomState, participant_id: u64) -> Option<Arc<Participant>> {
        state
            .host
            .iter()
            .chain(state.guest.iter())
            .find(|p| p.id == participant_id)
            .cloned()
    }

    fn partner(state: &RoomState, participant_id: u64) -> Option<Arc<Participant>> {
        state
            .host
            .iter()
            .chain(state.guest.iter())
            .find(|p| p.id != participant_id)
            .cloned()
    }

    /// Sends the current phase to both participants while holding the room
    /// lock, so both observe every transition in the same order.
    fn broadcast_status(state: &RoomState) {
        let message = ServerMessage::SessionStatus { status: state.phase };
        for participant in state.host.iter().chain(state.guest.iter()) {
            participant.outbound.send_json(&message);
        }
    }
}

/// Echo-suppression window bounds.
#[derive(Debug, Clone, Copy)]
pub struct LockWindow {
    pub margin_ms: u64,
    pub min_ms: u64,
    pub max_ms: u64,
}

impl Default for LockWindow {
    fn default() -> Self {
        Self {
            margin_ms: defaults::LOCK_MARGIN_MS,
            min_ms: defaults::LOCK_MIN_MS,
            max_ms: defaults::LOCK_MAX_MS,
        }
    }
}

impl LockWindow {
    pub fn from_config(config: &crate::config::Config) -> Self {
        Self {
            margin_ms: config.pipeline.lock_margin_ms,
            min_ms: config.pipeline.lock_min_ms,
            max_ms: config.pipeline.lock_max_ms,
        }
    }

    /// Lock duration for a synthesized blob: audio length plus margin,
    /// clamped. Unparseable audio falls back to a safe 2 s window.
    pub fn for_wav(&self, wav_bytes: &[u8]) -> u64 {
        let audio_ms = wav::duration_ms(wav_bytes).unwrap_or(2000);
        (audio_ms + self.margin_ms).clamp(self.min_ms, self.max_ms)
    }
}

/// Routes one participant's pipeline outputs across the room: transcripts
/// echo back to the speaker and fan out translated to the partner, with
/// synthesized audio and the mic-lock directive trailing the partner copy.
pub struct RoomRouter {
    room: Arc<Room>,
    me: Arc<Participant>,
    lock: LockWindow,
}

impl RoomRouter {
    pub fn new(room: Arc<Room>, me: Arc<Participant>, lock: LockWindow) -> Self {
        Self { room, me, lock }
    }
}

impl UtteranceRouter for RoomRouter {
    fn target_language(&self, _source_language: &str) -> Option<String> {
        self.room
            .partner_of(self.me.id)
            .map(|partner| partner.language.clone())
    }

    fn wants_tts(&self) -> bool {
        true
    }

    fn deliver(&self, output: StageOutput) {
        let partner = self.room.partner_of(self.me.id);

        match output.kind {
            OutputKind::Partial => {
                self.me.outbound.send_json(&ServerMessage::TranscriptPartial {
                    speaker: SPEAKER_SELF.to_string(),
                    text: output.text.clone(),
                    language: output.language.clone(),
                    translation: output.translation.clone(),
                    target_language: output.target_language.clone(),
                });
                if let Some(partner) = partner {
                    partner.outbound.send_json(&ServerMessage::TranscriptPartial {
                        speaker: SPEAKER_PARTNER.to_string(),
                        text: output.text,
                        language: output.language,
                        translation: output.translation,
                        target_language: output.target_language,
                    });
                }
            }
            OutputKind::Final => {
                let duration = (output.duration_ms as f64 / 10.0).round() / 100.0;

                self.me.outbound.send_json(&ServerMessage::Transcript {
                    speaker: SPEAKER_SELF.to_string(),
                    speaker_name: self.me.name.clone(),
                    text: output.text.clone(),
                    language: output.language.clone(),
                    translation: output.translation.clone(),
                    target_language: output.target_language.clone(),
                    duration,
                    has_tts_audio: false,
                });

                let Some(partner) = partner else {
                    return;
                };

                let has_tts_audio = output.tts_wav.is_some();
                partner.outbound.send_json(&ServerMessage::Transcript {
                    speaker: SPEAKER_PARTNER.to_string(),
                    speaker_name: self.me.name.clone(),
                    text: output.text,
                    language: output.language,
                    translation: output.translation,
                    target_language: output.target_language,
                    duration,
                    has_tts_audio,
                });

                if let Some(wav_bytes) = output.tts_wav {
                    let lock_ms = self.lock.for_wav(&wav_bytes);
                    // The server-side guard starts at dispatch, before the
                    // client can even have begun playback.
                    partner.lock_mic(Duration::from_millis(lock_ms));
                    partner.outbound.send_audio(wav_bytes);
                    partner
                        .outbound
                        .send_json(&ServerMessage::MicLocked { duration_ms: lock_ms });
                    debug!(
                        room = %self.room.code(),
                        partner = %partner.name,
                        lock_ms,
                        "echo suppression armed"
                    );
                }
            }
        }
    }
}

/// Per-connection driver for a room participant. Owned by the read task;
/// all audio state mutation happens here.
pub struct RoomConn<C: ContainerCodec = OpusWebmCodec> {
    room: Arc<Room>,
    me: Arc<Participant>,
    ingest: AudioIngest<C>,
    pipeline: StagePipeline,
    epoch: u64,
}

impl<C: ContainerCodec> RoomConn<C> {
    pub fn new(
        room: Arc<Room>,
        me: Arc<Participant>,
        ingest: AudioIngest<C>,
        pipeline: StagePipeline,
    ) -> Self {
        let epoch = room.activation_epoch();
        Self {
            room,
            me,
            ingest,
            pipeline,
            epoch,
        }
    }

    pub fn room(&self) -> &Arc<Room> {
        &self.room
    }

    pub fn participant(&self) -> &Arc<Participant> {
        &self.me
    }

    /// Handles one inbound binary frame: a 4-byte control marker or an
    /// encoded audio chunk.
    pub fn handle_binary(&mut self, bytes: &[u8]) {
        self.room.touch();

        match crate::wire::message::classify_binary(bytes) {
            crate::wire::message::BinaryFrame::Control(marker) => self.handle_marker(marker),
            crate::wire::message::BinaryFrame::Audio(audio) => self.handle_audio(audio),
        }
    }

    fn handle_marker(&mut self, marker: ControlMarker) {
        match marker {
            ControlMarker::Start => {
                self.room.start(self.me.id);
            }
            ControlMarker::End => {
                self.room.end(self.me.id);
            }
            ControlMarker::Mute => {
                if self.room.set_muted(self.me.id, true) {
                    self.ingest.reset_segmenter();
                }
            }
            ControlMarker::Unmute => {
                self.room.set_muted(self.me.id, false);
            }
        }
    }

    fn handle_audio(&mut self, bytes: &[u8]) {
        // Audio outside the active phase is dropped, not an error.
        if self.room.phase() != Phase::Active {
            return;
        }

        // The stream restarted since the last activation; the client sends
        // a fresh container header on re-arm.
        let epoch = self.room.activation_epoch();
        if epoch != self.epoch {
            self.ingest.reset();
            self.epoch = epoch;
        }

        // Muted or echo-locked audio decodes into the discard so the
        // container parse stays consistent, but never reaches the segmenter.
        if self.me.is_muted() || self.me.mic_locked() {
            self.ingest.decode_discard(bytes);
            return;
        }

        for event in self.ingest.push(bytes) {
            match event {
                IngestEvent::SpeechStart => {
                    debug!(participant = %self.me.name, "speech started");
                }
                IngestEvent::SpeechEnd { pcm, duration_ms } => {
                    self.pipeline.submit_final(pcm, duration_ms);
                }
            }
        }

        if self.ingest.is_speaking()
            && self.pipeline.partial_idle()
            && self.ingest.utterance_len() >= self.pipeline.partial_min_samples()
        {
            self.pipeline.maybe_submit_partial(self.ingest.utterance_snapshot());
        }
    }

    /// Tears down the pipeline on disconnect.
    pub fn finish(&self) {
        self.pipeline.abort();
    }
}

//! Wire protocol messages and binary frame classification.
//!
//! TEXT frames carry internally-tagged JSON; BINARY frames carry either
//! encoded audio (client to server), a 4-byte control marker (client to
//! server, room mode only), or a synthesized WAV blob (server to client).

use crate::error::ErrorKind;
use crate::session::room::Phase;
use serde::{Deserialize, Serialize};

/// `speaker` value for payloads about the recipient's own speech.
pub const SPEAKER_SELF: &str = "self";
/// `speaker` value for payloads about the other participant's speech.
pub const SPEAKER_PARTNER: &str = "partner";

/// Messages sent from the server to a client as JSON text frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    RoomCreated {
        room_id: String,
        language: String,
    },
    RoomJoined {
        room_id: String,
        language: String,
        partner_name: String,
        partner_language: String,
    },
    PartnerJoined {
        name: String,
        language: String,
    },
    PartnerLeft,
    SessionStatus {
        status: Phase,
    },
    PartnerMuted,
    PartnerUnmuted,
    TranscriptPartial {
        speaker: String,
        text: String,
        language: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        translation: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        target_language: Option<String>,
    },
    Transcript {
        speaker: String,
        speaker_name: String,
        text: String,
        language: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        translation: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        target_language: Option<String>,
        /// Utterance duration in seconds.
        duration: f64,
        has_tts_audio: bool,
    },
    MicLocked {
        duration_ms: u64,
    },
    Error {
        message: String,
        kind: ErrorKind,
    },
}

impl ServerMessage {
    /// Serialize to a JSON string for a text frame.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from a JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }

    /// Builds an `error` payload from an error's message and wire kind.
    pub fn error(err: &crate::error::ParlanceError) -> Self {
        ServerMessage::Error {
            message: err.to_string(),
            kind: err.kind(),
        }
    }
}

/// Room control markers carried as exact 4-byte binary frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMarker {
    /// Host starts the session.
    Start,
    /// Host ends the session.
    End,
    /// Sender muted their microphone.
    Mute,
    /// Sender unmuted their microphone.
    Unmute,
}

impl ControlMarker {
    pub const START: &'static [u8; 4] = b"STRT";
    pub const END: &'static [u8; 4] = b"ENDS";
    pub const MUTE: &'static [u8; 4] = b"MUTE";
    pub const UNMUTE: &'static [u8; 4] = b"UNMT";

    /// Parses a marker from an exact 4-byte payload.
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != 4 {
            return None;
        }
        match <&[u8; 4]>::try_from(bytes).ok()? {
            b if b == Self::START => Some(ControlMarker::Start),
            b if b == Self::END => Some(ControlMarker::End),
            b if b == Self::MUTE => Some(ControlMarker::Mute),
            b if b == Self::UNMUTE => Some(ControlMarker::Unmute),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> &'static [u8; 4] {
        match self {
            ControlMarker::Start => Self::START,
            ControlMarker::End => Self::END,
            ControlMarker::Mute => Self::MUTE,
            ControlMarker::Unmute => Self::UNMUTE,
        }
    }
}

/// Classification of an inbound binary frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryFrame<'a> {
    Control(ControlMarker),
    Audio(&'a [u8]),
}

/// Classifies an inbound binary frame. Any 4-byte frame matching a known
/// marker is control; everything else is encoded audio.
pub fn classify_binary(bytes: &[u8]) -> BinaryFrame<'_> {
    match ControlMarker::parse(bytes) {
        Some(marker) => BinaryFrame::Control(marker),
        None => BinaryFrame::Audio(bytes),
    }
}

//! Default configuration constants for parlance.
//!
//! This module provides shared constants used across different configuration
//! types to ensure consistency and eliminate duplication.

/// Pipeline audio sample rate in Hz.
///
/// Everything downstream of the decoder (VAD windows, utterance PCM, ASR
/// input) runs at 16 kHz mono; the container's native 48 kHz is decimated
/// down to this rate on ingest.
pub const SAMPLE_RATE: u32 = 16_000;

/// Native sample rate of the Opus streams browsers produce.
pub const CONTAINER_SAMPLE_RATE: u32 = 48_000;

/// Decimation factor from the container rate down to the pipeline rate.
pub const DECIMATION: usize = (CONTAINER_SAMPLE_RATE / SAMPLE_RATE) as usize;

/// VAD window size in samples (~32 ms at 16 kHz), fixed by the Silero model.
pub const VAD_WINDOW: usize = 512;

/// Speech probability above which a window counts as speech.
pub const SPEECH_PROBABILITY_THRESHOLD: f32 = 0.5;

/// RMS threshold for the energy-based speech gate fallback.
pub const ENERGY_THRESHOLD: f32 = 0.02;

/// Silence duration in milliseconds before an utterance is considered ended.
///
/// 500 ms tolerates short intra-utterance pauses while keeping end-of-speech
/// latency low enough for conversational turn-taking.
pub const SILENCE_MS: u32 = 500;

/// Minimum accumulated speech before an interim transcript is attempted.
pub const PARTIAL_MIN_MS: u32 = 1000;

/// EBML magic that opens every WebM/Matroska byte stream.
pub const WEBM_MAGIC: [u8; 4] = [0x1A, 0x45, 0xDF, 0xA3];

/// Upper bound on buffered bytes while the decoder has not yet seen a
/// parseable container header. Keeps a misbehaving client from growing the
/// buffer without bound between header refreshes.
pub const MAX_UNPRIMED_BYTES: usize = 1024 * 1024;

/// Length of generated room codes.
pub const ROOM_CODE_LEN: usize = 6;

/// Room code alphabet with ambiguous characters (O/0, I/1/L) removed.
pub const ROOM_CODE_ALPHABET: &[u8] = b"ABCDEFGHJKMNPQRSTUVWXYZ23456789";

/// Seconds a room may sit idle before the sweeper deletes it.
pub const ROOM_IDLE_TTL_SECS: u64 = 600;

/// Interval between registry sweeper passes.
pub const ROOM_SWEEP_INTERVAL_SECS: u64 = 60;

/// Maximum display name length after trimming.
pub const MAX_NAME_LEN: usize = 20;

/// Fallback display name when the client sends none.
pub const DEFAULT_NAME: &str = "User";

/// Bounded per-connection outbound queue size. Overflow means the client is
/// too slow and the connection is closed.
pub const OUTBOUND_QUEUE: usize = 64;

/// Bounded per-participant final-utterance queue size.
pub const FINAL_QUEUE: usize = 8;

/// Echo-suppression margin added to the synthesized audio length.
pub const LOCK_MARGIN_MS: u64 = 300;

/// Echo-suppression window clamp bounds.
pub const LOCK_MIN_MS: u64 = 1000;
pub const LOCK_MAX_MS: u64 = 4000;

/// Per-stage model call budgets in seconds.
pub const ASR_TIMEOUT_SECS: u64 = 15;
pub const MT_TIMEOUT_SECS: u64 = 5;
pub const TTS_TIMEOUT_SECS: u64 = 10;

/// Default bind address for the server.
pub const BIND_ADDR: &str = "127.0.0.1:8080";

/// Language codes the translation pipeline supports.
pub const SUPPORTED_LANGUAGES: [&str; 3] = ["en", "es", "pt"];

/// Language value that requests automatic language detection.
pub const AUTO_LANGUAGE: &str = "auto";

/// Returns true if `lang` is one of the supported short codes.
pub fn is_supported_language(lang: &str) -> bool {
    SUPPORTED_LANGUAGES.contains(&lang)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decimation_matches_rates() {
        assert_eq!(DECIMATION, 3);
        assert_eq!(CONTAINER_SAMPLE_RATE / DECIMATION as u32, SAMPLE_RATE);
    }

    #[test]
    fn alphabet_has_no_ambiguous_characters() {
        for c in [b'O', b'0', b'I', b'1', b'L'] {
            assert!(!ROOM_CODE_ALPHABET.contains(&c));
        }
    }

    #[test]
    fn supported_language_check() {
        assert!(is_supported_language("en"));
        assert!(is_supported_language("es"));
        assert!(is_supported_language("pt"));
        assert!(!is_supported_language("de"));
        assert!(!is_supported_language("auto"));
    }
}

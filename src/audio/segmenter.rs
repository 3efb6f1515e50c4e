//! Voice activity segmentation.
//!
//! Converts per-window speech probabilities into utterance boundary events
//! via a silence-duration state machine: speech opens an utterance, and the
//! utterance closes once enough consecutive silent windows accumulate.

use crate::capability::vad::SpeechGate;
use crate::defaults;
use crate::error::Result;

/// Configuration for the voice segmenter.
#[derive(Debug, Clone, Copy)]
pub struct SegmenterConfig {
    /// Window size in samples fed to the speech gate.
    pub window: usize,
    /// Sample rate of the incoming PCM.
    pub sample_rate: u32,
    /// Silence duration before an utterance is considered ended.
    pub silence_ms: u32,
    /// Probability at or above which a window counts as speech.
    pub speech_threshold: f32,
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self {
            window: defaults::VAD_WINDOW,
            sample_rate: defaults::SAMPLE_RATE,
            silence_ms: defaults::SILENCE_MS,
            speech_threshold: defaults::SPEECH_PROBABILITY_THRESHOLD,
        }
    }
}

impl SegmenterConfig {
    pub fn from_config(config: &crate::config::Config) -> Self {
        Self {
            window: config.audio.vad_window,
            sample_rate: config.audio.sample_rate,
            silence_ms: config.audio.silence_ms,
            speech_threshold: defaults::SPEECH_PROBABILITY_THRESHOLD,
        }
    }
}

/// Utterance boundary events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentEvent {
    SpeechStart,
    SpeechEnd {
        /// Cumulative speech duration of the utterance in milliseconds.
        duration_ms: u32,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SegmentState {
    Idle,
    Speaking,
}

/// Silence-duration segmenter over a speech gate.
pub struct VoiceSegmenter {
    config: SegmenterConfig,
    gate: Box<dyn SpeechGate>,
    state: SegmentState,
    silent_windows: u32,
    speech_windows: u32,
    /// Windows of silence that end an utterance.
    silence_window_threshold: u32,
}

impl VoiceSegmenter {
    pub fn new(config: SegmenterConfig, gate: Box<dyn SpeechGate>) -> Self {
        let window_ms = (config.window as u64 * 1000 / config.sample_rate as u64).max(1) as u32;
        let silence_window_threshold = config.silence_ms.div_ceil(window_ms).max(1);
        Self {
            config,
            gate,
            state: SegmentState::Idle,
            silent_windows: 0,
            speech_windows: 0,
            silence_window_threshold,
        }
    }

    /// Milliseconds represented by one window.
    pub fn window_ms(&self) -> u32 {
        (self.config.window as u64 * 1000 / self.config.sample_rate as u64).max(1) as u32
    }

    /// Window size in samples callers must feed to `update`.
    pub fn window(&self) -> usize {
        self.config.window
    }

    /// True while inside an utterance.
    pub fn is_speaking(&self) -> bool {
        self.state == SegmentState::Speaking
    }

    /// Consumes exactly one window of 16 kHz mono PCM and returns at most
    /// one boundary event.
    pub fn update(&mut self, window: &[f32]) -> Result<Option<SegmentEvent>> {
        debug_assert_eq!(window.len(), self.config.window);

        let prob = self.gate.probability(window)?;
        let is_speech = prob >= self.config.speech_threshold;

        let event = match self.state {
            SegmentState::Idle => {
                if is_speech {
                    self.state = SegmentState::Speaking;
                    self.silent_windows = 0;
                    self.speech_windows = 1;
                    Some(SegmentEvent::SpeechStart)
                } else {
                    None
                }
            }
            SegmentState::Speaking => {
                if is_speech {
                    self.silent_windows = 0;
                    self.speech_windows += 1;
                    None
                } else {
                    self.silent_windows += 1;
                    if self.silent_windows >= self.silence_window_threshold {
                        let duration_ms = self.speech_windows * self.window_ms();
                        self.state = SegmentState::Idle;
                        self.silent_windows = 0;
                        self.speech_windows = 0;
                        Some(SegmentEvent::SpeechEnd { duration_ms })
                    } else {
                        None
                    }
                }
            }
        };

        Ok(event)
    }

    /// Resets the state machine and the gate's recurrent state. Must be
    /// called whenever the participant's stream stops (phase leaves active,
    /// mute, disconnect).
    pub fn reset(&mut self) {
        self.state = SegmentState::Idle;
        self.silent_windows = 0;
        self.speech_windows = 0;
        self.gate.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::vad::EnergyGate;

    fn segmenter(silence_ms: u32) -> VoiceSegmenter {
        let config = SegmenterConfig {
            silence_ms,
            ..Default::default()
        };
        VoiceSegmenter::new(config, Box::new(EnergyGate::new(0.02)))
    }

    fn speech_window() -> Vec<f32> {
        vec![0.5f32; defaults::VAD_WINDOW]
    }

    fn silence_window() -> Vec<f32> {
        vec![0.0f32; defaults::VAD_WINDOW]
    }

    #[test]
    fn test_starts_idle() {
        let seg = segmenter(500);
        assert!(!seg.is_speaking());
    }

    #[test]
    fn test_silence_threshold_in_windows() {
        let seg = segmenter(500);
        // ceil(500 / 32) = 16 windows at 512 samples / 16 kHz
        assert_eq!(seg.silence_window_threshold, 16);
        assert_eq!(seg.window_ms(), 32);
    }

    #[test]
    fn test_speech_start_event() {
        let mut seg = segmenter(500);

        assert_eq!(seg.update(&silence_window()).unwrap(), None);
        assert!(!seg.is_speaking());

        let event = seg.update(&speech_window()).unwrap();
        assert_eq!(event, Some(SegmentEvent::SpeechStart));
        assert!(seg.is_speaking());
    }

    #[test]
    fn test_no_event_during_continuous_speech() {
        let mut seg = segmenter(500);
        seg.update(&speech_window()).unwrap();

        for _ in 0..50 {
            assert_eq!(seg.update(&speech_window()).unwrap(), None);
        }
        assert!(seg.is_speaking());
    }

    #[test]
    fn test_speech_end_after_silence_hangover() {
        let mut seg = segmenter(500);
        seg.update(&speech_window()).unwrap();

        // Silence below the threshold keeps the utterance open
        for _ in 0..15 {
            assert_eq!(seg.update(&silence_window()).unwrap(), None);
            assert!(seg.is_speaking());
        }

        // The 16th silent window closes it
        let event = seg.update(&silence_window()).unwrap();
        assert!(matches!(event, Some(SegmentEvent::SpeechEnd { .. })));
        assert!(!seg.is_speaking());
    }

    #[test]
    fn test_short_pause_does_not_end_utterance() {
        let mut seg = segmenter(500);
        seg.update(&speech_window()).unwrap();

        // Brief pause, then speech resumes: the silence counter resets
        for _ in 0..10 {
            seg.update(&silence_window()).unwrap();
        }
        assert_eq!(seg.update(&speech_window()).unwrap(), None);

        for _ in 0..15 {
            assert_eq!(seg.update(&silence_window()).unwrap(), None);
        }
        assert!(seg.is_speaking());
    }

    #[test]
    fn test_speech_duration_counts_speech_windows() {
        let mut seg = segmenter(500);

        seg.update(&speech_window()).unwrap();
        for _ in 0..9 {
            seg.update(&speech_window()).unwrap();
        }

        let mut end = None;
        for _ in 0..20 {
            if let Some(event) = seg.update(&silence_window()).unwrap() {
                end = Some(event);
                break;
            }
        }

        match end {
            Some(SegmentEvent::SpeechEnd { duration_ms }) => {
                // 10 speech windows * 32 ms
                assert_eq!(duration_ms, 320);
            }
            other => panic!("expected SpeechEnd, got {:?}", other),
        }
    }

    #[test]
    fn test_reset_returns_to_idle() {
        let mut seg = segmenter(500);
        seg.update(&speech_window()).unwrap();
        assert!(seg.is_speaking());

        seg.reset();
        assert!(!seg.is_speaking());

        // A new utterance starts cleanly after reset
        let event = seg.update(&speech_window()).unwrap();
        assert_eq!(event, Some(SegmentEvent::SpeechStart));
    }

    #[test]
    fn test_two_utterances_in_sequence() {
        let mut seg = segmenter(500);

        seg.update(&speech_window()).unwrap();
        for _ in 0..16 {
            seg.update(&silence_window()).unwrap();
        }
        assert!(!seg.is_speaking());

        let event = seg.update(&speech_window()).unwrap();
        assert_eq!(event, Some(SegmentEvent::SpeechStart));
    }

    #[test]
    fn test_at_most_one_event_per_window() {
        let mut seg = segmenter(500);
        let mut events = 0;
        for _ in 0..100 {
            if seg.update(&speech_window()).unwrap().is_some() {
                events += 1;
            }
        }
        assert_eq!(events, 1);
    }
}

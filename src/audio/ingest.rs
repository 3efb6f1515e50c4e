//! Per-participant audio ingest state.
//!
//! Owns the stream decoder, the voice segmenter, and the PCM accumulator
//! for the current utterance. Exactly one read task mutates this state;
//! completions from workers never touch it.

use crate::audio::decoder::{ContainerCodec, OpusWebmCodec, StreamDecoder};
use crate::audio::segmenter::{SegmentEvent, VoiceSegmenter};
use tracing::warn;

/// Events surfaced to the session layer per ingested chunk.
#[derive(Debug, Clone, PartialEq)]
pub enum IngestEvent {
    SpeechStart,
    /// A finished utterance with its frozen PCM.
    SpeechEnd { pcm: Vec<f32>, duration_ms: u32 },
}

/// Decoder + segmenter + utterance accumulator for one participant.
pub struct AudioIngest<C: ContainerCodec = OpusWebmCodec> {
    decoder: StreamDecoder<C>,
    segmenter: VoiceSegmenter,
    /// Carry buffer of decoded PCM not yet window-aligned.
    pcm_carry: Vec<f32>,
    /// PCM of the utterance currently in progress.
    utterance: Vec<f32>,
}

impl AudioIngest<OpusWebmCodec> {
    pub fn new(segmenter: VoiceSegmenter) -> Self {
        Self::with_decoder(StreamDecoder::new(), segmenter)
    }
}

impl<C: ContainerCodec> AudioIngest<C> {
    pub fn with_decoder(decoder: StreamDecoder<C>, segmenter: VoiceSegmenter) -> Self {
        Self {
            decoder,
            segmenter,
            pcm_carry: Vec::new(),
            utterance: Vec::new(),
        }
    }

    /// Decodes a chunk, runs segmentation over complete windows, and
    /// returns any boundary events. Never blocks on a model other than the
    /// speech gate, which is fast enough to run inline.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<IngestEvent> {
        let new_samples = self.decoder.ingest(chunk);
        if new_samples.is_empty() {
            return Vec::new();
        }
        self.pcm_carry.extend_from_slice(&new_samples);

        let window = self.segmenter.window();
        let mut events = Vec::new();

        while self.pcm_carry.len() >= window {
            let chunk: Vec<f32> = self.pcm_carry.drain(..window).collect();

            let event = match self.segmenter.update(&chunk) {
                Ok(event) => event,
                Err(e) => {
                    warn!("speech gate failed: {}", e);
                    continue;
                }
            };

            // Accumulate utterance PCM while inside speech, including the
            // silence hangover windows.
            if self.segmenter.is_speaking() {
                self.utterance.extend_from_slice(&chunk);
            }

            match event {
                Some(SegmentEvent::SpeechStart) => {
                    self.utterance = chunk;
                    events.push(IngestEvent::SpeechStart);
                }
                Some(SegmentEvent::SpeechEnd { duration_ms }) => {
                    let pcm = std::mem::take(&mut self.utterance);
                    events.push(IngestEvent::SpeechEnd { pcm, duration_ms });
                }
                None => {}
            }
        }

        events
    }

    /// Decodes a chunk and discards the PCM. Used while the participant is
    /// muted or echo-locked so the container parse stays consistent without
    /// feeding the segmenter.
    pub fn decode_discard(&mut self, chunk: &[u8]) {
        let _ = self.decoder.ingest(chunk);
    }

    /// True while inside an utterance.
    pub fn is_speaking(&self) -> bool {
        self.segmenter.is_speaking()
    }

    /// Samples accumulated for the utterance in progress.
    pub fn utterance_len(&self) -> usize {
        self.utterance.len()
    }

    /// Copy of the current utterance PCM for a partial transcription job.
    pub fn utterance_snapshot(&self) -> Vec<f32> {
        self.utterance.clone()
    }

    /// Resets decoder, segmenter, and utterance state. Called when the
    /// phase leaves active, on mute, and on stream teardown.
    pub fn reset(&mut self) {
        self.decoder.reset();
        self.segmenter.reset();
        self.pcm_carry.clear();
        self.utterance.clear();
    }

    /// Resets only the segmentation state, keeping the decoder's container
    /// position. Used on mute, where audio keeps decoding into the discard.
    pub fn reset_segmenter(&mut self) {
        self.segmenter.reset();
        self.pcm_carry.clear();
        self.utterance.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::decoder::MockContainerCodec;
    use crate::audio::segmenter::SegmenterConfig;
    use crate::capability::vad::EnergyGate;
    use crate::defaults::VAD_WINDOW;

    fn stream_of(samples: &[u8]) -> Vec<u8> {
        MockContainerCodec::stream_of(samples)
    }

    fn ingest() -> AudioIngest<MockContainerCodec> {
        let segmenter = VoiceSegmenter::new(
            SegmenterConfig::default(),
            Box::new(EnergyGate::new(0.02)),
        );
        AudioIngest::with_decoder(StreamDecoder::with_codec(MockContainerCodec), segmenter)
    }

    /// Bytes decoding to loud samples (~0.63) for `n` windows.
    fn speech_bytes(windows: usize) -> Vec<u8> {
        vec![80u8; windows * VAD_WINDOW]
    }

    /// Bytes decoding to silence for `n` windows.
    fn silence_bytes(windows: usize) -> Vec<u8> {
        vec![0u8; windows * VAD_WINDOW]
    }

    #[test]
    fn test_speech_start_and_end() {
        let mut ing = ingest();

        let mut stream = stream_of(&speech_bytes(10));
        let events = ing.push(&stream);
        assert_eq!(events, vec![IngestEvent::SpeechStart]);
        assert!(ing.is_speaking());

        stream = silence_bytes(17);
        let events = ing.push(&stream);
        assert_eq!(events.len(), 1);
        match &events[0] {
            IngestEvent::SpeechEnd { pcm, duration_ms } => {
                assert!(!pcm.is_empty());
                // 10 speech windows * 32 ms
                assert_eq!(*duration_ms, 320);
            }
            other => panic!("expected SpeechEnd, got {:?}", other),
        }
        assert!(!ing.is_speaking());
    }

    #[test]
    fn test_utterance_pcm_includes_hangover() {
        let mut ing = ingest();
        ing.push(&stream_of(&speech_bytes(5)));

        let events = ing.push(&silence_bytes(16));
        match &events[0] {
            IngestEvent::SpeechEnd { pcm, .. } => {
                // 5 speech windows plus 15 hangover silence windows (the
                // 16th closes the utterance before accumulating).
                assert_eq!(pcm.len(), (5 + 15) * VAD_WINDOW);
            }
            other => panic!("expected SpeechEnd, got {:?}", other),
        }
    }

    #[test]
    fn test_snapshot_grows_during_speech() {
        let mut ing = ingest();
        ing.push(&stream_of(&speech_bytes(3)));
        let len_a = ing.utterance_len();
        assert_eq!(len_a, 3 * VAD_WINDOW);

        ing.push(&speech_bytes(2));
        assert_eq!(ing.utterance_len(), 5 * VAD_WINDOW);
        assert_eq!(ing.utterance_snapshot().len(), 5 * VAD_WINDOW);
    }

    #[test]
    fn test_partial_window_carries() {
        let mut ing = ingest();
        // Half a window produces no events and no speaking state
        let half = VAD_WINDOW / 2;
        let events = ing.push(&stream_of(&vec![80u8; half]));
        assert!(events.is_empty());
        assert!(!ing.is_speaking());

        // The second half completes the window
        let events = ing.push(&vec![80u8; half]);
        assert_eq!(events, vec![IngestEvent::SpeechStart]);
    }

    #[test]
    fn test_decode_discard_produces_no_events() {
        let mut ing = ingest();
        ing.decode_discard(&stream_of(&speech_bytes(10)));
        assert!(!ing.is_speaking());
        assert_eq!(ing.utterance_len(), 0);

        // The decoder stayed consistent: subsequent pushes still decode
        let events = ing.push(&speech_bytes(2));
        assert_eq!(events, vec![IngestEvent::SpeechStart]);
    }

    #[test]
    fn test_reset_clears_everything() {
        let mut ing = ingest();
        ing.push(&stream_of(&speech_bytes(4)));
        assert!(ing.is_speaking());

        ing.reset();
        assert!(!ing.is_speaking());
        assert_eq!(ing.utterance_len(), 0);

        // A fresh container header starts a clean stream
        let events = ing.push(&stream_of(&speech_bytes(2)));
        assert_eq!(events, vec![IngestEvent::SpeechStart]);
    }

    #[test]
    fn test_reset_segmenter_keeps_decoder() {
        let mut ing = ingest();
        ing.push(&stream_of(&speech_bytes(4)));
        assert!(ing.is_speaking());

        ing.reset_segmenter();
        assert!(!ing.is_speaking());

        // Mid-stream bytes still decode without a new header
        let events = ing.push(&speech_bytes(1));
        assert_eq!(events, vec![IngestEvent::SpeechStart]);
    }
}

//! Single-participant session: transcribe, optionally translate, and
//! optionally speak back on the same connection.

use crate::audio::decoder::{ContainerCodec, OpusWebmCodec};
use crate::audio::ingest::{AudioIngest, IngestEvent};
use crate::pipeline::{OutputKind, StageOutput, StagePipeline, UtteranceRouter};
use crate::wire::message::{ServerMessage, SPEAKER_SELF};
use crate::wire::outbound::OutboundQueue;
use tracing::debug;

/// Validated query options for a solo connection.
#[derive(Debug, Clone, PartialEq)]
pub struct SoloOptions {
    /// Forced source language, `None` for auto-detection.
    pub language: Option<String>,
    /// Translation target, `None` to transcribe only.
    pub target_language: Option<String>,
    pub tts: bool,
}

impl Default for SoloOptions {
    fn default() -> Self {
        Self {
            language: None,
            target_language: None,
            tts: false,
        }
    }
}

/// Routes pipeline outputs back to the connection that sent the audio.
/// No echo suppression: the speaker asked to hear the synthesis.
pub struct SoloRouter {
    outbound: OutboundQueue,
    options: SoloOptions,
}

impl SoloRouter {
    pub fn new(outbound: OutboundQueue, options: SoloOptions) -> Self {
        Self { outbound, options }
    }
}

impl UtteranceRouter for SoloRouter {
    fn target_language(&self, _source_language: &str) -> Option<String> {
        self.options.target_language.clone()
    }

    fn wants_tts(&self) -> bool {
        self.options.tts && self.options.target_language.is_some()
    }

    fn deliver(&self, output: StageOutput) {
        match output.kind {
            OutputKind::Partial => {
                self.outbound.send_json(&ServerMessage::TranscriptPartial {
                    speaker: SPEAKER_SELF.to_string(),
                    text: output.text,
                    language: output.language,
                    translation: output.translation,
                    target_language: output.target_language,
                });
            }
            OutputKind::Final => {
                let duration = (output.duration_ms as f64 / 10.0).round() / 100.0;
                let has_tts_audio = output.tts_wav.is_some();
                self.outbound.send_json(&ServerMessage::Transcript {
                    speaker: SPEAKER_SELF.to_string(),
                    speaker_name: SPEAKER_SELF.to_string(),
                    text: output.text,
                    language: output.language,
                    translation: output.translation,
                    target_language: output.target_language,
                    duration,
                    has_tts_audio,
                });
                if let Some(wav_bytes) = output.tts_wav {
                    self.outbound.send_audio(wav_bytes);
                }
            }
        }
    }
}

/// Per-connection driver for a solo participant.
pub struct SoloConn<C: ContainerCodec = OpusWebmCodec> {
    ingest: AudioIngest<C>,
    pipeline: StagePipeline,
}

impl<C: ContainerCodec> SoloConn<C> {
    pub fn new(ingest: AudioIngest<C>, pipeline: StagePipeline) -> Self {
        Self { ingest, pipeline }
    }

    /// Handles one inbound binary frame. Solo mode defines no control
    /// markers; every binary frame is encoded audio.
    pub fn handle_binary(&mut self, bytes: &[u8]) {
        for event in self.ingest.push(bytes) {
            match event {
                IngestEvent::SpeechStart => {
                    debug!("speech started");
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

    pub fn finish(&self) {
        self.pipeline.abort();
    }
}

//! Per-utterance staged pipeline: ASR, then MT, then TTS, without ever
//! blocking the connection read task.
//!
//! Three rules govern the engine:
//! - Ingest is never blocked: model calls run on the blocking pool behind
//!   the shared worker semaphore.
//! - At most one interim transcription is in flight per participant; a
//!   would-be partial while one is running is skipped, not queued.
//! - Delivery is generation-gated: results tagged with a stale utterance
//!   generation are dropped silently.

pub mod stage;

pub use stage::StagePipeline;

use crate::config::Config;
use std::time::Duration;

/// Pipeline tuning knobs, resolved from [`Config`].
#[derive(Debug, Clone)]
pub struct StageConfig {
    pub sample_rate: u32,
    pub partial_min_ms: u32,
    pub partial_translation: bool,
    pub asr_timeout: Duration,
    pub mt_timeout: Duration,
    pub tts_timeout: Duration,
    pub final_queue: usize,
}

impl StageConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            sample_rate: config.audio.sample_rate,
            partial_min_ms: config.pipeline.partial_min_ms,
            partial_translation: config.pipeline.partial_translation,
            asr_timeout: Duration::from_secs(config.pipeline.asr_timeout_secs),
            mt_timeout: Duration::from_secs(config.pipeline.mt_timeout_secs),
            tts_timeout: Duration::from_secs(config.pipeline.tts_timeout_secs),
            final_queue: crate::defaults::FINAL_QUEUE,
        }
    }
}

impl Default for StageConfig {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Whether an output is an interim or a final transcript.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    Partial,
    Final,
}

/// One processed utterance result handed to the router.
#[derive(Debug, Clone)]
pub struct StageOutput {
    /// Utterance generation this output belongs to.
    pub generation: u64,
    pub kind: OutputKind,
    pub text: String,
    /// Detected (or forced) source language.
    pub language: String,
    pub translation: Option<String>,
    pub target_language: Option<String>,
    /// Speech duration in milliseconds; zero for partials.
    pub duration_ms: u32,
    /// Synthesized WAV for the recipient, finals only.
    pub tts_wav: Option<Vec<u8>>,
}

/// Direction-specific delivery seam.
///
/// Implementations resolve the translation target at processing time (the
/// partner may join or leave mid-utterance) and fan the result out to the
/// right connections. `deliver` must not block; it pushes onto bounded
/// outbound queues.
pub trait UtteranceRouter: Send + Sync + 'static {
    /// Translation target for an utterance detected in `source_language`,
    /// or `None` to relay untranslated.
    fn target_language(&self, source_language: &str) -> Option<String>;

    /// Whether synthesized audio should be produced for this direction.
    fn wants_tts(&self) -> bool;

    /// Delivers a processed output.
    fn deliver(&self, output: StageOutput);
}

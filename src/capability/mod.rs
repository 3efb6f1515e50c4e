//! Capability adapters: thin, synchronous wrappers over the VAD, ASR, MT
//! and TTS models with defined contracts and singleton lifetimes.
//!
//! Model calls never run on the connection read tasks; the pipeline routes
//! them through `spawn_blocking` bounded by the shared worker semaphore
//! held here.

pub mod asr;
pub mod mt;
pub mod tts;
pub mod vad;

use crate::config::Config;
use crate::error::{ParlanceError, Result};
use std::sync::Arc;
use tokio::sync::Semaphore;

pub use asr::{MockTranscriber, Transcriber, Transcript};
pub use mt::{MockTranslator, Translator};
pub use tts::{MockSynthesizer, Synthesizer};
pub use vad::{EnergyGate, GateBackend, SpeechGate};

/// The capability bundle shared by every session.
pub struct Capabilities {
    pub asr: Arc<dyn Transcriber>,
    pub mt: Arc<dyn Translator>,
    pub tts: Arc<dyn Synthesizer>,
    gate_backend: GateBackend,
    /// Shared worker pool for CPU-bound model calls across all rooms.
    pub workers: Arc<Semaphore>,
}

impl Capabilities {
    /// Assembles a bundle from explicit adapters. Production code wires the
    /// model backends; tests and the mock mode wire the mock adapters.
    pub fn new(
        asr: Arc<dyn Transcriber>,
        mt: Arc<dyn Translator>,
        tts: Arc<dyn Synthesizer>,
        gate_backend: GateBackend,
        worker_concurrency: usize,
    ) -> Self {
        Self {
            asr,
            mt,
            tts,
            gate_backend,
            workers: Arc::new(Semaphore::new(worker_concurrency.max(1))),
        }
    }

    /// All-mock bundle for tests and `--mock-capabilities` runs.
    pub fn mock(config: &Config) -> Self {
        Self::new(
            Arc::new(MockTranscriber::new("mock-asr")),
            Arc::new(MockTranslator::new()),
            Arc::new(MockSynthesizer::new()),
            GateBackend::Energy {
                threshold: config.audio.energy_threshold,
            },
            config.worker_concurrency(),
        )
    }

    /// Initializes the real model backends from configuration.
    ///
    /// Fails with `capability_unavailable` when a required model cannot be
    /// loaded; this is fatal at startup.
    pub fn initialize(config: &Config) -> Result<Self> {
        let gate_backend = Self::gate_backend(config)?;
        gate_backend.verify()?;

        let asr = Self::build_asr(config)?;
        let mt = Self::build_mt(config)?;
        let tts = Self::build_tts(config)?;

        tracing::info!(
            asr = asr.model_name(),
            workers = config.worker_concurrency(),
            "capabilities initialized"
        );

        Ok(Self::new(
            asr,
            mt,
            tts,
            gate_backend,
            config.worker_concurrency(),
        ))
    }

    /// Builds a fresh per-participant speech gate.
    pub fn speech_gate(&self) -> Result<Box<dyn SpeechGate>> {
        self.gate_backend.build()
    }

    fn gate_backend(config: &Config) -> Result<GateBackend> {
        match &config.models.vad_model {
            None => Ok(GateBackend::Energy {
                threshold: config.audio.energy_threshold,
            }),
            #[cfg(feature = "silero")]
            Some(path) => Ok(GateBackend::Silero { model: path.clone() }),
            #[cfg(not(feature = "silero"))]
            Some(_) => Err(ParlanceError::CapabilityUnavailable {
                name: "vad".to_string(),
                message: "models.vad_model set but built without the 'silero' feature"
                    .to_string(),
            }),
        }
    }

    #[cfg(feature = "whisper")]
    fn build_asr(config: &Config) -> Result<Arc<dyn Transcriber>> {
        let path = std::path::Path::new(&config.models.whisper_model);
        Ok(Arc::new(asr::WhisperTranscriber::new(path)?))
    }

    #[cfg(not(feature = "whisper"))]
    fn build_asr(_config: &Config) -> Result<Arc<dyn Transcriber>> {
        Err(ParlanceError::CapabilityUnavailable {
            name: "asr".to_string(),
            message: "built without the 'whisper' feature; rebuild with --features whisper \
                      or run with --mock-capabilities"
                .to_string(),
        })
    }

    #[cfg(feature = "nllb")]
    fn build_mt(config: &Config) -> Result<Arc<dyn Translator>> {
        let dir = config.models.nllb_dir.as_ref().ok_or_else(|| {
            ParlanceError::CapabilityUnavailable {
                name: "mt".to_string(),
                message: "models.nllb_dir is not configured".to_string(),
            }
        })?;
        Ok(Arc::new(mt::NllbTranslator::new(dir)?))
    }

    #[cfg(not(feature = "nllb"))]
    fn build_mt(_config: &Config) -> Result<Arc<dyn Translator>> {
        Err(ParlanceError::CapabilityUnavailable {
            name: "mt".to_string(),
            message: "built without the 'nllb' feature; rebuild with --features nllb \
                      or run with --mock-capabilities"
                .to_string(),
        })
    }

    #[cfg(feature = "piper")]
    fn build_tts(config: &Config) -> Result<Arc<dyn Synthesizer>> {
        let voices = config
            .models
            .piper_voices
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Ok(Arc::new(tts::PiperSynthesizer::new(voices)?))
    }

    #[cfg(not(feature = "piper"))]
    fn build_tts(_config: &Config) -> Result<Arc<dyn Synthesizer>> {
        Err(ParlanceError::CapabilityUnavailable {
            name: "tts".to_string(),
            message: "built without the 'piper' feature; rebuild with --features piper \
                      or run with --mock-capabilities"
                .to_string(),
        })
    }
}

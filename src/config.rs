use crate::defaults;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Top-level server configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub audio: AudioConfig,
    pub pipeline: PipelineConfig,
    pub room: RoomConfig,
    pub models: ModelConfig,
}

/// Network and diagnostics configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: String,
    /// When set, each connection's accumulated encoded audio is written here
    /// on close as `<session_id>.webm`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recordings_dir: Option<PathBuf>,
}

/// Audio segmentation configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub vad_window: usize,
    pub silence_ms: u32,
    pub energy_threshold: f32,
}

/// Staged pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    pub partial_min_ms: u32,
    /// Emit a translation alongside interim transcripts. Off by default:
    /// partials are latency-sensitive and the translation is redone at the
    /// final anyway.
    pub partial_translation: bool,
    /// Worker pool size for model calls. 0 means the available parallelism.
    pub worker_concurrency: usize,
    pub asr_timeout_secs: u64,
    pub mt_timeout_secs: u64,
    pub tts_timeout_secs: u64,
    pub lock_margin_ms: u64,
    pub lock_min_ms: u64,
    pub lock_max_ms: u64,
    pub outbound_queue: usize,
}

/// Room registry configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RoomConfig {
    pub code_len: usize,
    pub idle_ttl_secs: u64,
    pub sweep_interval_secs: u64,
}

/// Model backend configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ModelConfig {
    /// Whisper model name or path ("small", "medium", or a ggml file path).
    pub whisper_model: String,
    /// Silero VAD ONNX model path. Empty selects the energy-based gate.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vad_model: Option<PathBuf>,
    /// CTranslate2 NLLB model directory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nllb_dir: Option<PathBuf>,
    /// Piper voice config paths keyed by language code.
    pub piper_voices: std::collections::BTreeMap<String, PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: defaults::BIND_ADDR.to_string(),
            recordings_dir: None,
        }
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: defaults::SAMPLE_RATE,
            vad_window: defaults::VAD_WINDOW,
            silence_ms: defaults::SILENCE_MS,
            energy_threshold: defaults::ENERGY_THRESHOLD,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            partial_min_ms: defaults::PARTIAL_MIN_MS,
            partial_translation: false,
            worker_concurrency: 0,
            asr_timeout_secs: defaults::ASR_TIMEOUT_SECS,
            mt_timeout_secs: defaults::MT_TIMEOUT_SECS,
            tts_timeout_secs: defaults::TTS_TIMEOUT_SECS,
            lock_margin_ms: defaults::LOCK_MARGIN_MS,
            lock_min_ms: defaults::LOCK_MIN_MS,
            lock_max_ms: defaults::LOCK_MAX_MS,
            outbound_queue: defaults::OUTBOUND_QUEUE,
        }
    }
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            code_len: defaults::ROOM_CODE_LEN,
            idle_ttl_secs: defaults::ROOM_IDLE_TTL_SECS,
            sweep_interval_secs: defaults::ROOM_SWEEP_INTERVAL_SECS,
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            whisper_model: "small".to_string(),
            vad_model: None,
            nllb_dir: None,
            piper_voices: std::collections::BTreeMap::new(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// Any section or field absent from the file keeps its default;
    /// malformed TOML is an error.
    pub fn load(path: &Path) -> crate::error::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Like [`Config::load`], but a missing file yields the defaults.
    /// A file that exists but fails to parse is still an error.
    pub fn load_or_default(path: &Path) -> crate::error::Result<Self> {
        match Self::load(path) {
            Ok(config) => Ok(config),
            Err(crate::error::ParlanceError::Io(e))
                if e.kind() == std::io::ErrorKind::NotFound =>
            {
                Ok(Self::default())
            }
            Err(e) => Err(e),
        }
    }

    /// Overlays environment variables onto the loaded configuration:
    /// - PARLANCE_BIND → server.bind_addr
    /// - PARLANCE_WHISPER_MODEL → models.whisper_model
    /// - PARLANCE_SILENCE_MS → audio.silence_ms
    /// - PARLANCE_RECORDINGS_DIR → server.recordings_dir
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(bind) = std::env::var("PARLANCE_BIND") {
            if !bind.is_empty() {
                self.server.bind_addr = bind;
            }
        }

        if let Ok(model) = std::env::var("PARLANCE_WHISPER_MODEL") {
            if !model.is_empty() {
                self.models.whisper_model = model;
            }
        }

        if let Ok(ms) = std::env::var("PARLANCE_SILENCE_MS") {
            if let Ok(parsed) = ms.parse() {
                self.audio.silence_ms = parsed;
            }
        }

        if let Ok(dir) = std::env::var("PARLANCE_RECORDINGS_DIR") {
            if !dir.is_empty() {
                self.server.recordings_dir = Some(PathBuf::from(dir));
            }
        }

        self
    }

    /// Default configuration file location
    /// (`~/.config/parlance/config.toml` on Linux).
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("parlance")
            .join("config.toml")
    }

    /// Effective worker pool size for model calls.
    pub fn worker_concurrency(&self) -> usize {
        if self.pipeline.worker_concurrency > 0 {
            self.pipeline.worker_concurrency
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(2)
        }
    }
}

//! Text-to-speech capability.
//!
//! The production backend is Piper ONNX voices (`piper-rs`), one voice per
//! language, gated behind the `piper` feature. Synthesized audio is returned
//! as a complete RIFF WAV blob (PCM16 mono at the voice's native rate) ready
//! to send as a single binary frame.

use crate::audio::wav;
use crate::error::{ParlanceError, Result};
use std::sync::Arc;

/// Trait for speech synthesis.
pub trait Synthesizer: Send + Sync {
    /// Synthesize `text` with the voice for `language`.
    ///
    /// Returns complete WAV bytes, or an empty vec for empty input.
    fn synthesize(&self, text: &str, language: &str) -> Result<Vec<u8>>;

    /// Whether the backend can currently serve requests
    fn is_ready(&self) -> bool;
}

impl<T: Synthesizer + ?Sized> Synthesizer for Arc<T> {
    fn synthesize(&self, text: &str, language: &str) -> Result<Vec<u8>> {
        (**self).synthesize(text, language)
    }

    fn is_ready(&self) -> bool {
        (**self).is_ready()
    }
}

/// Mock synthesizer producing silent WAV audio.
///
/// The output length scales with the input text (80 ms per character,
/// clamped to [200 ms, 3 s]) so echo-suppression arithmetic stays
/// realistic in tests.
#[derive(Debug, Clone)]
pub struct MockSynthesizer {
    sample_rate: u32,
    delay: Option<std::time::Duration>,
    should_fail: bool,
}

impl MockSynthesizer {
    pub fn new() -> Self {
        Self {
            sample_rate: 22_050,
            delay: None,
            should_fail: false,
        }
    }

    /// Configure the mock to sleep before answering (for timeout tests)
    pub fn with_delay(mut self, delay: std::time::Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Make every synthesize call fail
    pub fn with_failure(mut self) -> Self {
        self.should_fail = true;
        self
    }
}

impl Default for MockSynthesizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Synthesizer for MockSynthesizer {
    fn synthesize(&self, text: &str, _language: &str) -> Result<Vec<u8>> {
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        if self.should_fail {
            return Err(ParlanceError::Synthesis {
                message: "mock synthesis failure".to_string(),
            });
        }
        if text.trim().is_empty() {
            return Ok(Vec::new());
        }

        let ms = (text.chars().count() as u64 * 80).clamp(200, 3000);
        let n_samples = (self.sample_rate as u64 * ms / 1000) as usize;
        wav::encode_pcm16(&vec![0i16; n_samples], self.sample_rate)
    }

    fn is_ready(&self) -> bool {
        !self.should_fail
    }
}

#[cfg(feature = "piper")]
pub use piper::PiperSynthesizer;

#[cfg(feature = "piper")]
mod piper {
    use super::Synthesizer;
    use crate::audio::wav;
    use crate::error::{ParlanceError, Result};
    use piper_rs::synth::PiperSpeechSynthesizer;
    use std::collections::HashMap;
    use std::path::{Path, PathBuf};
    use std::sync::Mutex;

    /// Piper TTS with one voice per language.
    ///
    /// Voices load lazily on first use; piper-rs synthesizers are not Sync,
    /// so calls serialize on an internal mutex.
    pub struct PiperSynthesizer {
        voice_configs: HashMap<String, PathBuf>,
        voices: Mutex<HashMap<String, PiperSpeechSynthesizer>>,
        sample_rate: u32,
    }

    impl PiperSynthesizer {
        pub fn new(voice_configs: HashMap<String, PathBuf>) -> Result<Self> {
            if voice_configs.is_empty() {
                return Err(ParlanceError::CapabilityUnavailable {
                    name: "tts".to_string(),
                    message: "no Piper voices configured".to_string(),
                });
            }
            for (lang, path) in &voice_configs {
                if !path.exists() {
                    return Err(ParlanceError::CapabilityUnavailable {
                        name: "tts".to_string(),
                        message: format!(
                            "Piper voice config for '{}' not found at {}",
                            lang,
                            path.display()
                        ),
                    });
                }
            }
            Ok(Self {
                voice_configs,
                voices: Mutex::new(HashMap::new()),
                sample_rate: 22_050,
            })
        }

        fn load_voice(config_path: &Path) -> Result<PiperSpeechSynthesizer> {
            let model = piper_rs::from_config_path(config_path).map_err(|e| {
                ParlanceError::CapabilityUnavailable {
                    name: "tts".to_string(),
                    message: format!("failed to load Piper voice: {}", e),
                }
            })?;
            PiperSpeechSynthesizer::new(model).map_err(|e| ParlanceError::CapabilityUnavailable {
                name: "tts".to_string(),
                message: format!("failed to create synthesizer: {}", e),
            })
        }
    }

    impl Synthesizer for PiperSynthesizer {
        fn synthesize(&self, text: &str, language: &str) -> Result<Vec<u8>> {
            if text.trim().is_empty() {
                return Ok(Vec::new());
            }

            let config_path = self.voice_configs.get(language).ok_or_else(|| {
                ParlanceError::Synthesis {
                    message: format!("no voice loaded for language '{}'", language),
                }
            })?;

            let mut voices = self.voices.lock().map_err(|_| ParlanceError::Synthesis {
                message: "voice cache poisoned".to_string(),
            })?;
            if !voices.contains_key(language) {
                voices.insert(language.to_string(), Self::load_voice(config_path)?);
            }
            let voice = voices.get(language).expect("voice inserted above");

            let audio = voice
                .synthesize_parallel(text.to_string(), None)
                .map_err(|e| ParlanceError::Synthesis {
                    message: format!("synthesis failed: {}", e),
                })?;

            let mut samples: Vec<f32> = Vec::new();
            for chunk in audio {
                let chunk = chunk.map_err(|e| ParlanceError::Synthesis {
                    message: format!("synthesis stream failed: {}", e),
                })?;
                samples.extend(chunk.into_vec());
            }

            let pcm16: Vec<i16> = samples
                .iter()
                .map(|&s| (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16)
                .collect();
            wav::encode_pcm16(&pcm16, self.sample_rate)
        }

        fn is_ready(&self) -> bool {
            true
        }
    }
}

//! Speech-to-text capability.
//!
//! The production backend is Whisper via whisper-rs, gated behind the
//! `whisper` cargo feature (requires cmake to build whisper.cpp). The
//! `MockTranscriber` serves tests and the `--mock-capabilities` dev mode.

use crate::error::{ParlanceError, Result};
use std::sync::Arc;

/// A transcribed utterance.
#[derive(Debug, Clone, PartialEq)]
pub struct Transcript {
    pub text: String,
    /// Language the model detected (or was forced to).
    pub language: Option<String>,
}

/// Speech-to-text over one utterance of PCM.
///
/// Implementations must be safe for concurrent invocation; backends that are
/// not serialize internally.
pub trait Transcriber: Send + Sync {
    /// Transcribe one utterance of 16 kHz mono f32 PCM in [-1, 1].
    ///
    /// `language` forces the decode language; `None` requests detection.
    fn transcribe(&self, audio: &[f32], language: Option<&str>) -> Result<Transcript>;

    /// Name of the loaded model, for logs and status output
    fn model_name(&self) -> &str;

    /// Whether the backend can currently serve requests
    fn is_ready(&self) -> bool;
}

/// An `Arc`-wrapped transcriber delegates to the shared instance, so one
/// loaded model serves every connection.
impl<T: Transcriber + ?Sized> Transcriber for Arc<T> {
    fn transcribe(&self, audio: &[f32], language: Option<&str>) -> Result<Transcript> {
        (**self).transcribe(audio, language)
    }

    fn model_name(&self) -> &str {
        (**self).model_name()
    }

    fn is_ready(&self) -> bool {
        (**self).is_ready()
    }
}

/// Mock transcriber for testing and capability-free development builds.
#[derive(Debug, Clone)]
pub struct MockTranscriber {
    model_name: String,
    response: String,
    language: Option<String>,
    delay: Option<std::time::Duration>,
    should_fail: bool,
}

impl MockTranscriber {
    /// New mock answering "mock transcription" in English
    pub fn new(model_name: &str) -> Self {
        Self {
            model_name: model_name.to_string(),
            response: "mock transcription".to_string(),
            language: Some("en".to_string()),
            delay: None,
            should_fail: false,
        }
    }

    /// Fix the transcript text the mock returns
    pub fn with_response(mut self, response: &str) -> Self {
        self.response = response.to_string();
        self
    }

    /// Configure the detected language
    pub fn with_language(mut self, language: &str) -> Self {
        self.language = Some(language.to_string());
        self
    }

    /// Configure the mock to sleep before answering (for timeout tests)
    pub fn with_delay(mut self, delay: std::time::Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Make every transcribe call fail
    pub fn with_failure(mut self) -> Self {
        self.should_fail = true;
        self
    }
}

impl Transcriber for MockTranscriber {
    fn transcribe(&self, _audio: &[f32], language: Option<&str>) -> Result<Transcript> {
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        if self.should_fail {
            return Err(ParlanceError::Transcription {
                message: "mock transcription failure".to_string(),
            });
        }
        Ok(Transcript {
            text: self.response.clone(),
            language: language
                .map(|l| l.to_string())
                .or_else(|| self.language.clone()),
        })
    }

    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn is_ready(&self) -> bool {
        !self.should_fail
    }
}

#[cfg(feature = "whisper")]
pub use whisper::WhisperTranscriber;

#[cfg(feature = "whisper")]
mod whisper {
    use super::{Transcriber, Transcript};
    use crate::error::{ParlanceError, Result};
    use std::path::Path;
    use std::sync::Mutex;
    use whisper_rs::{FullParams, SamplingStrategy, WhisperContext, WhisperContextParameters};

    /// Whisper-based transcriber.
    ///
    /// The WhisperContext is wrapped in a Mutex because whisper.cpp states
    /// are not safe to share; concurrent callers serialize here.
    pub struct WhisperTranscriber {
        context: Mutex<WhisperContext>,
        model_name: String,
    }

    impl WhisperTranscriber {
        pub fn new(model_path: &Path) -> Result<Self> {
            let context = WhisperContext::new_with_params(
                model_path.to_str().ok_or_else(|| {
                    ParlanceError::CapabilityUnavailable {
                        name: "asr".to_string(),
                        message: "model path is not valid UTF-8".to_string(),
                    }
                })?,
                WhisperContextParameters::default(),
            )
            .map_err(|e| ParlanceError::CapabilityUnavailable {
                name: "asr".to_string(),
                message: format!("failed to load Whisper model: {}", e),
            })?;

            let model_name = model_path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "whisper".to_string());

            Ok(Self {
                context: Mutex::new(context),
                model_name,
            })
        }
    }

    impl Transcriber for WhisperTranscriber {
        fn transcribe(&self, audio: &[f32], language: Option<&str>) -> Result<Transcript> {
            if audio.is_empty() {
                return Ok(Transcript {
                    text: String::new(),
                    language: language.map(|l| l.to_string()),
                });
            }

            let context = self.context.lock().map_err(|_| ParlanceError::Transcription {
                message: "whisper context poisoned".to_string(),
            })?;

            let mut state = context
                .create_state()
                .map_err(|e| ParlanceError::Transcription {
                    message: format!("failed to create state: {}", e),
                })?;

            let mut params = FullParams::new(SamplingStrategy::Greedy { best_of: 1 });
            params.set_language(language);
            params.set_translate(false);
            params.set_print_special(false);
            params.set_print_progress(false);
            params.set_print_realtime(false);
            params.set_print_timestamps(false);

            state
                .full(params, audio)
                .map_err(|e| ParlanceError::Transcription {
                    message: format!("inference failed: {}", e),
                })?;

            let n_segments = state
                .full_n_segments()
                .map_err(|e| ParlanceError::Transcription {
                    message: format!("segment count failed: {}", e),
                })?;

            let mut pieces = Vec::with_capacity(n_segments as usize);
            for i in 0..n_segments {
                if let Ok(segment) = state.full_get_segment_text(i) {
                    let trimmed = segment.trim().to_string();
                    if !trimmed.is_empty() {
                        pieces.push(trimmed);
                    }
                }
            }

            let detected = state
                .full_lang_id()
                .ok()
                .and_then(|id| whisper_rs::get_lang_str(id))
                .map(|s| s.to_string());

            Ok(Transcript {
                text: pieces.join(" "),
                language: detected.or_else(|| language.map(|l| l.to_string())),
            })
        }

        fn model_name(&self) -> &str {
            &self.model_name
        }

        fn is_ready(&self) -> bool {
            true
        }
    }
}

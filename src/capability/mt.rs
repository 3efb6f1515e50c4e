//! Machine translation capability.
//!
//! The production backend is NLLB-200 running on CTranslate2 (`ct2rs`),
//! gated behind the `nllb` feature. Language codes on the wire are short
//! ISO 639-1 codes; internally they map to NLLB Flores-200 codes.

use crate::error::{ParlanceError, Result};
use std::sync::Arc;

/// Maps a short language code to its NLLB Flores-200 code.
pub fn nllb_code(lang: &str) -> Option<&'static str> {
    match lang {
        "en" => Some("eng_Latn"),
        "es" => Some("spa_Latn"),
        "pt" => Some("por_Latn"),
        _ => None,
    }
}

/// Trait for text translation between supported languages.
pub trait Translator: Send + Sync {
    /// Translate `text` from `source` to `target` (short language codes).
    ///
    /// Returns the input unchanged when source and target match; errors on
    /// unsupported language codes.
    fn translate(&self, text: &str, source: &str, target: &str) -> Result<String>;

    /// Whether the backend can currently serve requests
    fn is_ready(&self) -> bool;
}

impl<T: Translator + ?Sized> Translator for Arc<T> {
    fn translate(&self, text: &str, source: &str, target: &str) -> Result<String> {
        (**self).translate(text, source, target)
    }

    fn is_ready(&self) -> bool {
        (**self).is_ready()
    }
}

/// Mock translator for testing and capability-free development builds.
///
/// Produces `"<text> [target]"` by default so tests can assert routing
/// without a model, or a fixed response when configured.
#[derive(Debug, Clone, Default)]
pub struct MockTranslator {
    response: Option<String>,
    delay: Option<std::time::Duration>,
    should_fail: bool,
}

impl MockTranslator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Configure a fixed translation output
    pub fn with_response(mut self, response: &str) -> Self {
        self.response = Some(response.to_string());
        self
    }

    /// Configure the mock to sleep before answering (for timeout tests)
    pub fn with_delay(mut self, delay: std::time::Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Make every translate call fail
    pub fn with_failure(mut self) -> Self {
        self.should_fail = true;
        self
    }
}

impl Translator for MockTranslator {
    fn translate(&self, text: &str, source: &str, target: &str) -> Result<String> {
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        if self.should_fail {
            return Err(ParlanceError::Translation {
                message: "mock translation failure".to_string(),
            });
        }
        if text.trim().is_empty() {
            return Ok(String::new());
        }
        if source == target {
            return Ok(text.to_string());
        }
        if nllb_code(source).is_none() || nllb_code(target).is_none() {
            return Err(ParlanceError::Translation {
                message: format!("unsupported language pair: {} -> {}", source, target),
            });
        }
        Ok(self
            .response
            .clone()
            .unwrap_or_else(|| format!("{} [{}]", text, target)))
    }

    fn is_ready(&self) -> bool {
        !self.should_fail
    }
}

#[cfg(feature = "nllb")]
pub use nllb::NllbTranslator;

#[cfg(feature = "nllb")]
mod nllb {
    use super::{nllb_code, Translator};
    use crate::error::{ParlanceError, Result};
    use ct2rs::{Config, TranslationOptions, Translator as Ct2Translator};
    use std::path::Path;

    /// NLLB-200 translator on CTranslate2.
    ///
    /// The converted model directory must contain the CTranslate2 weights
    /// and the SentencePiece tokenizer files.
    pub struct NllbTranslator {
        translator: Ct2Translator,
    }

    impl NllbTranslator {
        pub fn new(model_dir: &Path) -> Result<Self> {
            let translator = Ct2Translator::new(model_dir, &Config::default()).map_err(|e| {
                ParlanceError::CapabilityUnavailable {
                    name: "mt".to_string(),
                    message: format!("failed to load NLLB model: {}", e),
                }
            })?;
            Ok(Self { translator })
        }
    }

    impl Translator for NllbTranslator {
        fn translate(&self, text: &str, source: &str, target: &str) -> Result<String> {
            if text.trim().is_empty() {
                return Ok(String::new());
            }
            if source == target {
                return Ok(text.to_string());
            }

            let tgt = nllb_code(target).ok_or_else(|| ParlanceError::Translation {
                message: format!("unsupported target language: {}", target),
            })?;
            nllb_code(source).ok_or_else(|| ParlanceError::Translation {
                message: format!("unsupported source language: {}", source),
            })?;

            let options = TranslationOptions {
                beam_size: 4,
                ..Default::default()
            };

            let results = self
                .translator
                .translate_batch_with_target_prefix(
                    &[text.to_string()],
                    &[vec![tgt.to_string()]],
                    &options,
                    None,
                )
                .map_err(|e| ParlanceError::Translation {
                    message: format!("inference failed: {}", e),
                })?;

            let translated = results
                .into_iter()
                .next()
                .map(|(hypothesis, _score)| hypothesis)
                .unwrap_or_default();

            // The hypothesis leads with the target language token.
            Ok(translated
                .strip_prefix(tgt)
                .map(|s| s.trim_start().to_string())
                .unwrap_or(translated)
                .trim()
                .to_string())
        }

        fn is_ready(&self) -> bool {
            true
        }
    }
}

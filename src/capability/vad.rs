//! Speech gate capability: per-window voice activity probabilities.
//!
//! The production gate wraps the Silero VAD ONNX model (v4 LSTM or v5 GRU
//! interface) behind the `silero` feature. The always-available fallback is
//! an RMS energy gate, which is also what the test suite drives.

use crate::defaults;
use crate::error::Result;

/// Per-window speech probability source.
///
/// Implementations may keep recurrent state across windows; `reset` must
/// clear it whenever a participant's stream restarts.
pub trait SpeechGate: Send {
    /// Returns the speech probability in [0, 1] for one window of 16 kHz
    /// mono f32 samples.
    fn probability(&mut self, window: &[f32]) -> Result<f32>;

    /// Clears any recurrent state.
    fn reset(&mut self);
}

/// RMS-based speech gate.
///
/// Maps the window RMS onto a probability so that the segmenter's 0.5
/// threshold fires exactly when the RMS crosses `threshold`.
pub struct EnergyGate {
    threshold: f32,
}

impl EnergyGate {
    pub fn new(threshold: f32) -> Self {
        Self { threshold }
    }
}

impl Default for EnergyGate {
    fn default() -> Self {
        Self::new(defaults::ENERGY_THRESHOLD)
    }
}

impl SpeechGate for EnergyGate {
    fn probability(&mut self, window: &[f32]) -> Result<f32> {
        let rms = calculate_rms(window);
        Ok((rms / (2.0 * self.threshold)).clamp(0.0, 1.0))
    }

    fn reset(&mut self) {}
}

/// Calculates the Root Mean Square of normalized f32 samples.
pub fn calculate_rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }

    let sum_squares: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
    (sum_squares / samples.len() as f64).sqrt() as f32
}

/// Backend selection for constructing per-participant gates.
#[derive(Debug, Clone)]
pub enum GateBackend {
    Energy { threshold: f32 },
    #[cfg(feature = "silero")]
    Silero { model: std::path::PathBuf },
}

impl GateBackend {
    /// Builds a fresh gate. Each participant gets its own instance because
    /// the neural gate carries recurrent state.
    pub fn build(&self) -> Result<Box<dyn SpeechGate>> {
        match self {
            GateBackend::Energy { threshold } => Ok(Box::new(EnergyGate::new(*threshold))),
            #[cfg(feature = "silero")]
            GateBackend::Silero { model } => Ok(Box::new(silero::SileroGate::new(model)?)),
        }
    }

    /// Fails fast at startup when the configured backend cannot initialize.
    pub fn verify(&self) -> Result<()> {
        match self {
            GateBackend::Energy { .. } => Ok(()),
            #[cfg(feature = "silero")]
            GateBackend::Silero { model } => {
                if model.exists() {
                    Ok(())
                } else {
                    Err(crate::error::ParlanceError::CapabilityUnavailable {
                        name: "vad".to_string(),
                        message: format!("Silero model not found at {}", model.display()),
                    })
                }
            }
        }
    }
}

#[cfg(feature = "silero")]
mod silero {
    //! Silero VAD via ONNX Runtime.
    //!
    //! Supports the v3/v4 LSTM interface (separate `h`/`c` tensors) and the
    //! v5 GRU interface (single `state` tensor).

    use super::SpeechGate;
    use crate::defaults::VAD_WINDOW;
    use crate::error::{ParlanceError, Result};
    use ndarray::{Array1, Array2, Array3};
    use ort::session::builder::SessionBuilder;
    use ort::session::{Session, SessionInputValue};
    use ort::value::Value;
    use std::path::Path;

    const LSTM_STATE: usize = 128;
    const GRU_STATE: usize = 256;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum IoMode {
        Lstm,
        Gru,
        Stateless,
    }

    pub struct SileroGate {
        session: Session,
        io_mode: IoMode,
        input_name: String,
        sr_name: Option<String>,
        output_name: String,
        h_name: Option<String>,
        c_name: Option<String>,
        hn_name: Option<String>,
        cn_name: Option<String>,
        state_name: Option<String>,
        state_out_name: Option<String>,
        h: Vec<f32>,
        c: Vec<f32>,
        state: Vec<f32>,
    }

    fn ort_err(e: impl std::fmt::Display) -> ParlanceError {
        ParlanceError::CapabilityUnavailable {
            name: "vad".to_string(),
            message: e.to_string(),
        }
    }

    fn resolve(candidates: &[String], preferred: &[&str]) -> Option<String> {
        preferred.iter().find_map(|needle| {
            candidates
                .iter()
                .find(|name| name.eq_ignore_ascii_case(needle))
                .cloned()
        })
    }

    impl SileroGate {
        pub fn new(path: &Path) -> Result<Self> {
            let session = SessionBuilder::new()
                .map_err(ort_err)?
                .commit_from_file(path)
                .map_err(ort_err)?;

            let inputs: Vec<String> = session
                .inputs()
                .iter()
                .map(|outlet| outlet.name().to_string())
                .collect();
            let outputs: Vec<String> = session
                .outputs()
                .iter()
                .map(|outlet| outlet.name().to_string())
                .collect();

            let input_name = resolve(&inputs, &["input", "audio", "x"])
                .or_else(|| inputs.first().cloned())
                .ok_or_else(|| ort_err("Silero model has no inputs"))?;
            let sr_name = resolve(&inputs, &["sr", "sample_rate"]);
            let h_name = resolve(&inputs, &["h", "state_h"]);
            let c_name = resolve(&inputs, &["c", "state_c"]);
            let state_name = resolve(&inputs, &["state", "hidden"]);
            let output_name = resolve(&outputs, &["output", "prob"])
                .or_else(|| outputs.first().cloned())
                .ok_or_else(|| ort_err("Silero model has no outputs"))?;
            let hn_name = resolve(&outputs, &["hn", "h_out"]);
            let cn_name = resolve(&outputs, &["cn", "c_out"]);
            let state_out_name = resolve(&outputs, &["stateN", "state_out"]);

            let io_mode = if h_name.is_some() && c_name.is_some() {
                IoMode::Lstm
            } else if state_name.is_some() {
                IoMode::Gru
            } else {
                IoMode::Stateless
            };

            tracing::info!(path = %path.display(), ?io_mode, "loaded Silero VAD model");

            Ok(Self {
                session,
                io_mode,
                input_name,
                sr_name,
                output_name,
                h_name,
                c_name,
                hn_name,
                cn_name,
                state_name,
                state_out_name,
                h: vec![0.0; LSTM_STATE],
                c: vec![0.0; LSTM_STATE],
                state: vec![0.0; GRU_STATE],
            })
        }
    }

    impl SpeechGate for SileroGate {
        fn probability(&mut self, window: &[f32]) -> Result<f32> {
            debug_assert_eq!(window.len(), VAD_WINDOW);

            let input = Array2::<f32>::from_shape_vec((1, VAD_WINDOW), window.to_vec())
                .map_err(ort_err)?;
            let mut inputs: Vec<(String, SessionInputValue<'_>)> = vec![(
                self.input_name.clone(),
                Value::from_array(input).map_err(ort_err)?.into(),
            )];

            if let Some(sr_name) = &self.sr_name {
                let sr = Array1::<i64>::from_elem(1, 16_000i64);
                inputs.push((
                    sr_name.clone(),
                    Value::from_array(sr).map_err(ort_err)?.into(),
                ));
            }

            match self.io_mode {
                IoMode::Lstm => {
                    let h = Array3::<f32>::from_shape_vec((2, 1, 64), self.h.clone())
                        .map_err(ort_err)?;
                    let c = Array3::<f32>::from_shape_vec((2, 1, 64), self.c.clone())
                        .map_err(ort_err)?;
                    if let (Some(h_name), Some(c_name)) = (&self.h_name, &self.c_name) {
                        inputs.push((
                            h_name.clone(),
                            Value::from_array(h).map_err(ort_err)?.into(),
                        ));
                        inputs.push((
                            c_name.clone(),
                            Value::from_array(c).map_err(ort_err)?.into(),
                        ));
                    }
                }
                IoMode::Gru => {
                    let state = Array3::<f32>::from_shape_vec((2, 1, 128), self.state.clone())
                        .map_err(ort_err)?;
                    if let Some(state_name) = &self.state_name {
                        inputs.push((
                            state_name.clone(),
                            Value::from_array(state).map_err(ort_err)?.into(),
                        ));
                    }
                }
                IoMode::Stateless => {}
            }

            let outputs = self.session.run(inputs).map_err(ort_err)?;

            let prob_output = outputs
                .get(self.output_name.as_str())
                .unwrap_or(&outputs[0]);
            let (_, prob_data) = prob_output.try_extract_tensor::<f32>().map_err(ort_err)?;
            let prob = prob_data.first().copied().unwrap_or(0.0);

            match self.io_mode {
                IoMode::Lstm => {
                    if let (Some(hn), Some(cn)) = (&self.hn_name, &self.cn_name) {
                        if let (Some(hn_out), Some(cn_out)) =
                            (outputs.get(hn.as_str()), outputs.get(cn.as_str()))
                        {
                            let (_, hn_data) =
                                hn_out.try_extract_tensor::<f32>().map_err(ort_err)?;
                            let (_, cn_data) =
                                cn_out.try_extract_tensor::<f32>().map_err(ort_err)?;
                            self.h = hn_data.to_vec();
                            self.c = cn_data.to_vec();
                        }
                    }
                }
                IoMode::Gru => {
                    if let Some(name) = &self.state_out_name {
                        if let Some(out) = outputs.get(name.as_str()) {
                            let (_, data) = out.try_extract_tensor::<f32>().map_err(ort_err)?;
                            self.state = data.to_vec();
                        }
                    }
                }
                IoMode::Stateless => {}
            }

            Ok(prob)
        }

        fn reset(&mut self) {
            self.h.iter_mut().for_each(|v| *v = 0.0);
            self.c.iter_mut().for_each(|v| *v = 0.0);
            self.state.iter_mut().for_each(|v| *v = 0.0);
        }
    }
}

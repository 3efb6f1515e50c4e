//! WAV helpers for synthesized audio blobs.

use crate::error::{ParlanceError, Result};
use std::io::Cursor;

/// Encodes PCM16 mono samples into a complete RIFF WAV blob.
pub fn encode_pcm16(samples: &[i16], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer =
            hound::WavWriter::new(&mut cursor, spec).map_err(|e| ParlanceError::Synthesis {
                message: format!("failed to create WAV writer: {}", e),
            })?;
        for &sample in samples {
            writer
                .write_sample(sample)
                .map_err(|e| ParlanceError::Synthesis {
                    message: format!("failed to write WAV sample: {}", e),
                })?;
        }
        writer.finalize().map_err(|e| ParlanceError::Synthesis {
            message: format!("failed to finalize WAV: {}", e),
        })?;
    }
    Ok(cursor.into_inner())
}

/// Returns the duration of a WAV blob in milliseconds.
pub fn duration_ms(wav_bytes: &[u8]) -> Result<u64> {
    let reader =
        hound::WavReader::new(Cursor::new(wav_bytes)).map_err(|e| ParlanceError::Decode {
            message: format!("failed to parse WAV: {}", e),
        })?;
    let spec = reader.spec();
    if spec.sample_rate == 0 {
        return Err(ParlanceError::Decode {
            message: "WAV has zero sample rate".to_string(),
        });
    }
    Ok(reader.duration() as u64 * 1000 / spec.sample_rate as u64)
}

//! Incremental decode of a growing WebM/Opus byte stream.
//!
//! Browsers stream MediaRecorder output as small WebM chunks that are only
//! decodable from byte zero, so every ingest re-parses the accumulated
//! prefix and slices off the samples already returned (tail-delta emission).
//! That re-parse is O(buffer), which is why the protocol requires clients to
//! restart their encoder on a fixed cadence: each restart opens a fresh
//! container and lets the decoder drop the old prefix.
//!
//! Stream restarts are detected two ways: a chunk that begins with the EBML
//! magic while the decoder is already primed, or a decode failure over the
//! accumulated buffer, which triggers a re-probe from the most recent magic
//! offset.

use crate::defaults::{DECIMATION, MAX_UNPRIMED_BYTES, WEBM_MAGIC};
use crate::error::{ParlanceError, Result};
use tracing::{debug, warn};

/// Full-buffer container decode, kept behind a trait so the stream logic is
/// testable without real Opus payloads.
pub trait ContainerCodec: Send {
    /// Decodes an entire container byte stream into 16 kHz mono f32 PCM.
    ///
    /// Implementations decode as far as the buffer allows and stop at the
    /// first truncated element; an error means the bytes do not parse as a
    /// container at all.
    fn decode_all(&mut self, bytes: &[u8]) -> Result<Vec<f32>>;
}

/// WebM demux (symphonia) + Opus decode (audiopus) + decimation to 16 kHz.
pub struct OpusWebmCodec;

impl OpusWebmCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Default for OpusWebmCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl ContainerCodec for OpusWebmCodec {
    fn decode_all(&mut self, bytes: &[u8]) -> Result<Vec<f32>> {
        use audiopus::packet::Packet as OpusPacket;
        use audiopus::{coder::Decoder as OpusDecoder, Channels, MutSignals, SampleRate};
        use symphonia::core::codecs::CODEC_TYPE_OPUS;
        use symphonia::core::formats::FormatOptions;
        use symphonia::core::io::MediaSourceStream;
        use symphonia::core::meta::MetadataOptions;
        use symphonia::core::probe::Hint;

        let cursor = std::io::Cursor::new(bytes.to_vec());
        let mss = MediaSourceStream::new(Box::new(cursor), Default::default());
        let mut hint = Hint::new();
        hint.with_extension("webm");

        let probed = symphonia::default::get_probe()
            .format(
                &hint,
                mss,
                &FormatOptions::default(),
                &MetadataOptions::default(),
            )
            .map_err(|e| ParlanceError::Decode {
                message: format!("container probe failed: {}", e),
            })?;
        let mut reader = probed.format;

        let track = reader
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec == CODEC_TYPE_OPUS)
            .ok_or_else(|| ParlanceError::Decode {
                message: "no Opus audio track in container".to_string(),
            })?;
        let track_id = track.id;
        let channels = track
            .codec_params
            .channels
            .map(|c| c.count())
            .unwrap_or(1)
            .clamp(1, 2);

        let opus_channels = if channels == 2 {
            Channels::Stereo
        } else {
            Channels::Mono
        };
        let mut opus =
            OpusDecoder::new(SampleRate::Hz48000, opus_channels).map_err(|e| {
                ParlanceError::Decode {
                    message: format!("failed to create Opus decoder: {}", e),
                }
            })?;

        // Largest Opus frame: 120 ms at 48 kHz per channel.
        let mut frame = vec![0f32; 5760 * channels];
        let mut mono_48k: Vec<f32> = Vec::new();

        loop {
            let packet = match reader.next_packet() {
                Ok(packet) => packet,
                // Truncated tail or end of buffered stream.
                Err(_) => break,
            };
            if packet.track_id() != track_id {
                continue;
            }

            let opus_packet = match OpusPacket::try_from(packet.buf()) {
                Ok(p) => p,
                Err(_) => continue,
            };
            let signals = match MutSignals::try_from(&mut frame[..]) {
                Ok(s) => s,
                Err(_) => continue,
            };
            match opus.decode_float(Some(opus_packet), signals, false) {
                Ok(n_per_channel) => {
                    if channels == 2 {
                        for i in 0..n_per_channel {
                            mono_48k.push((frame[2 * i] + frame[2 * i + 1]) * 0.5);
                        }
                    } else {
                        mono_48k.extend_from_slice(&frame[..n_per_channel]);
                    }
                }
                Err(e) => {
                    debug!("skipping undecodable Opus packet: {}", e);
                }
            }
        }

        // 48 kHz -> 16 kHz by plain decimation; downstream ASR consumes
        // 16 kHz input, so the aliasing tradeoff is acceptable.
        Ok(mono_48k.iter().step_by(DECIMATION).copied().collect())
    }
}

/// Incremental stream decoder with tail-delta emission and header-refresh
/// recovery.
pub struct StreamDecoder<C: ContainerCodec = OpusWebmCodec> {
    codec: C,
    buffer: Vec<u8>,
    /// Count of decoded samples already handed to the caller within the
    /// current encoded stream. Never exceeds the current decode length.
    samples_returned: usize,
    /// True once the current buffer has decoded successfully at least once.
    primed: bool,
}

impl StreamDecoder<OpusWebmCodec> {
    pub fn new() -> Self {
        Self::with_codec(OpusWebmCodec::new())
    }
}

impl Default for StreamDecoder<OpusWebmCodec> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: ContainerCodec> StreamDecoder<C> {
    pub fn with_codec(codec: C) -> Self {
        Self {
            codec,
            buffer: Vec::new(),
            samples_returned: 0,
            primed: false,
        }
    }

    /// Discards the buffer and resets the counter, ready for a new encoded
    /// stream.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.samples_returned = 0;
        self.primed = false;
    }

    /// Bytes currently buffered for the active stream.
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Appends encoded bytes and returns only the newly decoded samples
    /// since the last successful call (16 kHz mono f32 in [-1, 1]).
    ///
    /// A chunk opening with the EBML magic while the decoder is primed marks
    /// a restarted encoder: the old prefix is dropped and decoding re-primes
    /// from the new header. Returns an empty vec while the header is still
    /// partial or a mid-stream payload is malformed.
    pub fn ingest(&mut self, chunk: &[u8]) -> Vec<f32> {
        if self.primed && chunk.starts_with(&WEBM_MAGIC) {
            debug!("header refresh detected, restarting stream decode");
            self.reset();
        }
        self.buffer.extend_from_slice(chunk);

        match self.codec.decode_all(&self.buffer) {
            Ok(samples) if samples.len() >= self.samples_returned => {
                if !samples.is_empty() {
                    self.primed = true;
                }
                let new = samples[self.samples_returned..].to_vec();
                self.samples_returned = samples.len();
                new
            }
            // A shrinking decode means the stream restarted without a clean
            // chunk boundary; re-probe from the most recent header.
            Ok(_) => self.resync(),
            Err(e) => {
                if self.primed {
                    warn!("decode failed mid-stream: {}", e);
                    self.resync()
                } else {
                    if self.buffer.len() > MAX_UNPRIMED_BYTES {
                        warn!("dropping {} undecodable bytes", self.buffer.len());
                        self.reset();
                    }
                    Vec::new()
                }
            }
        }
    }

    /// Retries decoding from the most recent EBML magic in the buffer,
    /// treating it as the start of a fresh stream.
    fn resync(&mut self) -> Vec<f32> {
        match find_last_magic(&self.buffer) {
            Some(pos) if pos > 0 => {
                self.buffer.drain(..pos);
                self.samples_returned = 0;
                self.primed = false;
                match self.codec.decode_all(&self.buffer) {
                    Ok(samples) => {
                        if !samples.is_empty() {
                            self.primed = true;
                        }
                        self.samples_returned = samples.len();
                        samples
                    }
                    Err(_) => Vec::new(),
                }
            }
            _ => {
                // No later header to resync from; drop the stream and wait
                // for the next refresh.
                self.reset();
                Vec::new()
            }
        }
    }
}

/// Finds the byte offset of the last EBML magic occurrence.
fn find_last_magic(buffer: &[u8]) -> Option<usize> {
    if buffer.len() < WEBM_MAGIC.len() {
        return None;
    }
    (0..=buffer.len() - WEBM_MAGIC.len())
        .rev()
        .find(|&i| buffer[i..i + WEBM_MAGIC.len()] == WEBM_MAGIC)
}

/// Mock codec for testing the stream logic without real Opus payloads.
///
/// Streams are an 8-byte header (EBML magic + 4 reserved bytes) followed by
/// one byte per sample, decoded as i8 / 127. The byte 0xEE marks an
/// undecodable payload.
pub struct MockContainerCodec;

impl MockContainerCodec {
    const HEADER_LEN: usize = 8;

    /// Builds a complete mock stream around a sample payload.
    pub fn stream_of(samples: &[u8]) -> Vec<u8> {
        let mut bytes = WEBM_MAGIC.to_vec();
        bytes.extend_from_slice(&[0, 0, 0, 0]);
        bytes.extend_from_slice(samples);
        bytes
    }
}

impl ContainerCodec for MockContainerCodec {
    fn decode_all(&mut self, bytes: &[u8]) -> Result<Vec<f32>> {
        if bytes.len() < Self::HEADER_LEN || !bytes.starts_with(&WEBM_MAGIC) {
            return Err(ParlanceError::Decode {
                message: "incomplete header".to_string(),
            });
        }
        if bytes[Self::HEADER_LEN..].contains(&0xEE) {
            return Err(ParlanceError::Decode {
                message: "corrupt payload".to_string(),
            });
        }
        Ok(bytes[Self::HEADER_LEN..]
            .iter()
            .map(|&b| (b as i8) as f32 / 127.0)
            .collect())
    }
}

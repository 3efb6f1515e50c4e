//! Audio stream handling: incremental container decode, voice activity
//! segmentation, per-participant ingest state, and WAV helpers.

pub mod decoder;
pub mod ingest;
pub mod segmenter;
pub mod wav;

pub use decoder::{ContainerCodec, MockContainerCodec, OpusWebmCodec, StreamDecoder};
pub use ingest::{AudioIngest, IngestEvent};
pub use segmenter::{SegmentEvent, SegmenterConfig, VoiceSegmenter};

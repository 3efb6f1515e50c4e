//! parlance - real-time bidirectional speech translation server
//!
//! Each participant streams microphone audio over a WebSocket; the server
//! segments speech, transcribes it, translates it into the partner's
//! language, synthesizes speech, and delivers text and audio back to the
//! partner in near real time.

pub mod audio;
pub mod capability;
pub mod config;
pub mod defaults;
pub mod error;
pub mod pipeline;
pub mod session;
pub mod wire;

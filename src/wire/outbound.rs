//! Per-connection outbound queue.
//!
//! Every connection gets one bounded queue drained by a dedicated write
//! task, which serializes JSON text frames and binary audio in FIFO order.
//! Overflow means the client is too slow to drain its socket; the
//! connection is marked closed (`backpressure`).

use crate::error::ParlanceError;
use crate::wire::message::ServerMessage;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::warn;

/// A frame queued for the write pump.
#[derive(Debug)]
pub enum Outbound {
    Text(String),
    Audio(Vec<u8>),
    /// Close the socket gracefully and stop the write pump.
    Close,
}

/// Cloneable sending half of a connection's outbound queue.
#[derive(Clone)]
pub struct OutboundQueue {
    tx: mpsc::Sender<Outbound>,
    closed: Arc<AtomicBool>,
}

impl OutboundQueue {
    /// Creates a queue and its receiving half for the write pump.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                closed: Arc::new(AtomicBool::new(false)),
            },
            rx,
        )
    }

    /// Enqueues a JSON text frame. Returns false if the frame was dropped.
    pub fn send_json(&self, message: &ServerMessage) -> bool {
        let json = match message.to_json() {
            Ok(json) => json,
            Err(e) => {
                warn!("failed to serialize outbound message: {}", e);
                return false;
            }
        };
        self.push(Outbound::Text(json))
    }

    /// Enqueues a binary audio frame. Returns false if dropped.
    pub fn send_audio(&self, wav: Vec<u8>) -> bool {
        self.push(Outbound::Audio(wav))
    }

    /// Requests a graceful close. The connection is marked closed either
    /// way; the read loop observes the flag and tears down.
    pub fn close(&self) {
        let _ = self.tx.try_send(Outbound::Close);
        self.closed.store(true, Ordering::SeqCst);
    }

    /// True once the connection is closing (explicitly or by overflow).
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn push(&self, frame: Outbound) -> bool {
        if self.is_closed() {
            return false;
        }
        match self.tx.try_send(frame) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                // The queue is full, so no error frame can reach the client;
                // the connection just closes.
                let err = ParlanceError::Backpressure;
                warn!(kind = ?err.kind(), "{}, closing slow connection", err);
                self.closed.store(true, Ordering::SeqCst);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.closed.store(true, Ordering::SeqCst);
                false
            }
        }
    }
}

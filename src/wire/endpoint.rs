//! WebSocket endpoint: upgrade, query parsing, and the per-connection
//! read/write pumps.
//!
//! Each connection gets a long-lived read loop (this task owns all of the
//! participant's audio state) and a dedicated write task draining the
//! bounded outbound queue, so writes never block the read path.

use crate::audio::ingest::AudioIngest;
use crate::audio::segmenter::{SegmenterConfig, VoiceSegmenter};
use crate::capability::Capabilities;
use crate::config::Config;
use crate::error::{ParlanceError, Result};
use crate::pipeline::{StageConfig, StagePipeline};
use crate::session::room::{LockWindow, RoomConn, RoomRouter};
use crate::session::solo::{SoloConn, SoloOptions, SoloRouter};
use crate::session::{session_id, RoomRegistry};
use crate::wire::message::{ControlMarker, ServerMessage};
use crate::wire::outbound::{Outbound, OutboundQueue};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Shared server state.
#[derive(Clone)]
pub struct AppState {
    pub caps: Arc<Capabilities>,
    pub registry: Arc<RoomRegistry>,
    pub config: Arc<Config>,
}

/// Builds the HTTP/WebSocket router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(health))
        .route("/rooms", get(list_rooms))
        .route("/ws/audio", get(ws_audio))
        .route("/ws/session", get(ws_session))
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "parlance",
    }))
}

async fn list_rooms(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({ "rooms": state.registry.snapshots() }))
}

/// Query parameters for the solo endpoint `/ws/audio`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SoloQuery {
    pub lang: Option<String>,
    pub target_lang: Option<String>,
    pub tts: Option<String>,
}

/// Query parameters for the room endpoint `/ws/session`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SessionQuery {
    pub room_id: Option<String>,
    pub name: Option<String>,
    pub my_lang: Option<String>,
    pub partner_lang: Option<String>,
}

/// Resolved mode for a `/ws/session` connection.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionIntent {
    Create {
        my_lang: String,
        partner_lang: String,
        name: Option<String>,
    },
    Join {
        room_id: String,
        name: Option<String>,
    },
}

/// Validates solo query parameters.
pub fn parse_solo_query(query: &SoloQuery) -> Result<SoloOptions> {
    let language = match query.lang.as_deref() {
        None | Some("") | Some(crate::defaults::AUTO_LANGUAGE) => None,
        Some(lang) if crate::defaults::is_supported_language(lang) => Some(lang.to_string()),
        Some(other) => {
            return Err(ParlanceError::BadRequest {
                message: format!("unknown language code: {}", other),
            })
        }
    };

    let target_language = match query.target_lang.as_deref() {
        None | Some("") | Some("none") => None,
        Some(lang) if crate::defaults::is_supported_language(lang) => Some(lang.to_string()),
        Some(other) => {
            return Err(ParlanceError::BadRequest {
                message: format!("unknown target language code: {}", other),
            })
        }
    };

    let tts = match query.tts.as_deref() {
        None | Some("") | Some("false") => false,
        Some("true") => true,
        Some(other) => {
            return Err(ParlanceError::BadRequest {
                message: format!("tts must be true or false, got: {}", other),
            })
        }
    };

    Ok(SoloOptions {
        language,
        target_language,
        tts,
    })
}

/// Resolves a `/ws/session` query into create or join intent.
pub fn parse_session_query(query: &SessionQuery) -> Result<SessionIntent> {
    let room_id = query
        .room_id
        .as_deref()
        .map(str::trim)
        .filter(|id| !id.is_empty());

    if let Some(room_id) = room_id {
        return Ok(SessionIntent::Join {
            room_id: room_id.to_string(),
            name: query.name.clone(),
        });
    }

    let my_lang = query
        .my_lang
        .as_deref()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .ok_or_else(|| ParlanceError::BadRequest {
            message: "my_lang is required to create a room".to_string(),
        })?
        .to_lowercase();
    let partner_lang = query
        .partner_lang
        .as_deref()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .ok_or_else(|| ParlanceError::BadRequest {
            message: "partner_lang is required to create a room".to_string(),
        })?
        .to_lowercase();

    Ok(SessionIntent::Create {
        my_lang,
        partner_lang,
        name: query.name.clone(),
    })
}

async fn ws_audio(
    ws: WebSocketUpgrade,
    Query(query): Query<SoloQuery>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| solo_connection(socket, query, state))
}

async fn ws_session(
    ws: WebSocketUpgrade,
    Query(query): Query<SessionQuery>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| session_connection(socket, query, state))
}

/// Serializes outbound frames to the socket in FIFO order.
async fn write_pump(mut sink: SplitSink<WebSocket, Message>, mut rx: mpsc::Receiver<Outbound>) {
    while let Some(frame) = rx.recv().await {
        let message = match frame {
            Outbound::Text(json) => Message::Text(json),
            Outbound::Audio(bytes) => Message::Binary(bytes),
            Outbound::Close => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
        };
        if sink.send(message).await.is_err() {
            break;
        }
    }
}

/// Accumulates a connection's encoded audio for the optional on-disk dump.
struct SessionRecorder {
    path: Option<PathBuf>,
    bytes: Vec<u8>,
}

impl SessionRecorder {
    fn new(dir: Option<&std::path::Path>, session: &str) -> Self {
        Self {
            path: dir.map(|d| d.join(format!("{}.webm", session))),
            bytes: Vec::new(),
        }
    }

    fn push(&mut self, chunk: &[u8]) {
        if self.path.is_some() {
            self.bytes.extend_from_slice(chunk);
        }
    }

    fn flush(&self) {
        let Some(path) = &self.path else {
            return;
        };
        if self.bytes.is_empty() {
            return;
        }
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        match std::fs::write(path, &self.bytes) {
            Ok(()) => info!(path = %path.display(), "saved session recording"),
            Err(e) => warn!(path = %path.display(), "failed to save recording: {}", e),
        }
    }
}

/// Sends an error payload and closes, before any session state exists.
fn reject(queue: &OutboundQueue, error: &ParlanceError) {
    queue.send_json(&ServerMessage::error(error));
    queue.close();
}

async fn drain_writer(writer: tokio::task::JoinHandle<()>) {
    if tokio::time::timeout(Duration::from_secs(5), writer).await.is_err() {
        warn!("write pump did not drain in time");
    }
}

async fn solo_connection(socket: WebSocket, query: SoloQuery, state: AppState) {
    let (queue, outbound_rx) = OutboundQueue::new(state.config.pipeline.outbound_queue);
    let (sink, stream) = socket.split();
    let writer = tokio::spawn(write_pump(sink, outbound_rx));

    let options = match parse_solo_query(&query) {
        Ok(options) => options,
        Err(e) => {
            reject(&queue, &e);
            drain_writer(writer).await;
            return;
        }
    };
    let gate = match state.caps.speech_gate() {
        Ok(gate) => gate,
        Err(e) => {
            reject(&queue, &e);
            drain_writer(writer).await;
            return;
        }
    };

    let session = session_id(state.registry.allocate_participant_id());
    info!(
        session = %session,
        language = options.language.as_deref().unwrap_or("auto"),
        target = options.target_language.as_deref().unwrap_or("none"),
        tts = options.tts,
        "solo client connected"
    );

    let router = Arc::new(SoloRouter::new(queue.clone(), options.clone()));
    let pipeline = StagePipeline::new(
        state.caps.clone(),
        StageConfig::from_config(&state.config),
        router,
        options.language.clone(),
    );
    let segmenter = VoiceSegmenter::new(SegmenterConfig::from_config(&state.config), gate);
    let mut conn = SoloConn::new(AudioIngest::new(segmenter), pipeline);
    let mut recorder =
        SessionRecorder::new(state.config.server.recordings_dir.as_deref(), &session);

    let mut stream = stream;
    read_solo_frames(&mut stream, &queue, &mut conn, &mut recorder).await;

    conn.finish();
    drop(conn);
    recorder.flush();
    queue.close();
    drain_writer(writer).await;
    info!(session = %session, "solo client disconnected");
}

async fn read_solo_frames(
    stream: &mut SplitStream<WebSocket>,
    queue: &OutboundQueue,
    conn: &mut SoloConn,
    recorder: &mut SessionRecorder,
) {
    while let Some(frame) = stream.next().await {
        if queue.is_closed() {
            break;
        }
        match frame {
            Ok(Message::Binary(bytes)) => {
                recorder.push(&bytes);
                conn.handle_binary(&bytes);
            }
            // No client text messages are defined; unknown frames are
            // ignored for forward compatibility.
            Ok(Message::Text(_)) => {}
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(_) => break,
        }
    }
}

async fn session_connection(socket: WebSocket, query: SessionQuery, state: AppState) {
    let (queue, outbound_rx) = OutboundQueue::new(state.config.pipeline.outbound_queue);
    let (sink, stream) = socket.split();
    let writer = tokio::spawn(write_pump(sink, outbound_rx));

    let intent = match parse_session_query(&query) {
        Ok(intent) => intent,
        Err(e) => {
            reject(&queue, &e);
            drain_writer(writer).await;
            return;
        }
    };
    let gate = match state.caps.speech_gate() {
        Ok(gate) => gate,
        Err(e) => {
            reject(&queue, &e);
            drain_writer(writer).await;
            return;
        }
    };

    let seated = match &intent {
        SessionIntent::Create {
            my_lang,
            partner_lang,
            name,
        } => state
            .registry
            .create(my_lang, partner_lang, name.as_deref(), queue.clone())
            .map(|(room, host)| {
                queue.send_json(&ServerMessage::RoomCreated {
                    room_id: room.code().to_string(),
                    language: host.language.clone(),
                });
                queue.send_json(&ServerMessage::SessionStatus {
                    status: room.phase(),
                });
                (room, host)
            }),
        SessionIntent::Join { room_id, name } => state
            .registry
            .join(room_id, name.as_deref(), queue.clone())
            .map(|(room, guest, _info)| (room, guest)),
    };

    let (room, me) = match seated {
        Ok(seated) => seated,
        Err(e) => {
            reject(&queue, &e);
            drain_writer(writer).await;
            return;
        }
    };

    let session = session_id(me.id);
    info!(
        session = %session,
        room = %room.code(),
        participant = %me.name,
        language = %me.language,
        "room client connected"
    );

    let router = Arc::new(RoomRouter::new(
        room.clone(),
        me.clone(),
        LockWindow::from_config(&state.config),
    ));
    let pipeline = StagePipeline::new(
        state.caps.clone(),
        StageConfig::from_config(&state.config),
        router,
        Some(me.language.clone()),
    );
    let segmenter = VoiceSegmenter::new(SegmenterConfig::from_config(&state.config), gate);
    let mut conn = RoomConn::new(
        room.clone(),
        me.clone(),
        AudioIngest::new(segmenter),
        pipeline,
    );
    let mut recorder =
        SessionRecorder::new(state.config.server.recordings_dir.as_deref(), &session);

    let mut stream = stream;
    read_session_frames(&mut stream, &queue, &mut conn, &mut recorder).await;

    conn.finish();
    state.registry.leave(&room, me.id);
    drop(conn);
    recorder.flush();
    queue.close();
    drain_writer(writer).await;
    info!(session = %session, room = %room.code(), "room client disconnected");
}

async fn read_session_frames(
    stream: &mut SplitStream<WebSocket>,
    queue: &OutboundQueue,
    conn: &mut RoomConn,
    recorder: &mut SessionRecorder,
) {
    while let Some(frame) = stream.next().await {
        if queue.is_closed() {
            break;
        }
        match frame {
            Ok(Message::Binary(bytes)) => {
                if ControlMarker::parse(&bytes).is_none() {
                    recorder.push(&bytes);
                }
                conn.handle_binary(&bytes);
            }
            // Room control rides on binary markers; text frames are ignored
            // for forward compatibility.
            Ok(Message::Text(_)) => {}
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(_) => break,
        }
    }
}

//! End-to-end room scenarios driven at the session layer with mock
//! capabilities and channel-backed connections.

use parlance::audio::decoder::{MockContainerCodec, StreamDecoder};
use parlance::audio::ingest::AudioIngest;
use parlance::audio::segmenter::{SegmenterConfig, VoiceSegmenter};
use parlance::capability::vad::{EnergyGate, GateBackend};
use parlance::capability::{Capabilities, MockSynthesizer, MockTranscriber, MockTranslator};
use parlance::config::RoomConfig;
use parlance::defaults::VAD_WINDOW;
use parlance::pipeline::{StageConfig, StagePipeline};
use parlance::session::room::{LockWindow, Phase, Room, RoomConn, RoomRouter};
use parlance::session::{Participant, RoomRegistry};
use parlance::wire::outbound::{Outbound, OutboundQueue};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

fn mock_caps() -> Arc<Capabilities> {
    Arc::new(Capabilities::new(
        Arc::new(
            MockTranscriber::new("mock-asr")
                .with_response("hello")
                .with_language("en"),
        ),
        Arc::new(MockTranslator::new().with_response("hola")),
        Arc::new(MockSynthesizer::new()),
        GateBackend::Energy { threshold: 0.02 },
        2,
    ))
}

fn conn_for(
    room: Arc<Room>,
    me: Arc<Participant>,
    caps: Arc<Capabilities>,
) -> RoomConn<MockContainerCodec> {
    let router = Arc::new(RoomRouter::new(room.clone(), me.clone(), LockWindow::default()));
    let pipeline = StagePipeline::new(
        caps,
        StageConfig::default(),
        router,
        Some(me.language.clone()),
    );
    let segmenter = VoiceSegmenter::new(
        SegmenterConfig::default(),
        Box::new(EnergyGate::new(0.02)),
    );
    let ingest = AudioIngest::with_decoder(StreamDecoder::with_codec(MockContainerCodec), segmenter);
    RoomConn::new(room, me, ingest, pipeline)
}

/// A fresh container stream carrying `windows` windows of loud samples.
fn speech_stream(windows: usize) -> Vec<u8> {
    MockContainerCodec::stream_of(&vec![80u8; windows * VAD_WINDOW])
}

/// Mid-stream continuation of loud samples.
fn speech_bytes(windows: usize) -> Vec<u8> {
    vec![80u8; windows * VAD_WINDOW]
}

/// Mid-stream continuation of silence, enough to close an utterance.
fn closing_silence() -> Vec<u8> {
    vec![0u8; 17 * VAD_WINDOW]
}

async fn recv_frame(rx: &mut mpsc::Receiver<Outbound>) -> Outbound {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for frame")
        .expect("connection closed")
}

async fn recv_json(rx: &mut mpsc::Receiver<Outbound>) -> serde_json::Value {
    match recv_frame(rx).await {
        Outbound::Text(json) => serde_json::from_str(&json).expect("invalid JSON"),
        other => panic!("expected text frame, got {:?}", other),
    }
}

fn drain(rx: &mut mpsc::Receiver<Outbound>) -> Vec<Outbound> {
    let mut frames = Vec::new();
    while let Ok(frame) = rx.try_recv() {
        frames.push(frame);
    }
    frames
}

fn texts(frames: &[Outbound]) -> Vec<serde_json::Value> {
    frames
        .iter()
        .filter_map(|f| match f {
            Outbound::Text(json) => serde_json::from_str(json).ok(),
            _ => None,
        })
        .collect()
}

struct TestRoom {
    registry: Arc<RoomRegistry>,
    room: Arc<Room>,
    host: Arc<Participant>,
    guest: Arc<Participant>,
    host_rx: mpsc::Receiver<Outbound>,
    guest_rx: mpsc::Receiver<Outbound>,
    host_conn: RoomConn<MockContainerCodec>,
    guest_conn: RoomConn<MockContainerCodec>,
}

fn set_up_room(caps: &Arc<Capabilities>) -> TestRoom {
    let registry = Arc::new(RoomRegistry::new(&RoomConfig::default()));

    let (host_queue, mut host_rx) = OutboundQueue::new(64);
    let (room, host) = registry
        .create("en", "es", Some("Alice"), host_queue)
        .unwrap();
    assert_eq!(room.phase(), Phase::Waiting);

    let (guest_queue, mut guest_rx) = OutboundQueue::new(64);
    let (_, guest, info) = registry
        .join(room.code(), Some("Bob"), guest_queue)
        .unwrap();
    assert_eq!(info.partner_name, "Alice");
    assert_eq!(room.phase(), Phase::Ready);

    // Consume the join handshake frames
    let host_msgs = texts(&drain(&mut host_rx));
    assert!(host_msgs
        .iter()
        .any(|m| m["type"] == "partner_joined" && m["name"] == "Bob" && m["language"] == "es"));
    assert!(host_msgs
        .iter()
        .any(|m| m["type"] == "session_status" && m["status"] == "ready"));

    let guest_msgs = texts(&drain(&mut guest_rx));
    assert!(guest_msgs
        .iter()
        .any(|m| m["type"] == "room_joined"
            && m["language"] == "es"
            && m["partner_name"] == "Alice"
            && m["partner_language"] == "en"));
    assert!(guest_msgs
        .iter()
        .any(|m| m["type"] == "session_status" && m["status"] == "ready"));

    let host_conn = conn_for(room.clone(), host.clone(), caps.clone());
    let guest_conn = conn_for(room.clone(), guest.clone(), caps.clone());

    TestRoom {
        registry,
        room,
        host,
        guest,
        host_rx,
        guest_rx,
        host_conn,
        guest_conn,
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn create_join_start_utter_end() {
    let caps = mock_caps();
    let mut tr = set_up_room(&caps);

    // Host starts the session; both observe active
    tr.host_conn.handle_binary(b"STRT");
    assert_eq!(tr.room.phase(), Phase::Active);
    let msg = recv_json(&mut tr.host_rx).await;
    assert_eq!(msg["type"], "session_status");
    assert_eq!(msg["status"], "active");
    let msg = recv_json(&mut tr.guest_rx).await;
    assert_eq!(msg["status"], "active");

    // Host speaks ~1.3 s; the partner sees an interim transcript
    tr.host_conn.handle_binary(&speech_stream(42));
    let partial = recv_json(&mut tr.guest_rx).await;
    assert_eq!(partial["type"], "transcript_partial");
    assert_eq!(partial["speaker"], "partner");
    assert_eq!(partial["text"], "hello");

    // The speaker's own interim echo
    let own = recv_json(&mut tr.host_rx).await;
    assert_eq!(own["type"], "transcript_partial");
    assert_eq!(own["speaker"], "self");

    // Silence closes the utterance: final transcript, audio, mic lock
    tr.host_conn.handle_binary(&closing_silence());

    let own_final = recv_json(&mut tr.host_rx).await;
    assert_eq!(own_final["type"], "transcript");
    assert_eq!(own_final["speaker"], "self");
    assert_eq!(own_final["has_tts_audio"], false);

    let partner_final = recv_json(&mut tr.guest_rx).await;
    assert_eq!(partner_final["type"], "transcript");
    assert_eq!(partner_final["speaker"], "partner");
    assert_eq!(partner_final["speaker_name"], "Alice");
    assert_eq!(partner_final["text"], "hello");
    assert_eq!(partner_final["language"], "en");
    assert_eq!(partner_final["translation"], "hola");
    assert_eq!(partner_final["target_language"], "es");
    assert_eq!(partner_final["has_tts_audio"], true);
    assert!(partner_final["duration"].as_f64().unwrap() > 1.0);

    // Binary WAV immediately after its transcript
    match recv_frame(&mut tr.guest_rx).await {
        Outbound::Audio(bytes) => assert_eq!(&bytes[..4], b"RIFF"),
        other => panic!("expected audio frame, got {:?}", other),
    }

    // Echo suppression arming: "hola" is 4 * 80 ms + 300 ms margin,
    // clamped up to the 1 s minimum
    let locked = recv_json(&mut tr.guest_rx).await;
    assert_eq!(locked["type"], "mic_locked");
    assert_eq!(locked["duration_ms"], 1000);
    assert!(tr.guest.mic_locked());

    // Host ends the session; both observe ready
    tr.host_conn.handle_binary(b"ENDS");
    assert_eq!(tr.room.phase(), Phase::Ready);
    let msg = recv_json(&mut tr.host_rx).await;
    assert_eq!(msg["status"], "ready");
    let msg = recv_json(&mut tr.guest_rx).await;
    assert_eq!(msg["status"], "ready");

    tr.host_conn.finish();
    tr.guest_conn.finish();
}

#[tokio::test(flavor = "multi_thread")]
async fn non_host_cannot_start() {
    let caps = mock_caps();
    let mut tr = set_up_room(&caps);

    tr.guest_conn.handle_binary(b"STRT");
    assert_eq!(tr.room.phase(), Phase::Ready);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(drain(&mut tr.host_rx).is_empty());
    assert!(drain(&mut tr.guest_rx).is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn mute_drops_audio() {
    let caps = mock_caps();
    let mut tr = set_up_room(&caps);

    tr.host_conn.handle_binary(b"STRT");
    drain(&mut tr.host_rx);
    drain(&mut tr.guest_rx);

    // Guest mutes, then streams: the partner learns of the mute but sees
    // no transcripts for that speech
    tr.guest_conn.handle_binary(b"MUTE");
    let msg = recv_json(&mut tr.host_rx).await;
    assert_eq!(msg["type"], "partner_muted");

    tr.guest_conn.handle_binary(&speech_stream(20));
    tr.guest_conn.handle_binary(&closing_silence());
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(drain(&mut tr.host_rx).is_empty());
    assert!(drain(&mut tr.guest_rx).is_empty());

    // Unmute and speak again: transcripts flow
    tr.guest_conn.handle_binary(b"UNMT");
    let msg = recv_json(&mut tr.host_rx).await;
    assert_eq!(msg["type"], "partner_unmuted");

    tr.guest_conn.handle_binary(&speech_bytes(20));
    tr.guest_conn.handle_binary(&closing_silence());

    let msg = recv_json(&mut tr.host_rx).await;
    assert_eq!(msg["type"], "transcript");
    assert_eq!(msg["speaker"], "partner");
    assert_eq!(msg["speaker_name"], "Bob");
}

#[tokio::test(flavor = "multi_thread")]
async fn join_to_missing_room() {
    let registry = RoomRegistry::new(&RoomConfig::default());
    let (queue, _rx) = OutboundQueue::new(64);

    let err = registry.join("ZZZZZZ", Some("Bob"), queue).unwrap_err();
    assert!(matches!(
        err,
        parlance::error::ParlanceError::RoomNotFound { .. }
    ));
    assert_eq!(err.kind(), parlance::error::ErrorKind::RoomNotFound);
}

#[tokio::test(flavor = "multi_thread")]
async fn partner_disconnect_ends_room() {
    let caps = mock_caps();
    let mut tr = set_up_room(&caps);

    tr.host_conn.handle_binary(b"STRT");
    drain(&mut tr.host_rx);
    drain(&mut tr.guest_rx);

    // Host's transport closes mid-session
    tr.host_conn.finish();
    tr.registry.leave(&tr.room, tr.host.id);

    let msg = recv_json(&mut tr.guest_rx).await;
    assert_eq!(msg["type"], "partner_left");
    let msg = recv_json(&mut tr.guest_rx).await;
    assert_eq!(msg["type"], "session_status");
    assert_eq!(msg["status"], "ended");
    assert!(tr.guest.outbound.is_closed());

    // Audio from the remaining participant is ignored
    tr.guest_conn.handle_binary(&speech_stream(42));
    tr.guest_conn.handle_binary(&closing_silence());
    tokio::time::sleep(Duration::from_millis(300)).await;
    let leftover = texts(&drain(&mut tr.guest_rx));
    assert!(leftover
        .iter()
        .all(|m| m["type"] != "transcript" && m["type"] != "transcript_partial"));
}

#[tokio::test(flavor = "multi_thread")]
async fn echo_suppression_drops_locked_audio() {
    let caps = mock_caps();
    let mut tr = set_up_room(&caps);

    tr.host_conn.handle_binary(b"STRT");
    drain(&mut tr.host_rx);
    drain(&mut tr.guest_rx);

    // Short utterance from the host (below the partial threshold)
    tr.host_conn.handle_binary(&speech_stream(20));
    tr.host_conn.handle_binary(&closing_silence());

    // Guest receives transcript + audio + mic_locked
    let msg = recv_json(&mut tr.guest_rx).await;
    assert_eq!(msg["type"], "transcript");
    assert!(matches!(
        recv_frame(&mut tr.guest_rx).await,
        Outbound::Audio(_)
    ));
    let locked = recv_json(&mut tr.guest_rx).await;
    assert_eq!(locked["type"], "mic_locked");
    drain(&mut tr.host_rx);

    // Guest audio inside the lock window produces no utterance
    assert!(tr.guest.mic_locked());
    tr.guest_conn.handle_binary(&speech_stream(20));
    tr.guest_conn.handle_binary(&closing_silence());
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(drain(&mut tr.host_rx).is_empty());

    // After the window expires the guest is heard again
    tokio::time::sleep(Duration::from_millis(900)).await;
    assert!(!tr.guest.mic_locked());
    tr.guest_conn.handle_binary(&speech_bytes(20));
    tr.guest_conn.handle_binary(&closing_silence());

    let msg = recv_json(&mut tr.host_rx).await;
    assert_eq!(msg["type"], "transcript");
    assert_eq!(msg["speaker"], "partner");
}

#[tokio::test(flavor = "multi_thread")]
async fn finals_arrive_in_utterance_order() {
    let caps = mock_caps();
    let mut tr = set_up_room(&caps);

    tr.host_conn.handle_binary(b"STRT");
    drain(&mut tr.host_rx);
    drain(&mut tr.guest_rx);

    // Three short utterances back to back
    tr.host_conn.handle_binary(&speech_stream(20));
    tr.host_conn.handle_binary(&closing_silence());
    tr.host_conn.handle_binary(&speech_bytes(20));
    tr.host_conn.handle_binary(&closing_silence());
    tr.host_conn.handle_binary(&speech_bytes(20));
    tr.host_conn.handle_binary(&closing_silence());

    let mut finals = 0;
    while finals < 3 {
        // Audio and mic_locked frames interleave with the transcripts
        if let Outbound::Text(json) = recv_frame(&mut tr.guest_rx).await {
            let msg: serde_json::Value = serde_json::from_str(&json).unwrap();
            if msg["type"] == "transcript" {
                finals += 1;
            }
        }
    }
}

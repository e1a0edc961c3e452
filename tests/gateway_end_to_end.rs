//! Black-box WebSocket gateway tests driving `vox-core` the way a real orb
//! or mission-control client would: connect to `/ws/events` and
//! `/ws/command` over real TCP sockets and observe the wire protocol only.
//! Mirrors the shape of `streaming-core`'s `tests/end_to_end_voice_pipeline.rs`
//! (a standalone integration test exercising the full stack), adapted from
//! an audio pipeline to the session timeline in spec §8's scenarios.

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::Message;
use vox_core::adapters::sim::{SimLlmAdapter, SimSttAdapter, SimTtsAdapter};
use vox_core::{Adapters, CasStore, CommandHandler, EventBus, Gateway, ManifestWriter, Orchestrator, RootConfig};

/// Picks a free ephemeral port by binding and immediately releasing it, then
/// hands that address to `Gateway::serve` (which owns its own listener and
/// never exposes the bound port itself). A vanishingly small race window
/// between release and the gateway's own bind is the same tradeoff every
/// "find a free port for a test server" helper makes.
async fn spawn_vox_core(dir: &std::path::Path, autostart: bool) -> SocketAddr {
    let probe = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = probe.local_addr().unwrap();
    drop(probe);

    let bus = Arc::new(EventBus::new());
    let cas = CasStore::new(dir.join("cas"));
    let manifest_writer = ManifestWriter::new(dir.join("runs"));
    let adapters = Adapters {
        sim_llm: Arc::new(SimLlmAdapter::new()),
        ollama_llm: Arc::new(SimLlmAdapter::new()),
        cli_llm: Arc::new(SimLlmAdapter::new()),
        stt: Arc::new(SimSttAdapter),
        tts: Arc::new(SimTtsAdapter::new()),
    };
    let orchestrator = Arc::new(Orchestrator::new("sim", RootConfig::default(), bus.clone(), cas, manifest_writer, adapters));
    let command_handler = Arc::new(CommandHandler::new(orchestrator));
    let gateway = Arc::new(Gateway::new(bus, command_handler, autostart));

    tokio::spawn(async move {
        let _ = gateway.serve(addr).await;
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    addr
}

async fn recv_json(ws: &mut tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>) -> Value {
    loop {
        match ws.next().await.expect("stream closed").expect("ws error") {
            Message::Text(text) => return serde_json::from_str(&text).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

async fn send_command(ws: &mut tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>, json: &str) {
    ws.send(Message::Text(json.to_string().into())).await.unwrap();
}

/// Scenario 1 (spec §8): happy-path sim session observes the canonical
/// ordered timeline ending in `run_manifest_written`, and the manifest file
/// on disk is the real thing, with the transcript CAS blob matching the
/// German demo utterance.
#[tokio::test]
async fn happy_sim_session_emits_canonical_timeline_and_writes_manifest() {
    let dir = tempfile::tempdir().unwrap();
    let addr = spawn_vox_core(dir.path(), false).await;

    let (mut events_ws, _) = connect_async(format!("ws://{addr}/ws/events")).await.unwrap();
    let (mut cmd_ws, _) = connect_async(format!("ws://{addr}/ws/command")).await.unwrap();

    tokio::time::sleep(Duration::from_millis(20)).await;
    send_command(&mut cmd_ws, r#"{"type":"start_sim","payload":{}}"#).await;
    let _ack = recv_json(&mut cmd_ws).await;

    let mut observed = Vec::new();
    let mut manifest_path = None;
    loop {
        let env = recv_json(&mut events_ws).await;
        observed.push(env["type"].as_str().unwrap().to_string());
        if env["type"] == "run_manifest_written" {
            manifest_path = Some(env["payload"]["path"].as_str().unwrap().to_string());
            break;
        }
    }

    assert_eq!(observed.first().unwrap(), "session_start");
    assert!(observed.contains(&"vad_start".to_string()));
    assert!(observed.contains(&"stt_final".to_string()));
    assert!(observed.contains(&"llm_done".to_string()));
    assert!(observed.contains(&"tts_stop".to_string()));
    assert_eq!(observed[observed.len() - 2], "session_end");

    // stt_final must come before router_decision, which must come before llm_done.
    let idx = |t: &str| observed.iter().position(|x| x == t).unwrap();
    assert!(idx("stt_final") < idx("router_decision"));
    assert!(idx("router_decision") < idx("llm_done"));
    assert!(idx("llm_done") < idx("tts_start"));

    let manifest_path = manifest_path.expect("manifest path in run_manifest_written payload");
    let manifest_bytes = tokio::fs::read(&manifest_path).await.unwrap();
    let manifest: Value = serde_json::from_slice(&manifest_bytes).unwrap();
    assert_eq!(manifest["failed"], false);

    let transcripts_digest = manifest["artifacts"]["transcripts_json_sha256"].as_str().unwrap();
    let cas_path = dir.path().join("cas").join(transcripts_digest);
    let transcripts_bytes = tokio::fs::read(&cas_path).await.unwrap();
    let transcripts: Value = serde_json::from_slice(&transcripts_bytes).unwrap();
    assert_eq!(transcripts["user"], "wie geht es dir");
    assert_eq!(transcripts["assistant"], "Mir geht es gut. Was brauchst du?");
}

/// Scenario 2 (spec §8): barge-in during TTS truncates the tail with no
/// further `tts_chunk` delivered once `stop` has been sent.
#[tokio::test]
async fn barge_in_during_tts_stops_further_chunks() {
    let dir = tempfile::tempdir().unwrap();
    let addr = spawn_vox_core(dir.path(), false).await;

    let (mut events_ws, _) = connect_async(format!("ws://{addr}/ws/events")).await.unwrap();
    let (mut cmd_ws, _) = connect_async(format!("ws://{addr}/ws/command")).await.unwrap();

    tokio::time::sleep(Duration::from_millis(20)).await;
    send_command(&mut cmd_ws, r#"{"type":"start_sim","payload":{}}"#).await;
    let _ack = recv_json(&mut cmd_ws).await;

    let mut stop_sent = false;
    let mut tts_chunks_after_stop = 0;
    let mut saw_cancel_request = false;
    let mut saw_cancel_done = false;

    loop {
        let env = recv_json(&mut events_ws).await;
        let ty = env["type"].as_str().unwrap();

        if ty == "tts_chunk" && !stop_sent {
            stop_sent = true;
            send_command(&mut cmd_ws, r#"{"type":"stop","payload":{}}"#).await;
            let _ack = recv_json(&mut cmd_ws).await;
        } else if ty == "tts_chunk" && stop_sent {
            tts_chunks_after_stop += 1;
        } else if ty == "cancel_request" {
            saw_cancel_request = true;
            assert_eq!(env["payload"]["reason"], "user_stop");
        } else if ty == "cancel_done" {
            saw_cancel_done = true;
        } else if ty == "run_manifest_written" {
            break;
        }
    }

    assert!(saw_cancel_request, "expected cancel_request after stop");
    assert!(saw_cancel_done, "expected cancel_done after stop");
    assert!(tts_chunks_after_stop <= 1, "at most one in-flight chunk may race the cancel check");
}

/// Scenario 3 (spec §8): a PTT round trip emits `vad_start{source:"ptt"}`,
/// then `vad_end` followed by an empty, fully-confident `stt_final`.
#[tokio::test]
async fn ptt_round_trip_emits_vad_and_empty_stt_final() {
    let dir = tempfile::tempdir().unwrap();
    let addr = spawn_vox_core(dir.path(), false).await;

    let (mut events_ws, _) = connect_async(format!("ws://{addr}/ws/events")).await.unwrap();
    let (mut cmd_ws, _) = connect_async(format!("ws://{addr}/ws/command")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    send_command(&mut cmd_ws, r#"{"type":"ptt_start","payload":{}}"#).await;
    let _ack = recv_json(&mut cmd_ws).await;
    let start_ev = recv_json(&mut events_ws).await;
    assert_eq!(start_ev["type"], "vad_start");
    assert_eq!(start_ev["payload"]["source"], "ptt");

    send_command(&mut cmd_ws, r#"{"type":"ptt_stop","payload":{}}"#).await;
    let _ack = recv_json(&mut cmd_ws).await;
    let vad_end = recv_json(&mut events_ws).await;
    assert_eq!(vad_end["type"], "vad_end");
    let stt_final = recv_json(&mut events_ws).await;
    assert_eq!(stt_final["type"], "stt_final");
    assert_eq!(stt_final["payload"]["text"], "");
    assert_eq!(stt_final["payload"]["confidence"], 1.0);
}

/// Scenario 4 (spec §8): `set_wake_words` broadcasts `wake_words_updated`
/// with the submitted word list.
#[tokio::test]
async fn set_wake_words_broadcasts_update_with_submitted_words() {
    let dir = tempfile::tempdir().unwrap();
    let addr = spawn_vox_core(dir.path(), false).await;

    let (mut events_ws, _) = connect_async(format!("ws://{addr}/ws/events")).await.unwrap();
    let (mut cmd_ws, _) = connect_async(format!("ws://{addr}/ws/command")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    send_command(&mut cmd_ws, r#"{"type":"set_wake_words","payload":{"words":["alpha","beta"]}}"#).await;
    let ack = recv_json(&mut cmd_ws).await;
    assert_eq!(ack["ok"], true);

    let ev = recv_json(&mut events_ws).await;
    assert_eq!(ev["type"], "wake_words_updated");
    assert_eq!(ev["payload"]["words"], serde_json::json!(["alpha", "beta"]));
}

/// Spec §4.J: any path other than the two known endpoints is closed with a
/// policy-violation code at the WebSocket layer, not rejected at handshake.
#[tokio::test]
async fn unknown_websocket_path_is_closed_with_policy_violation() {
    let dir = tempfile::tempdir().unwrap();
    let addr = spawn_vox_core(dir.path(), false).await;

    let (mut ws, _) = connect_async(format!("ws://{addr}/ws/nonsense")).await.unwrap();
    match ws.next().await.unwrap().unwrap() {
        Message::Close(Some(frame)) => {
            assert_eq!(frame.code, CloseCode::Policy);
        }
        other => panic!("expected a policy-violation close frame, got {other:?}"),
    }
}

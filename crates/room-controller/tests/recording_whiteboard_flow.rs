//! Integration tests for recordings, the shared whiteboard and chat.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::time::Duration;

use rc_test_utils::{HarnessOptions, TestRoomController, TestSession, TestSocket, TestUser};
use room_controller::collaborators::ArtifactStatus;
use serde_json::{json, Value};

const SESSION: &str = "s-board";
const WHITEBOARD: &str = "wb-s-board";

fn error_code(frame: &Value) -> i64 {
    assert_eq!(frame["event"], "error_message", "expected an error, got {frame}");
    frame["data"]["code"].as_i64().unwrap()
}

async fn join(rc: &TestRoomController, user: &TestUser) -> TestSocket {
    let mut socket = rc.connect();
    let joined = socket.join(&user.token(), SESSION).await;
    assert_eq!(joined["event"], "joined_room", "join failed: {joined}");
    socket
}

async fn produce(socket: &mut TestSocket, kind: &str, source: &str) -> String {
    let transport = socket
        .request("create-transport", json!({ "direction": "send" }))
        .await;
    let transport_id = transport["data"]["id"].as_str().unwrap().to_string();
    let produced = socket
        .request(
            "transport-produce",
            json!({
                "transportId": transport_id,
                "kind": kind,
                "rtpParameters": {},
                "appData": { "source": source },
            }),
        )
        .await;
    assert_eq!(produced["event"], "produced", "{produced}");
    produced["data"]["producerId"].as_str().unwrap().to_string()
}

fn draw(element_id: &str) -> Value {
    json!({ "op": { "elementId": element_id, "element": { "shape": "line", "points": [0, 0, 10, 10] } } })
}

// ============================================================================
// Recording
// ============================================================================

#[tokio::test]
async fn test_recording_start_and_stop_appends_artifact() {
    let rc = TestRoomController::start(vec![TestSession::new(SESSION).build()]);
    let mut streamer = join(&rc, &TestUser::streamer()).await;
    let mut viewer = join(&rc, &TestUser::viewer("v-1")).await;
    produce(&mut streamer, "video", "camera").await;
    produce(&mut streamer, "audio", "camera").await;

    let ack = streamer.request("recording-start", json!({})).await;
    assert_eq!(ack["event"], "ack", "{ack}");
    assert_eq!(ack["data"]["action"], "recording_start");
    viewer.expect_event("recording_started").await;
    assert_eq!(rc.transcoder.spawned(), 1);
    assert!(rc.room_state(SESSION).await.unwrap().recording_active);

    let again = streamer.request("recording-start", json!({})).await;
    assert_eq!(error_code(&again), 5);

    let ack = streamer.request("recording-stop", json!({})).await;
    assert_eq!(ack["event"], "ack", "{ack}");
    let stopped = viewer.expect_event("recording_stopped").await;
    assert_eq!(stopped["data"]["artifact"]["status"], "COMPLETED");
    assert!(stopped["data"].get("degraded").is_none());

    assert_eq!(rc.transcoder.stopped(), 1);
    assert_eq!(rc.platform.uploads().len(), 1);
    let stored = rc.platform.session(SESSION).unwrap();
    assert_eq!(stored.recordings.len(), 1);
    assert_eq!(stored.recordings[0].status, ArtifactStatus::Completed);
    assert!(!rc.room_state(SESSION).await.unwrap().recording_active);

    rc.shutdown().await;
}

#[tokio::test]
async fn test_recording_without_video_is_provider_error() {
    let rc = TestRoomController::start(vec![TestSession::new(SESSION).build()]);
    let mut streamer = join(&rc, &TestUser::streamer()).await;
    produce(&mut streamer, "audio", "camera").await;

    let reply = streamer.request("recording-start", json!({})).await;
    assert_eq!(error_code(&reply), 9);
    assert_eq!(rc.transcoder.spawned(), 0);

    rc.shutdown().await;
}

#[tokio::test]
async fn test_recording_stop_without_recording() {
    let rc = TestRoomController::start(vec![TestSession::new(SESSION).build()]);
    let mut streamer = join(&rc, &TestUser::streamer()).await;

    let reply = streamer.request("recording-stop", json!({})).await;
    assert_eq!(error_code(&reply), 4);
    assert_eq!(reply["data"]["kind"], "not_found");

    rc.shutdown().await;
}

#[tokio::test]
async fn test_viewer_cannot_record() {
    let rc = TestRoomController::start(vec![TestSession::new(SESSION).build()]);
    let mut streamer = join(&rc, &TestUser::streamer()).await;
    produce(&mut streamer, "video", "camera").await;
    let mut viewer = join(&rc, &TestUser::viewer("v-1")).await;

    let reply = viewer.request("recording-start", json!({})).await;
    assert_eq!(error_code(&reply), 3);

    rc.shutdown().await;
}

#[tokio::test]
async fn test_failed_upload_degrades_artifact() {
    let rc = TestRoomController::start(vec![TestSession::new(SESSION).build()]);
    let mut streamer = join(&rc, &TestUser::streamer()).await;
    produce(&mut streamer, "video", "camera").await;
    rc.platform.set_fail_uploads(true);

    streamer.request("recording-start", json!({})).await;
    let ack = streamer.request("recording-stop", json!({})).await;
    assert_eq!(ack["event"], "ack", "{ack}");

    let stopped = streamer.expect_event("recording_stopped").await;
    assert_eq!(stopped["data"]["artifact"]["status"], "FAILED");
    assert!(stopped["data"]["degraded"].is_string());

    rc.shutdown().await;
}

#[tokio::test]
async fn test_streamer_end_finishes_recording() {
    let rc = TestRoomController::start(vec![TestSession::new(SESSION).build()]);
    let mut streamer = join(&rc, &TestUser::streamer()).await;
    produce(&mut streamer, "video", "camera").await;
    streamer.request("recording-start", json!({})).await;

    streamer.request("streamer_end", json!({})).await;

    let stopped = streamer.expect_event("recording_stopped").await;
    assert_eq!(stopped["data"]["artifact"]["status"], "COMPLETED");
    assert_eq!(rc.transcoder.stopped(), 1);
    assert_eq!(rc.platform.session(SESSION).unwrap().recordings.len(), 1);

    rc.shutdown().await;
}

// ============================================================================
// Whiteboard
// ============================================================================

#[tokio::test]
async fn test_draw_is_relayed_and_flushed() {
    let rc = TestRoomController::start(vec![TestSession::new(SESSION).build()]);
    let mut streamer = join(&rc, &TestUser::streamer()).await;
    let mut viewer = join(&rc, &TestUser::viewer("v-1")).await;

    streamer.send("whiteboard_draw", draw("e-1")).await;
    streamer.send("whiteboard_draw", draw("e-2")).await;

    let relayed = viewer.expect_event("whiteboard_draw").await;
    assert_eq!(relayed["data"]["op"]["type"], "draw");
    assert_eq!(relayed["data"]["op"]["elementId"], "e-1");
    assert_eq!(relayed["data"]["op"]["userId"], "streamer-1");
    streamer
        .expect_no_event("whiteboard_draw", Duration::from_millis(50))
        .await;

    // Both ops land in one flushed batch after the debounce window.
    let state = rc
        .wait_for_room(SESSION, |s| s.whiteboard_version == Some(1))
        .await;
    assert_eq!(state.pending_whiteboard_ops, 0);
    let document = rc.platform.whiteboard(WHITEBOARD).unwrap();
    assert_eq!(document.version, 1);
    assert_eq!(document.operations.len(), 2);
    assert!(document.canvas.contains_key("e-2"));

    rc.shutdown().await;
}

#[tokio::test]
async fn test_save_flushes_pending_ops() {
    let rc = TestRoomController::start_with(
        vec![TestSession::new(SESSION).build()],
        HarnessOptions {
            whiteboard_flush: Duration::from_secs(60),
            ..HarnessOptions::default()
        },
    );
    let mut streamer = join(&rc, &TestUser::streamer()).await;

    streamer.send("whiteboard_draw", draw("e-1")).await;
    let state = rc
        .wait_for_room(SESSION, |s| s.pending_whiteboard_ops == 1)
        .await;
    assert_eq!(state.whiteboard_version.unwrap_or(0), 0);

    // A late joiner sees the op that has not been flushed yet.
    let mut viewer = rc.connect();
    let joined = viewer.join(&TestUser::viewer("v-1").token(), SESSION).await;
    assert_eq!(
        joined["data"]["whiteboard"]["pending"][0]["elementId"],
        "e-1"
    );

    let saved = streamer.request("whiteboard_save", json!({})).await;
    assert_eq!(saved["event"], "whiteboard_saved");
    assert_eq!(saved["data"]["version"], 1);
    assert_eq!(rc.platform.whiteboard(WHITEBOARD).unwrap().version, 1);

    rc.shutdown().await;
}

#[tokio::test]
async fn test_undo_and_redo_broadcast_board() {
    let rc = TestRoomController::start(vec![TestSession::new(SESSION).build()]);
    let mut streamer = join(&rc, &TestUser::streamer()).await;
    let mut viewer = join(&rc, &TestUser::viewer("v-1")).await;

    streamer.send("whiteboard_draw", draw("e-1")).await;
    streamer.request("whiteboard_save", json!({})).await;
    streamer
        .send("whiteboard_erase", json!({ "op": { "elementId": "e-1" } }))
        .await;
    viewer.expect_event("whiteboard_erase").await;

    let ack = streamer.request("whiteboard_undo", json!({})).await;
    assert_eq!(ack["event"], "ack", "{ack}");
    let undone = viewer.expect_event("whiteboard_undo").await;
    assert_eq!(undone["data"]["whiteboardId"], WHITEBOARD);
    assert!(undone["data"]["canvas"].get("e-1").is_some());

    let ack = streamer.request("whiteboard_redo", json!({})).await;
    assert_eq!(ack["event"], "ack", "{ack}");
    let redone = viewer.expect_event("whiteboard_redo").await;
    assert!(redone["data"]["canvas"].get("e-1").is_none());

    rc.shutdown().await;
}

#[tokio::test]
async fn test_failed_flush_keeps_ops_for_retry() {
    let rc = TestRoomController::start(vec![TestSession::new(SESSION).build()]);
    let mut streamer = join(&rc, &TestUser::streamer()).await;
    rc.platform.set_fail_whiteboard_saves(true);

    streamer.send("whiteboard_draw", draw("e-1")).await;
    tokio::time::sleep(Duration::from_millis(400)).await;
    let state = rc.room_state(SESSION).await.unwrap();
    assert_eq!(state.pending_whiteboard_ops, 1);
    assert!(rc.platform.whiteboard(WHITEBOARD).is_none());

    rc.platform.set_fail_whiteboard_saves(false);
    let saved = streamer.request("whiteboard_save", json!({})).await;
    assert_eq!(saved["data"]["version"], 1);

    rc.shutdown().await;
}

#[tokio::test]
async fn test_session_without_whiteboard() {
    let rc = TestRoomController::start(vec![TestSession::new(SESSION)
        .without_whiteboard()
        .build()]);
    let mut streamer = join(&rc, &TestUser::streamer()).await;

    let reply = streamer.request("whiteboard_save", json!({})).await;
    assert_eq!(error_code(&reply), 4);

    rc.shutdown().await;
}

// ============================================================================
// Chat
// ============================================================================

#[tokio::test]
async fn test_chat_reaches_everyone() {
    let rc = TestRoomController::start(vec![TestSession::new(SESSION).build()]);
    let mut streamer = join(&rc, &TestUser::streamer()).await;
    let mut viewer = join(&rc, &TestUser::viewer("v-1")).await;

    viewer
        .send("chat_message", json!({ "text": "  Can you zoom in?  " }))
        .await;

    for socket in [&mut streamer, &mut viewer] {
        let chat = socket.expect_event("chat_message").await;
        assert_eq!(chat["data"]["userId"], "v-1");
        assert_eq!(chat["data"]["displayName"], "Viewer v-1");
        assert_eq!(chat["data"]["text"], "Can you zoom in?");
    }

    let reply = viewer.request("chat_message", json!({ "text": "   " })).await;
    assert_eq!(error_code(&reply), 8);

    rc.shutdown().await;
}

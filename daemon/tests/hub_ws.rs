//! WebSocket protocol tests against a live hub on an ephemeral port.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use overture_daemon::adapters::{Adapter, ClaudeAdapter};
use overture_daemon::config::Config;
use overture_daemon::hub;
use overture_daemon::project::{ManifestProjectStore, ProjectInfo};
use overture_daemon::prompt::PromptLoader;
use overture_daemon::registry::AdapterRegistry;
use overture_daemon::state::DaemonState;
use overture_daemon::store::MemoryMessageStore;
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

const HAPPY_FIXTURE: &str = r#"#!/usr/bin/env bash
if [ "$1" = "--version" ]; then echo "fixture 1.0.0"; exit 0; fi
cat <<'EOF'
{"type":"system","subtype":"init","session_id":"sess-A"}
{"type":"assistant","message":{"content":[{"type":"text","text":"Creating page."}]}}
{"type":"assistant","message":{"content":[{"type":"tool_use","id":"t1","name":"write_file","input":{"path":"app/hello/page.tsx"}}]}}
{"type":"user","message":{"content":[{"type":"tool_result","tool_use_id":"t1","content":"ok","is_error":false}]}}
{"type":"assistant","message":{"content":[{"type":"text","text":"Done."}]}}
{"type":"result","subtype":"success","result":"Done.","duration_ms":900,"num_turns":2,"is_error":false}
EOF
"#;

fn write_fixture(dir: &Path) -> String {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.join("claude-fixture");
    std::fs::write(&path, HAPPY_FIXTURE).expect("write fixture");
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
        .expect("chmod fixture");
    path.to_string_lossy().into_owned()
}

async fn start_daemon(token: Option<String>) -> (SocketAddr, TempDir) {
    let tmp = tempfile::tempdir().expect("tempdir");
    let workspace = tmp.path().join("workspace");
    std::fs::create_dir_all(&workspace).expect("workspace");
    let fixture = write_fixture(tmp.path());

    let projects = Arc::new(ManifestProjectStore::from_projects(vec![ProjectInfo {
        id: "p1".to_string(),
        workspace,
        preferred_agent: None,
        preferred_model: None,
    }]));
    let registry = Arc::new(AdapterRegistry::with_adapters(
        vec![Adapter::Claude(ClaudeAdapter::with_program(fixture))],
        Duration::from_secs(60),
    ));
    let state = Arc::new(DaemonState::new(
        Config::default(),
        token,
        registry,
        Arc::new(MemoryMessageStore::new()),
        projects,
        Arc::new(PromptLoader::new(None)),
    ));

    let app = hub::router(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (addr, tmp)
}

async fn next_message<S>(ws: &mut S) -> Message
where
    S: StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    tokio::time::timeout(Duration::from_secs(15), ws.next())
        .await
        .expect("timed out waiting for frame")
        .expect("connection closed")
        .expect("websocket error")
}

#[tokio::test(flavor = "multi_thread")]
async fn ping_is_answered_with_pong() {
    let (addr, _tmp) = start_daemon(None).await;
    let (mut ws, _) = connect_async(format!("ws://{addr}/v1/ws/projects/p1"))
        .await
        .expect("connect");

    ws.send(Message::Text("ping".into())).await.expect("send");
    let reply = next_message(&mut ws).await;
    assert_eq!(reply.into_text().expect("text").as_str(), "pong");
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_project_closes_with_4003() {
    let (addr, _tmp) = start_daemon(None).await;
    let (mut ws, _) = connect_async(format!("ws://{addr}/v1/ws/projects/nope"))
        .await
        .expect("connect");

    let frame = next_message(&mut ws).await;
    match frame {
        Message::Close(Some(close)) => assert_eq!(u16::from(close.code), 4003),
        other => panic!("expected close frame, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn bad_token_closes_with_4002() {
    let (addr, _tmp) = start_daemon(Some("secret".to_string())).await;

    let (mut ws, _) = connect_async(format!("ws://{addr}/v1/ws/projects/p1"))
        .await
        .expect("connect");
    let frame = next_message(&mut ws).await;
    match frame {
        Message::Close(Some(close)) => assert_eq!(u16::from(close.code), 4002),
        other => panic!("expected close frame, got {other:?}"),
    }

    // With the token the connection behaves normally.
    let (mut ws, _) = connect_async(format!("ws://{addr}/v1/ws/projects/p1?token=secret"))
        .await
        .expect("connect");
    ws.send(Message::Text("ping".into())).await.expect("send");
    let reply = next_message(&mut ws).await;
    assert_eq!(reply.into_text().expect("text").as_str(), "pong");
}

#[tokio::test(flavor = "multi_thread")]
async fn submit_streams_ordered_event_frames() {
    let (addr, _tmp) = start_daemon(None).await;
    let (mut ws, _) = connect_async(format!("ws://{addr}/v1/ws/projects/p1"))
        .await
        .expect("connect");

    let envelope = json!({
        "type": "submit",
        "data": {"instruction": "add hello page", "agent": "claude"}
    });
    ws.send(Message::Text(envelope.to_string().into()))
        .await
        .expect("send");

    let mut frames: Vec<Value> = Vec::new();
    loop {
        let message = next_message(&mut ws).await;
        let text = match message {
            Message::Text(text) => text,
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame: {other:?}"),
        };
        let frame: Value = serde_json::from_str(text.as_str()).expect("frame json");
        let terminal = frame["type"] == "status" && frame["data"]["phase"] == "complete";
        frames.push(frame);
        if terminal {
            break;
        }
    }

    let types: Vec<&str> = frames
        .iter()
        .map(|f| f["type"].as_str().expect("type"))
        .collect();
    assert_eq!(
        types,
        vec![
            "status",
            "session_info",
            "assistant_text",
            "tool_call",
            "tool_result",
            "assistant_text",
            "status",
        ]
    );
    assert_eq!(frames[0]["data"]["phase"], "start");
    assert_eq!(frames[0]["data"]["agent"], "claude");

    // Frames carry request id and strictly increasing seq.
    let request_id = frames[0]["request_id"].as_str().expect("request id");
    assert!(frames
        .iter()
        .all(|f| f["request_id"].as_str() == Some(request_id)));
    let seqs: Vec<u64> = frames
        .iter()
        .map(|f| f["seq"].as_u64().expect("seq"))
        .collect();
    assert!(seqs.windows(2).all(|w| w[0] < w[1]));
}

#[tokio::test(flavor = "multi_thread")]
async fn malformed_frame_gets_protocol_error_without_disconnect() {
    let (addr, _tmp) = start_daemon(None).await;
    let (mut ws, _) = connect_async(format!("ws://{addr}/v1/ws/projects/p1"))
        .await
        .expect("connect");

    ws.send(Message::Text("{\"type\":\"bogus\"}".into()))
        .await
        .expect("send");
    let frame = next_message(&mut ws).await;
    let value: Value =
        serde_json::from_str(frame.into_text().expect("text").as_str()).expect("json");
    assert_eq!(value["type"], "error");
    assert_eq!(value["data"]["kind"], "protocol");

    // Connection survives; keepalive still works.
    ws.send(Message::Text("ping".into())).await.expect("send");
    let reply = next_message(&mut ws).await;
    assert_eq!(reply.into_text().expect("text").as_str(), "pong");
}

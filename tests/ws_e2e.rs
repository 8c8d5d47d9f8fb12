//! End-to-end tests: a real server, real WebSocket clients and a shell
//! script standing in for the generator.

use std::path::Path;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite::Message;

use omnigen::config::Settings;
use omnigen::job::server;

type Client = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

struct TestServer {
    url: String,
    artifact_dir: std::path::PathBuf,
    shutdown: Option<oneshot::Sender<()>>,
    _dir: TempDir,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

async fn start_server(script: &str) -> TestServer {
    let dir = TempDir::new().unwrap();
    let script_path = dir.path().join("worker.sh");
    std::fs::write(&script_path, script).unwrap();

    let mut settings = Settings::default();
    settings.worker.program = "sh".to_string();
    settings.worker.args = vec![script_path.to_string_lossy().to_string()];
    settings.worker.artifact_dir = dir.path().join("artifacts");
    settings.server.public_dir = dir.path().join("public");
    settings.job.poll_interval_ms = 60_000;
    settings.job.replay_state_on_connect = true;

    let (state, app) = server::build_app(&settings).unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = oneshot::channel::<()>();

    tokio::spawn(async move {
        let _ = server::serve(listener, state, app, async {
            let _ = rx.await;
        })
        .await;
    });

    TestServer {
        url: format!("ws://{}/ws", addr),
        artifact_dir: settings.worker.artifact_dir.clone(),
        shutdown: Some(tx),
        _dir: dir,
    }
}

/// Connect and wait for the replayed status, which arrives only once the
/// session is subscribed to the event bus.
async fn connect(server: &TestServer) -> Client {
    let (mut client, _) = tokio_tungstenite::connect_async(server.url.as_str())
        .await
        .unwrap();
    let greeting = next_json(&mut client).await;
    assert_eq!(greeting, json!({"type": "status", "data": {"state": "stopped"}}));
    client
}

async fn next_json(client: &mut Client) -> Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(10), client.next())
            .await
            .expect("timed out waiting for a message")
            .expect("connection closed")
            .unwrap();
        match msg {
            Message::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame: {:?}", other),
        }
    }
}

async fn send_json(client: &mut Client, value: Value) {
    client
        .send(Message::Text(value.to_string().into()))
        .await
        .unwrap();
}

fn start_frame(charset: &str, min: i64, max: i64) -> Value {
    json!({"type": "startGeneration", "data": {"charset": charset, "min": min, "max": max}})
}

fn status(state: &str) -> Value {
    json!({"type": "status", "data": {"state": state}})
}

fn progress(count: u64) -> Value {
    json!({"type": "progress", "data": {"count": count}})
}

fn download_ready() -> Value {
    json!({"type": "downloadReady"})
}

fn read_artifact(dir: &Path, name: &str) -> String {
    std::fs::read_to_string(dir.join(name)).unwrap()
}

const COUNTING_WORKER: &str = r#"
echo "$@" > args.txt
echo 1
echo 2
printf 'a\nb\n' > output.txt
echo 3
"#;

#[tokio::test]
async fn test_all_observers_see_the_same_run() {
    let server = start_server(COUNTING_WORKER).await;
    let mut alice = connect(&server).await;
    let mut bob = connect(&server).await;

    send_json(&mut alice, start_frame("ab", 1, 2)).await;

    let expected = vec![
        status("running"),
        progress(1),
        progress(2),
        progress(3),
        status("stopped"),
        download_ready(),
    ];
    for client in [&mut alice, &mut bob] {
        let mut seen = Vec::new();
        for _ in 0..expected.len() {
            seen.push(next_json(client).await);
        }
        assert_eq!(seen, expected);
    }

    assert_eq!(
        read_artifact(&server.artifact_dir, "args.txt").trim(),
        "--charset ab --min 1 --max 2"
    );
    assert_eq!(read_artifact(&server.artifact_dir, "output.txt"), "a\nb\n");
}

#[tokio::test]
async fn test_invalid_start_is_reported_to_sender_only() {
    let server = start_server(COUNTING_WORKER).await;
    let mut alice = connect(&server).await;
    let mut bob = connect(&server).await;

    send_json(&mut alice, start_frame("ab", 3, 1)).await;
    let reply = next_json(&mut alice).await;
    assert_eq!(reply["type"], "error");

    // Bob sees the next real run first, proving he got nothing for Alice's mistake.
    send_json(&mut bob, start_frame("ab", 1, 1)).await;
    assert_eq!(next_json(&mut bob).await, status("running"));
    assert_eq!(next_json(&mut alice).await, status("running"));
}

const SLOW_WORKER: &str = r#"
echo 1
echo "warming up" >&2
exec sleep 30
"#;

#[tokio::test]
async fn test_second_start_rejected_and_stop_ends_run() {
    let server = start_server(SLOW_WORKER).await;
    let mut alice = connect(&server).await;
    let mut bob = connect(&server).await;

    send_json(&mut alice, start_frame("xyz", 1, 3)).await;

    assert_eq!(next_json(&mut bob).await, status("running"));
    assert_eq!(next_json(&mut bob).await, progress(1));

    // Alice started the run, so only she hears about its stderr.
    assert_eq!(next_json(&mut alice).await, status("running"));
    let mut alice_seen = vec![next_json(&mut alice).await, next_json(&mut alice).await];
    alice_seen.sort_by_key(|v| v["type"].as_str().unwrap_or_default().to_string());
    assert_eq!(alice_seen[0], json!({"type": "error", "data": {"message": "warming up"}}));
    assert_eq!(alice_seen[1], progress(1));

    send_json(&mut bob, start_frame("xyz", 1, 3)).await;
    assert_eq!(
        next_json(&mut bob).await,
        json!({"type": "error", "data": {"message": "Generation already in progress"}})
    );

    send_json(&mut bob, json!({"type": "stopGeneration"})).await;
    for client in [&mut alice, &mut bob] {
        assert_eq!(next_json(client).await, status("stopped"));
        assert_eq!(next_json(client).await, download_ready());
    }

    // The slot is free again.
    send_json(&mut alice, start_frame("xyz", 1, 3)).await;
    assert_eq!(next_json(&mut bob).await, status("running"));
    send_json(&mut alice, json!({"type": "stopGeneration"})).await;
}

#[tokio::test]
async fn test_stop_when_idle_is_silent() {
    let server = start_server(COUNTING_WORKER).await;
    let mut alice = connect(&server).await;

    send_json(&mut alice, json!({"type": "stopGeneration"})).await;
    send_json(&mut alice, start_frame("a", 1, 1)).await;

    assert_eq!(next_json(&mut alice).await, status("running"));
}

#[tokio::test]
async fn test_malformed_command_gets_error() {
    let server = start_server(COUNTING_WORKER).await;
    let mut alice = connect(&server).await;

    alice
        .send(Message::Text("not json".to_string().into()))
        .await
        .unwrap();
    let reply = next_json(&mut alice).await;
    assert_eq!(reply["type"], "error");
}

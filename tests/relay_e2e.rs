//! End-to-end relay scenarios: real server, real sockets, scripted extension.
//!
//! The extension side runs the actual proxy + reconnect loop from
//! `relay-extension` against scripted debugger/recorder hosts, so every frame
//! crosses the same code paths a live deployment uses.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use cdp_relay::{build_router, ServeState};
use futures::{SinkExt, StreamExt};
use relay_core::{spawn_relay, IdlePolicy, RelayConfig, RelayHandle, StatusSnapshot};
use relay_extension::{
    run_extension_proxy, ExtensionClientConfig, ExtensionProxy, ScriptedDebugger, ScriptedRecorder,
};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use url::Url;

const WAIT: Duration = Duration::from_secs(10);

struct Relay {
    addr: SocketAddr,
    handle: RelayHandle,
}

async fn start_relay(idle_policy: IdlePolicy) -> Relay {
    let config = RelayConfig {
        bind: "127.0.0.1:0".parse().expect("addr"),
        idle_policy,
        ..RelayConfig::default()
    };
    let handle = spawn_relay(config);
    let (shutdown_tx, mut shutdown_rx) = tokio::sync::mpsc::channel::<()>(1);
    let state = ServeState::new(handle.clone(), None, shutdown_tx);
    let router = build_router(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        let _ = axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.recv().await;
        })
        .await;
    });
    Relay { addr, handle }
}

struct Extension {
    debugger: Arc<ScriptedDebugger>,
    recorder: Arc<ScriptedRecorder>,
    task: JoinHandle<()>,
    config: ExtensionClientConfig,
}

impl Extension {
    async fn spawn(relay: &Relay) -> Self {
        let debugger = Arc::new(ScriptedDebugger::new());
        let recorder = Arc::new(ScriptedRecorder::new());
        let config = ExtensionClientConfig::new(
            Url::parse(&format!("http://{}", relay.addr)).expect("relay url"),
        );
        let task = Self::run(debugger.clone(), recorder.clone(), config.clone());
        Self {
            debugger,
            recorder,
            task,
            config,
        }
    }

    fn run(
        debugger: Arc<ScriptedDebugger>,
        recorder: Arc<ScriptedRecorder>,
        config: ExtensionClientConfig,
    ) -> JoinHandle<()> {
        let proxy = ExtensionProxy::new(debugger, recorder);
        tokio::spawn(async move {
            let _ = run_extension_proxy(proxy, config).await;
        })
    }

    /// Drop the socket and stay down until `reconnect`.
    fn kill(&self) {
        self.task.abort();
    }

    fn reconnect(&mut self) {
        self.task = Self::run(
            self.debugger.clone(),
            self.recorder.clone(),
            self.config.clone(),
        );
    }
}

async fn wait_for_status<F>(relay: &Relay, predicate: F) -> StatusSnapshot
where
    F: Fn(&StatusSnapshot) -> bool,
{
    timeout(WAIT, async {
        loop {
            let status = relay.handle.status().await;
            if predicate(&status) {
                return status;
            }
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("status condition not reached")
}

struct TestClient {
    socket: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl TestClient {
    async fn connect(relay: &Relay, id: &str) -> Self {
        let (socket, _) = connect_async(format!("ws://{}/cdp/{id}", relay.addr))
            .await
            .expect("client connect");
        Self { socket }
    }

    async fn send(&mut self, value: Value) {
        self.socket
            .send(Message::Text(value.to_string()))
            .await
            .expect("client send");
    }

    async fn recv_json(&mut self) -> Value {
        timeout(WAIT, async {
            loop {
                match self.socket.next().await {
                    Some(Ok(Message::Text(text))) => {
                        return serde_json::from_str(&text).expect("json frame")
                    }
                    Some(Ok(_)) => continue,
                    other => panic!("client socket ended: {other:?}"),
                }
            }
        })
        .await
        .expect("no frame before timeout")
    }

    /// Skip frames until the given event method arrives.
    async fn recv_event(&mut self, method: &str) -> Value {
        timeout(WAIT, async {
            loop {
                let frame = self.recv_json().await;
                if frame["method"] == method {
                    return frame;
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("no {method} event before timeout"))
    }

    async fn recv_response(&mut self, id: u64) -> Value {
        timeout(WAIT, async {
            loop {
                let frame = self.recv_json().await;
                if frame["id"] == id {
                    return frame;
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("no response for id {id} before timeout"))
    }

    async fn set_auto_attach(&mut self, id: u64) -> Value {
        self.send(json!({
            "id": id,
            "method": "Target.setAutoAttach",
            "params": {"autoAttach": true, "waitForDebuggerOnStart": false, "flatten": true},
        }))
        .await;
        let response = self.recv_response(id).await;
        assert_eq!(response["result"], json!({}));
        self.recv_event("Target.attachedToTarget").await
    }
}

async fn relay_with_tab() -> (Relay, Extension) {
    let relay = start_relay(IdlePolicy::Reject).await;
    let extension = Extension::spawn(&relay).await;
    extension.debugger.open_tab(42, "https://a.example", "page a");
    wait_for_status(&relay, |status| status.extension_connected && status.targets == 1).await;
    (relay, extension)
}

#[tokio::test]
async fn solo_happy_path_auto_attach() {
    let (relay, _extension) = relay_with_tab().await;

    let mut client = TestClient::connect(&relay, "alpha").await;
    let created = client.recv_event("Target.targetCreated").await;
    let target_id = created["params"]["targetInfo"]["targetId"]
        .as_str()
        .expect("target id")
        .to_string();

    let attached = client.set_auto_attach(1).await;
    let params = &attached["params"];
    assert_eq!(params["targetInfo"]["targetId"], target_id.as_str());
    assert_eq!(params["targetInfo"]["type"], "page");
    assert_eq!(params["targetInfo"]["attached"], true);
    assert_eq!(params["targetInfo"]["browserContextId"], "default");
    assert_eq!(params["targetInfo"]["canAccessOpener"], false);
    assert_eq!(params["waitingForDebugger"], false);
    assert!(params["sessionId"].as_str().expect("session id").starts_with('s'));
}

#[tokio::test]
async fn navigation_preserves_target_id() {
    let (relay, extension) = relay_with_tab().await;
    let mut client = TestClient::connect(&relay, "alpha").await;
    let created = client.recv_event("Target.targetCreated").await;
    let target_id = created["params"]["targetInfo"]["targetId"].clone();
    client.set_auto_attach(1).await;

    extension
        .debugger
        .navigate_tab(42, "https://b.example", "page b");
    let changed = client.recv_event("Target.targetInfoChanged").await;
    assert_eq!(changed["params"]["targetInfo"]["targetId"], target_id);
    assert_eq!(changed["params"]["targetInfo"]["url"], "https://b.example");
}

#[tokio::test]
async fn closed_tab_detaches_then_destroys() {
    let (relay, extension) = relay_with_tab().await;
    let mut client = TestClient::connect(&relay, "alpha").await;
    let created = client.recv_event("Target.targetCreated").await;
    let target_id = created["params"]["targetInfo"]["targetId"].clone();
    let attached = client.set_auto_attach(1).await;
    let session_id = attached["params"]["sessionId"]
        .as_str()
        .expect("session id")
        .to_string();

    extension.debugger.close_tab(42);
    let detached = client.recv_event("Target.detachedFromTarget").await;
    assert_eq!(detached["params"]["sessionId"], session_id.as_str());
    let destroyed = client.recv_event("Target.targetDestroyed").await;
    assert_eq!(destroyed["params"]["targetId"], target_id);

    client
        .send(json!({
            "id": 9,
            "method": "Runtime.evaluate",
            "params": {"expression": "1"},
            "sessionId": session_id,
        }))
        .await;
    let response = client.recv_response(9).await;
    let message = response["error"]["message"].as_str().expect("error message");
    assert!(message.contains("No session with given id"));
}

#[tokio::test]
async fn two_clients_share_one_tab_with_distinct_sessions() {
    let (relay, extension) = relay_with_tab().await;
    extension
        .debugger
        .set_response("Runtime.evaluate", json!({"result": {"value": 7}}));

    let mut alpha = TestClient::connect(&relay, "alpha").await;
    alpha.recv_event("Target.targetCreated").await;
    let session_a = alpha.set_auto_attach(1).await["params"]["sessionId"]
        .as_str()
        .expect("session a")
        .to_string();

    let mut beta = TestClient::connect(&relay, "beta").await;
    beta.recv_event("Target.targetCreated").await;
    let session_b = beta.set_auto_attach(1).await["params"]["sessionId"]
        .as_str()
        .expect("session b")
        .to_string();
    assert_ne!(session_a, session_b);

    alpha
        .send(json!({
            "id": 10,
            "method": "Runtime.evaluate",
            "params": {"expression": "3+4"},
            "sessionId": session_a,
        }))
        .await;
    beta.send(json!({
            "id": 20,
            "method": "Runtime.evaluate",
            "params": {"expression": "3+4"},
            "sessionId": session_b,
        }))
        .await;

    let response_a = alpha.recv_response(10).await;
    assert_eq!(response_a["result"]["result"]["value"], 7);
    assert_eq!(response_a["sessionId"], session_a.as_str());
    let response_b = beta.recv_response(20).await;
    assert_eq!(response_b["result"]["result"]["value"], 7);
    assert_eq!(response_b["sessionId"], session_b.as_str());
}

#[tokio::test]
async fn extension_reconnect_revives_target_id_with_fresh_session() {
    let (relay, mut extension) = relay_with_tab().await;
    let mut client = TestClient::connect(&relay, "alpha").await;
    let created = client.recv_event("Target.targetCreated").await;
    let target_id = created["params"]["targetInfo"]["targetId"].clone();
    let attached = client.set_auto_attach(1).await;
    let old_session = attached["params"]["sessionId"].clone();

    extension.kill();
    client.recv_event("Target.detachedFromTarget").await;
    client.recv_event("Target.targetDestroyed").await;
    wait_for_status(&relay, |status| !status.extension_connected).await;

    extension.reconnect();
    let recreated = client.recv_event("Target.targetCreated").await;
    assert_eq!(recreated["params"]["targetInfo"]["targetId"], target_id);
    let reattached = client.recv_event("Target.attachedToTarget").await;
    assert_eq!(reattached["params"]["targetInfo"]["targetId"], target_id);
    assert_ne!(reattached["params"]["sessionId"], old_session);
}

#[tokio::test]
async fn recording_end_to_end_writes_byte_exact_file() {
    let (relay, extension) = relay_with_tab().await;
    let mut client = TestClient::connect(&relay, "alpha").await;
    client.recv_event("Target.targetCreated").await;
    let session_id = client.set_auto_attach(1).await["params"]["sessionId"]
        .as_str()
        .expect("session id")
        .to_string();

    let output = std::env::temp_dir().join(format!(
        "relay-e2e-{}-{}.webm",
        std::process::id(),
        unique_stamp()
    ));
    let http = reqwest::Client::new();
    let base = format!("http://{}", relay.addr);

    let started: Value = http
        .post(format!("{base}/recording/start"))
        .json(&json!({"sessionId": session_id, "outputPath": output}))
        .send()
        .await
        .expect("start request")
        .json()
        .await
        .expect("start json");
    assert_eq!(started["success"], true, "start failed: {started}");
    assert_eq!(started["tabId"], 42);

    let chunks: Vec<Vec<u8>> = vec![vec![0x00, 0x7f, 0xff], vec![0x01, 0x02, 0x03]];
    for chunk in &chunks {
        assert!(extension.recorder.push_chunk(42, chunk.clone()));
    }

    let status: Value = http
        .get(format!("{base}/recording/status"))
        .send()
        .await
        .expect("status request")
        .json()
        .await
        .expect("status json");
    assert_eq!(status["recording"], true);

    let stopped: Value = http
        .post(format!("{base}/recording/stop"))
        .json(&json!({"sessionId": session_id}))
        .send()
        .await
        .expect("stop request")
        .json()
        .await
        .expect("stop json");
    assert_eq!(stopped["success"], true, "stop failed: {stopped}");
    assert_eq!(stopped["size"], 6);
    assert_eq!(stopped["path"], output.to_str().expect("utf8 path"));

    let on_disk = tokio::fs::read(&output).await.expect("recording file");
    assert_eq!(on_disk, chunks.concat());
    let _ = tokio::fs::remove_file(&output).await;
}

#[tokio::test]
async fn recording_without_session_targets_the_first_attached_tab() {
    let (relay, extension) = relay_with_tab().await;
    extension.debugger.open_tab(43, "https://b.example", "page b");
    wait_for_status(&relay, |status| status.targets == 2).await;

    let output = std::env::temp_dir().join(format!(
        "relay-first-tab-{}-{}.webm",
        std::process::id(),
        unique_stamp()
    ));
    let http = reqwest::Client::new();
    let base = format!("http://{}", relay.addr);

    // No sessionId: the recording must land on the first-attached tab (42),
    // not whichever entry the target map yields first.
    let started: Value = http
        .post(format!("{base}/recording/start"))
        .json(&json!({"outputPath": output}))
        .send()
        .await
        .expect("start request")
        .json()
        .await
        .expect("start json");
    assert_eq!(started["success"], true, "start failed: {started}");
    assert_eq!(started["tabId"], 42);

    let status: Value = http
        .get(format!("{base}/recording/status"))
        .send()
        .await
        .expect("status request")
        .json()
        .await
        .expect("status json");
    assert_eq!(status["recording"], true);
    assert_eq!(status["tabId"], 42);

    let cancelled: Value = http
        .post(format!("{base}/recording/cancel"))
        .send()
        .await
        .expect("cancel request")
        .json()
        .await
        .expect("cancel json");
    assert_eq!(cancelled["success"], true);
    assert_eq!(cancelled["tabId"], 42);
}

#[tokio::test]
async fn idle_relay_rejects_clients_under_reject_policy() {
    let relay = start_relay(IdlePolicy::Reject).await;
    let (mut socket, _) = connect_async(format!("ws://{}/cdp/alpha", relay.addr))
        .await
        .expect("handshake succeeds");
    let frame = timeout(WAIT, socket.next())
        .await
        .expect("frame before timeout")
        .expect("frame present")
        .expect("no socket error");
    match frame {
        Message::Close(Some(close)) => {
            assert_eq!(u16::from(close.code), 1013);
            assert!(close.reason.contains("extension not connected"));
        }
        other => panic!("expected close frame, got {other:?}"),
    }
}

#[tokio::test]
async fn wait_policy_holds_clients_until_extension_arrives() {
    let relay = start_relay(IdlePolicy::Wait).await;
    let mut client = TestClient::connect(&relay, "early").await;

    // Intercepted methods answer locally even while the extension is idle.
    client
        .send(json!({"id": 1, "method": "Browser.getVersion", "params": {}}))
        .await;
    let version = client.recv_response(1).await;
    assert!(version["result"]["product"]
        .as_str()
        .expect("product")
        .starts_with("CdpRelay/"));

    let extension = Extension::spawn(&relay).await;
    extension.debugger.open_tab(7, "https://late.example", "late");
    let created = client.recv_event("Target.targetCreated").await;
    assert_eq!(created["params"]["targetInfo"]["url"], "https://late.example");
}

#[tokio::test]
async fn graceful_shutdown_drains_clients() {
    let (relay, _extension) = relay_with_tab().await;
    let mut client = TestClient::connect(&relay, "alpha").await;
    client.recv_event("Target.targetCreated").await;
    let session_id = client.set_auto_attach(1).await["params"]["sessionId"].clone();

    relay.handle.shutdown().await;
    let detached = client.recv_event("Target.detachedFromTarget").await;
    assert_eq!(detached["params"]["sessionId"], session_id);
    client.recv_event("Target.targetDestroyed").await;
}

/// Unique-enough filename stamp for parallel test runs.
fn unique_stamp() -> u128 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos())
        .unwrap_or_default()
}

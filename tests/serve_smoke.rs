use reqwest::blocking::Client;
use serde_json::Value;
use std::net::TcpListener;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

fn find_free_port() -> u16 {
    TcpListener::bind(("127.0.0.1", 0))
        .expect("bind probe port")
        .local_addr()
        .expect("local addr")
        .port()
}

fn wait_for_version(client: &Client, port: u16) {
    let url = format!("http://127.0.0.1:{}/version", port);
    for _ in 0..60 {
        if let Ok(resp) = client.get(&url).send() {
            if resp.status().is_success() {
                return;
            }
        }
        thread::sleep(Duration::from_millis(100));
    }
    panic!("relay did not become ready on port {}", port);
}

#[test]
fn serve_reports_version_and_exits_cleanly_on_shutdown() {
    let port = find_free_port();

    let bin = assert_cmd::cargo::cargo_bin!("cdp-relay");
    let mut child = Command::new(bin)
        .args(["serve", "--port", &port.to_string()])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn serve");

    let client = Client::builder()
        .timeout(Duration::from_secs(2))
        .build()
        .expect("client");

    wait_for_version(&client, port);

    let body: Value = client
        .get(format!("http://127.0.0.1:{}/version", port))
        .send()
        .expect("version request")
        .json()
        .expect("version json");
    assert_eq!(body["version"].as_str(), Some(env!("CARGO_PKG_VERSION")));

    // Reachability probe used by the extension's reconnect loop.
    let probe = client
        .head(format!("http://127.0.0.1:{}/", port))
        .send()
        .expect("probe request");
    assert!(probe.status().is_success());

    let shutdown: Value = client
        .post(format!("http://127.0.0.1:{}/shutdown", port))
        .send()
        .expect("shutdown request")
        .json()
        .expect("shutdown json");
    assert_eq!(shutdown["ok"].as_bool(), Some(true));

    let deadline = Instant::now() + Duration::from_secs(10);
    let status = loop {
        match child.try_wait().expect("poll child") {
            Some(status) => break status,
            None if Instant::now() > deadline => {
                let _ = child.kill();
                let _ = child.wait();
                panic!("relay did not exit after /shutdown");
            }
            None => thread::sleep(Duration::from_millis(100)),
        }
    };
    assert!(status.success(), "relay exited with {status:?}");
}

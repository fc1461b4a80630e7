use std::fs;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use assert_cmd::cargo::cargo_bin;
use ed25519_dalek::SigningKey;
use rand_core::OsRng;
use tempfile::tempdir;

fn wait_for_http(url: &str, timeout: Duration) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if reqwest::blocking::get(url).is_ok() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    false
}

fn available_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .and_then(|listener| listener.local_addr())
        .map(|addr| addr.port())
        .expect("failed to bind an ephemeral port")
}

fn authorityd_bin() -> std::path::PathBuf {
    cargo_bin("authorityd")
}

struct DaemonHandle(Child);

impl Drop for DaemonHandle {
    fn drop(&mut self) {
        let _ = self.0.kill();
        let _ = self.0.wait();
    }
}

#[test]
fn issue_and_validate_over_http() {
    let temp = tempdir().unwrap();
    let keystore_dir = temp.path().join("keystore");
    fs::create_dir_all(&keystore_dir).unwrap();

    let signing_key = SigningKey::generate(&mut OsRng);
    fs::write(keystore_dir.join("issuer-1.key"), signing_key.to_bytes()).unwrap();
    let public_key_hex = hex::encode(signing_key.verifying_key().to_bytes());

    let status_port = available_port();
    let rpc_port = available_port();

    let mut daemon = DaemonHandle(
        Command::new(authorityd_bin())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .arg("--status-addr")
            .arg(format!("127.0.0.1:{status_port}"))
            .arg("--rpc-addr")
            .arg(format!("127.0.0.1:{rpc_port}"))
            .arg("--keystore-dir")
            .arg(&keystore_dir)
            .arg("daemon")
            .spawn()
            .expect("failed to spawn authorityd"),
    );

    let health_url = format!("http://127.0.0.1:{status_port}/healthz");
    assert!(wait_for_http(&health_url, Duration::from_secs(5)), "daemon never came up");

    let client = reqwest::blocking::Client::new();
    let rpc_base = format!("http://127.0.0.1:{rpc_port}");

    let principal_resp = client
        .post(format!("{rpc_base}/principals"))
        .json(&serde_json::json!({
            "id": "issuer-1",
            "name": "issuer-1",
            "kind": "agent",
            "parent_id": null,
            "public_key_hex": public_key_hex,
            "metadata": null,
        }))
        .send()
        .unwrap();
    assert!(principal_resp.status().is_success(), "principal creation failed");

    let policy_resp = client
        .post(format!("{rpc_base}/policies"))
        .json(&serde_json::json!({
            "principal_id": "issuer-1",
            "allowed_resource_patterns": ["repo:acme/*"],
            "allowed_actions": ["read", "write"],
            "max_validity_seconds": 3600,
            "delegation_allowed": true,
            "max_delegation_depth": 2,
            "creator": "test-harness",
        }))
        .send()
        .unwrap();
    assert!(policy_resp.status().is_success(), "policy creation failed");

    let issue_resp: serde_json::Value = client
        .post(format!("{rpc_base}/mandates"))
        .json(&serde_json::json!({
            "issuer_id": "issuer-1",
            "subject_id": "agent-1",
            "resource_scope": ["repo:acme/widgets"],
            "action_scope": ["read"],
            "validity_seconds": 600,
            "intent": null,
            "parent_mandate_id": null,
            "metadata": {"ticket": "OPS-1"},
        }))
        .send()
        .unwrap()
        .json()
        .unwrap();
    let mandate_id = issue_resp["mandate_id"]
        .as_str()
        .expect("issue response missing mandate_id")
        .to_string();

    let validate_resp: serde_json::Value = client
        .post(format!("{rpc_base}/mandates/validate"))
        .json(&serde_json::json!({
            "mandate_id": mandate_id,
            "requested_action": "read",
            "requested_resource": "repo:acme/widgets",
            "correlation_id": "test-corr-1",
            "intent": null,
        }))
        .send()
        .unwrap()
        .json()
        .unwrap();
    assert_eq!(validate_resp["allowed"], true);

    let metrics_body = reqwest::blocking::get(format!("http://127.0.0.1:{status_port}/metrics"))
        .unwrap()
        .text()
        .unwrap();
    assert!(metrics_body.contains("authorityd_operations_total"));

    daemon.0.kill().ok();
}

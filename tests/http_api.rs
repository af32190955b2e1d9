//! HTTP control surface round trip: register, start, observe, and send
//! through the JSON shell with a real client.

mod common;

use std::net::SocketAddr;
use std::time::Duration;

use common::harness;
use hypha::http_api::{bind, create_app, serve_with_graceful_shutdown};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

async fn serve(h: &common::TestHarness) -> (SocketAddr, CancellationToken) {
    let addr = SocketAddr::from(([127, 0, 0, 1], 0));
    let (listener, actual) = bind(addr).await.unwrap();
    let token = CancellationToken::new();
    let app = create_app(h.control.clone());
    let shutdown = token.clone();
    tokio::spawn(async move {
        serve_with_graceful_shutdown(listener, app, shutdown)
            .await
            .unwrap();
    });
    // Give the server a moment to start accepting.
    tokio::time::sleep(Duration::from_millis(10)).await;
    (actual, token)
}

#[tokio::test]
async fn full_lifecycle_over_http() {
    let h = harness();
    let (addr, token) = serve(&h).await;
    let client = reqwest::Client::new();
    let base = format!("http://{addr}/api/v1");

    // Health first.
    let health: Value = client
        .get(format!("{base}/health"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "healthy");

    // Register an echo agent from the installed blueprint.
    let response = client
        .post(format!("{base}/agents"))
        .json(&json!({
            "name": "echo-http",
            "capabilities": ["echo"],
            "blueprint": "echo",
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::CREATED);
    let body: Value = response.json().await.unwrap();
    let id = body["id"].as_str().unwrap().to_string();

    // Duplicate names conflict.
    let duplicate = client
        .post(format!("{base}/agents"))
        .json(&json!({
            "name": "echo-http",
            "capabilities": ["echo"],
            "blueprint": "echo",
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(duplicate.status(), reqwest::StatusCode::CONFLICT);

    // Start it and wait for the lifecycle to settle.
    let started = client
        .post(format!("{base}/agents/{id}/start"))
        .send()
        .await
        .unwrap();
    assert_eq!(started.status(), reqwest::StatusCode::ACCEPTED);

    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    loop {
        let agent: Value = client
            .get(format!("{base}/agents/{id}"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        if agent["state"] == "running" {
            break;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "agent never reached running: {agent}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // Capability-addressed send through the shell.
    let sent = client
        .post(format!("{base}/messages"))
        .json(&json!({
            "to": "cap:echo",
            "kind": "capability_request",
            "payload": {"ping": true},
            "routing": "round_robin",
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(sent.status(), reqwest::StatusCode::ACCEPTED);
    let sent: Value = sent.json().await.unwrap();
    assert_eq!(sent["recipients"][0].as_str().unwrap(), id);

    // The metrics snapshot reflects the send.
    let metrics: Value = client
        .get(format!("{base}/metrics"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(
        metrics["messages_sent_total"]["capability_request/normal"]
            .as_u64()
            .unwrap()
            >= 1
    );

    // The registration is on the audit trail.
    h.runtime.audit().flush().await;
    let audit: Value = client
        .get(format!("{base}/audit"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(
        audit
            .as_array()
            .unwrap()
            .iter()
            .any(|record| record["inputs_redacted"]["op"] == "register")
    );

    token.cancel();
}

#[tokio::test]
async fn unknown_agents_and_bad_input_map_to_http_errors() {
    let h = harness();
    let (addr, token) = serve(&h).await;
    let client = reqwest::Client::new();
    let base = format!("http://{addr}/api/v1");

    let missing = client
        .get(format!("{base}/agents/agent-00000000000000ff"))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), reqwest::StatusCode::NOT_FOUND);

    let malformed = client
        .get(format!("{base}/agents/not-an-id"))
        .send()
        .await
        .unwrap();
    assert_eq!(malformed.status(), reqwest::StatusCode::BAD_REQUEST);

    let unknown_blueprint = client
        .post(format!("{base}/agents"))
        .json(&json!({"name": "ghost", "blueprint": "missing"}))
        .send()
        .await
        .unwrap();
    assert_eq!(
        unknown_blueprint.status(),
        reqwest::StatusCode::INTERNAL_SERVER_ERROR
    );

    let nobody_home = client
        .post(format!("{base}/messages"))
        .json(&json!({"to": "cap:unserved", "kind": "event"}))
        .send()
        .await
        .unwrap();
    assert_eq!(nobody_home.status(), reqwest::StatusCode::NOT_FOUND);

    token.cancel();
}

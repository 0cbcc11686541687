//! Gateway integration tests — start a real gateway over a loopback TCP
//! listener and exercise it via plain HTTP and a WebSocket client. These
//! cover the paths that do not require a live upstream realtime connection
//! (minting, balance checks, upload validation); the realtime-agent-backed
//! paths are covered by the pipeline unit tests, which substitute a fake
//! transport rather than dialing out.

use std::sync::Arc;

use echogate_core::balance::InMemoryBalanceLedger;
use echogate_core::config::{BillingConfig, Config, GatewayConfig, RealtimeConfig};
use echogate_gateway::state::AppState;
use echogate_media::stt::Transcriber;
use echogate_media::vad_pool::VadPool;
use tokio_tungstenite::connect_async;

struct FakeTranscriber;

#[async_trait::async_trait]
impl Transcriber for FakeTranscriber {
    async fn transcribe(&self, _wav_bytes: &[u8]) -> anyhow::Result<String> {
        Ok("hello from the fake transcriber".to_string())
    }
}

fn find_free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port()
}

/// Start a gateway bound to a free loopback port, with a guest starting
/// balance low enough for exhaustion tests to be cheap.
async fn start_test_gateway(guest_balance: i64) -> u16 {
    let port = find_free_port();
    let config = Config {
        gateway: Some(GatewayConfig { bind: Some("127.0.0.1".to_string()), port: Some(port), server_prefix: None, rate_limit: None }),
        realtime: Some(RealtimeConfig { api_key: Some("test-key".to_string()), ..RealtimeConfig::default() }),
        billing: Some(BillingConfig { guest_starting_balance_seconds: Some(guest_balance) }),
        ..Config::default()
    };

    let vad_pool = Arc::new(VadPool::new(2));
    vad_pool.initialize().await;
    let balance_ledger = Arc::new(InMemoryBalanceLedger::new());
    let transcriber = Arc::new(FakeTranscriber);

    let state = Arc::new(AppState::new(Arc::new(config), vad_pool, balance_ledger, transcriber));
    tokio::spawn(echogate_gateway::server::start_gateway(state));

    for _ in 0..50 {
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        if reqwest::get(format!("http://127.0.0.1:{port}/health")).await.is_ok() {
            break;
        }
    }
    port
}

#[tokio::test]
async fn health_endpoint_reports_zero_sessions_on_startup() {
    let port = start_test_gateway(120).await;

    let resp = reqwest::get(format!("http://127.0.0.1:{port}/health")).await.expect("health request failed");
    assert!(resp.status().is_success());

    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["streaming_sessions"], 0);
    assert_eq!(body["push_to_talk_sessions"], 0);
}

#[tokio::test]
async fn session_id_endpoint_mints_a_uuid_for_a_guest() {
    let port = start_test_gateway(120).await;

    let resp = reqwest::get(format!("http://127.0.0.1:{port}/api/session-id")).await.expect("request failed");
    assert!(resp.status().is_success());

    let body: serde_json::Value = resp.json().await.unwrap();
    let session_id = body["session_id"].as_str().expect("session_id present");
    assert!(uuid::Uuid::parse_str(session_id).is_ok());
}

#[tokio::test]
async fn session_id_endpoint_rejects_exhausted_guest() {
    let port = start_test_gateway(0).await;

    let resp = reqwest::get(format!("http://127.0.0.1:{port}/api/session-id")).await.expect("request failed");
    assert_eq!(resp.status(), reqwest::StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn streaming_ws_without_session_id_is_rejected_before_upgrade() {
    let port = start_test_gateway(120).await;

    let url = format!("ws://127.0.0.1:{port}/ws");
    let err = connect_async(&url).await.expect_err("missing session_id must not upgrade");
    assert!(err.to_string().contains("400") || format!("{err:?}").contains("400"));
}

#[tokio::test]
async fn upload_audio_rejects_empty_file() {
    let port = start_test_gateway(120).await;

    let form = reqwest::multipart::Form::new()
        .text("session_id", "nonexistent-session")
        .part("file", reqwest::multipart::Part::bytes(Vec::<u8>::new()).file_name("empty.wav"));

    let resp = reqwest::Client::new()
        .post(format!("http://127.0.0.1:{port}/api/upload-audio/"))
        .multipart(form)
        .send()
        .await
        .expect("upload request failed");

    assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn upload_audio_rejects_unknown_session() {
    let port = start_test_gateway(120).await;

    let wav = echogate_media::wav::wrap_pcm(&[0u8; 32], 16_000, 1);
    let form = reqwest::multipart::Form::new()
        .text("session_id", "nonexistent-session")
        .part("file", reqwest::multipart::Part::bytes(wav).file_name("utterance.wav"));

    let resp = reqwest::Client::new()
        .post(format!("http://127.0.0.1:{port}/api/upload-audio/"))
        .multipart(form)
        .send()
        .await
        .expect("upload request failed");

    assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);
}

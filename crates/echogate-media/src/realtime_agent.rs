//! C4 — persistent full-duplex session with an external realtime multimodal
//! model (OpenAI Realtime API over WebSocket). One agent per client session;
//! created during session initialisation, torn down on disconnect.
//!
//! The upstream event stream is modelled as a tagged-variant enum matched
//! exhaustively by the caller (the dialogue pipeline's synthesize loop) — no
//! polymorphic handler hierarchy, per this workspace's redesign note for
//! upstream LLM dispatch.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use base64::Engine as _;
use echogate_core::config::RealtimeConfig;
use echogate_core::timing::DELTA_HEADER_SKIP_BYTES;
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::wav::wrap_pcm;

/// Sample rate of the provider's synthesized-audio deltas.
const DELTA_SAMPLE_RATE: u32 = 24_000;

/// Token usage reported on `response.done`, forwarded to the token ledger.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsageStats {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
}

/// A dispatched upstream event, ready for the pipeline to act on.
#[derive(Debug)]
pub enum AgentEvent {
    AudioDelta { wav_bytes: Vec<u8>, duration_secs: f64 },
    AssistantTranscript(String),
    ResponseCreated,
    ResponseDone { usage: Option<UsageStats> },
    Error(String),
}

/// Transport boundary between the agent's protocol logic and the wire, so
/// tests can exercise `connect`/`send_text`/`cancel`/event-dispatch without a
/// live upstream connection.
#[async_trait]
trait RealtimeTransport: Send + Sync {
    async fn send_json(&mut self, value: serde_json::Value) -> anyhow::Result<()>;
    /// `Ok(None)` means the connection closed cleanly.
    async fn recv_text(&mut self) -> anyhow::Result<Option<String>>;
    async fn close(&mut self);
}

type TungsteniteStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct WebSocketTransport {
    stream: TungsteniteStream,
}

#[async_trait]
impl RealtimeTransport for WebSocketTransport {
    async fn send_json(&mut self, value: serde_json::Value) -> anyhow::Result<()> {
        self.stream.send(Message::Text(serde_json::to_string(&value)?.into())).await?;
        Ok(())
    }

    async fn recv_text(&mut self) -> anyhow::Result<Option<String>> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return Ok(Some(text.to_string())),
                Some(Ok(Message::Close(_))) => return Ok(None),
                Some(Ok(_)) => continue, // ping/pong/binary carry no protocol events
                Some(Err(e)) => return Err(e.into()),
                None => return Ok(None),
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.stream.close(None).await;
    }
}

/// Persistent realtime-model session bound to one client session.
pub struct RealtimeAgent {
    model: String,
    voice: String,
    temperature: f64,
    api_key: String,
    transport: Mutex<Option<Box<dyn RealtimeTransport>>>,
    generating: AtomicBool,
}

impl RealtimeAgent {
    pub fn new(config: &RealtimeConfig, voice: &str) -> anyhow::Result<Self> {
        let api_key = config
            .resolve_api_key()
            .ok_or_else(|| anyhow::anyhow!("no realtime API key configured"))?;
        Ok(Self {
            model: config.model(),
            voice: voice.to_string(),
            temperature: config.temperature(),
            api_key,
            transport: Mutex::new(None),
            generating: AtomicBool::new(false),
        })
    }

    #[cfg(test)]
    fn new_for_test(transport: Box<dyn RealtimeTransport>) -> Self {
        Self {
            model: "test-model".to_string(),
            voice: "alloy".to_string(),
            temperature: 0.6,
            api_key: "test-key".to_string(),
            transport: Mutex::new(Some(transport)),
            generating: AtomicBool::new(false),
        }
    }

    /// Open the upstream channel and configure the session. Idempotent.
    pub async fn connect(&self, instructions: &str) -> anyhow::Result<()> {
        {
            let guard = self.transport.lock().await;
            if guard.is_some() {
                return Ok(());
            }
        }

        let url = format!("wss://api.openai.com/v1/realtime?model={}", self.model);
        let mut request = url.into_client_request()?;
        request.headers_mut().insert(
            "Authorization",
            HeaderValue::from_str(&format!("Bearer {}", self.api_key))?,
        );
        request.headers_mut().insert("OpenAI-Beta", HeaderValue::from_static("realtime=v1"));

        let (stream, _response) = connect_async(request).await?;
        *self.transport.lock().await = Some(Box::new(WebSocketTransport { stream }));

        self.send_json(json!({
            "type": "session.update",
            "session": {
                "modalities": ["text", "audio"],
                "instructions": instructions,
                "voice": self.voice,
                "input_audio_transcription": null,
                "turn_detection": null,
                "temperature": self.temperature,
            }
        }))
        .await
    }

    async fn send_json(&self, value: serde_json::Value) -> anyhow::Result<()> {
        let mut guard = self.transport.lock().await;
        let transport = guard.as_deref_mut().ok_or_else(|| anyhow::anyhow!("agent not connected"))?;
        transport.send_json(value).await
    }

    /// If a response is in flight, cancel it first (barge-in), then post the
    /// user turn and request a new response.
    pub async fn send_text(&self, text: &str) -> anyhow::Result<()> {
        if self.generating.load(Ordering::SeqCst) {
            self.cancel().await;
        }
        self.send_json(json!({
            "type": "conversation.item.create",
            "item": {
                "type": "message",
                "role": "user",
                "content": [{"type": "input_text", "text": text}],
            }
        }))
        .await?;
        self.send_json(json!({"type": "response.create"})).await?;
        self.generating.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Cancel any in-flight response. Idempotent; errors are logged, not
    /// propagated, matching the source's best-effort cancel.
    pub async fn cancel(&self) {
        if self.generating.load(Ordering::SeqCst) {
            if let Err(e) = self.send_json(json!({"type": "response.cancel"})).await {
                tracing::warn!(error = %e, "response.cancel failed");
            }
        }
        self.generating.store(false, Ordering::SeqCst);
    }

    /// Close the upstream channel. Idempotent.
    pub async fn disconnect(&self) {
        let mut guard = self.transport.lock().await;
        if let Some(mut transport) = guard.take() {
            transport.close().await;
        }
    }

    pub fn is_generating(&self) -> bool {
        self.generating.load(Ordering::SeqCst)
    }

    /// Block on the next upstream event and dispatch it.
    pub async fn next_event(&self) -> anyhow::Result<AgentEvent> {
        loop {
            let text = {
                let mut guard = self.transport.lock().await;
                let transport = guard.as_deref_mut().ok_or_else(|| anyhow::anyhow!("agent not connected"))?;
                transport.recv_text().await?
            };
            let Some(text) = text else {
                anyhow::bail!("upstream realtime connection closed");
            };
            if let Some(event) = self.dispatch(&text)? {
                return Ok(event);
            }
        }
    }

    fn dispatch(&self, raw: &str) -> anyhow::Result<Option<AgentEvent>> {
        let value: serde_json::Value = serde_json::from_str(raw)?;
        let event_type = value.get("type").and_then(|v| v.as_str()).unwrap_or("");

        match event_type {
            "response.audio.delta" => {
                self.generating.store(true, Ordering::SeqCst);
                let delta = value.get("delta").and_then(|v| v.as_str()).unwrap_or("");
                let decoded = base64::engine::general_purpose::STANDARD.decode(delta)?;
                let payload: &[u8] = if decoded.len() > DELTA_HEADER_SKIP_BYTES {
                    &decoded[DELTA_HEADER_SKIP_BYTES..]
                } else {
                    &[]
                };
                let wav_bytes = wrap_pcm(payload, DELTA_SAMPLE_RATE, 1);
                let duration_secs = (payload.len() / 2) as f64 / DELTA_SAMPLE_RATE as f64;
                Ok(Some(AgentEvent::AudioDelta { wav_bytes, duration_secs }))
            }
            "response.audio_transcript.done" => {
                let transcript = value.get("transcript").and_then(|v| v.as_str()).unwrap_or("").to_string();
                Ok(Some(AgentEvent::AssistantTranscript(transcript)))
            }
            "response.created" => {
                self.generating.store(true, Ordering::SeqCst);
                Ok(Some(AgentEvent::ResponseCreated))
            }
            "response.done" => {
                self.generating.store(false, Ordering::SeqCst);
                let usage = value
                    .get("response")
                    .and_then(|r| r.get("usage"))
                    .map(|u| UsageStats {
                        input_tokens: u.get("input_tokens").and_then(|v| v.as_u64()).unwrap_or(0),
                        output_tokens: u.get("output_tokens").and_then(|v| v.as_u64()).unwrap_or(0),
                        total_tokens: u.get("total_tokens").and_then(|v| v.as_u64()).unwrap_or(0),
                    });
                Ok(Some(AgentEvent::ResponseDone { usage }))
            }
            "error" => {
                let message = value
                    .get("error")
                    .and_then(|e| e.get("message"))
                    .and_then(|m| m.as_str())
                    .unwrap_or("unknown upstream error")
                    .to_string();
                Ok(Some(AgentEvent::Error(message)))
            }
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex as StdMutex};

    #[derive(Default)]
    struct FakeTransport {
        sent: Arc<StdMutex<Vec<serde_json::Value>>>,
        incoming: StdMutex<VecDeque<String>>,
    }

    #[async_trait]
    impl RealtimeTransport for FakeTransport {
        async fn send_json(&mut self, value: serde_json::Value) -> anyhow::Result<()> {
            self.sent.lock().unwrap().push(value);
            Ok(())
        }

        async fn recv_text(&mut self) -> anyhow::Result<Option<String>> {
            Ok(self.incoming.lock().unwrap().pop_front())
        }

        async fn close(&mut self) {}
    }

    fn sent_types(sent: &Arc<StdMutex<Vec<serde_json::Value>>>) -> Vec<String> {
        sent.lock()
            .unwrap()
            .iter()
            .map(|v| v.get("type").and_then(|t| t.as_str()).unwrap_or("").to_string())
            .collect()
    }

    #[tokio::test]
    async fn send_text_cancels_in_flight_response_before_new_turn() {
        let sent = Arc::new(StdMutex::new(Vec::new()));
        let transport = FakeTransport { sent: sent.clone(), incoming: StdMutex::new(VecDeque::new()) };
        let agent = RealtimeAgent::new_for_test(Box::new(transport));
        agent.generating.store(true, Ordering::SeqCst);

        agent.send_text("hello again").await.unwrap();

        assert_eq!(sent_types(&sent), vec!["response.cancel", "conversation.item.create", "response.create"]);
        assert!(agent.is_generating());
    }

    #[tokio::test]
    async fn send_text_without_in_flight_response_skips_cancel() {
        let sent = Arc::new(StdMutex::new(Vec::new()));
        let transport = FakeTransport { sent: sent.clone(), incoming: StdMutex::new(VecDeque::new()) };
        let agent = RealtimeAgent::new_for_test(Box::new(transport));
        agent.send_text("hello").await.unwrap();

        assert_eq!(sent_types(&sent), vec!["conversation.item.create", "response.create"]);
    }

    #[tokio::test]
    async fn cancel_is_idempotent() {
        let sent = Arc::new(StdMutex::new(Vec::new()));
        let transport = FakeTransport { sent: sent.clone(), incoming: StdMutex::new(VecDeque::new()) };
        let agent = RealtimeAgent::new_for_test(Box::new(transport));
        agent.cancel().await;
        agent.cancel().await;
        assert!(sent_types(&sent).is_empty());
        assert!(!agent.is_generating());
    }

    #[test]
    fn dispatch_audio_delta_skips_provider_header_and_computes_duration() {
        let agent = RealtimeAgent::new_for_test(Box::new(FakeTransport::default()));
        let mut raw = vec![0xAAu8; DELTA_HEADER_SKIP_BYTES];
        raw.extend_from_slice(&[0u8; 480]); // 240 int16 samples of payload
        let b64 = base64::engine::general_purpose::STANDARD.encode(&raw);
        let msg = json!({"type": "response.audio.delta", "delta": b64}).to_string();

        let event = agent.dispatch(&msg).unwrap().unwrap();
        match event {
            AgentEvent::AudioDelta { wav_bytes, duration_secs } => {
                assert_eq!(wav_bytes.len(), 44 + 480);
                assert!((duration_secs - 240.0 / DELTA_SAMPLE_RATE as f64).abs() < 1e-9);
            }
            _ => panic!("expected AudioDelta"),
        }
        assert!(agent.is_generating());
    }

    #[test]
    fn dispatch_response_done_clears_generating_and_extracts_usage() {
        let agent = RealtimeAgent::new_for_test(Box::new(FakeTransport::default()));
        agent.generating.store(true, Ordering::SeqCst);
        let msg = json!({
            "type": "response.done",
            "response": {"usage": {"input_tokens": 10, "output_tokens": 20, "total_tokens": 30}}
        })
        .to_string();

        let event = agent.dispatch(&msg).unwrap().unwrap();
        match event {
            AgentEvent::ResponseDone { usage } => {
                let usage = usage.unwrap();
                assert_eq!(usage.input_tokens, 10);
                assert_eq!(usage.total_tokens, 30);
            }
            _ => panic!("expected ResponseDone"),
        }
        assert!(!agent.is_generating());
    }

    #[test]
    fn dispatch_unknown_event_type_is_ignored() {
        let agent = RealtimeAgent::new_for_test(Box::new(FakeTransport::default()));
        let msg = json!({"type": "session.updated"}).to_string();
        assert!(agent.dispatch(&msg).unwrap().is_none());
    }

    #[test]
    fn dispatch_error_event_does_not_panic_and_carries_message() {
        let agent = RealtimeAgent::new_for_test(Box::new(FakeTransport::default()));
        let msg = json!({"type": "error", "error": {"message": "rate limited"}}).to_string();
        match agent.dispatch(&msg).unwrap().unwrap() {
            AgentEvent::Error(m) => assert_eq!(m, "rate limited"),
            _ => panic!("expected Error"),
        }
    }
}

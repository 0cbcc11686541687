//! Shared downstream pump: the synthesize, playback, and heartbeat loops,
//! the client transport plumbing, and instruction-template rendering used
//! by both the streaming and push-to-talk pipelines.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket};
use echogate_core::voice::ResponseLength;
use echogate_media::realtime_agent::AgentEvent;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::accountant::{BillingOutcome, UsageAccountant};
use crate::session::{OutboundFrame, PlaybackChunk, SessionMode, SessionStore};

const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(5);
const PLAYBACK_GAP_THRESHOLD: Duration = Duration::from_secs(3);
const PLAYBACK_PREROLL_SILENCE: Duration = Duration::from_millis(1400);

const BASE_INSTRUCTIONS: &str = "You are a warm, attentive voice assistant speaking naturally in dialogue. \
Keep replies conversational and brief unless the listener asks for more detail.\n\n{topic_section}";

/// Render the system-instructions template for a session: substitute the
/// topic (or a "no topic" phrase) and append a length directive for
/// non-default response lengths.
pub fn build_instructions(topic: Option<&str>, response_length: ResponseLength) -> String {
    let topic_section = match topic {
        Some(t) if !t.trim().is_empty() => format!("## Conversation topic: {t}"),
        _ => "## No topic is set; talk freely about anything.".to_string(),
    };
    let mut instructions = BASE_INSTRUCTIONS.replace("{topic_section}", &topic_section);
    match response_length {
        ResponseLength::Short => instructions.push_str("\n\n## Response length: keep replies shorter than usual."),
        ResponseLength::Long => instructions.push_str("\n\n## Response length: make replies longer than usual."),
        ResponseLength::Normal => {}
    }
    instructions
}

/// Forward everything sent on `outbound_rx` to the real client socket.
/// Exits when the channel closes or the socket write fails.
pub async fn sink_forwarder(mut sink: SplitSink<WebSocket, Message>, mut outbound_rx: mpsc::UnboundedReceiver<OutboundFrame>) {
    while let Some(frame) = outbound_rx.recv().await {
        let message = match frame {
            OutboundFrame::Text(text) => Message::Text(text.into()),
            OutboundFrame::Binary(bytes) => Message::Binary(bytes.into()),
            OutboundFrame::Close => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
        };
        if sink.send(message).await.is_err() {
            break;
        }
    }
}

/// Split the raw client socket stream into binary frames (routed to the
/// ingest loop, streaming mode only) and text frames (routed to the
/// heartbeat loop). Cancels the session's task group on transport close.
pub async fn demux(
    mut stream: SplitStream<WebSocket>,
    binary_tx: mpsc::UnboundedSender<Vec<u8>>,
    text_tx: mpsc::UnboundedSender<String>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            frame = stream.next() => {
                match frame {
                    Some(Ok(Message::Binary(bytes))) => {
                        let _ = binary_tx.send(bytes.to_vec());
                    }
                    Some(Ok(Message::Text(text))) => {
                        let _ = text_tx.send(text.to_string());
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        cancel.cancel();
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "client transport error, tearing down session");
                        cancel.cancel();
                        break;
                    }
                }
            }
        }
    }
}

/// Alternates receiving text frames with a 5s timeout; responds to the
/// client's `"ping"` with `"pong"`, and itself sends `"ping"` on silence.
/// Every inbound frame and every outbound ping refreshes the heartbeat.
pub async fn heartbeat_loop(
    sessions: Arc<SessionStore>,
    session_id: String,
    mut text_rx: mpsc::UnboundedReceiver<String>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            received = tokio::time::timeout(HEARTBEAT_TIMEOUT, text_rx.recv()) => {
                match received {
                    Ok(Some(text)) if text == "ping" => {
                        sessions.send_text(&session_id, "pong").await;
                        sessions.heartbeat(&session_id).await;
                    }
                    Ok(Some(_)) => {
                        sessions.heartbeat(&session_id).await;
                    }
                    Ok(None) => break,
                    Err(_elapsed) => {
                        sessions.send_text(&session_id, "ping").await;
                        sessions.heartbeat(&session_id).await;
                    }
                }
            }
        }
    }
}

/// Dequeues synthesized-audio chunks and writes them to the client,
/// inserting a pre-roll silence gap after a playback lull. Reads from the
/// session's shared queue rather than owning a channel receiver, so
/// `SessionStore::clear_queues` can discard buffered chunks from outside
/// this task on barge-in.
pub async fn playback_loop(
    sessions: Arc<SessionStore>,
    session_id: String,
    playback_queue: Arc<StdMutex<VecDeque<PlaybackChunk>>>,
    playback_notify: Arc<Notify>,
    cancel: CancellationToken,
) {
    let mut last_sent: Option<Instant> = None;
    loop {
        let chunk = playback_queue.lock().unwrap().pop_front();
        let chunk = match chunk {
            Some(chunk) => chunk,
            None => {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = playback_notify.notified() => continue,
                }
            }
        };
        if let Some(last) = last_sent {
            if last.elapsed() > PLAYBACK_GAP_THRESHOLD {
                tokio::time::sleep(PLAYBACK_PREROLL_SILENCE).await;
            }
        }
        last_sent = Some(Instant::now());
        sessions.send_bytes(&session_id, chunk.wav_bytes).await;
    }
}

/// Drives the upstream event stream and performs every side effect the
/// event table calls for (playback enqueue, transcript forwarding, request
/// timing stamps, billing, error logging).
pub async fn synthesize_loop(sessions: Arc<SessionStore>, session_id: String, accountant: Arc<UsageAccountant>, cancel: CancellationToken) {
    let Some(agent) = sessions.with(&session_id, |s| s.llm_agent.clone()).await else {
        return;
    };

    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = agent.next_event() => event,
        };

        let event = match event {
            Ok(event) => event,
            Err(e) => {
                warn!(session_id, error = %e, "realtime agent event stream ended");
                break;
            }
        };

        match event {
            AgentEvent::AudioDelta { wav_bytes, duration_secs } => {
                sessions
                    .with(&session_id, |s| s.enqueue_playback(PlaybackChunk { wav_bytes, duration_secs }))
                    .await;
            }
            AgentEvent::AssistantTranscript(transcript) => {
                sessions.send_text(&session_id, format!("<b>Assistant reply:</b> {transcript}")).await;
            }
            AgentEvent::ResponseCreated => {
                stamp_response_start(&sessions, &session_id).await;
            }
            AgentEvent::ResponseDone { usage } => {
                if let Some(usage) = usage {
                    info!(
                        session_id,
                        input_tokens = usage.input_tokens,
                        output_tokens = usage.output_tokens,
                        total_tokens = usage.total_tokens,
                        "realtime response token usage"
                    );
                }
                finish_response(&sessions, &session_id, &accountant).await;
            }
            AgentEvent::Error(message) => {
                warn!(session_id, error = %message, "realtime agent reported an error");
            }
        }
    }
}

async fn stamp_response_start(sessions: &Arc<SessionStore>, session_id: &str) {
    let now = Instant::now();
    sessions
        .with(session_id, move |s| {
            let Some(request_id) = s.current_request_id.clone() else { return };
            let started = s.recording_started_at.unwrap_or(now);
            if let Some(request) = s.request_mut(&request_id) {
                request.response_start = Some((now - started).as_secs_f64());
            }
            // Rebase so `finish_response` measures only the response.created
            // -> response.done span, not the send_text -> response.created gap.
            s.recording_started_at = Some(now);
        })
        .await;
}

/// On `response.done`: stamp `response_duration`, then bill the request
/// under the session's mode, disconnecting on an exhausted balance.
async fn finish_response(sessions: &Arc<SessionStore>, session_id: &str, accountant: &UsageAccountant) {
    let now = Instant::now();
    let billing = sessions
        .with(session_id, move |s| {
            let request_id = s.current_request_id.take();
            let mode = s.mode;
            let started = s.recording_started_at.take().unwrap_or(now);
            let response_duration = (now - started).as_secs_f64();

            match mode {
                SessionMode::Streaming => {
                    if let Some(request_id) = request_id.clone() {
                        if let Some(request) = s.request_mut(&request_id) {
                            request.response_duration = Some(response_duration);
                        }
                    }
                }
                SessionMode::PushToTalk => {
                    s.flat_response_duration += response_duration;
                }
            }
            (mode, request_id)
        })
        .await;

    let Some((mode, request_id)) = billing else { return };

    let outcome = match mode {
        SessionMode::Streaming => {
            let Some(request_id) = request_id else { return };
            accountant.bill_streaming_request(sessions, session_id, &request_id).await
        }
        SessionMode::PushToTalk => accountant.bill_push_to_talk(sessions, session_id).await,
    };

    if outcome == Some(BillingOutcome::Exhausted) {
        if let Some(session) = sessions.disconnect(session_id).await {
            session.llm_agent.disconnect().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_instructions_uses_topic_when_present() {
        let instructions = build_instructions(Some("cooking"), ResponseLength::Normal);
        assert!(instructions.contains("Conversation topic: cooking"));
        assert!(!instructions.contains("Response length"));
    }

    #[test]
    fn build_instructions_falls_back_to_no_topic_phrase() {
        let instructions = build_instructions(None, ResponseLength::Normal);
        assert!(instructions.contains("No topic is set"));
    }

    #[test]
    fn build_instructions_appends_length_directive_for_short_and_long() {
        let short = build_instructions(None, ResponseLength::Short);
        assert!(short.contains("keep replies shorter"));
        let long = build_instructions(None, ResponseLength::Long);
        assert!(long.contains("make replies longer"));
    }
}

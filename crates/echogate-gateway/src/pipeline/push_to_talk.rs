//! Push-to-talk pipeline: no VAD, no continuous ingest. A client holds a
//! button, records locally, and uploads one complete WAV file per utterance
//! over HTTP; the WebSocket carries only the `CONNECTED:{id}` handshake and
//! the shared synthesize/playback/heartbeat loops.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Multipart, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::extract::ws::WebSocket;
use echogate_core::config::RealtimeConfig;
use echogate_core::voice::{ResponseLength, Voice};
use echogate_media::realtime_agent::RealtimeAgent;
use echogate_media::resampler;
use echogate_media::wav::{self, WavInfo};
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::accountant::{UsageAccountant, BALANCE_EXHAUSTED_MESSAGE};
use crate::pipeline::common;
use crate::session::{Session, SessionMode, SessionStore};
use crate::state::AppState;

/// Rate every uploaded utterance is transcribed at, matching the streaming
/// pipeline's downstream rate so both share one transcription contract.
const TARGET_SAMPLE_RATE: u32 = 16_000;

/// Spawn every task backing one push-to-talk client connection and block
/// until they all tear down. No ingest loop: audio arrives via
/// [`upload_audio`], not over this socket.
#[allow(clippy::too_many_arguments)]
pub async fn handle(
    socket: WebSocket,
    sessions: Arc<SessionStore>,
    accountant: Arc<UsageAccountant>,
    realtime_config: RealtimeConfig,
    session_id: String,
    user_id: String,
    is_authenticated: bool,
    voice: Voice,
    topic: Option<String>,
    response_length: ResponseLength,
) {
    let agent = match RealtimeAgent::new(&realtime_config, voice.as_str()) {
        Ok(agent) => Arc::new(agent),
        Err(e) => {
            warn!(session_id, error = %e, "failed to construct realtime agent");
            return;
        }
    };

    let instructions = common::build_instructions(topic.as_deref(), response_length);
    if let Err(e) = agent.connect(&instructions).await {
        warn!(session_id, error = %e, "failed to connect realtime agent upstream");
        return;
    }

    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let (binary_tx, _binary_rx) = mpsc::unbounded_channel();
    let (text_tx, text_rx) = mpsc::unbounded_channel();

    let session = Session::new(session_id.clone(), user_id, is_authenticated, SessionMode::PushToTalk, outbound_tx, agent, voice, topic, response_length);
    let (playback_queue, playback_notify) = session.playback_handles();
    sessions.connect(session).await;
    sessions.send_text(&session_id, format!("CONNECTED:{session_id}")).await;
    #[cfg(feature = "metrics")]
    crate::metrics::record_push_to_talk_session_start();

    let (sink, stream) = socket.split();
    let cancel = CancellationToken::new();

    let mut tasks = tokio::task::JoinSet::new();
    tasks.spawn(common::sink_forwarder(sink, outbound_rx));
    tasks.spawn(common::demux(stream, binary_tx, text_tx, cancel.clone()));
    tasks.spawn(common::synthesize_loop(sessions.clone(), session_id.clone(), accountant.clone(), cancel.clone()));
    tasks.spawn(common::playback_loop(sessions.clone(), session_id.clone(), playback_queue, playback_notify, cancel.clone()));
    tasks.spawn(common::heartbeat_loop(sessions.clone(), session_id.clone(), text_rx, cancel.clone()));

    tasks.join_next().await;
    cancel.cancel();
    while tasks.join_next().await.is_some() {}

    if let Some(session) = sessions.disconnect(&session_id).await {
        session.llm_agent.disconnect().await;
    }
    #[cfg(feature = "metrics")]
    crate::metrics::record_push_to_talk_session_end();
}

/// Resample the WAV's PCM payload to [`TARGET_SAMPLE_RATE`] if it isn't
/// already, leaving it untouched otherwise.
fn prepare_pcm16k(file_bytes: &[u8], info: &WavInfo) -> Vec<u8> {
    let pcm = &file_bytes[info.data_offset..info.data_offset + info.data_len];
    if info.sample_rate == TARGET_SAMPLE_RATE {
        pcm.to_vec()
    } else {
        resampler::resample(pcm, info.sample_rate, TARGET_SAMPLE_RATE)
    }
}

/// `POST {prefix}/api/upload-audio/` — one complete utterance per request,
/// `file` (multipart WAV) plus `session_id` (form field).
pub async fn upload_audio(State(state): State<Arc<AppState>>, mut multipart: Multipart) -> Response {
    let mut file_bytes: Option<Vec<u8>> = None;
    let mut session_id: Option<String> = None;

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "malformed multipart body");
                return (StatusCode::BAD_REQUEST, "malformed multipart body").into_response();
            }
        };
        match field.name() {
            Some("file") => match field.bytes().await {
                Ok(bytes) => file_bytes = Some(bytes.to_vec()),
                Err(e) => {
                    warn!(error = %e, "failed to read uploaded file");
                    return (StatusCode::BAD_REQUEST, "unreadable file").into_response();
                }
            },
            Some("session_id") => {
                session_id = field.text().await.ok();
            }
            _ => {}
        }
    }

    let Some(file_bytes) = file_bytes.filter(|b| !b.is_empty()) else {
        return (StatusCode::BAD_REQUEST, "missing or empty audio file").into_response();
    };
    let Some(session_id) = session_id else {
        return (StatusCode::BAD_REQUEST, "missing session_id").into_response();
    };

    let Some(user_id) = state.sessions_push_to_talk.with(&session_id, |s| s.user_id.clone()).await else {
        return (StatusCode::BAD_REQUEST, "unknown session").into_response();
    };

    if !state.accountant.preflight_ok(&user_id).await {
        state.sessions_push_to_talk.send_text(&session_id, BALANCE_EXHAUSTED_MESSAGE).await;
        if let Some(session) = state.sessions_push_to_talk.disconnect(&session_id).await {
            session.llm_agent.disconnect().await;
        }
        return (StatusCode::FORBIDDEN, "balance exhausted").into_response();
    }

    let Some(info) = wav::parse(&file_bytes) else {
        return (StatusCode::BAD_REQUEST, "not a valid WAV file").into_response();
    };
    let voice_duration = info.duration_seconds();
    let wav_bytes = wav::wrap_pcm(&prepare_pcm16k(&file_bytes, &info), TARGET_SAMPLE_RATE, 1);

    state.sessions_push_to_talk.send_text(&session_id, "Request being processed...").await;

    let processing_start = Instant::now();
    let transcript = match state.transcriber.transcribe(&wav_bytes).await {
        Ok(transcript) => transcript,
        Err(e) => {
            warn!(session_id, error = %e, "transcription failed");
            return (StatusCode::BAD_GATEWAY, "transcription failed").into_response();
        }
    };
    let processing_duration = processing_start.elapsed().as_secs_f64();

    state
        .sessions_push_to_talk
        .send_text(&session_id, format!("<b>User query:</b> {transcript}"))
        .await;

    let agent = state
        .sessions_push_to_talk
        .with(&session_id, move |s| {
            s.flat_voice_duration += voice_duration;
            s.flat_processing_duration += processing_duration;
            s.recording_started_at = Some(Instant::now());
            s.llm_agent.clone()
        })
        .await;

    let Some(agent) = agent else {
        return (StatusCode::BAD_REQUEST, "session disconnected mid-upload").into_response();
    };

    if let Err(e) = agent.send_text(&transcript).await {
        warn!(session_id, error = %e, "failed to forward transcript to realtime agent");
        return (StatusCode::BAD_GATEWAY, "failed to reach realtime agent").into_response();
    }

    StatusCode::OK.into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use echogate_media::wav::wrap_pcm;

    #[test]
    fn prepare_pcm16k_passes_through_matching_rate() {
        let pcm = vec![1u8, 2, 3, 4];
        let wav = wrap_pcm(&pcm, TARGET_SAMPLE_RATE, 1);
        let info = wav::parse(&wav).unwrap();
        assert_eq!(prepare_pcm16k(&wav, &info), pcm);
    }

    #[test]
    fn prepare_pcm16k_resamples_mismatched_rate() {
        let pcm = vec![0u8; 2000]; // 1000 samples @ 44.1kHz
        let wav = wrap_pcm(&pcm, 44_100, 1);
        let info = wav::parse(&wav).unwrap();
        let out = prepare_pcm16k(&wav, &info);
        assert_eq!(out.len() / 2, 1000 * TARGET_SAMPLE_RATE as usize / 44_100);
    }
}

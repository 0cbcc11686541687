//! Streaming (VAD-segmented) pipeline: continuous 44.1 kHz audio frames in,
//! utterances detected by silence, transcribed, and handed to the realtime
//! agent. Shares the synthesize/playback/heartbeat loops with push-to-talk
//! through [`super::common`].

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::WebSocket;
use echogate_core::config::RealtimeConfig;
use echogate_core::timing::{RequestTiming, INGEST_PREAMBLE_SKIP_BYTES, UTTERANCE_SILENCE_THRESHOLD_BYTES};
use echogate_core::voice::{ResponseLength, Voice};
use echogate_media::realtime_agent::RealtimeAgent;
use echogate_media::resampler;
use echogate_media::stt::Transcriber;
use echogate_media::vad_pool::VadPool;
use echogate_media::wav::wrap_pcm;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use uuid::Uuid;

use crate::accountant::{UsageAccountant, BALANCE_EXHAUSTED_MESSAGE};
use crate::pipeline::common;
use crate::session::{Session, SessionMode, SessionStore};

/// Source sample rate the client streams binary frames at.
const INGEST_SOURCE_SAMPLE_RATE: u32 = 44_100;
/// Rate everything downstream of resampling (VAD, buffer, transcription) runs at.
const INGEST_TARGET_SAMPLE_RATE: u32 = 16_000;
/// No audio at all within this span tears the session down.
const INGEST_RECEIVE_TIMEOUT: Duration = Duration::from_secs(60);

/// Spawn every task backing one streaming client connection and block until
/// they all tear down.
#[allow(clippy::too_many_arguments)]
pub async fn handle(
    socket: WebSocket,
    sessions: Arc<SessionStore>,
    vad_pool: Arc<VadPool>,
    transcriber: Arc<dyn Transcriber>,
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
    let (binary_tx, binary_rx) = mpsc::unbounded_channel();
    let (text_tx, text_rx) = mpsc::unbounded_channel();

    let session = Session::new(session_id.clone(), user_id, is_authenticated, SessionMode::Streaming, outbound_tx, agent, voice, topic, response_length);
    let (playback_queue, playback_notify) = session.playback_handles();
    sessions.connect(session).await;
    #[cfg(feature = "metrics")]
    crate::metrics::record_streaming_session_start();

    let (sink, stream) = socket.split();
    let cancel = CancellationToken::new();

    let mut tasks = tokio::task::JoinSet::new();
    tasks.spawn(common::sink_forwarder(sink, outbound_rx));
    tasks.spawn(common::demux(stream, binary_tx, text_tx, cancel.clone()));
    tasks.spawn(common::synthesize_loop(sessions.clone(), session_id.clone(), accountant.clone(), cancel.clone()));
    tasks.spawn(common::playback_loop(sessions.clone(), session_id.clone(), playback_queue, playback_notify, cancel.clone()));
    tasks.spawn(common::heartbeat_loop(sessions.clone(), session_id.clone(), text_rx, cancel.clone()));
    tasks.spawn(ingest_loop(sessions.clone(), vad_pool, transcriber, accountant, session_id.clone(), binary_rx, cancel.clone()));

    // The first task to finish means the session is tearing down (transport
    // closed, receive timeout, balance exhausted); cancel the rest and drain.
    tasks.join_next().await;
    cancel.cancel();
    while tasks.join_next().await.is_some() {}

    if let Some(session) = sessions.disconnect(&session_id).await {
        session.llm_agent.disconnect().await;
    }
    #[cfg(feature = "metrics")]
    crate::metrics::record_streaming_session_end();
}

/// Outcome of feeding one classified frame through the VAD state machine.
enum VadTransition {
    Continue,
    VoiceDetected,
    UtteranceComplete { request_id: String, wav_bytes: Vec<u8>, voice_duration: f64 },
}

/// IDLE/RECORDING transition table: preroll capture while idle, silence-span
/// tracking against the byte offset voice was last observed at while
/// recording, wall-clock `voice_duration` measured from recording onset.
fn advance_vad(session: &mut Session, is_speech: bool, frame: Vec<u8>) -> VadTransition {
    if !session.is_recording {
        if !is_speech {
            session.push_preroll(frame);
            return VadTransition::Continue;
        }

        session.is_recording = true;
        session.recording_started_at = Some(Instant::now());
        session.audio_buffer.clear();
        let preroll: VecDeque<Vec<u8>> = std::mem::take(&mut session.preroll);
        for preroll_frame in preroll {
            session.audio_buffer.extend_from_slice(&preroll_frame);
        }
        session.last_voice_offset = session.audio_buffer.len();
        session.audio_buffer.extend_from_slice(&frame);
        return VadTransition::VoiceDetected;
    }

    if is_speech {
        session.last_voice_offset = session.audio_buffer.len();
        session.audio_buffer.extend_from_slice(&frame);
        return VadTransition::Continue;
    }

    session.audio_buffer.extend_from_slice(&frame);
    let silence_len = session.audio_buffer.len().saturating_sub(session.last_voice_offset);
    if silence_len <= UTTERANCE_SILENCE_THRESHOLD_BYTES {
        return VadTransition::Continue;
    }

    session.is_recording = false;
    let started = session.recording_started_at.take().unwrap_or_else(Instant::now);
    let voice_duration = started.elapsed().as_secs_f64();
    let wav_bytes = wrap_pcm(&session.audio_buffer, INGEST_TARGET_SAMPLE_RATE, 1);
    let request_id = Uuid::new_v4().to_string();

    session.audio_buffer.clear();
    session.last_voice_offset = 0;
    session.preroll.clear();

    VadTransition::UtteranceComplete { request_id, wav_bytes, voice_duration }
}

#[allow(clippy::too_many_arguments)]
async fn ingest_loop(
    sessions: Arc<SessionStore>,
    vad_pool: Arc<VadPool>,
    transcriber: Arc<dyn Transcriber>,
    accountant: Arc<UsageAccountant>,
    session_id: String,
    mut binary_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    cancel: CancellationToken,
) {
    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => break,
            received = tokio::time::timeout(INGEST_RECEIVE_TIMEOUT, binary_rx.recv()) => received,
        };

        let raw = match received {
            Ok(Some(raw)) => raw,
            Ok(None) => break,
            Err(_elapsed) => {
                warn!(session_id, "no audio received within timeout, tearing down session");
                break;
            }
        };

        let resampled = resampler::resample(&raw, INGEST_SOURCE_SAMPLE_RATE, INGEST_TARGET_SAMPLE_RATE);
        if resampled.len() <= INGEST_PREAMBLE_SKIP_BYTES {
            continue;
        }
        let mut frame = resampled[INGEST_PREAMBLE_SKIP_BYTES..].to_vec();
        if frame.len() % 2 != 0 {
            frame.pop();
        }
        if frame.is_empty() {
            continue;
        }

        #[cfg(feature = "metrics")]
        let vad_wait_start = Instant::now();
        let is_speech = match vad_pool.detect(&frame).await {
            Ok(is_speech) => is_speech,
            Err(e) => {
                warn!(session_id, error = %e, "vad classification failed, treating frame as silence");
                false
            }
        };
        #[cfg(feature = "metrics")]
        crate::metrics::record_vad_pool_wait(vad_wait_start.elapsed().as_secs_f64());

        let transition = sessions.with(&session_id, move |s| advance_vad(s, is_speech, frame)).await;
        match transition {
            None => break, // session evicted from under us
            Some(VadTransition::Continue) => {}
            Some(VadTransition::VoiceDetected) => {
                sessions.send_text(&session_id, "Voice detected. Clearing playback queue.").await;
                sessions.clear_queues(&session_id).await;
            }
            Some(VadTransition::UtteranceComplete { request_id, wav_bytes, voice_duration }) => {
                let exhausted = handle_utterance(&sessions, &transcriber, &accountant, &session_id, request_id, wav_bytes, voice_duration).await;
                if exhausted {
                    break;
                }
            }
        }
    }
}

/// Transcribe a completed utterance, bill the pre-flight balance check, and
/// forward it to the realtime agent. Returns `true` if the session should be
/// torn down (balance already exhausted before any work was billed).
async fn handle_utterance(
    sessions: &SessionStore,
    transcriber: &Arc<dyn Transcriber>,
    accountant: &UsageAccountant,
    session_id: &str,
    request_id: String,
    wav_bytes: Vec<u8>,
    voice_duration: f64,
) -> bool {
    sessions.send_text(session_id, "Request being processed...").await;

    let Some(user_id) = sessions.with(session_id, |s| s.user_id.clone()).await else {
        return true;
    };

    if !accountant.preflight_ok(&user_id).await {
        sessions.send_text(session_id, BALANCE_EXHAUSTED_MESSAGE).await;
        return true;
    }

    let processing_start = Instant::now();
    let transcript = match transcriber.transcribe(&wav_bytes).await {
        Ok(transcript) => transcript,
        Err(e) => {
            warn!(session_id, error = %e, "transcription failed, dropping utterance");
            return false;
        }
    };
    let processing_duration = processing_start.elapsed().as_secs_f64();

    sessions.send_text(session_id, format!("<b>User query:</b> {transcript}")).await;

    let mut timing = RequestTiming::new(&request_id, 0.0);
    timing.voice_duration = Some(voice_duration);
    timing.processing_duration = Some(processing_duration);

    let agent = sessions
        .with(session_id, move |s| {
            s.request_queue.push(timing);
            s.current_request_id = Some(request_id.clone());
            s.recording_started_at = Some(Instant::now());
            s.llm_agent.clone()
        })
        .await;

    let Some(agent) = agent else { return true };

    if let Err(e) = agent.send_text(&transcript).await {
        warn!(session_id, error = %e, "failed to forward utterance to realtime agent");
    }

    false
}

//! Media pipeline — resampling, VAD pool, transcription client, and the
//! realtime LLM agent that front a client voice session.

pub mod realtime_agent;
pub mod resampler;
pub mod stt;
pub mod vad;
pub mod vad_pool;
pub mod wav;

//! C6 — per-session dialogue pipeline. Streaming (VAD-segmented) and
//! push-to-talk (HTTP-uploaded) share the synthesize/playback/heartbeat
//! loops and the agent lifecycle through [`common`]; they differ only in
//! how an utterance's text reaches the realtime agent.

pub mod common;
pub mod push_to_talk;
pub mod streaming;

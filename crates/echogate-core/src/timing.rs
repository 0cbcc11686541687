//! Per-request timing records and the constants the VAD/ingest pipeline is
//! contracted to use regardless of the specific upstream/downstream codec.

use serde::{Deserialize, Serialize};

/// Silence span (in resampled 16 kHz/16-bit bytes) that closes an utterance.
/// ~2.5s at 16 kHz mono 16-bit.
pub const UTTERANCE_SILENCE_THRESHOLD_BYTES: usize = 80_000;

/// Number of pre-trigger frames retained in the preroll ring.
pub const PREROLL_CAPACITY: usize = 2;

/// Bytes dropped from the front of every resampled inbound streaming frame
/// (provider-specific preamble on the 44.1 kHz -> 16 kHz leg).
pub const INGEST_PREAMBLE_SKIP_BYTES: usize = 300;

/// Bytes dropped from the front of every decoded realtime audio delta
/// (provider response header) before framing it as WAV.
pub const DELTA_HEADER_SKIP_BYTES: usize = 200;

/// Timing accumulated for one in-flight utterance / response cycle.
///
/// Created on voice-onset (or on upload receipt for push-to-talk), completed
/// and removed from the owning session's request queue by the usage
/// accountant when the response finishes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestTiming {
    pub request_id: String,
    pub recording_start: f64,
    pub voice_duration: Option<f64>,
    pub processing_start: Option<f64>,
    pub processing_duration: Option<f64>,
    pub response_start: Option<f64>,
    pub response_duration: Option<f64>,
}

impl RequestTiming {
    pub fn new(request_id: impl Into<String>, recording_start: f64) -> Self {
        Self {
            request_id: request_id.into(),
            recording_start,
            voice_duration: None,
            processing_start: None,
            processing_duration: None,
            response_start: None,
            response_duration: None,
        }
    }

    /// Whether this request has seen its response complete and is billable.
    pub fn is_complete(&self) -> bool {
        self.response_duration.is_some()
    }

    /// Sum of the three measured spans, in seconds. Missing spans count as 0,
    /// matching the source's `int(v + p + r)` with unset fields defaulting to 0.
    pub fn total_seconds(&self) -> f64 {
        self.voice_duration.unwrap_or(0.0)
            + self.processing_duration.unwrap_or(0.0)
            + self.response_duration.unwrap_or(0.0)
    }

    /// Billable whole seconds, rounded per the accountant's debit contract.
    pub fn billable_seconds(&self) -> i64 {
        self.total_seconds().round() as i64
    }
}

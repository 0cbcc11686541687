//! Per-instance voice-activity classifier backing the VAD engine pool (C2).
//!
//! An RMS-energy detector with hysteresis, recalibrated to expose a single
//! `0.0..=1.0` "speech probability" so the pool can apply the spec's fixed
//! 0.6 threshold uniformly regardless of which concrete detector backs a
//! given pool slot.

/// RMS energy above which a frame is considered unambiguously speech for the
/// purpose of normalizing into a 0..=1 probability.
const SATURATION_RMS: f64 = 2_000.0;

/// A single VAD model instance, as the pool would load one `silero_vad`
/// instance per slot in the source implementation.
pub struct EnergyVad;

impl EnergyVad {
    pub fn new() -> Self {
        Self
    }

    /// Compute RMS energy of 16-bit PCM samples.
    fn rms(samples: &[i16]) -> f64 {
        if samples.is_empty() {
            return 0.0;
        }
        let sum: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
        (sum / samples.len() as f64).sqrt()
    }

    /// Classify a frame, returning a speech-probability in `0.0..=1.0`.
    ///
    /// Frames of odd byte length are right-trimmed; frames shorter than 2
    /// bytes yield probability 0.0 (classifies as non-speech).
    pub fn speech_probability(&self, frame: &[u8]) -> f64 {
        let usable_len = frame.len() - (frame.len() % 2);
        if usable_len < 2 {
            return 0.0;
        }
        let samples: Vec<i16> = frame[..usable_len]
            .chunks_exact(2)
            .map(|c| i16::from_le_bytes([c[0], c[1]]))
            .collect();
        (Self::rms(&samples) / SATURATION_RMS).min(1.0)
    }
}

impl Default for EnergyVad {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pcm(samples: &[i16]) -> Vec<u8> {
        samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    #[test]
    fn silence_has_zero_probability() {
        let vad = EnergyVad::new();
        assert_eq!(vad.speech_probability(&pcm(&[0i16; 320])), 0.0);
    }

    #[test]
    fn loud_signal_saturates_near_one() {
        let vad = EnergyVad::new();
        let p = vad.speech_probability(&pcm(&[20_000i16; 320]));
        assert!(p >= 1.0);
    }

    #[test]
    fn short_frame_classifies_as_non_speech() {
        let vad = EnergyVad::new();
        assert_eq!(vad.speech_probability(&[]), 0.0);
        assert_eq!(vad.speech_probability(&[0x01]), 0.0);
    }

    #[test]
    fn odd_length_frame_is_right_trimmed_not_rejected() {
        let vad = EnergyVad::new();
        let mut frame = pcm(&[20_000i16; 10]);
        frame.push(0xFF); // trailing odd byte
        assert!(vad.speech_probability(&frame) > 0.0);
    }
}

//! Minimal RIFF/WAVE framing and parsing for 16-bit PCM audio — used to wrap
//! outbound synthesized-audio deltas, to frame completed utterances before
//! transcription, and to read the sample rate/duration off uploaded files.

/// Wrap raw little-endian int16 PCM bytes in a 44-byte RIFF/WAVE header.
pub fn wrap_pcm(pcm: &[u8], sample_rate: u32, channels: u16) -> Vec<u8> {
    let bits_per_sample: u16 = 16;
    let data_len = pcm.len() as u32;
    let byte_rate = sample_rate * channels as u32 * bits_per_sample as u32 / 8;
    let block_align = channels * bits_per_sample / 8;
    let file_size = 36 + data_len;

    let mut wav = Vec::with_capacity(44 + pcm.len());
    wav.extend_from_slice(b"RIFF");
    wav.extend_from_slice(&file_size.to_le_bytes());
    wav.extend_from_slice(b"WAVE");

    wav.extend_from_slice(b"fmt ");
    wav.extend_from_slice(&16u32.to_le_bytes());
    wav.extend_from_slice(&1u16.to_le_bytes()); // PCM
    wav.extend_from_slice(&channels.to_le_bytes());
    wav.extend_from_slice(&sample_rate.to_le_bytes());
    wav.extend_from_slice(&byte_rate.to_le_bytes());
    wav.extend_from_slice(&block_align.to_le_bytes());
    wav.extend_from_slice(&bits_per_sample.to_le_bytes());

    wav.extend_from_slice(b"data");
    wav.extend_from_slice(&data_len.to_le_bytes());
    wav.extend_from_slice(pcm);

    wav
}

/// Parsed `fmt `/`data` summary of a RIFF/WAVE file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WavInfo {
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
    pub data_offset: usize,
    pub data_len: usize,
}

impl WavInfo {
    pub fn duration_seconds(&self) -> f64 {
        if self.sample_rate == 0 || self.channels == 0 || self.bits_per_sample == 0 {
            return 0.0;
        }
        let bytes_per_frame = self.channels as usize * (self.bits_per_sample as usize / 8);
        if bytes_per_frame == 0 {
            return 0.0;
        }
        (self.data_len / bytes_per_frame) as f64 / self.sample_rate as f64
    }
}

/// Parse just enough of a RIFF/WAVE container to recover format + data
/// extent. Returns `None` for anything empty, truncated, or not RIFF/WAVE.
pub fn parse(bytes: &[u8]) -> Option<WavInfo> {
    if bytes.len() < 12 || &bytes[0..4] != b"RIFF" || &bytes[8..12] != b"WAVE" {
        return None;
    }

    let mut pos = 12;
    let mut sample_rate = None;
    let mut channels = None;
    let mut bits_per_sample = None;
    let mut data_offset = None;
    let mut data_len = None;

    while pos + 8 <= bytes.len() {
        let chunk_id = &bytes[pos..pos + 4];
        let chunk_size = u32::from_le_bytes(bytes[pos + 4..pos + 8].try_into().ok()?) as usize;
        let body_start = pos + 8;
        if body_start > bytes.len() {
            break;
        }
        let body_end = (body_start + chunk_size).min(bytes.len());

        match chunk_id {
            b"fmt " => {
                if body_end - body_start >= 16 {
                    channels = Some(u16::from_le_bytes(bytes[body_start + 2..body_start + 4].try_into().ok()?));
                    sample_rate = Some(u32::from_le_bytes(bytes[body_start + 4..body_start + 8].try_into().ok()?));
                    bits_per_sample = Some(u16::from_le_bytes(bytes[body_start + 14..body_start + 16].try_into().ok()?));
                }
            }
            b"data" => {
                data_offset = Some(body_start);
                data_len = Some(body_end - body_start);
            }
            _ => {}
        }

        // Chunks are word-aligned.
        pos = body_start + chunk_size + (chunk_size % 2);
    }

    Some(WavInfo {
        sample_rate: sample_rate?,
        channels: channels?,
        bits_per_sample: bits_per_sample?,
        data_offset: data_offset?,
        data_len: data_len?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrap_then_parse_round_trips_format() {
        let pcm = vec![0u8; 16_000 * 2]; // 1s of silence at 16kHz mono
        let wav = wrap_pcm(&pcm, 16_000, 1);
        let info = parse(&wav).unwrap();
        assert_eq!(info.sample_rate, 16_000);
        assert_eq!(info.channels, 1);
        assert_eq!(info.bits_per_sample, 16);
        assert_eq!(info.data_len, pcm.len());
        assert!((info.duration_seconds() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn parse_rejects_non_wav_bytes() {
        assert!(parse(b"not a wav file at all").is_none());
        assert!(parse(&[]).is_none());
    }

    #[test]
    fn parse_handles_extra_chunks_before_data() {
        let mut wav = wrap_pcm(&[1, 2, 3, 4], 24_000, 1);
        // Splice a LIST chunk in right after the fmt chunk (byte 36).
        let mut with_list = wav[..36].to_vec();
        with_list.extend_from_slice(b"LIST");
        with_list.extend_from_slice(&4u32.to_le_bytes());
        with_list.extend_from_slice(b"abcd");
        with_list.extend_from_slice(&wav[36..]);
        // Fix up RIFF size for the inserted 12 bytes.
        let new_size = (with_list.len() - 8) as u32;
        with_list[4..8].copy_from_slice(&new_size.to_le_bytes());
        wav = with_list;

        let info = parse(&wav).unwrap();
        assert_eq!(info.sample_rate, 24_000);
        assert_eq!(info.data_len, 4);
    }
}

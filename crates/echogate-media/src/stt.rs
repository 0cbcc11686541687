//! C3 — transcriber client: submit a completed utterance to an external
//! speech-to-text API and return its text. Errors bubble to the caller,
//! which reports them to the client session but never tears the session
//! down for a transient transcription failure.

use async_trait::async_trait;
use echogate_core::config::TranscriptionConfig;
use tracing::debug;

/// Abstraction over the external STT provider, so the dialogue pipeline can
/// be exercised against a fake in tests without hitting the network.
#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, wav_bytes: &[u8]) -> anyhow::Result<String>;
}

fn provider_url(provider: &str) -> &'static str {
    match provider {
        "groq" => "https://api.groq.com/openai/v1/audio/transcriptions",
        _ => "https://api.openai.com/v1/audio/transcriptions",
    }
}

/// HTTP-backed transcriber targeting an OpenAI-compatible transcriptions
/// endpoint (OpenAI `whisper-1` by default, or Groq's Whisper-compatible API).
pub struct HttpTranscriber {
    config: TranscriptionConfig,
    client: reqwest::Client,
}

impl HttpTranscriber {
    pub fn new(config: TranscriptionConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Transcriber for HttpTranscriber {
    async fn transcribe(&self, wav_bytes: &[u8]) -> anyhow::Result<String> {
        let api_key = self
            .config
            .resolve_api_key()
            .ok_or_else(|| anyhow::anyhow!("no transcription API key configured"))?;

        let url = provider_url(&self.config.provider);
        let model = self.config.model.as_deref().unwrap_or("whisper-1");

        debug!(url, model, wav_bytes = wav_bytes.len(), "submitting utterance for transcription");

        let part = reqwest::multipart::Part::bytes(wav_bytes.to_vec())
            .file_name("utterance.wav")
            .mime_str("audio/wav")?;
        let form = reqwest::multipart::Form::new()
            .text("model", model.to_string())
            .text("response_format", "text")
            .part("file", part);

        let resp = self
            .client
            .post(url)
            .header("Authorization", format!("Bearer {api_key}"))
            .multipart(form)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("transcription API error {status}: {body}");
        }

        Ok(resp.text().await?.trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_url_selects_groq() {
        assert!(provider_url("groq").contains("groq.com"));
        assert!(provider_url("openai").contains("openai.com"));
        assert!(provider_url("unknown-provider").contains("openai.com"));
    }
}

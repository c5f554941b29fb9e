//! Provider adapter trait and factory.
//!
//! Generalized from the `VoiceProvider` trait (`voice/pipeline.rs`):
//! one struct per vendor, each opening a WebSocket, splitting it into an
//! outbound-message loop and an inbound-event loop, and feeding a shared
//! `NeutralEvent` channel.

pub mod gemini;
pub mod openai;
pub mod ultravox;
pub mod xai;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::event::NeutralEvent;
use crate::model::{AgentConfig, ProviderKind};

#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Opens the provider session and begins emitting `NeutralEvent`s on
    /// the returned receiver. `agent` carries the instructions, voice, and
    /// language the session should be configured with.
    async fn open(&mut self, agent: &AgentConfig) -> anyhow::Result<mpsc::Receiver<NeutralEvent>>;

    async fn send_user_audio(&self, pcm: Vec<u8>) -> anyhow::Result<()>;

    async fn send_user_text(&self, text: String) -> anyhow::Result<()>;

    async fn send_tool_result(&self, call_id: String, result: serde_json::Value) -> anyhow::Result<()>;

    /// Requests the in-flight response be cancelled (barge-in).
    async fn request_cancel(&self) -> anyhow::Result<()>;

    /// Closes the session. Takes `&self`, not `&mut self`: the outbound
    /// close message goes through the same channel `send_*` already uses,
    /// so the adapter can be shared via `Arc` across the session's three
    /// tasks once `open` has returned.
    async fn close(&self) -> anyhow::Result<()>;
}

/// Builds the adapter for the agent's configured provider.
pub fn create_adapter(
    provider: ProviderKind,
    api_key: String,
) -> anyhow::Result<Box<dyn ProviderAdapter>> {
    match provider {
        ProviderKind::OpenAi => Ok(Box::new(openai::OpenAiAdapter::new(api_key))),
        ProviderKind::Xai => Ok(Box::new(xai::XaiAdapter::new(api_key))),
        ProviderKind::Gemini => Ok(Box::new(gemini::GeminiAdapter::new(api_key))),
        ProviderKind::Ultravox => Ok(Box::new(ultravox::UltravoxAdapter::new(api_key))),
    }
}

/// Pure function building the bilingual directive xAI's realtime model
/// needs because its Turkish transcription quality is weak. Only xAI's
/// adapter calls this; it must never sit on the hot audio path.
pub fn language_preamble(provider: ProviderKind, language: &str, instructions: &str) -> String {
    if provider != ProviderKind::Xai || language != "tr" {
        return instructions.to_string();
    }
    format!(
        "Respond in Turkish. The user may code-switch into English; if their \
         speech is ambiguous, prefer the Turkish reading.\n\n{instructions}"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preamble_only_applies_to_xai_turkish() {
        let base = "be concise";
        assert_eq!(language_preamble(ProviderKind::OpenAi, "tr", base), base);
        assert_eq!(language_preamble(ProviderKind::Xai, "en", base), base);
        assert!(language_preamble(ProviderKind::Xai, "tr", base).contains("Turkish"));
    }
}

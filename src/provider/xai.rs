//! xAI Grok realtime adapter.
//!
//! Same shape as [`crate::provider::openai::OpenAiAdapter`] (xAI's
//! realtime API is OpenAI-Realtime-compatible), plus the language
//! preamble injection for Turkish and per-second billing instead of
//! token-based usage.

use async_trait::async_trait;
use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;

use crate::event::NeutralEvent;
use crate::model::{AgentConfig, ProviderKind};
use crate::provider::{language_preamble, ProviderAdapter};

const REALTIME_URL: &str = "wss://api.x.ai/v1/realtime?model=grok-realtime";

/// Per-second billing rate, in thousandths of a cent, for the default
/// realtime tier. Configurable in a future revision; fixed here per the
/// spec's cost-model description.
const XAI_RATE_MILLICENTS_PER_SECOND: u64 = 17;

enum OutboundMessage {
    Audio(Vec<u8>),
    Text(String),
    ToolResult { call_id: String, output: Value },
    Close,
}

pub struct XaiAdapter {
    api_key: String,
    outbound_tx: Option<mpsc::Sender<OutboundMessage>>,
}

impl XaiAdapter {
    pub fn new(api_key: String) -> Self {
        Self { api_key, outbound_tx: None }
    }

    fn build_session_update(agent: &AgentConfig) -> Value {
        let instructions = language_preamble(ProviderKind::Xai, &agent.language, &agent.instructions);
        json!({
            "type": "session.update",
            "session": {
                "instructions": instructions,
                "voice": agent.voice,
                "input_audio_format": "pcm16",
                "output_audio_format": "pcm16",
                "turn_detection": { "type": "server_vad" },
            }
        })
    }

    /// Triggers the opening response with a fixed greeting line instead of
    /// letting the model improvise one.
    fn build_greeting_trigger(greeting: &str) -> Value {
        json!({
            "type": "response.create",
            "response": {
                "instructions": format!("Greet the caller now, saying exactly: \"{greeting}\""),
            }
        })
    }

    fn parse_server_event(raw: &str, connected_secs: f64) -> Option<NeutralEvent> {
        let value: Value = serde_json::from_str(raw).ok()?;
        let event_type = value.get("type")?.as_str()?;
        match event_type {
            "session.created" | "session.updated" => Some(NeutralEvent::SessionReady),
            "input_audio_buffer.speech_started" => Some(NeutralEvent::UserSpeechStarted),
            "input_audio_buffer.speech_stopped" => Some(NeutralEvent::UserSpeechStopped),
            "response.audio.delta" => {
                let b64 = value.get("delta")?.as_str()?;
                let pcm = base64::engine::general_purpose::STANDARD.decode(b64).ok()?;
                Some(NeutralEvent::AgentAudioDelta(pcm))
            }
            "response.audio_transcript.delta" => {
                Some(NeutralEvent::AgentTextDelta(value.get("delta")?.as_str()?.to_string()))
            }
            "response.done" => {
                let mut cost = crate::model::CostAccumulator::default();
                cost.add_xai_seconds(connected_secs, XAI_RATE_MILLICENTS_PER_SECOND);
                Some(NeutralEvent::ResponseDone { usage: Some(cost), reason: "done".to_string() })
            }
            "error" => {
                let message = value
                    .get("error")
                    .and_then(|e| e.get("message"))
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error")
                    .to_string();
                Some(NeutralEvent::ProviderError { kind: "xai_error".to_string(), message, fatal: true })
            }
            _ => None,
        }
    }
}

#[async_trait]
impl ProviderAdapter for XaiAdapter {
    async fn open(&mut self, agent: &AgentConfig) -> anyhow::Result<mpsc::Receiver<NeutralEvent>> {
        let mut request = REALTIME_URL.into_client_request()?;
        request
            .headers_mut()
            .insert("Authorization", HeaderValue::from_str(&format!("Bearer {}", self.api_key))?);

        let (ws_stream, _) = tokio_tungstenite::connect_async(request).await?;
        let (mut ws_tx, mut ws_rx) = ws_stream.split();

        let session_update = Self::build_session_update(agent);
        ws_tx.send(Message::Text(session_update.to_string().into())).await?;

        if let Some(greeting) = &agent.greeting {
            let trigger = Self::build_greeting_trigger(greeting);
            ws_tx.send(Message::Text(trigger.to_string().into())).await?;
        }

        let (outbound_tx, mut outbound_rx) = mpsc::channel::<OutboundMessage>(64);
        let (event_tx, event_rx) = mpsc::channel::<NeutralEvent>(256);
        let opened_at = std::time::Instant::now();
        let closing = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));

        let outbound_closing = closing.clone();
        tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                let payload = match message {
                    OutboundMessage::Audio(pcm) => json!({
                        "type": "input_audio_buffer.append",
                        "audio": base64::engine::general_purpose::STANDARD.encode(pcm),
                    }),
                    OutboundMessage::Text(text) => json!({
                        "type": "conversation.item.create",
                        "item": { "type": "message", "role": "user", "content": [{ "type": "input_text", "text": text }] },
                    }),
                    OutboundMessage::ToolResult { call_id, output } => json!({
                        "type": "conversation.item.create",
                        "item": { "type": "function_call_output", "call_id": call_id, "output": output.to_string() },
                    }),
                    OutboundMessage::Close => {
                        outbound_closing.store(true, std::sync::atomic::Ordering::Relaxed);
                        break;
                    }
                };
                if ws_tx.send(Message::Text(payload.to_string().into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_tx.close().await;
        });

        tokio::spawn(async move {
            while let Some(Ok(message)) = ws_rx.next().await {
                if let Message::Text(raw) = message {
                    let connected_secs = opened_at.elapsed().as_secs_f64();
                    if let Some(event) = Self::parse_server_event(&raw, connected_secs) {
                        if event_tx.send(event).await.is_err() {
                            break;
                        }
                    }
                }
            }
            if !closing.load(std::sync::atomic::Ordering::Relaxed) {
                let _ = event_tx
                    .send(NeutralEvent::ProviderError {
                        kind: "transport".to_string(),
                        message: "xai realtime connection dropped unexpectedly".to_string(),
                        fatal: true,
                    })
                    .await;
            }
        });

        self.outbound_tx = Some(outbound_tx);
        Ok(event_rx)
    }

    async fn send_user_audio(&self, pcm: Vec<u8>) -> anyhow::Result<()> {
        self.send(OutboundMessage::Audio(pcm)).await
    }

    async fn send_user_text(&self, text: String) -> anyhow::Result<()> {
        self.send(OutboundMessage::Text(text)).await
    }

    async fn send_tool_result(&self, call_id: String, result: Value) -> anyhow::Result<()> {
        self.send(OutboundMessage::ToolResult { call_id, output: result }).await
    }

    async fn request_cancel(&self) -> anyhow::Result<()> {
        // xAI's realtime API has no mid-response cancel message; barge-in
        // there relies entirely on the pacer dropping queued output locally.
        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.send(OutboundMessage::Close).await
    }
}

impl XaiAdapter {
    async fn send(&self, message: OutboundMessage) -> anyhow::Result<()> {
        let tx = self
            .outbound_tx
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("session not open"))?;
        tx.send(message).await.map_err(|_| anyhow::anyhow!("outbound channel closed"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_events_are_fatal() {
        let raw = r#"{"type":"error","error":{"message":"nope"}}"#;
        match XaiAdapter::parse_server_event(raw, 1.0).unwrap() {
            NeutralEvent::ProviderError { fatal, .. } => assert!(fatal),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn response_done_bills_by_connected_seconds() {
        let raw = r#"{"type":"response.done"}"#;
        match XaiAdapter::parse_server_event(raw, 2.5).unwrap() {
            NeutralEvent::ResponseDone { usage: Some(usage), .. } => assert_eq!(usage.billed_units, 3),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn session_update_applies_turkish_preamble() {
        let agent = AgentConfig {
            agent_id: "a1".into(),
            provider: ProviderKind::Xai,
            voice: "v".into(),
            instructions: "be helpful".into(),
            language: "tr".into(),
            tools: vec![],
            greeting: None,
        };
        let update = XaiAdapter::build_session_update(&agent);
        let instructions = update["session"]["instructions"].as_str().unwrap();
        assert!(instructions.contains("Turkish"));
    }

    #[test]
    fn greeting_trigger_embeds_text() {
        let trigger = XaiAdapter::build_greeting_trigger("good afternoon, thanks for calling");
        let instructions = trigger["response"]["instructions"].as_str().unwrap();
        assert!(instructions.contains("good afternoon, thanks for calling"));
    }
}

//! Google Gemini Live adapter.
//!
//! Generalized from `GeminiLiveSession`. Gemini sends every
//! message — including JSON control messages — as a WebSocket **Binary**
//! frame, so inbound handling sniffs for a leading `{` before falling
//! back to treating the payload as raw audio.

use async_trait::async_trait;
use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use crate::event::NeutralEvent;
use crate::model::{AgentConfig, CostAccumulator};
use crate::provider::ProviderAdapter;

const LIVE_URL_TEMPLATE: &str =
    "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent?key=";

enum OutboundMessage {
    Audio(Vec<u8>),
    Text(String),
    ToolResult { call_id: String, output: Value },
    Cancel,
    Close,
}

pub struct GeminiAdapter {
    api_key: String,
    outbound_tx: Option<mpsc::Sender<OutboundMessage>>,
}

impl GeminiAdapter {
    pub fn new(api_key: String) -> Self {
        Self { api_key, outbound_tx: None }
    }

    fn build_setup_message(agent: &AgentConfig) -> Value {
        json!({
            "setup": {
                "model": "models/gemini-2.0-flash-live",
                "generationConfig": {
                    "responseModalities": ["AUDIO"],
                    "speechConfig": {
                        "voiceConfig": { "prebuiltVoiceConfig": { "voiceName": agent.voice } }
                    }
                },
                "systemInstruction": { "parts": [{ "text": agent.instructions }] },
                "tools": agent.tools.iter().map(|name| json!({ "functionDeclarations": [{ "name": name }] })).collect::<Vec<_>>(),
                "realtimeInputConfig": {
                    "automaticActivityDetection": {
                        "startOfSpeechSensitivity": "START_SENSITIVITY_LOW",
                        "endOfSpeechSensitivity": "END_SENSITIVITY_LOW",
                        "prefixPaddingMs": 100,
                        "silenceDurationMs": 300
                    }
                }
            }
        })
    }

    fn build_audio_message(pcm: Vec<u8>) -> Value {
        json!({
            "realtimeInput": {
                "audio": { "data": base64::engine::general_purpose::STANDARD.encode(pcm), "mimeType": "audio/pcm;rate=16000" }
            }
        })
    }

    /// The Live API has no dedicated "speak this now" control message, so
    /// the greeting is injected as a user-role turn instructing the model
    /// to say it verbatim.
    fn build_greeting_trigger(greeting: &str) -> Value {
        json!({
            "clientContent": {
                "turns": [{
                    "role": "user",
                    "parts": [{ "text": format!("(system) Begin the call by saying exactly: \"{greeting}\"") }]
                }],
                "turnComplete": true
            }
        })
    }

    /// Gemini's frames arrive as Binary; JSON control messages are
    /// sniffed by their leading `{` before falling back to raw audio.
    fn parse_server_payload(payload: &[u8]) -> Option<NeutralEvent> {
        if payload.first() != Some(&b'{') {
            return Some(NeutralEvent::AgentAudioDelta(payload.to_vec()));
        }
        let value: Value = serde_json::from_slice(payload).ok()?;
        if value.get("setupComplete").is_some() {
            return Some(NeutralEvent::SessionReady);
        }
        if let Some(server_content) = value.get("serverContent") {
            if server_content.get("interrupted").and_then(Value::as_bool) == Some(true) {
                return Some(NeutralEvent::ProviderError {
                    kind: "interrupted".to_string(),
                    message: "generation interrupted".to_string(),
                    fatal: false,
                });
            }
            if let Some(turn_complete) = server_content.get("turnComplete").and_then(Value::as_bool) {
                if turn_complete {
                    return Some(NeutralEvent::ResponseDone { usage: None, reason: "turn_complete".to_string() });
                }
            }
            if let Some(parts) = server_content
                .get("modelTurn")
                .and_then(|t| t.get("parts"))
                .and_then(Value::as_array)
            {
                for part in parts {
                    if let Some(text) = part.get("text").and_then(Value::as_str) {
                        return Some(NeutralEvent::AgentTextDelta(text.to_string()));
                    }
                    if let Some(b64) = part
                        .get("inlineData")
                        .and_then(|d| d.get("data"))
                        .and_then(Value::as_str)
                    {
                        let pcm = base64::engine::general_purpose::STANDARD.decode(b64).ok()?;
                        return Some(NeutralEvent::AgentAudioDelta(pcm));
                    }
                }
            }
        }
        if let Some(tool_call) = value.get("toolCall") {
            if let Some(calls) = tool_call.get("functionCalls").and_then(Value::as_array) {
                if let Some(first) = calls.first() {
                    let call_id = first.get("id").and_then(Value::as_str).unwrap_or("").to_string();
                    let name = first.get("name").and_then(Value::as_str).unwrap_or("").to_string();
                    let arguments = first.get("args").cloned().unwrap_or(Value::Null);
                    return Some(NeutralEvent::ToolCallRequested { call_id, name, arguments });
                }
            }
        }
        if let Some(usage) = value.get("usageMetadata") {
            let mut cost = CostAccumulator::default();
            cost.add_openai_usage(
                usage.get("promptTokenCount").and_then(Value::as_u64).unwrap_or(0),
                usage.get("responseTokenCount").and_then(Value::as_u64).unwrap_or(0),
                0,
            );
            return Some(NeutralEvent::ResponseDone { usage: Some(cost), reason: "usage".to_string() });
        }
        None
    }
}

#[async_trait]
impl ProviderAdapter for GeminiAdapter {
    async fn open(&mut self, agent: &AgentConfig) -> anyhow::Result<mpsc::Receiver<NeutralEvent>> {
        let url = format!("{LIVE_URL_TEMPLATE}{}", self.api_key);
        let (ws_stream, _) = tokio_tungstenite::connect_async(url).await?;
        let (mut ws_tx, mut ws_rx) = ws_stream.split();

        let setup = Self::build_setup_message(agent);
        ws_tx.send(Message::Text(setup.to_string().into())).await?;

        if let Some(greeting) = &agent.greeting {
            let trigger = Self::build_greeting_trigger(greeting);
            ws_tx.send(Message::Text(trigger.to_string().into())).await?;
        }

        let (outbound_tx, mut outbound_rx) = mpsc::channel::<OutboundMessage>(64);
        let (event_tx, event_rx) = mpsc::channel::<NeutralEvent>(256);
        let closing = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));

        let outbound_closing = closing.clone();
        tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                let payload = match message {
                    OutboundMessage::Audio(pcm) => Self::build_audio_message(pcm),
                    OutboundMessage::Text(text) => json!({
                        "clientContent": { "turns": [{ "role": "user", "parts": [{ "text": text }] }], "turnComplete": true }
                    }),
                    OutboundMessage::ToolResult { call_id, output } => json!({
                        "toolResponse": { "functionResponses": [{ "id": call_id, "response": output }] }
                    }),
                    OutboundMessage::Cancel => json!({ "clientContent": { "turns": [], "turnComplete": true } }),
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
                let bytes: Option<Vec<u8>> = match message {
                    Message::Binary(b) => Some(b.to_vec()),
                    Message::Text(t) => Some(t.as_bytes().to_vec()),
                    _ => None,
                };
                if let Some(bytes) = bytes {
                    if let Some(event) = Self::parse_server_payload(&bytes) {
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
                        message: "gemini live connection dropped unexpectedly".to_string(),
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
        self.send(OutboundMessage::Cancel).await
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.send(OutboundMessage::Close).await
    }
}

impl GeminiAdapter {
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
    fn setup_complete_maps_to_ready() {
        let event = GeminiAdapter::parse_server_payload(br#"{"setupComplete":{}}"#).unwrap();
        assert!(matches!(event, NeutralEvent::SessionReady));
    }

    #[test]
    fn non_json_payload_is_raw_audio() {
        let payload = vec![9u8, 8, 7, 6];
        match GeminiAdapter::parse_server_payload(&payload).unwrap() {
            NeutralEvent::AgentAudioDelta(pcm) => assert_eq!(pcm, payload),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn turn_complete_maps_to_response_done() {
        let raw = br#"{"serverContent":{"turnComplete":true}}"#;
        let event = GeminiAdapter::parse_server_payload(raw).unwrap();
        assert!(matches!(event, NeutralEvent::ResponseDone { .. }));
    }

    #[test]
    fn interrupted_is_nonfatal_provider_error() {
        let raw = br#"{"serverContent":{"interrupted":true}}"#;
        match GeminiAdapter::parse_server_payload(raw).unwrap() {
            NeutralEvent::ProviderError { fatal, .. } => assert!(!fatal),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn tool_call_extracted_from_tool_call_message() {
        let raw = br#"{"toolCall":{"functionCalls":[{"id":"t1","name":"end_call","args":{"reason":"done"}}]}}"#;
        match GeminiAdapter::parse_server_payload(raw).unwrap() {
            NeutralEvent::ToolCallRequested { call_id, name, .. } => {
                assert_eq!(call_id, "t1");
                assert_eq!(name, "end_call");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn greeting_trigger_embeds_text() {
        let trigger = GeminiAdapter::build_greeting_trigger("hi there, how can I help");
        let text = trigger["clientContent"]["turns"][0]["parts"][0]["text"].as_str().unwrap();
        assert!(text.contains("hi there, how can I help"));
    }
}

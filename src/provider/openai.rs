//! OpenAI Realtime adapter.
//!
//! Generalized from `OpenAiRealtimeSession`: same
//! connect-split-spawn-two-loops shape, same `session.update` handshake,
//! same `parse_server_event` dispatch table, extended with
//! `response.cancel` for barge-in, function-call argument completion for
//! tool dispatch, and `response.done.usage` for cost accounting.

use async_trait::async_trait;
use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;

use crate::event::NeutralEvent;
use crate::model::{AgentConfig, CostAccumulator};
use crate::provider::ProviderAdapter;

const REALTIME_URL: &str = "wss://api.openai.com/v1/realtime?model=gpt-4o-realtime-preview";

enum OutboundMessage {
    Audio(Vec<u8>),
    Text(String),
    ToolResult { call_id: String, output: Value },
    Cancel,
    Close,
}

pub struct OpenAiAdapter {
    api_key: String,
    outbound_tx: Option<mpsc::Sender<OutboundMessage>>,
}

impl OpenAiAdapter {
    pub fn new(api_key: String) -> Self {
        Self { api_key, outbound_tx: None }
    }

    fn build_session_update(agent: &AgentConfig) -> Value {
        json!({
            "type": "session.update",
            "session": {
                "instructions": agent.instructions,
                "voice": agent.voice,
                "input_audio_format": "pcm16",
                "output_audio_format": "pcm16",
                "input_audio_transcription": { "model": "gpt-4o-mini-transcribe" },
                "turn_detection": { "type": "semantic_vad", "eagerness": "high" },
                "tools": agent.tools.iter().map(|name| json!({ "type": "function", "name": name })).collect::<Vec<_>>(),
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

    fn parse_server_event(raw: &str) -> Option<NeutralEvent> {
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
                let text = value.get("delta")?.as_str()?.to_string();
                Some(NeutralEvent::AgentTextDelta(text))
            }
            "conversation.item.input_audio_transcription.completed" => {
                let text = value.get("transcript")?.as_str()?.to_string();
                Some(NeutralEvent::UserTranscript { text, is_final: true })
            }
            "response.function_call_arguments.done" => {
                let call_id = value.get("call_id")?.as_str()?.to_string();
                let name = value.get("name")?.as_str()?.to_string();
                let args_raw = value.get("arguments")?.as_str()?;
                let arguments = serde_json::from_str(args_raw).unwrap_or(Value::Null);
                Some(NeutralEvent::ToolCallRequested { call_id, name, arguments })
            }
            "response.done" => {
                let usage = value
                    .get("response")
                    .and_then(|r| r.get("usage"))
                    .map(|u| {
                        let mut cost = CostAccumulator::default();
                        cost.add_openai_usage(
                            u.get("input_tokens").and_then(Value::as_u64).unwrap_or(0),
                            u.get("output_tokens").and_then(Value::as_u64).unwrap_or(0),
                            u.get("input_token_details")
                                .and_then(|d| d.get("cached_tokens"))
                                .and_then(Value::as_u64)
                                .unwrap_or(0),
                        );
                        cost
                    });
                Some(NeutralEvent::ResponseDone { usage, reason: "done".to_string() })
            }
            "response.cancelled" => Some(NeutralEvent::ProviderError {
                kind: "cancelled".to_string(),
                message: "response cancelled".to_string(),
                fatal: false,
            }),
            "error" => {
                let message = value
                    .get("error")
                    .and_then(|e| e.get("message"))
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error")
                    .to_string();
                let fatal = value
                    .get("error")
                    .and_then(|e| e.get("code"))
                    .and_then(Value::as_str)
                    == Some("rate_limit_exceeded");
                Some(NeutralEvent::ProviderError { kind: "openai_error".to_string(), message, fatal })
            }
            _ => None,
        }
    }
}

#[async_trait]
impl ProviderAdapter for OpenAiAdapter {
    async fn open(&mut self, agent: &AgentConfig) -> anyhow::Result<mpsc::Receiver<NeutralEvent>> {
        let mut request = REALTIME_URL.into_client_request()?;
        request.headers_mut().insert(
            "Authorization",
            HeaderValue::from_str(&format!("Bearer {}", self.api_key))?,
        );
        request
            .headers_mut()
            .insert("OpenAI-Beta", HeaderValue::from_static("realtime=v1"));

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
                    OutboundMessage::Cancel => json!({ "type": "response.cancel" }),
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
                    if let Some(event) = Self::parse_server_event(&raw) {
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
                        message: "openai realtime connection dropped unexpectedly".to_string(),
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

impl OpenAiAdapter {
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
    fn session_created_maps_to_ready() {
        let event = OpenAiAdapter::parse_server_event(r#"{"type":"session.created"}"#).unwrap();
        assert!(matches!(event, NeutralEvent::SessionReady));
    }

    #[test]
    fn speech_started_and_stopped_map() {
        assert!(matches!(
            OpenAiAdapter::parse_server_event(r#"{"type":"input_audio_buffer.speech_started"}"#).unwrap(),
            NeutralEvent::UserSpeechStarted
        ));
        assert!(matches!(
            OpenAiAdapter::parse_server_event(r#"{"type":"input_audio_buffer.speech_stopped"}"#).unwrap(),
            NeutralEvent::UserSpeechStopped
        ));
    }

    #[test]
    fn audio_delta_decodes_base64() {
        let b64 = base64::engine::general_purpose::STANDARD.encode([1, 2, 3]);
        let raw = format!(r#"{{"type":"response.audio.delta","delta":"{b64}"}}"#);
        match OpenAiAdapter::parse_server_event(&raw).unwrap() {
            NeutralEvent::AgentAudioDelta(pcm) => assert_eq!(pcm, vec![1, 2, 3]),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn function_call_arguments_done_maps_to_tool_call() {
        let raw = r#"{"type":"response.function_call_arguments.done","call_id":"call1","name":"end_call","arguments":"{\"reason\":\"done\"}"}"#;
        match OpenAiAdapter::parse_server_event(raw).unwrap() {
            NeutralEvent::ToolCallRequested { call_id, name, arguments } => {
                assert_eq!(call_id, "call1");
                assert_eq!(name, "end_call");
                assert_eq!(arguments["reason"], "done");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn response_done_extracts_usage() {
        let raw = r#"{"type":"response.done","response":{"usage":{"input_tokens":10,"output_tokens":5,"input_token_details":{"cached_tokens":2}}}}"#;
        match OpenAiAdapter::parse_server_event(raw).unwrap() {
            NeutralEvent::ResponseDone { usage: Some(usage), .. } => {
                assert_eq!(usage.input_tokens, 10);
                assert_eq!(usage.output_tokens, 5);
                assert_eq!(usage.cached_tokens, 2);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn rate_limit_error_is_fatal() {
        let raw = r#"{"type":"error","error":{"code":"rate_limit_exceeded","message":"slow down"}}"#;
        match OpenAiAdapter::parse_server_event(raw).unwrap() {
            NeutralEvent::ProviderError { fatal, .. } => assert!(fatal),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn unrelated_event_types_are_ignored() {
        assert!(OpenAiAdapter::parse_server_event(r#"{"type":"response.created"}"#).is_none());
    }

    #[test]
    fn greeting_trigger_embeds_text() {
        let trigger = OpenAiAdapter::build_greeting_trigger("thanks for calling acme support");
        let instructions = trigger["response"]["instructions"].as_str().unwrap();
        assert!(instructions.contains("thanks for calling acme support"));
    }
}

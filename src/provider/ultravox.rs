//! Ultravox adapter.
//!
//! Ultravox's realtime API is two-phase: a REST call creates a call and
//! returns a `joinUrl`, then the bridge opens a control WebSocket to that
//! URL. Billing is in deciminutes (ceil(seconds/6)) rather than tokens or
//! per-second, per spec.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use crate::event::NeutralEvent;
use crate::model::{AgentConfig, CostAccumulator};
use crate::provider::ProviderAdapter;

const CALLS_URL: &str = "https://api.ultravox.ai/api/calls";
const ULTRAVOX_RATE_MILLICENTS_PER_DECIMINUTE: u64 = 50;

enum OutboundMessage {
    Text(String),
    ToolResult { call_id: String, output: Value },
    Cancel,
    Close,
}

pub struct UltravoxAdapter {
    api_key: String,
    http: reqwest::Client,
    outbound_tx: Option<mpsc::Sender<OutboundMessage>>,
}

impl UltravoxAdapter {
    pub fn new(api_key: String) -> Self {
        Self { api_key, http: reqwest::Client::new(), outbound_tx: None }
    }

    /// Ultravox configures its system prompt and opening turn at call
    /// creation rather than over a later control message, so the greeting
    /// (when set) is injected here as a forced first agent turn.
    fn build_call_body(agent: &AgentConfig) -> Value {
        let mut body = json!({
            "systemPrompt": agent.instructions,
            "voice": agent.voice,
            "medium": { "serverWebSocket": { "inputSampleRate": 16000, "outputSampleRate": 16000 } },
        });
        if let Some(greeting) = &agent.greeting {
            body["firstSpeaker"] = json!("FIRST_SPEAKER_AGENT");
            body["firstSpeakerSettings"] = json!({ "agent": { "text": greeting } });
        }
        body
    }

    async fn create_call(&self, agent: &AgentConfig) -> anyhow::Result<String> {
        let body = Self::build_call_body(agent);
        let response = self
            .http
            .post(CALLS_URL)
            .header("X-API-Key", &self.api_key)
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        let payload: Value = response.json().await?;
        payload
            .get("joinUrl")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| anyhow::anyhow!("ultravox response missing joinUrl"))
    }

    fn parse_server_event(raw: &str, connected_secs: f64) -> Option<NeutralEvent> {
        let value: Value = serde_json::from_str(raw).ok()?;
        let event_type = value.get("type")?.as_str()?;
        match event_type {
            "state" if value.get("state").and_then(Value::as_str) == Some("listening") => {
                Some(NeutralEvent::SessionReady)
            }
            "transcript" => {
                let text = value.get("text")?.as_str()?.to_string();
                let is_final = value.get("final").and_then(Value::as_bool).unwrap_or(false);
                if value.get("role").and_then(Value::as_str) == Some("agent") {
                    Some(NeutralEvent::AgentTextDelta(text))
                } else {
                    Some(NeutralEvent::UserTranscript { text, is_final })
                }
            }
            "client_tool_invocation" => {
                let call_id = value.get("invocationId")?.as_str()?.to_string();
                let name = value.get("toolName")?.as_str()?.to_string();
                let arguments = value.get("parameters").cloned().unwrap_or(Value::Null);
                Some(NeutralEvent::ToolCallRequested { call_id, name, arguments })
            }
            "ended" => {
                let mut cost = CostAccumulator::default();
                cost.add_ultravox_seconds(connected_secs, ULTRAVOX_RATE_MILLICENTS_PER_DECIMINUTE);
                Some(NeutralEvent::ResponseDone { usage: Some(cost), reason: "ended".to_string() })
            }
            "error" => Some(NeutralEvent::ProviderError {
                kind: "ultravox_error".to_string(),
                message: value.get("message").and_then(Value::as_str).unwrap_or("unknown").to_string(),
                fatal: true,
            }),
            _ => None,
        }
    }
}

#[async_trait]
impl ProviderAdapter for UltravoxAdapter {
    async fn open(&mut self, agent: &AgentConfig) -> anyhow::Result<mpsc::Receiver<NeutralEvent>> {
        let join_url = self.create_call(agent).await?;
        let (ws_stream, _) = tokio_tungstenite::connect_async(join_url).await?;
        let (mut ws_tx, mut ws_rx) = ws_stream.split();

        let (outbound_tx, mut outbound_rx) = mpsc::channel::<OutboundMessage>(64);
        let (event_tx, event_rx) = mpsc::channel::<NeutralEvent>(256);
        let opened_at = std::time::Instant::now();
        let closing = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));

        let outbound_closing = closing.clone();
        tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                match message {
                    OutboundMessage::Text(text) => {
                        let payload = json!({ "type": "input_text_message", "text": text });
                        if ws_tx.send(Message::Text(payload.to_string().into())).await.is_err() {
                            break;
                        }
                    }
                    OutboundMessage::ToolResult { call_id, output } => {
                        let payload = json!({
                            "type": "client_tool_result",
                            "invocationId": call_id,
                            "result": output,
                        });
                        if ws_tx.send(Message::Text(payload.to_string().into())).await.is_err() {
                            break;
                        }
                    }
                    OutboundMessage::Cancel => {
                        let payload = json!({ "type": "stop_response" });
                        if ws_tx.send(Message::Text(payload.to_string().into())).await.is_err() {
                            break;
                        }
                    }
                    OutboundMessage::Close => {
                        outbound_closing.store(true, std::sync::atomic::Ordering::Relaxed);
                        break;
                    }
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
                        message: "ultravox connection dropped unexpectedly".to_string(),
                        fatal: true,
                    })
                    .await;
            }
        });

        self.outbound_tx = Some(outbound_tx);
        Ok(event_rx)
    }

    async fn send_user_audio(&self, _pcm: Vec<u8>) -> anyhow::Result<()> {
        // Ultravox audio is SIP-direct: the caller leg is bridged straight
        // into Ultravox's media path, bypassing this adapter entirely.
        Ok(())
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

impl UltravoxAdapter {
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
    fn listening_state_maps_to_ready() {
        let event = UltravoxAdapter::parse_server_event(r#"{"type":"state","state":"listening"}"#, 0.0).unwrap();
        assert!(matches!(event, NeutralEvent::SessionReady));
    }

    #[test]
    fn agent_transcript_maps_to_text_delta() {
        let raw = r#"{"type":"transcript","role":"agent","text":"hi","final":true}"#;
        assert!(matches!(
            UltravoxAdapter::parse_server_event(raw, 0.0).unwrap(),
            NeutralEvent::AgentTextDelta(_)
        ));
    }

    #[test]
    fn user_transcript_preserves_final_flag() {
        let raw = r#"{"type":"transcript","role":"user","text":"hello","final":false}"#;
        match UltravoxAdapter::parse_server_event(raw, 0.0).unwrap() {
            NeutralEvent::UserTranscript { is_final, .. } => assert!(!is_final),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn ended_bills_in_deciminutes() {
        let event = UltravoxAdapter::parse_server_event(r#"{"type":"ended"}"#, 7.0).unwrap();
        match event {
            NeutralEvent::ResponseDone { usage: Some(usage), .. } => assert_eq!(usage.billed_units, 2),
            other => panic!("unexpected event {other:?}"),
        }
    }

    fn agent_with_greeting(greeting: Option<&str>) -> AgentConfig {
        AgentConfig {
            agent_id: "a1".into(),
            provider: crate::model::ProviderKind::Ultravox,
            voice: "v".into(),
            instructions: "be helpful".into(),
            language: "en".into(),
            tools: vec![],
            greeting: greeting.map(str::to_string),
        }
    }

    #[test]
    fn greeting_sets_agent_first_speaker() {
        let agent = agent_with_greeting(Some("thanks for calling"));
        let body = UltravoxAdapter::build_call_body(&agent);
        assert_eq!(body["firstSpeaker"], "FIRST_SPEAKER_AGENT");
        assert_eq!(body["firstSpeakerSettings"]["agent"]["text"], "thanks for calling");
    }

    #[test]
    fn no_greeting_omits_first_speaker() {
        let agent = agent_with_greeting(None);
        let body = UltravoxAdapter::build_call_body(&agent);
        assert!(body.get("firstSpeaker").is_none());
    }

    #[test]
    fn client_tool_invocation_maps_to_tool_call() {
        let raw = r#"{"type":"client_tool_invocation","invocationId":"i1","toolName":"end_call","parameters":{}}"#;
        match UltravoxAdapter::parse_server_event(raw, 0.0).unwrap() {
            NeutralEvent::ToolCallRequested { call_id, name, .. } => {
                assert_eq!(call_id, "i1");
                assert_eq!(name, "end_call");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
}

//! The neutral event stream every provider adapter normalizes into.
//!
//! Generalized from the `VoiceEvent` enum: the `Error` variant
//! is renamed `ProviderError` and carries a `fatal` flag, tool-call and
//! explicit turn-completion events are added, and speech-start/stop get
//! their own variants instead of being logged and dropped.

use serde_json::Value;

use crate::model::CostAccumulator;

#[derive(Debug, Clone)]
pub enum NeutralEvent {
    SessionReady,
    UserSpeechStarted,
    UserSpeechStopped,
    AgentAudioDelta(Vec<u8>),
    AgentTextDelta(String),
    UserTranscript { text: String, is_final: bool },
    ToolCallRequested { call_id: String, name: String, arguments: Value },
    ResponseDone { usage: Option<CostAccumulator>, reason: String },
    ProviderError { kind: String, message: String, fatal: bool },
}

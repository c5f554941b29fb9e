//! Core data types shared across the bridge: the call record, the agent's
//! configuration as loaded from the KV store, turn state, audio chunks,
//! the recording buffer, and the cost accumulator.

use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Which realtime provider a call is bridged to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    OpenAi,
    Xai,
    Gemini,
    Ultravox,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "openai",
            ProviderKind::Xai => "xai",
            ProviderKind::Gemini => "gemini",
            ProviderKind::Ultravox => "ultravox",
        }
    }
}

/// Agent configuration, looked up in the KV store by call id at
/// `voiceai:call:{id}:agent`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub agent_id: String,
    pub provider: ProviderKind,
    pub voice: String,
    pub instructions: String,
    pub language: String,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub greeting: Option<String>,
}

/// The finite turn-state machine driving one call's conversational turn.
///
/// Transitions: idle -> user_speaking -> agent_thinking -> agent_speaking
/// -> idle. `barging_in` is reachable only from `agent_speaking`.
/// `tool_running` is reachable only from `agent_thinking` or
/// `agent_speaking`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Idle,
    UserSpeaking,
    AgentThinking,
    AgentSpeaking,
    BargingIn,
    ToolRunning,
}

impl TurnState {
    /// Whether `next` is a legal transition from `self`.
    pub fn can_transition_to(&self, next: TurnState) -> bool {
        use TurnState::*;
        match (self, next) {
            (Idle, UserSpeaking) => true,
            (UserSpeaking, AgentThinking) => true,
            (UserSpeaking, Idle) => true,
            (AgentThinking, AgentSpeaking) => true,
            (AgentThinking, ToolRunning) => true,
            (AgentThinking, Idle) => true,
            (AgentSpeaking, Idle) => true,
            (AgentSpeaking, BargingIn) => true,
            (AgentSpeaking, ToolRunning) => true,
            (BargingIn, UserSpeaking) => true,
            (BargingIn, Idle) => true,
            (ToolRunning, AgentThinking) => true,
            (ToolRunning, AgentSpeaking) => true,
            (ToolRunning, Idle) => true,
            _ => false,
        }
    }
}

/// One call, its identity and the transport/provider state backing it.
pub struct Call {
    pub call_id: String,
    pub agent: AgentConfig,
    pub turn_state: TurnState,
    pub greeting_done: bool,
    pub started_at: Instant,
}

impl Call {
    pub fn new(call_id: String, agent: AgentConfig) -> Self {
        Self {
            call_id,
            agent,
            turn_state: TurnState::Idle,
            greeting_done: false,
            started_at: Instant::now(),
        }
    }

    /// Applies a turn-state transition, returning false (and leaving state
    /// unchanged) if the transition is not legal.
    pub fn transition(&mut self, next: TurnState) -> bool {
        if self.turn_state.can_transition_to(next) {
            self.turn_state = next;
            true
        } else {
            false
        }
    }
}

/// One slice of PCM audio moving through the bridge, tagged with the
/// sample rate it was framed at.
#[derive(Debug, Clone)]
pub struct AudioChunk {
    pub sample_rate_hz: u32,
    pub pcm: Vec<u8>,
}

impl AudioChunk {
    pub fn new(sample_rate_hz: u32, pcm: Vec<u8>) -> Self {
        Self { sample_rate_hz, pcm }
    }
}

/// Which leg of the call an audio or transcript artifact belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    #[default]
    Caller,
    Agent,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Caller => "caller",
            Direction::Agent => "agent",
        }
    }
}

/// In-memory recording buffer flushed to the KV store at 48 KiB or 1s age,
/// whichever comes first. Best-effort: failures are logged, never
/// propagated to the call.
#[derive(Debug, Default)]
pub struct RecordingBuffer {
    pub direction: Direction,
    pub bytes: Vec<u8>,
    pub opened_at: Option<Instant>,
    pub consecutive_failures: u32,
}

pub const RECORDING_FLUSH_BYTES: usize = 48 * 1024;
pub const RECORDING_FLUSH_MAX_FAILURES: u32 = 3;

impl RecordingBuffer {
    pub fn push(&mut self, chunk: &[u8]) {
        if self.bytes.is_empty() {
            self.opened_at = Some(Instant::now());
        }
        self.bytes.extend_from_slice(chunk);
    }

    pub fn should_flush(&self, max_age: std::time::Duration) -> bool {
        if self.bytes.len() >= RECORDING_FLUSH_BYTES {
            return true;
        }
        match self.opened_at {
            Some(opened) => opened.elapsed() >= max_age,
            None => false,
        }
    }

    pub fn take(&mut self) -> Vec<u8> {
        self.opened_at = None;
        std::mem::take(&mut self.bytes)
    }
}

/// Token/usage accounting, dispatched per provider's own billing unit.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CostAccumulator {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cached_tokens: u64,
    /// xAI bills by ceil(seconds) of connected audio; Ultravox by
    /// ceil(seconds/6) deciminutes. Both are tracked here rather than as
    /// tokens.
    pub billed_units: u64,
    pub usd_estimate_millicents: u64,
}

impl CostAccumulator {
    pub fn add_openai_usage(&mut self, input: u64, output: u64, cached: u64) {
        self.input_tokens += input;
        self.output_tokens += output;
        self.cached_tokens += cached;
    }

    pub fn add_xai_seconds(&mut self, seconds: f64, rate_millicents_per_second: u64) {
        let billed = seconds.ceil().max(0.0) as u64;
        self.billed_units += billed;
        self.usd_estimate_millicents += billed * rate_millicents_per_second;
    }

    pub fn add_ultravox_seconds(&mut self, seconds: f64, rate_millicents_per_deciminute: u64) {
        let deciminutes = (seconds / 6.0).ceil().max(0.0) as u64;
        self.billed_units += deciminutes;
        self.usd_estimate_millicents += deciminutes * rate_millicents_per_deciminute;
    }
}

/// A tool invocation requested by the provider mid-turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub call_id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn turn_state_legal_transitions() {
        assert!(TurnState::Idle.can_transition_to(TurnState::UserSpeaking));
        assert!(TurnState::AgentSpeaking.can_transition_to(TurnState::BargingIn));
        assert!(!TurnState::Idle.can_transition_to(TurnState::BargingIn));
        assert!(!TurnState::UserSpeaking.can_transition_to(TurnState::ToolRunning));
        assert!(TurnState::AgentThinking.can_transition_to(TurnState::ToolRunning));
    }

    #[test]
    fn call_transition_rejects_illegal_moves() {
        let agent = AgentConfig {
            agent_id: "a1".into(),
            provider: ProviderKind::OpenAi,
            voice: "alloy".into(),
            instructions: "be helpful".into(),
            language: "en".into(),
            tools: vec![],
            greeting: None,
        };
        let mut call = Call::new("c1".into(), agent);
        assert!(!call.transition(TurnState::BargingIn));
        assert_eq!(call.turn_state, TurnState::Idle);
        assert!(call.transition(TurnState::UserSpeaking));
        assert_eq!(call.turn_state, TurnState::UserSpeaking);
    }

    #[test]
    fn recording_buffer_flush_threshold() {
        let mut buf = RecordingBuffer::default();
        assert!(!buf.should_flush(std::time::Duration::from_secs(1)));
        buf.push(&vec![0u8; RECORDING_FLUSH_BYTES]);
        assert!(buf.should_flush(std::time::Duration::from_secs(3600)));
    }

    #[test]
    fn cost_accumulator_xai_rounds_up() {
        let mut cost = CostAccumulator::default();
        cost.add_xai_seconds(1.2, 100);
        assert_eq!(cost.billed_units, 2);
        assert_eq!(cost.usd_estimate_millicents, 200);
    }

    #[test]
    fn cost_accumulator_ultravox_deciminutes() {
        let mut cost = CostAccumulator::default();
        cost.add_ultravox_seconds(7.0, 50);
        assert_eq!(cost.billed_units, 2);
    }
}

//! Recording sink: buffers caller and agent audio separately in memory and
//! flushes each to the KV store at 48 KiB or 1s age, whichever comes
//! first. Best-effort — a failed flush is logged and, after three
//! consecutive failures, that direction's buffer is silently dropped
//! rather than growing unbounded.

use std::time::Duration;

use tracing::warn;

use crate::kv::KvClient;
use crate::model::{Direction, RecordingBuffer, RECORDING_FLUSH_MAX_FAILURES};

const MAX_BUFFER_AGE: Duration = Duration::from_secs(1);

pub struct RecordingSink {
    call_id: String,
    kv: KvClient,
    caller: RecordingBuffer,
    agent: RecordingBuffer,
}

impl RecordingSink {
    pub fn new(call_id: String, kv: KvClient) -> Self {
        Self {
            call_id,
            kv,
            caller: RecordingBuffer { direction: Direction::Caller, ..Default::default() },
            agent: RecordingBuffer { direction: Direction::Agent, ..Default::default() },
        }
    }

    pub fn push(&mut self, direction: Direction, chunk: &[u8]) {
        self.buffer_mut(direction).push(chunk);
    }

    /// Flushes whichever direction(s) have grown past the size/age
    /// threshold. Call on every audio chunk so a quiet call still flushes
    /// its tail promptly.
    pub async fn maybe_flush(&mut self) {
        if self.caller.should_flush(MAX_BUFFER_AGE) {
            self.flush_direction(Direction::Caller).await;
        }
        if self.agent.should_flush(MAX_BUFFER_AGE) {
            self.flush_direction(Direction::Agent).await;
        }
    }

    pub async fn flush_now(&mut self) {
        self.flush_direction(Direction::Caller).await;
        self.flush_direction(Direction::Agent).await;
    }

    fn buffer_mut(&mut self, direction: Direction) -> &mut RecordingBuffer {
        match direction {
            Direction::Caller => &mut self.caller,
            Direction::Agent => &mut self.agent,
        }
    }

    async fn flush_direction(&mut self, direction: Direction) {
        let buffer = self.buffer_mut(direction);
        if buffer.bytes.is_empty() {
            return;
        }
        let chunk = buffer.take();
        match self.kv.append_audio(&self.call_id, direction, &chunk).await {
            Ok(()) => self.buffer_mut(direction).consecutive_failures = 0,
            Err(err) => {
                let buffer = self.buffer_mut(direction);
                buffer.consecutive_failures += 1;
                warn!(
                    call_id = %self.call_id,
                    direction = direction.as_str(),
                    error = %err,
                    failures = buffer.consecutive_failures,
                    "recording flush failed"
                );
                if buffer.consecutive_failures >= RECORDING_FLUSH_MAX_FAILURES {
                    warn!(call_id = %self.call_id, direction = direction.as_str(), "dropping recording buffer after repeated flush failures");
                    buffer.consecutive_failures = 0;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KvConfig;

    #[tokio::test]
    async fn buffer_grows_until_flush_threshold() {
        // Without a live redis connection, KvClient::connect would fail,
        // so this test exercises the buffer logic directly rather than
        // going through RecordingSink::flush_now.
        let mut buffer = RecordingBuffer { direction: Direction::Caller, ..Default::default() };
        assert!(!buffer.should_flush(MAX_BUFFER_AGE));
        buffer.push(&[0u8; 10]);
        assert!(!buffer.should_flush(MAX_BUFFER_AGE));
        let _ = KvConfig::default();
    }

    #[test]
    fn caller_and_agent_buffers_are_independent() {
        let caller = RecordingBuffer { direction: Direction::Caller, ..Default::default() };
        let agent = RecordingBuffer { direction: Direction::Agent, ..Default::default() };
        assert_eq!(caller.direction, Direction::Caller);
        assert_eq!(agent.direction, Direction::Agent);
    }
}

//! Redis-backed KV client: `AgentConfig` lookup by call id and the
//! storage side of the recording/transcript/cost/tool sinks.

use anyhow::{Context, Result};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use crate::config::KvConfig;
use crate::model::{AgentConfig, Direction};

#[derive(Clone)]
pub struct KvClient {
    conn: ConnectionManager,
}

fn agent_key(call_id: &str) -> String {
    format!("voiceai:call:{call_id}:agent")
}

fn audio_key(call_id: &str, direction: Direction) -> String {
    format!("voiceai:call:{call_id}:audio:{}", direction.as_str())
}

fn events_key(call_id: &str) -> String {
    format!("voiceai:call:{call_id}:events")
}

fn cost_key(call_id: &str) -> String {
    format!("voiceai:call:{call_id}:cost")
}

fn tool_key(call_id: &str, tool: &str) -> String {
    format!("voiceai:call:{call_id}:tool:{tool}")
}

impl KvClient {
    pub async fn connect(config: &KvConfig) -> Result<Self> {
        let client = redis::Client::open(config.url.as_str()).context("building redis client")?;
        let conn = ConnectionManager::new(client).await.context("connecting to redis")?;
        Ok(Self { conn })
    }

    pub async fn load_agent_config(&self, call_id: &str) -> Result<AgentConfig> {
        let mut conn = self.conn.clone();
        let raw: String = conn
            .get(agent_key(call_id))
            .await
            .with_context(|| format!("loading agent config for call {call_id}"))?;
        serde_json::from_str(&raw).context("parsing agent config")
    }

    /// Appends a chunk of recorded audio, keyed by direction; best-effort,
    /// failures are the caller's concern to log and swallow.
    pub async fn append_audio(&self, call_id: &str, direction: Direction, chunk: &[u8]) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.append(audio_key(call_id, direction), chunk).await?;
        Ok(())
    }

    pub async fn append_event(&self, call_id: &str, event_json: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.rpush(events_key(call_id), event_json).await?;
        Ok(())
    }

    pub async fn write_cost(&self, call_id: &str, cost_json: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.set(cost_key(call_id), cost_json).await?;
        Ok(())
    }

    /// Appends a built-in tool's persisted side effect (survey answer,
    /// appointment, lead, callback) to its own list, separate from the
    /// general transcript/event stream.
    pub async fn append_tool_result(&self, call_id: &str, tool: &str, payload_json: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.rpush(tool_key(call_id, tool), payload_json).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_layout_matches_spec() {
        assert_eq!(agent_key("c1"), "voiceai:call:c1:agent");
        assert_eq!(audio_key("c1", Direction::Caller), "voiceai:call:c1:audio:caller");
        assert_eq!(audio_key("c1", Direction::Agent), "voiceai:call:c1:audio:agent");
        assert_eq!(cost_key("c1"), "voiceai:call:c1:cost");
        assert_eq!(tool_key("c1", "save_answer"), "voiceai:call:c1:tool:save_answer");
    }
}

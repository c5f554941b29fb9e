//! Cost sink: writes the call's running `CostAccumulator` to the KV
//! store, retrying transient failures with backoff before dead-lettering.

use std::time::Duration;

use tracing::{error, warn};

use crate::kv::KvClient;
use crate::model::CostAccumulator;

const RETRY_BACKOFFS: [Duration; 3] = [
    Duration::from_millis(100),
    Duration::from_millis(500),
    Duration::from_secs(2),
];

pub struct CostSink {
    call_id: String,
    kv: KvClient,
    dead_letter: Vec<String>,
}

impl CostSink {
    pub fn new(call_id: String, kv: KvClient) -> Self {
        Self { call_id, kv, dead_letter: Vec::new() }
    }

    /// Persists `cost`, retrying on the fixed backoff schedule before
    /// dead-lettering in-process for later inspection/replay.
    pub async fn write(&mut self, cost: &CostAccumulator) {
        let payload = match serde_json::to_string(cost) {
            Ok(p) => p,
            Err(err) => {
                error!(call_id = %self.call_id, error = %err, "cost record is not serializable");
                return;
            }
        };

        for (attempt, backoff) in RETRY_BACKOFFS.iter().enumerate() {
            match self.kv.write_cost(&self.call_id, &payload).await {
                Ok(()) => return,
                Err(err) => {
                    warn!(call_id = %self.call_id, attempt, error = %err, "cost write failed, retrying");
                    tokio::time::sleep(*backoff).await;
                }
            }
        }

        match self.kv.write_cost(&self.call_id, &payload).await {
            Ok(()) => {}
            Err(err) => {
                error!(call_id = %self.call_id, error = %err, "cost write exhausted retries, dead-lettering");
                self.dead_letter.push(payload);
            }
        }
    }

    pub fn dead_letter_count(&self) -> usize {
        self.dead_letter.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_schedule_has_three_steps() {
        assert_eq!(RETRY_BACKOFFS.len(), 3);
        assert!(RETRY_BACKOFFS[0] < RETRY_BACKOFFS[1]);
        assert!(RETRY_BACKOFFS[1] < RETRY_BACKOFFS[2]);
    }
}

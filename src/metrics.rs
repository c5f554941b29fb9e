//! Process-wide observability counters, exported as Prometheus gauges
//! and counters the way this crate's `Cargo.toml` already pulls in
//! `prometheus` for.

use prometheus::{IntCounter, IntGauge, Registry};

pub struct Metrics {
    pub registry: Registry,
    pub calls_in_flight: IntGauge,
    pub frames_in_total: IntCounter,
    pub frames_out_total: IntCounter,
    pub barge_ins_total: IntCounter,
    pub tool_calls_total: IntCounter,
    pub provider_reconnects_total: IntCounter,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let calls_in_flight = IntGauge::new("voicebridge_calls_in_flight", "Calls currently bridged").unwrap();
        let frames_in_total = IntCounter::new("voicebridge_frames_in_total", "Audio frames received from the PBX leg").unwrap();
        let frames_out_total = IntCounter::new("voicebridge_frames_out_total", "Audio frames sent to the PBX leg").unwrap();
        let barge_ins_total = IntCounter::new("voicebridge_barge_ins_total", "Barge-in events handled").unwrap();
        let tool_calls_total = IntCounter::new("voicebridge_tool_calls_total", "Tool invocations dispatched").unwrap();
        let provider_reconnects_total = IntCounter::new("voicebridge_provider_reconnects_total", "Provider transport reconnect attempts").unwrap();

        registry.register(Box::new(calls_in_flight.clone())).unwrap();
        registry.register(Box::new(frames_in_total.clone())).unwrap();
        registry.register(Box::new(frames_out_total.clone())).unwrap();
        registry.register(Box::new(barge_ins_total.clone())).unwrap();
        registry.register(Box::new(tool_calls_total.clone())).unwrap();
        registry.register(Box::new(provider_reconnects_total.clone())).unwrap();

        Self {
            registry,
            calls_in_flight,
            frames_in_total,
            frames_out_total,
            barge_ins_total,
            tool_calls_total,
            provider_reconnects_total,
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_zero() {
        let metrics = Metrics::new();
        assert_eq!(metrics.frames_in_total.get(), 0);
        metrics.frames_in_total.inc();
        assert_eq!(metrics.frames_in_total.get(), 1);
    }
}

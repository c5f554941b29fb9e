//! Session driver: the per-call orchestrator tying frame codec, provider
//! adapter, turn-state machine, tool dispatcher, and sinks together.
//!
//! Modeled on `SimulSession::start`, which spawns three
//! cooperating tasks (`audio_forwarder`, `event_processor`, `tick_timer`)
//! coordinated by channels and a stop signal. Here the three tasks are
//! ingress (PBX -> provider), provider-events (provider -> pacer/tools),
//! and egress/pacer (pacer -> PBX), and the stop signal is a single
//! `CancellationToken` so hangup, a fatal provider error, or a bridge
//! shutdown all tear every task down the same way.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::circuit_breaker::CircuitBreaker;
use crate::errors::BridgeError;
use crate::event::NeutralEvent;
use crate::frame::{self, Frame};
use crate::metrics::Metrics;
use crate::model::{AgentConfig, Call, CostAccumulator, Direction, ProviderKind, TurnState};
use crate::pacer::{OutputPacer, PacerCommand};
use crate::provider::{self, ProviderAdapter};
use crate::sinks::cost::CostSink;
use crate::sinks::recording::RecordingSink;
use crate::tools::ToolRegistry;

/// A reconnect attempt must land within this window of the transport
/// error being observed, session reconfigured from scratch, or the call
/// ends.
const RECONNECT_WINDOW: Duration = Duration::from_secs(2);

/// Shared process-wide dependencies, handed to every call.
pub struct SessionDeps {
    pub tool_registry: Arc<ToolRegistry>,
    pub circuit_breaker: Arc<CircuitBreaker>,
    pub metrics: Arc<Metrics>,
    pub kv: crate::kv::KvClient,
    pub api_keys: ApiKeys,
}

#[derive(Clone)]
pub struct ApiKeys {
    pub openai: Option<String>,
    pub xai: Option<String>,
    pub gemini: Option<String>,
    pub ultravox: Option<String>,
}

impl ApiKeys {
    fn key_for(&self, provider: ProviderKind) -> Option<String> {
        match provider {
            ProviderKind::OpenAi => self.openai.clone(),
            ProviderKind::Xai => self.xai.clone(),
            ProviderKind::Gemini => self.gemini.clone(),
            ProviderKind::Ultravox => self.ultravox.clone(),
        }
    }
}

/// Accepts one PBX connection through to call teardown.
pub async fn run_call(socket: TcpStream, deps: Arc<SessionDeps>) -> anyhow::Result<()> {
    let (mut reader, mut writer) = tokio::io::split(socket);

    let call_id = frame::read_leading_uuid(&mut reader).await?;
    let agent = deps.kv.load_agent_config(&call_id).await?;

    if deps.circuit_breaker.is_open(agent.provider) {
        warn!(call_id = %call_id, provider = agent.provider.as_str(), "provider circuit open, rejecting call");
        frame::write_frame(&mut writer, &Frame::Hangup).await.ok();
        return Ok(());
    }

    let api_key = deps
        .api_keys
        .key_for(agent.provider)
        .ok_or_else(|| anyhow::anyhow!("no api key configured for provider {}", agent.provider.as_str()))?;

    let mut adapter = provider::create_adapter(agent.provider, api_key)?;
    let event_rx = match adapter.open(&agent).await {
        Ok(rx) => {
            deps.circuit_breaker.record_handshake_success(agent.provider);
            rx
        }
        Err(err) => {
            deps.circuit_breaker.record_handshake_failure(agent.provider);
            return Err(BridgeError::ProviderHandshakeFailed(err.to_string()).into());
        }
    };
    let adapter: Arc<dyn ProviderAdapter> = Arc::from(adapter);

    deps.metrics.calls_in_flight.inc();
    let result = drive_call(call_id.clone(), agent, reader, writer, adapter, event_rx, deps.clone()).await;
    deps.metrics.calls_in_flight.dec();

    if let Err(err) = &result {
        warn!(call_id = %call_id, error = %err, "call ended with error");
    } else {
        info!(call_id = %call_id, "call ended");
    }
    result
}

async fn drive_call(
    call_id: String,
    agent: AgentConfig,
    reader: tokio::io::ReadHalf<TcpStream>,
    writer: tokio::io::WriteHalf<TcpStream>,
    adapter: Arc<dyn ProviderAdapter>,
    event_rx: mpsc::Receiver<NeutralEvent>,
    deps: Arc<SessionDeps>,
) -> anyhow::Result<()> {
    let cancellation = CancellationToken::new();
    let call = Arc::new(parking_lot::Mutex::new(Call::new(call_id.clone(), agent.clone())));
    let adapter_cell = Arc::new(parking_lot::Mutex::new(adapter));

    let (pacer_tx, pacer_rx) = mpsc::channel::<PacerCommand>(256);
    let (frame_tx, frame_rx) = mpsc::channel::<Frame>(256);

    let recording = Arc::new(tokio::sync::Mutex::new(RecordingSink::new(call_id.clone(), deps.kv.clone())));

    // Egress/pacer task.
    let pacer = OutputPacer::new(pacer_rx, frame_tx.clone());
    let pacer_cancel = cancellation.clone();
    let pacer_handle = tokio::spawn(async move {
        tokio::select! {
            _ = pacer.run() => {}
            _ = pacer_cancel.cancelled() => {}
        }
    });

    let egress_cancel = cancellation.clone();
    let egress_metrics = deps.metrics.clone();
    let egress_recording = recording.clone();
    let egress_handle = tokio::spawn(egress_loop(writer, frame_rx, egress_metrics, egress_recording, egress_cancel));

    // Ingress task: PBX -> provider, plus recording capture.
    let ingress_cancel = cancellation.clone();
    let ingress_adapter = adapter_cell.clone();
    let ingress_metrics = deps.metrics.clone();
    let ingress_recording = recording.clone();
    let ingress_handle = tokio::spawn(ingress_loop(
        reader,
        ingress_adapter,
        ingress_recording,
        ingress_metrics,
        ingress_cancel,
    ));

    // Provider-events task: provider -> pacer/tools/cost, plus reconnect.
    let events_cancel = cancellation.clone();
    let events_adapter = adapter_cell.clone();
    let events_deps = deps.clone();
    let events_call = call.clone();
    let events_agent = agent.clone();
    let events_handle = tokio::spawn(provider_events_loop(
        event_rx,
        events_call,
        pacer_tx,
        events_adapter,
        events_agent,
        events_deps,
        events_cancel,
    ));

    let ingress_result = ingress_handle.await.unwrap_or_else(|e| Err(BridgeError::Protocol(e.to_string()).into()));
    let events_result = {
        cancellation.cancel();
        events_handle.await.unwrap_or(Ok(CostAccumulator::default()))
    };

    let _ = pacer_handle.await;
    let _ = egress_handle.await;

    recording.lock().await.flush_now().await;

    let accumulated_cost = events_result.unwrap_or_default();
    let mut cost_sink = CostSink::new(call_id, deps.kv.clone());
    cost_sink.write(&accumulated_cost).await;

    let _ = adapter_cell.lock().clone().close().await;

    ingress_result
}

async fn egress_loop(
    mut writer: tokio::io::WriteHalf<TcpStream>,
    mut frame_rx: mpsc::Receiver<Frame>,
    metrics: Arc<Metrics>,
    recording: Arc<tokio::sync::Mutex<RecordingSink>>,
    cancellation: CancellationToken,
) {
    loop {
        tokio::select! {
            frame = frame_rx.recv() => {
                match frame {
                    Some(frame) => {
                        if let Frame::Audio24k(pcm) = &frame {
                            let mut recording = recording.lock().await;
                            recording.push(Direction::Agent, pcm);
                            recording.maybe_flush().await;
                        }
                        if frame::write_frame(&mut writer, &frame).await.is_err() {
                            break;
                        }
                        metrics.frames_out_total.inc();
                    }
                    None => break,
                }
            }
            _ = cancellation.cancelled() => break,
        }
    }
}

async fn ingress_loop(
    mut reader: tokio::io::ReadHalf<TcpStream>,
    adapter_cell: Arc<parking_lot::Mutex<Arc<dyn ProviderAdapter>>>,
    recording: Arc<tokio::sync::Mutex<RecordingSink>>,
    metrics: Arc<Metrics>,
    cancellation: CancellationToken,
) -> anyhow::Result<()> {
    let result = loop {
        let frame = tokio::select! {
            frame = frame::read_frame(&mut reader) => frame,
            _ = cancellation.cancelled() => break Ok(()),
        };
        match frame {
            Ok(Frame::Audio24k(pcm)) => {
                metrics.frames_in_total.inc();
                {
                    let mut recording = recording.lock().await;
                    recording.push(Direction::Caller, &pcm);
                    recording.maybe_flush().await;
                }
                let adapter = adapter_cell.lock().clone();
                if let Err(err) = adapter.send_user_audio(pcm).await {
                    break Err(err);
                }
            }
            Ok(Frame::Audio8k(pcm)) | Ok(Frame::Audio16k(pcm)) | Ok(Frame::Audio48k(pcm)) => {
                metrics.frames_in_total.inc();
                let mut recording = recording.lock().await;
                recording.push(Direction::Caller, &pcm);
                recording.maybe_flush().await;
            }
            Ok(Frame::Hangup) => break Ok(()),
            Ok(Frame::Dtmf(_)) | Ok(Frame::Uuid(_)) | Ok(Frame::Error(_)) => {}
            Err(err) => break Err(BridgeError::Protocol(err.to_string()).into()),
        }
    };
    cancellation.cancel();
    result
}

async fn provider_events_loop(
    mut event_rx: mpsc::Receiver<NeutralEvent>,
    call: Arc<parking_lot::Mutex<Call>>,
    pacer_tx: mpsc::Sender<PacerCommand>,
    adapter_cell: Arc<parking_lot::Mutex<Arc<dyn ProviderAdapter>>>,
    agent: AgentConfig,
    deps: Arc<SessionDeps>,
    cancellation: CancellationToken,
) -> anyhow::Result<CostAccumulator> {
    let mut accumulated_cost = CostAccumulator::default();
    let result = loop {
        let adapter = adapter_cell.lock().clone();
        let event = tokio::select! {
            event = event_rx.recv() => event,
            _ = cancellation.cancelled() => break Ok(()),
        };
        let Some(event) = event else { break Ok(()) };

        match event {
            NeutralEvent::SessionReady => {}
            NeutralEvent::UserSpeechStarted => {
                // Scoped so the non-Send parking_lot guard is dropped
                // before the awaits below.
                let was_agent_speaking = {
                    let mut call = call.lock();
                    let was_agent_speaking = call.greeting_done && call.turn_state == TurnState::AgentSpeaking;
                    if was_agent_speaking {
                        call.transition(TurnState::BargingIn);
                        deps.metrics.barge_ins_total.inc();
                    }
                    call.transition(TurnState::UserSpeaking);
                    was_agent_speaking
                };
                if was_agent_speaking {
                    // Flush queued output immediately, then hold the
                    // pacer silent: the provider can still emit deltas
                    // for the response it's cancelling before it
                    // confirms cancellation, and those must not reach
                    // the PBX leg. Park is lifted by the next response's
                    // first AgentAudioDelta.
                    pacer_tx.send(PacerCommand::Drain).await.ok();
                    pacer_tx.send(PacerCommand::Park).await.ok();
                    adapter.request_cancel().await.ok();
                }
            }
            NeutralEvent::UserSpeechStopped => {
                call.lock().transition(TurnState::AgentThinking);
            }
            NeutralEvent::AgentAudioDelta(pcm) => {
                {
                    let mut call = call.lock();
                    if call.turn_state != TurnState::AgentSpeaking {
                        call.transition(TurnState::AgentSpeaking);
                    }
                }
                pacer_tx.send(PacerCommand::Emit(pcm)).await.ok();
            }
            NeutralEvent::AgentTextDelta(text) => {
                let call_id = call.lock().call_id.clone();
                let payload = serde_json::json!({ "type": "agent_text_delta", "text": text }).to_string();
                if let Err(err) = deps.kv.append_event(&call_id, &payload).await {
                    warn!(call_id = %call_id, error = %err, "failed to append agent text delta to transcript sink");
                }
            }
            NeutralEvent::UserTranscript { text, is_final } => {
                let call_id = call.lock().call_id.clone();
                let payload =
                    serde_json::json!({ "type": "user_transcript", "text": text, "is_final": is_final }).to_string();
                if let Err(err) = deps.kv.append_event(&call_id, &payload).await {
                    warn!(call_id = %call_id, error = %err, "failed to append user transcript to transcript sink");
                }
            }
            NeutralEvent::ToolCallRequested { call_id: tool_call_id, name, arguments } => {
                let call_id = call.lock().call_id.clone();
                call.lock().transition(TurnState::ToolRunning);
                deps.metrics.tool_calls_total.inc();
                let dispatch_result = deps.tool_registry.dispatch(&call_id, &name, arguments).await;
                let payload = match dispatch_result {
                    Ok(value) => value,
                    Err(err) => serde_json::json!({ "error": err.to_string() }),
                };
                adapter.send_tool_result(tool_call_id, payload).await.ok();
            }
            NeutralEvent::ResponseDone { usage, .. } => {
                if let Some(usage) = usage {
                    accumulated_cost.input_tokens += usage.input_tokens;
                    accumulated_cost.output_tokens += usage.output_tokens;
                    accumulated_cost.cached_tokens += usage.cached_tokens;
                    accumulated_cost.billed_units += usage.billed_units;
                    accumulated_cost.usd_estimate_millicents += usage.usd_estimate_millicents;
                }
                let mut call = call.lock();
                call.greeting_done = true;
                call.transition(TurnState::Idle);
            }
            NeutralEvent::ProviderError { kind, message, fatal } => {
                let error = classify_provider_error(&kind, message);
                if error.should_reconnect() {
                    warn!(%kind, "provider transport error, attempting reconnect");
                    match tokio::time::timeout(RECONNECT_WINDOW, reconnect_adapter(&deps, &agent)).await {
                        Ok(Ok((new_adapter, new_event_rx))) => {
                            deps.circuit_breaker.record_handshake_success(agent.provider);
                            deps.metrics.provider_reconnects_total.inc();
                            *adapter_cell.lock() = new_adapter;
                            event_rx = new_event_rx;
                            continue;
                        }
                        Ok(Err(err)) => {
                            deps.circuit_breaker.record_handshake_failure(agent.provider);
                            warn!(error = %err, "reconnect attempt failed, ending call");
                            break Err(error.into());
                        }
                        Err(_) => {
                            deps.circuit_breaker.record_handshake_failure(agent.provider);
                            warn!("reconnect attempt did not land within the 2s window, ending call");
                            break Err(error.into());
                        }
                    }
                }
                if fatal || error.is_fatal() {
                    break Err(error.into());
                }
            }
        }
    };
    cancellation.cancel();
    result.map(|()| accumulated_cost)
}

/// Opens a fresh provider session from scratch (new adapter, new
/// `session.update`-equivalent, new greeting policy) after a transport
/// drop. Reuses the same agent configuration the call started with.
async fn reconnect_adapter(
    deps: &Arc<SessionDeps>,
    agent: &AgentConfig,
) -> anyhow::Result<(Arc<dyn ProviderAdapter>, mpsc::Receiver<NeutralEvent>)> {
    let api_key = deps
        .api_keys
        .key_for(agent.provider)
        .ok_or_else(|| anyhow::anyhow!("no api key configured for provider {}", agent.provider.as_str()))?;
    let mut adapter = provider::create_adapter(agent.provider, api_key)?;
    let event_rx = adapter.open(agent).await?;
    Ok((Arc::from(adapter), event_rx))
}

/// Maps a provider's loosely-typed error `kind` string onto the bridge's
/// own error taxonomy, so the session driver can apply a recovery rule
/// per kind instead of treating every fatal provider error the same.
fn classify_provider_error(kind: &str, message: String) -> BridgeError {
    match kind {
        "handshake" => BridgeError::ProviderHandshakeFailed(message),
        "transport" => BridgeError::ProviderTransportError(message),
        "rate_limit" => BridgeError::ProviderRateLimit(message),
        _ => BridgeError::ProviderRateLimit(message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AgentConfig, ProviderKind};

    #[test]
    fn greeting_not_done_on_fresh_call() {
        let agent = AgentConfig {
            agent_id: "a1".into(),
            provider: ProviderKind::OpenAi,
            voice: "alloy".into(),
            instructions: "hi".into(),
            language: "en".into(),
            tools: vec![],
            greeting: Some("hello!".into()),
        };
        let call = Call::new("c1".into(), agent);
        assert!(!call.greeting_done);
    }

    #[test]
    fn classify_transport_error_should_reconnect() {
        let error = classify_provider_error("transport", "socket reset".into());
        assert!(error.should_reconnect());
        assert!(!error.is_fatal());
    }

    #[test]
    fn classify_rate_limit_is_fatal() {
        let error = classify_provider_error("rate_limit", "429".into());
        assert!(error.is_fatal());
        assert!(!error.should_reconnect());
    }
}

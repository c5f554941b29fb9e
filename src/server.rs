//! Accept loop: binds the PBX-facing TCP listener and spawns one
//! `CallSession` per accepted connection, bounded by a semaphore so a
//! flood of connections can't unbounded-spawn tasks.

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::session::{ApiKeys, SessionDeps};

pub async fn serve(config: Config) -> anyhow::Result<()> {
    let kv = crate::kv::KvClient::connect(&config.kv).await?;
    let deps = Arc::new(SessionDeps {
        tool_registry: Arc::new(crate::tools::ToolRegistry::new(Arc::new(kv.clone()))),
        circuit_breaker: Arc::new(crate::circuit_breaker::CircuitBreaker::new(
            config.circuit_breaker.failure_threshold,
            std::time::Duration::from_secs(config.circuit_breaker.window_secs),
            std::time::Duration::from_secs(config.circuit_breaker.cooldown_secs),
        )),
        metrics: Arc::new(crate::metrics::Metrics::new()),
        kv,
        api_keys: ApiKeys {
            openai: config.providers.openai_api_key.clone(),
            xai: config.providers.xai_api_key.clone(),
            gemini: config.providers.gemini_api_key.clone(),
            ultravox: config.providers.ultravox_api_key.clone(),
        },
    });

    let listener = TcpListener::bind(&config.bridge.bind_addr).await?;
    info!(addr = %config.bridge.bind_addr, "voicebridge listening");

    let permits = Arc::new(Semaphore::new(config.bridge.max_concurrent_calls));

    loop {
        let (socket, peer_addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                warn!(error = %err, "accept failed");
                continue;
            }
        };

        let permit = match permits.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                warn!(%peer_addr, "max concurrent calls reached, rejecting connection");
                drop(socket);
                continue;
            }
        };

        let deps = deps.clone();
        tokio::spawn(async move {
            let _permit = permit;
            if let Err(err) = crate::session::run_call(socket, deps).await {
                error!(%peer_addr, error = %err, "call session failed");
            }
        });
    }
}

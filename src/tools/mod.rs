//! Tool dispatcher: routes a provider's `ToolCallRequested` event to a
//! built-in handler or an external HTTP tool, with a 5s hard timeout per
//! invocation.

pub mod builtin;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::errors::BridgeError;
use crate::kv::KvClient;

pub const TOOL_TIMEOUT: Duration = Duration::from_secs(5);

#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn invoke(&self, call_id: &str, arguments: Value) -> Result<Value, BridgeError>;
}

/// Persistence seam for built-ins that write a survey answer, appointment,
/// lead, or callback to the external data store. `KvClient` is the
/// production implementation; tests substitute `NullDataStore`.
#[async_trait]
pub trait ToolDataStore: Send + Sync {
    async fn save_tool_result(&self, call_id: &str, tool: &str, payload: &Value) -> Result<(), BridgeError>;
}

#[async_trait]
impl ToolDataStore for KvClient {
    async fn save_tool_result(&self, call_id: &str, tool: &str, payload: &Value) -> Result<(), BridgeError> {
        self.append_tool_result(call_id, tool, &payload.to_string())
            .await
            .map_err(|e| BridgeError::ToolError(e.to_string()))
    }
}

/// External tool backed by an HTTP endpoint, dispatched with `reqwest`.
pub struct HttpTool {
    pub url: String,
    client: reqwest::Client,
}

impl HttpTool {
    pub fn new(url: String) -> Self {
        Self { url, client: reqwest::Client::new() }
    }
}

#[async_trait]
impl ToolHandler for HttpTool {
    async fn invoke(&self, _call_id: &str, arguments: Value) -> Result<Value, BridgeError> {
        let response = self
            .client
            .post(&self.url)
            .json(&arguments)
            .send()
            .await
            .map_err(|e| BridgeError::ToolError(e.to_string()))?;
        response
            .json::<Value>()
            .await
            .map_err(|e| BridgeError::ToolError(e.to_string()))
    }
}

/// Process-wide registry of named tool handlers, initialized once at
/// startup with the built-ins plus any configured external tools.
pub struct ToolRegistry {
    handlers: HashMap<String, Arc<dyn ToolHandler>>,
}

impl ToolRegistry {
    pub fn new(data_store: Arc<dyn ToolDataStore>) -> Self {
        let mut handlers: HashMap<String, Arc<dyn ToolHandler>> = HashMap::new();
        handlers.insert("end_call".to_string(), Arc::new(builtin::EndCall));
        handlers.insert("transfer_to_human".to_string(), Arc::new(builtin::TransferToHuman));
        handlers.insert(
            "save_answer".to_string(),
            Arc::new(builtin::SaveAnswer { data_store: data_store.clone() }),
        );
        handlers.insert(
            "confirm_appointment".to_string(),
            Arc::new(builtin::ConfirmAppointment { data_store: data_store.clone() }),
        );
        handlers.insert(
            "capture_lead".to_string(),
            Arc::new(builtin::CaptureLead { data_store: data_store.clone() }),
        );
        handlers.insert("search_documents".to_string(), Arc::new(builtin::SearchDocuments));
        handlers.insert(
            "schedule_callback".to_string(),
            Arc::new(builtin::ScheduleCallback { data_store }),
        );
        Self { handlers }
    }

    pub fn register_external(&mut self, name: String, url: String) {
        self.handlers.insert(name, Arc::new(HttpTool::new(url)));
    }

    /// Dispatches `name` with `arguments`, enforcing the 5s hard timeout
    /// and mapping an unknown tool name to `BridgeError::ToolUnknown`.
    pub async fn dispatch(&self, call_id: &str, name: &str, arguments: Value) -> Result<Value, BridgeError> {
        let handler = self
            .handlers
            .get(name)
            .ok_or_else(|| BridgeError::ToolUnknown(name.to_string()))?
            .clone();
        match tokio::time::timeout(TOOL_TIMEOUT, handler.invoke(call_id, arguments)).await {
            Ok(result) => result,
            Err(_) => Err(BridgeError::ToolTimeout(name.to_string())),
        }
    }
}

/// Data store that discards every write; used wherever a `ToolRegistry`
/// is built without a live KV connection.
#[cfg(test)]
pub(crate) struct NullDataStore;

#[cfg(test)]
#[async_trait]
impl ToolDataStore for NullDataStore {
    async fn save_tool_result(&self, _call_id: &str, _tool: &str, _payload: &Value) -> Result<(), BridgeError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unknown_tool_maps_to_tool_unknown() {
        let registry = ToolRegistry::new(Arc::new(NullDataStore));
        let err = registry.dispatch("c1", "does_not_exist", Value::Null).await.unwrap_err();
        assert!(matches!(err, BridgeError::ToolUnknown(name) if name == "does_not_exist"));
    }

    #[tokio::test]
    async fn end_call_dispatches_successfully() {
        let registry = ToolRegistry::new(Arc::new(NullDataStore));
        let result = registry.dispatch("c1", "end_call", serde_json::json!({"reason": "done"})).await;
        assert!(result.is_ok());
    }

    struct SlowTool;

    #[async_trait]
    impl ToolHandler for SlowTool {
        async fn invoke(&self, _call_id: &str, _arguments: Value) -> Result<Value, BridgeError> {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(Value::Null)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn slow_tool_times_out() {
        let mut registry = ToolRegistry::new(Arc::new(NullDataStore));
        registry.handlers.insert("slow".to_string(), Arc::new(SlowTool));
        let dispatch = registry.dispatch("c1", "slow", Value::Null);
        tokio::pin!(dispatch);
        tokio::time::advance(Duration::from_secs(6)).await;
        let err = dispatch.await.unwrap_err();
        assert!(matches!(err, BridgeError::ToolTimeout(name) if name == "slow"));
    }
}

//! Built-in tool handlers available to every agent without external
//! configuration.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::errors::BridgeError;
use crate::tools::{ToolDataStore, ToolHandler};

pub struct EndCall;

#[async_trait]
impl ToolHandler for EndCall {
    async fn invoke(&self, _call_id: &str, arguments: Value) -> Result<Value, BridgeError> {
        let reason = arguments.get("reason").and_then(Value::as_str).unwrap_or("agent_requested");
        Ok(json!({ "status": "ending", "reason": reason }))
    }
}

pub struct TransferToHuman;

#[async_trait]
impl ToolHandler for TransferToHuman {
    async fn invoke(&self, _call_id: &str, arguments: Value) -> Result<Value, BridgeError> {
        let destination = arguments
            .get("destination")
            .and_then(Value::as_str)
            .ok_or_else(|| BridgeError::ToolError("transfer_to_human requires destination".to_string()))?;
        Ok(json!({ "status": "transferring", "destination": destination }))
    }
}

pub struct SaveAnswer {
    pub data_store: Arc<dyn ToolDataStore>,
}

#[async_trait]
impl ToolHandler for SaveAnswer {
    async fn invoke(&self, call_id: &str, arguments: Value) -> Result<Value, BridgeError> {
        let question = arguments.get("question").and_then(Value::as_str).unwrap_or("");
        let answer = arguments.get("answer").and_then(Value::as_str).unwrap_or("");
        let payload = json!({ "question": question, "answer": answer });
        self.data_store.save_tool_result(call_id, "save_answer", &payload).await?;
        Ok(json!({ "status": "saved", "question": question, "answer": answer }))
    }
}

pub struct ConfirmAppointment {
    pub data_store: Arc<dyn ToolDataStore>,
}

#[async_trait]
impl ToolHandler for ConfirmAppointment {
    async fn invoke(&self, call_id: &str, arguments: Value) -> Result<Value, BridgeError> {
        let slot = arguments
            .get("slot")
            .and_then(Value::as_str)
            .ok_or_else(|| BridgeError::ToolError("confirm_appointment requires slot".to_string()))?;
        let payload = json!({ "slot": slot });
        self.data_store.save_tool_result(call_id, "confirm_appointment", &payload).await?;
        Ok(json!({ "status": "confirmed", "slot": slot }))
    }
}

pub struct CaptureLead {
    pub data_store: Arc<dyn ToolDataStore>,
}

#[async_trait]
impl ToolHandler for CaptureLead {
    async fn invoke(&self, call_id: &str, arguments: Value) -> Result<Value, BridgeError> {
        self.data_store.save_tool_result(call_id, "capture_lead", &arguments).await?;
        Ok(json!({ "status": "captured", "lead": arguments }))
    }
}

pub struct SearchDocuments;

#[async_trait]
impl ToolHandler for SearchDocuments {
    async fn invoke(&self, _call_id: &str, arguments: Value) -> Result<Value, BridgeError> {
        let query = arguments
            .get("query")
            .and_then(Value::as_str)
            .ok_or_else(|| BridgeError::ToolError("search_documents requires query".to_string()))?;
        Ok(json!({ "status": "ok", "query": query, "results": [] }))
    }
}

pub struct ScheduleCallback {
    pub data_store: Arc<dyn ToolDataStore>,
}

#[async_trait]
impl ToolHandler for ScheduleCallback {
    async fn invoke(&self, call_id: &str, arguments: Value) -> Result<Value, BridgeError> {
        let when = arguments
            .get("when")
            .and_then(Value::as_str)
            .ok_or_else(|| BridgeError::ToolError("schedule_callback requires when".to_string()))?;
        let payload = json!({ "when": when });
        self.data_store.save_tool_result(call_id, "schedule_callback", &payload).await?;
        Ok(json!({ "status": "scheduled", "when": when }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::NullDataStore;

    #[tokio::test]
    async fn end_call_defaults_reason() {
        let result = EndCall.invoke("c1", json!({})).await.unwrap();
        assert_eq!(result["reason"], "agent_requested");
    }

    #[tokio::test]
    async fn transfer_requires_destination() {
        let err = TransferToHuman.invoke("c1", json!({})).await.unwrap_err();
        assert!(matches!(err, BridgeError::ToolError(_)));
    }

    #[tokio::test]
    async fn confirm_appointment_requires_slot() {
        let handler = ConfirmAppointment { data_store: Arc::new(NullDataStore) };
        let err = handler.invoke("c1", json!({})).await.unwrap_err();
        assert!(matches!(err, BridgeError::ToolError(_)));
    }

    #[tokio::test]
    async fn save_answer_persists_and_returns_status() {
        let handler = SaveAnswer { data_store: Arc::new(NullDataStore) };
        let result = handler
            .invoke("c1", json!({ "question": "favorite color?", "answer": "blue" }))
            .await
            .unwrap();
        assert_eq!(result["status"], "saved");
        assert_eq!(result["answer"], "blue");
    }
}

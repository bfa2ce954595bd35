//! Messages, subscriptions and publish receipts.

use crate::error::HandlerError;
use chrono::{DateTime, Utc};
use mesh_store::{ContextRecord, ContextType, SyncStatus};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;

/// A unit of shared situational context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextMessage {
    /// Store-assigned id, empty until persisted
    #[serde(default)]
    pub id: String,

    /// Producing module
    pub module_name: String,

    pub context_type: ContextType,

    #[serde(default)]
    pub context_data: Map<String, Value>,

    /// Stamped by the mesh on publish when absent
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,

    #[serde(default)]
    pub source: String,

    #[serde(default)]
    pub sync_status: SyncStatus,
}

impl ContextMessage {
    pub fn new(module_name: impl Into<String>, context_type: ContextType) -> Self {
        let module_name = module_name.into();
        Self {
            id: String::new(),
            source: module_name.clone(),
            module_name,
            context_type,
            context_data: Map::new(),
            timestamp: None,
            sync_status: SyncStatus::Pending,
        }
    }

    /// Replace the payload. Non-object values land under `"value"`.
    pub fn with_data(mut self, data: Value) -> Self {
        self.context_data = match data {
            Value::Object(map) => map,
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.context_data.insert(key.into(), value.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Read a payload field.
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.context_data.get(key)
    }

    /// Convert to a storage record. A missing timestamp takes the current time.
    pub fn to_record(&self) -> ContextRecord {
        ContextRecord {
            id: self.id.clone(),
            module_name: self.module_name.clone(),
            context_type: self.context_type,
            context_data: Value::Object(self.context_data.clone()),
            timestamp: self.timestamp.unwrap_or_else(Utc::now),
            source: self.source.clone(),
            sync_status: self.sync_status,
        }
    }

    pub fn from_record(record: ContextRecord) -> Self {
        let context_data = match record.context_data {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        Self {
            id: record.id,
            module_name: record.module_name,
            context_type: record.context_type,
            context_data,
            timestamp: Some(record.timestamp),
            source: record.source,
            sync_status: record.sync_status,
        }
    }
}

/// Receives fanned-out context messages.
///
/// Handlers run synchronously on the publisher's call stack, so they should
/// not block. Errors and panics are isolated per handler.
pub trait ContextHandler: Send + Sync {
    fn handle(&self, message: &ContextMessage) -> Result<(), HandlerError>;
}

impl<F> ContextHandler for F
where
    F: Fn(&ContextMessage) -> Result<(), HandlerError> + Send + Sync,
{
    fn handle(&self, message: &ContextMessage) -> Result<(), HandlerError> {
        self(message)
    }
}

/// A request to receive messages of the listed context types.
#[derive(Clone)]
pub struct ContextSubscription {
    pub module_name: String,
    pub context_types: Vec<ContextType>,
    pub handler: Arc<dyn ContextHandler>,
}

impl ContextSubscription {
    pub fn new(
        module_name: impl Into<String>,
        context_types: impl IntoIterator<Item = ContextType>,
        handler: impl ContextHandler + 'static,
    ) -> Self {
        Self {
            module_name: module_name.into(),
            context_types: context_types.into_iter().collect(),
            handler: Arc::new(handler),
        }
    }

    /// Subscribe a closure.
    pub fn from_fn<F>(
        module_name: impl Into<String>,
        context_types: impl IntoIterator<Item = ContextType>,
        handler: F,
    ) -> Self
    where
        F: Fn(&ContextMessage) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        Self::new(module_name, context_types, handler)
    }
}

impl fmt::Debug for ContextSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextSubscription")
            .field("module_name", &self.module_name)
            .field("context_types", &self.context_types)
            .finish_non_exhaustive()
    }
}

/// Opaque subscription handle.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(String);

impl SubscriptionId {
    pub(crate) fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A handler that failed during fan-out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandlerFault {
    pub subscription_id: SubscriptionId,
    /// Subscriber module
    pub module_name: String,
    pub error: String,
}

/// Outcome of a publish.
#[derive(Debug, Clone)]
pub struct PublishReceipt {
    /// The message as delivered, with its timestamp filled in
    pub message: ContextMessage,
    /// Handlers that returned normally
    pub delivered: usize,
    pub faults: Vec<HandlerFault>,
}

impl PublishReceipt {
    pub fn is_clean(&self) -> bool {
        self.faults.is_empty()
    }
}

/// Where durable writes currently go.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeshMode {
    /// Durable store reachable
    Remote,
    /// Local tiered persistence
    Local,
}

impl MeshMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Remote => "remote",
            Self::Local => "local",
        }
    }
}

impl fmt::Display for MeshMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_builder() {
        let message = ContextMessage::new("navigation", ContextType::Risk)
            .with_data(json!({"vessel": "MV Aurora"}))
            .with_field("cpa_nm", 0.4);

        assert_eq!(message.source, "navigation");
        assert_eq!(message.field("vessel"), Some(&json!("MV Aurora")));
        assert_eq!(message.field("cpa_nm"), Some(&json!(0.4)));
        assert_eq!(message.sync_status, SyncStatus::Pending);
        assert!(message.timestamp.is_none());
    }

    #[test]
    fn test_scalar_payload_wrapped() {
        let message = ContextMessage::new("weather", ContextType::Telemetry).with_data(json!(17.5));
        assert_eq!(message.field("value"), Some(&json!(17.5)));
    }

    #[test]
    fn test_record_conversion_keeps_payload() {
        let stamp = Utc::now();
        let message = ContextMessage::new("berth", ContextType::Mission)
            .with_field("berth", "B4")
            .with_timestamp(stamp);

        let restored = ContextMessage::from_record(message.to_record());
        assert_eq!(restored.context_data, message.context_data);
        assert_eq!(restored.timestamp, Some(stamp));
        assert_eq!(restored.module_name, "berth");
    }
}

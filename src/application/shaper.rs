use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::domain::{ChangeNotification, EntityType};
use crate::infrastructure::crm::{CrmError, CrmRecord};
use crate::infrastructure::schema::SchemaId;

/// CRM record field holding the cross-system correlation identifier.
pub const CORRELATION_FIELD: &str = "Uuid";

/// A shaped, action-specific payload ready for serialization, tagged with
/// the schema that governs it.
#[derive(Debug, Clone)]
pub struct ShapedEvent {
    pub schema: SchemaId,
    pub payload: Value,
}

#[derive(Debug, Error)]
pub enum ShapeError {
    #[error("change notification carries no record id for {action}")]
    MissingRecordId { action: String },
    #[error("no correlation id recoverable for {object} record {record_id}")]
    CorrelationMissing {
        object: &'static str,
        record_id: String,
    },
    #[error("lookup of {object} {record_id} failed: {source}")]
    Lookup {
        object: &'static str,
        record_id: String,
        #[source]
        source: CrmError,
    },
    #[error("correlation write-back to {object} {record_id} failed: {source}")]
    WriteBack {
        object: &'static str,
        record_id: String,
        #[source]
        source: CrmError,
    },
}

/// Per-entity shaping policy: turns a change notification (plus freshly
/// retrieved CRM state where the action needs it) into a canonical payload.
///
/// `Ok(None)` is a deliberate no-op (unhandled action, unsupported UPDATE);
/// `Err` aborts the action so the dispatcher can log and drop. A shaper
/// never returns a partial payload.
#[async_trait]
pub trait Shaper: Send + Sync {
    fn entity(&self) -> EntityType;

    async fn shape(
        &self,
        notification: &ChangeNotification,
    ) -> Result<Option<ShapedEvent>, ShapeError>;
}

/// First affected record id; record-bound actions cannot proceed without one.
pub fn require_record_id<'a>(
    notification: &'a ChangeNotification,
) -> Result<&'a str, ShapeError> {
    notification
        .record_id()
        .ok_or_else(|| ShapeError::MissingRecordId {
            action: notification.header.change_type.to_string(),
        })
}

/// Scalar field rendered as wire text; absent and non-scalar values default
/// to the empty string.
pub fn text(fields: &Map<String, Value>, name: &str) -> String {
    match fields.get(name) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::Bool(b)) => b.to_string(),
        _ => String::new(),
    }
}

/// Correlation id stored on a CRM record, if one was ever assigned.
pub fn correlation_of(record: &CrmRecord) -> Option<String> {
    record
        .get(CORRELATION_FIELD)
        .and_then(Value::as_str)
        .filter(|uuid| !uuid.is_empty())
        .map(str::to_string)
}

/// Wall-clock action timestamp in the wire's millisecond ISO form.
pub fn time_of_action() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

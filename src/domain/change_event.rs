use serde::de::Deserializer;
use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;

/// Action carried by a CDC change notification.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ChangeType {
    Create,
    Update,
    Delete,
    Undelete,
    /// Anything the bridge does not handle (GAP_CREATE, GAP_UPDATE, ...).
    Other(String),
}

impl ChangeType {
    pub fn as_str(&self) -> &str {
        match self {
            ChangeType::Create => "CREATE",
            ChangeType::Update => "UPDATE",
            ChangeType::Delete => "DELETE",
            ChangeType::Undelete => "UNDELETE",
            ChangeType::Other(raw) => raw.as_str(),
        }
    }

    /// Actions that operate on an existing record and therefore require an id.
    pub fn requires_record_id(&self) -> bool {
        matches!(
            self,
            ChangeType::Create | ChangeType::Update | ChangeType::Delete | ChangeType::Undelete
        )
    }
}

impl std::fmt::Display for ChangeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for ChangeType {
    fn from(raw: &str) -> Self {
        match raw {
            "CREATE" => ChangeType::Create,
            "UPDATE" => ChangeType::Update,
            "DELETE" => ChangeType::Delete,
            "UNDELETE" => ChangeType::Undelete,
            other => ChangeType::Other(other.to_string()),
        }
    }
}

impl<'de> Deserialize<'de> for ChangeType {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Ok(ChangeType::from(raw.as_str()))
    }
}

/// Header of a CDC change notification as emitted by the CRM platform.
#[derive(Debug, Clone, Deserialize)]
pub struct ChangeEventHeader {
    #[serde(rename = "changeType")]
    pub change_type: ChangeType,
    #[serde(rename = "changeOrigin", default)]
    pub change_origin: String,
    #[serde(rename = "recordIds", default)]
    pub record_ids: Vec<String>,
}

#[derive(Debug, Error)]
pub enum ChangeEventError {
    #[error("notification has no payload object")]
    MissingPayload,
    #[error("notification has no ChangeEventHeader")]
    MissingHeader,
    #[error("malformed ChangeEventHeader: {0}")]
    MalformedHeader(#[source] serde_json::Error),
}

/// A received CRM change notification: the parsed header plus the snapshot of
/// changed fields. Constructed per notification, discarded after shaping.
#[derive(Debug, Clone)]
pub struct ChangeNotification {
    pub header: ChangeEventHeader,
    pub fields: Map<String, Value>,
}

impl ChangeNotification {
    /// Parses the raw wire shape
    /// `{ payload: { ChangeEventHeader: {...}, ...entityFields } }`.
    pub fn from_raw(raw: &Value) -> Result<Self, ChangeEventError> {
        let payload = raw
            .get("payload")
            .and_then(Value::as_object)
            .ok_or(ChangeEventError::MissingPayload)?;

        let header_value = payload
            .get("ChangeEventHeader")
            .ok_or(ChangeEventError::MissingHeader)?;
        let header: ChangeEventHeader = serde_json::from_value(header_value.clone())
            .map_err(ChangeEventError::MalformedHeader)?;

        let mut fields = payload.clone();
        fields.remove("ChangeEventHeader");

        Ok(Self { header, fields })
    }

    /// First affected record id, if any.
    pub fn record_id(&self) -> Option<&str> {
        self.header.record_ids.first().map(String::as_str)
    }

    /// Changed field as a string; `None` when absent or not scalar.
    pub fn field_str(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(Value::as_str)
    }
}

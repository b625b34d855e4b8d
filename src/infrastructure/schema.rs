use once_cell::sync::Lazy;
use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;

use crate::domain::{ChangeType, EntityType};
use crate::infrastructure::xml;

/// Identity of a wire document schema. Shapers and reconcilers never deal
/// in schema storage locations; every document is tagged with one of these
/// and resolved through the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SchemaId {
    UserCreate,
    UserUpdate,
    UserDelete,
    EventCreate,
    EventUpdate,
    EventDelete,
    /// Full-roster snapshot emitted by event participation shaping.
    EventRoster,
    SessionCreate,
    SessionUpdate,
    SessionDelete,
    /// Full-roster snapshot emitted by session participation shaping.
    SessionRoster,
    /// Operational log side channel.
    OpsLog,
}

impl SchemaId {
    /// Schema governing the outbound document for `(entity, action)`.
    /// Participation changes always surface as roster snapshots.
    pub fn for_change(entity: EntityType, action: &ChangeType) -> Option<SchemaId> {
        use ChangeType::*;
        use EntityType::*;
        match (entity, action) {
            (Contact, Create) => Some(SchemaId::UserCreate),
            (Contact, Update) => Some(SchemaId::UserUpdate),
            (Contact, Delete) => Some(SchemaId::UserDelete),
            (Event, Create) => Some(SchemaId::EventCreate),
            (Event, Update) => Some(SchemaId::EventUpdate),
            (Event, Delete) => Some(SchemaId::EventDelete),
            (EventParticipation, Create | Delete | Undelete) => Some(SchemaId::EventRoster),
            (Session, Create) => Some(SchemaId::SessionCreate),
            (Session, Update) => Some(SchemaId::SessionUpdate),
            (Session, Delete) => Some(SchemaId::SessionDelete),
            (SessionParticipation, Create | Delete | Undelete) => Some(SchemaId::SessionRoster),
            _ => None,
        }
    }
}

/// Declarative definition of one wire document shape. `required` children
/// must be present (they may be empty); `optional` children are known but
/// not mandatory.
#[derive(Debug, Clone)]
pub struct SchemaDefinition {
    pub root: &'static str,
    pub required: &'static [&'static str],
    pub optional: &'static [&'static str],
}

impl SchemaDefinition {
    /// All children the schema knows about.
    pub fn known_fields(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.required.iter().chain(self.optional.iter()).copied()
    }
}

static REGISTRY: Lazy<HashMap<SchemaId, SchemaDefinition>> = Lazy::new(|| {
    let mut registry = HashMap::new();
    registry.insert(
        SchemaId::UserCreate,
        SchemaDefinition {
            root: "UserMessage",
            required: &[
                "ActionType",
                "UUID",
                "TimeOfAction",
                "FirstName",
                "LastName",
                "EmailAddress",
            ],
            optional: &["EncryptedPassword", "PhoneNumber", "Business"],
        },
    );
    registry.insert(
        SchemaId::UserUpdate,
        SchemaDefinition {
            root: "UserMessage",
            required: &[
                "ActionType",
                "UUID",
                "TimeOfAction",
                "FirstName",
                "LastName",
                "EmailAddress",
            ],
            optional: &["EncryptedPassword", "PhoneNumber", "Business"],
        },
    );
    registry.insert(
        SchemaId::UserDelete,
        SchemaDefinition {
            root: "UserMessage",
            required: &["ActionType", "UUID", "TimeOfAction"],
            optional: &[],
        },
    );
    registry.insert(
        SchemaId::EventCreate,
        SchemaDefinition {
            root: "CreateEvent",
            required: &["EventUUID", "EventName"],
            optional: &[
                "EventDescription",
                "StartDateTime",
                "EndDateTime",
                "EventLocation",
                "Organisator",
                "Capacity",
                "EventType",
                "RegisteredUsers",
            ],
        },
    );
    registry.insert(
        SchemaId::EventUpdate,
        SchemaDefinition {
            root: "UpdateEvent",
            required: &["EventUUID"],
            optional: &[
                "EventName",
                "EventDescription",
                "StartDateTime",
                "EndDateTime",
                "EventLocation",
                "Organisator",
                "Capacity",
                "EventType",
                "RegisteredUsers",
            ],
        },
    );
    registry.insert(
        SchemaId::EventDelete,
        SchemaDefinition {
            root: "DeleteEvent",
            required: &["ActionType", "EventUUID", "TimeOfAction"],
            optional: &[],
        },
    );
    registry.insert(
        SchemaId::EventRoster,
        SchemaDefinition {
            root: "UpdateEvent",
            required: &["EventUUID", "RegisteredUsers"],
            optional: &[],
        },
    );
    registry.insert(
        SchemaId::SessionCreate,
        SchemaDefinition {
            root: "CreateSession",
            required: &["SessionUUID", "EventUUID", "SessionName"],
            optional: &[
                "SessionDescription",
                "GuestSpeakers",
                "Capacity",
                "StartDateTime",
                "EndDateTime",
                "SessionLocation",
                "SessionType",
                "RegisteredUsers",
            ],
        },
    );
    registry.insert(
        SchemaId::SessionUpdate,
        SchemaDefinition {
            root: "UpdateSession",
            required: &["SessionUUID", "FieldsToUpdate"],
            optional: &[],
        },
    );
    registry.insert(
        SchemaId::SessionDelete,
        SchemaDefinition {
            root: "DeleteSession",
            required: &["ActionType", "SessionUUID", "TimeOfAction"],
            optional: &[],
        },
    );
    registry.insert(
        SchemaId::SessionRoster,
        SchemaDefinition {
            root: "UpdateSession",
            required: &["SessionUUID", "EventUUID", "RegisteredUsers"],
            optional: &[],
        },
    );
    registry.insert(
        SchemaId::OpsLog,
        SchemaDefinition {
            root: "Log",
            required: &["ServiceName", "Status", "Code", "Message"],
            optional: &[],
        },
    );
    registry
});

pub fn definition(schema: SchemaId) -> &'static SchemaDefinition {
    // Every variant is registered above; a miss is a construction bug.
    REGISTRY
        .get(&schema)
        .unwrap_or_else(|| panic!("schema {schema:?} missing from registry"))
}

#[derive(Debug, Error)]
pub enum SchemaViolation {
    #[error("document is not well-formed: {0}")]
    Malformed(String),
    #[error("root element mismatch: expected <{expected}>, found <{found}>")]
    RootMismatch {
        expected: &'static str,
        found: String,
    },
    #[error("schema-required fields missing: {}", missing.join(", "))]
    MissingFields { missing: Vec<String> },
}

/// Validates serialized wire bytes against a schema. Callers must pass the
/// exact bytes they intend to publish.
pub fn validate(schema: SchemaId, document: &[u8]) -> Result<(), SchemaViolation> {
    let text = std::str::from_utf8(document)
        .map_err(|e| SchemaViolation::Malformed(e.to_string()))?;
    let (root, tree) = xml::xml_to_json(text).map_err(|e| SchemaViolation::Malformed(e.to_string()))?;

    let def = definition(schema);
    if root != def.root {
        return Err(SchemaViolation::RootMismatch {
            expected: def.root,
            found: root,
        });
    }

    let fields = match &tree {
        Value::Object(fields) => fields,
        // A childless root can only satisfy a schema with no requirements.
        _ if def.required.is_empty() => return Ok(()),
        _ => {
            return Err(SchemaViolation::MissingFields {
                missing: def.required.iter().map(|f| f.to_string()).collect(),
            })
        }
    };

    let missing: Vec<String> = def
        .required
        .iter()
        .filter(|name| !fields.contains_key(**name))
        .map(|name| name.to_string())
        .collect();
    if !missing.is_empty() {
        return Err(SchemaViolation::MissingFields { missing });
    }
    Ok(())
}

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::{info, warn};

use crate::application::shaper::{
    correlation_of, require_record_id, text, ShapeError, ShapedEvent, Shaper,
};
use crate::domain::{ChangeNotification, ChangeType, EntityType};
use crate::infrastructure::crm::{CrmClient, CrmRecord, Query};
use crate::infrastructure::schema::SchemaId;

/// Shapes EventParticipation changes. Like session membership, every change
/// surfaces as a full roster snapshot, here as an `UpdateEvent` document on
/// the event exchange.
pub struct EventParticipationShaper {
    crm: Arc<dyn CrmClient>,
}

impl EventParticipationShaper {
    pub fn new(crm: Arc<dyn CrmClient>) -> Self {
        Self { crm }
    }

    /// Re-queries every live participation of the event; members travel as
    /// `User/UUID` entries.
    async fn roster(&self, event_id: &str, event_uuid: String) -> Result<ShapedEvent, ShapeError> {
        let siblings = self
            .crm
            .query(Query::new("EventParticipation").filter("EventId", event_id))
            .await
            .map_err(|source| ShapeError::Lookup {
                object: "EventParticipation",
                record_id: event_id.to_string(),
                source,
            })?;
        let users: Vec<Value> = siblings
            .iter()
            .map(|row| text(row, "ContactUuid"))
            .filter(|uuid| !uuid.is_empty())
            .map(|uuid| json!({ "UUID": uuid }))
            .collect();

        let payload = json!({
            "EventUUID": event_uuid,
            "RegisteredUsers": { "User": users },
        });
        Ok(ShapedEvent {
            schema: SchemaId::EventRoster,
            payload,
        })
    }

    fn relation_id(
        fields: &Map<String, Value>,
        name: &str,
        record_id: &str,
    ) -> Result<String, ShapeError> {
        let id = text(fields, name);
        if id.is_empty() {
            return Err(ShapeError::CorrelationMissing {
                object: if name == "EventId" { "Event" } else { "Contact" },
                record_id: record_id.to_string(),
            });
        }
        Ok(id)
    }

    async fn shape_create(
        &self,
        notification: &ChangeNotification,
    ) -> Result<Option<ShapedEvent>, ShapeError> {
        let record_id = require_record_id(notification)?;
        let fields = &notification.fields;
        let event_id = Self::relation_id(fields, "EventId", record_id)?;
        let contact_id = Self::relation_id(fields, "ContactId", record_id)?;

        let event = self
            .crm
            .retrieve("Event", &event_id)
            .await
            .map_err(|source| ShapeError::Lookup {
                object: "Event",
                record_id: event_id.clone(),
                source,
            })?;
        let event_uuid = correlation_of(&event).ok_or_else(|| ShapeError::CorrelationMissing {
            object: "Event",
            record_id: event_id.clone(),
        })?;
        let contact = self
            .crm
            .retrieve("Contact", &contact_id)
            .await
            .map_err(|source| ShapeError::Lookup {
                object: "Contact",
                record_id: contact_id.clone(),
                source,
            })?;
        let contact_uuid =
            correlation_of(&contact).ok_or_else(|| ShapeError::CorrelationMissing {
                object: "Contact",
                record_id: contact_id.clone(),
            })?;

        let mut write_back = CrmRecord::new();
        write_back.insert("EventUuid".to_string(), Value::String(event_uuid.clone()));
        write_back.insert("ContactUuid".to_string(), Value::String(contact_uuid));
        let member_name = text(&contact, "LastName");
        write_back.insert(
            "Name".to_string(),
            Value::String(if member_name.is_empty() {
                "-".to_string()
            } else {
                member_name
            }),
        );
        self.crm
            .update("EventParticipation", record_id, write_back)
            .await
            .map_err(|source| ShapeError::WriteBack {
                object: "EventParticipation",
                record_id: record_id.to_string(),
                source,
            })?;
        info!(record_id, %event_uuid, "event participation linked to its correlations");

        self.roster(&event_id, event_uuid).await.map(Some)
    }

    async fn shape_undelete(
        &self,
        notification: &ChangeNotification,
    ) -> Result<Option<ShapedEvent>, ShapeError> {
        let record_id = require_record_id(notification)?;
        // A restored participation still carries the correlations assigned
        // at creation; the notification snapshot is enough.
        let fields = &notification.fields;
        let event_id = Self::relation_id(fields, "EventId", record_id)?;
        let event_uuid = text(fields, "EventUuid");
        if event_uuid.is_empty() {
            return Err(ShapeError::CorrelationMissing {
                object: "Event",
                record_id: record_id.to_string(),
            });
        }
        self.roster(&event_id, event_uuid).await.map(Some)
    }

    async fn shape_delete(
        &self,
        notification: &ChangeNotification,
    ) -> Result<Option<ShapedEvent>, ShapeError> {
        let record_id = require_record_id(notification)?;
        let rows = self
            .crm
            .query(
                Query::new("EventParticipation")
                    .filter("Id", record_id)
                    .include_deleted()
                    .limit(1),
            )
            .await
            .map_err(|source| ShapeError::Lookup {
                object: "EventParticipation",
                record_id: record_id.to_string(),
                source,
            })?;
        let row = rows.first().ok_or_else(|| ShapeError::CorrelationMissing {
            object: "EventParticipation",
            record_id: record_id.to_string(),
        })?;
        let event_id = Self::relation_id(row, "EventId", record_id)?;
        let event_uuid = text(row, "EventUuid");
        if event_uuid.is_empty() {
            return Err(ShapeError::CorrelationMissing {
                object: "Event",
                record_id: record_id.to_string(),
            });
        }
        // The deleted row is gone from the live sibling query; the snapshot
        // already excludes the leaver.
        self.roster(&event_id, event_uuid).await.map(Some)
    }
}

#[async_trait]
impl Shaper for EventParticipationShaper {
    fn entity(&self) -> EntityType {
        EntityType::EventParticipation
    }

    async fn shape(
        &self,
        notification: &ChangeNotification,
    ) -> Result<Option<ShapedEvent>, ShapeError> {
        match &notification.header.change_type {
            ChangeType::Create => self.shape_create(notification).await,
            ChangeType::Delete => self.shape_delete(notification).await,
            ChangeType::Undelete => self.shape_undelete(notification).await,
            ChangeType::Update => {
                warn!("event participation update has no downstream representation");
                Ok(None)
            }
            other => {
                warn!(action = %other, "unhandled event participation action");
                Ok(None)
            }
        }
    }
}

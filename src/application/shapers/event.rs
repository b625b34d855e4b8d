use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::{info, warn};

use crate::application::fields::EVENT_TABLE;
use crate::application::shaper::{
    correlation_of, require_record_id, text, time_of_action, ShapeError, ShapedEvent, Shaper,
    CORRELATION_FIELD,
};
use crate::domain::{ChangeNotification, ChangeType, EntityType};
use crate::infrastructure::correlation::CorrelationGenerator;
use crate::infrastructure::crm::{CrmClient, Query};
use crate::infrastructure::schema::SchemaId;

/// Shapes Event change notifications into Create/Update/DeleteEvent
/// documents.
pub struct EventShaper {
    crm: Arc<dyn CrmClient>,
    correlation: Arc<CorrelationGenerator>,
}

impl EventShaper {
    pub fn new(crm: Arc<dyn CrmClient>, correlation: Arc<CorrelationGenerator>) -> Self {
        Self { crm, correlation }
    }

    /// Wire body built from the declared field table; the same table drives
    /// the inbound direction, so the two cannot drift apart.
    fn mapped(source: &Map<String, Value>) -> Map<String, Value> {
        EVENT_TABLE
            .fields
            .iter()
            .map(|map| (map.wire.to_string(), Value::String(text(source, map.crm))))
            .collect()
    }

    async fn shape_create(
        &self,
        notification: &ChangeNotification,
    ) -> Result<Option<ShapedEvent>, ShapeError> {
        let record_id = require_record_id(notification)?;
        let uuid = self.correlation.generate();

        let mut write_back = Map::new();
        write_back.insert(CORRELATION_FIELD.to_string(), Value::String(uuid.clone()));
        self.crm
            .update("Event", record_id, write_back)
            .await
            .map_err(|source| ShapeError::WriteBack {
                object: "Event",
                record_id: record_id.to_string(),
                source,
            })?;
        info!(record_id, %uuid, "correlation id assigned to event");

        let mut payload = Self::mapped(&notification.fields);
        payload.insert("EventUUID".to_string(), Value::String(uuid));
        Ok(Some(ShapedEvent {
            schema: SchemaId::EventCreate,
            payload: Value::Object(payload),
        }))
    }

    async fn shape_update(
        &self,
        notification: &ChangeNotification,
    ) -> Result<Option<ShapedEvent>, ShapeError> {
        let record_id = require_record_id(notification)?;
        let record = self
            .crm
            .retrieve("Event", record_id)
            .await
            .map_err(|source| ShapeError::Lookup {
                object: "Event",
                record_id: record_id.to_string(),
                source,
            })?;
        let uuid = correlation_of(&record).ok_or_else(|| ShapeError::CorrelationMissing {
            object: "Event",
            record_id: record_id.to_string(),
        })?;

        let mut payload = Self::mapped(&record);
        payload.insert("EventUUID".to_string(), Value::String(uuid));
        Ok(Some(ShapedEvent {
            schema: SchemaId::EventUpdate,
            payload: Value::Object(payload),
        }))
    }

    async fn shape_delete(
        &self,
        notification: &ChangeNotification,
    ) -> Result<Option<ShapedEvent>, ShapeError> {
        let record_id = require_record_id(notification)?;
        let rows = self
            .crm
            .query(
                Query::new("Event")
                    .filter("Id", record_id)
                    .include_deleted()
                    .limit(1),
            )
            .await
            .map_err(|source| ShapeError::Lookup {
                object: "Event",
                record_id: record_id.to_string(),
                source,
            })?;
        let uuid = rows
            .first()
            .and_then(|record| correlation_of(record))
            .ok_or_else(|| ShapeError::CorrelationMissing {
                object: "Event",
                record_id: record_id.to_string(),
            })?;

        let payload = json!({
            "ActionType": "DELETE",
            "EventUUID": uuid,
            "TimeOfAction": time_of_action(),
        });
        Ok(Some(ShapedEvent {
            schema: SchemaId::EventDelete,
            payload,
        }))
    }
}

#[async_trait]
impl Shaper for EventShaper {
    fn entity(&self) -> EntityType {
        EntityType::Event
    }

    async fn shape(
        &self,
        notification: &ChangeNotification,
    ) -> Result<Option<ShapedEvent>, ShapeError> {
        match &notification.header.change_type {
            ChangeType::Create => self.shape_create(notification).await,
            ChangeType::Update => self.shape_update(notification).await,
            ChangeType::Delete => self.shape_delete(notification).await,
            other => {
                warn!(action = %other, "unhandled event action");
                Ok(None)
            }
        }
    }
}

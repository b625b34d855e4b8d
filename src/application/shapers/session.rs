use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::{info, warn};

use crate::application::fields::SESSION_TABLE;
use crate::application::shaper::{
    correlation_of, require_record_id, text, time_of_action, ShapeError, ShapedEvent, Shaper,
    CORRELATION_FIELD,
};
use crate::domain::{ChangeNotification, ChangeType, EntityType};
use crate::infrastructure::correlation::CorrelationGenerator;
use crate::infrastructure::crm::{CrmClient, Query};
use crate::infrastructure::schema::SchemaId;

/// Shapes Session change notifications. Creates carry a full document with
/// the parent event resolved to its correlation id; updates are sparse.
pub struct SessionShaper {
    crm: Arc<dyn CrmClient>,
    correlation: Arc<CorrelationGenerator>,
}

impl SessionShaper {
    pub fn new(crm: Arc<dyn CrmClient>, correlation: Arc<CorrelationGenerator>) -> Self {
        Self { crm, correlation }
    }

    /// Parent event correlation id. The session carries it directly once
    /// reconciled; a freshly created session only knows the parent's record
    /// id, so we follow the relation.
    async fn resolve_event_uuid(
        &self,
        fields: &Map<String, Value>,
        record_id: &str,
    ) -> Result<String, ShapeError> {
        let direct = text(fields, "EventUuid");
        if !direct.is_empty() {
            return Ok(direct);
        }
        let event_id = text(fields, "EventId");
        if event_id.is_empty() {
            return Err(ShapeError::CorrelationMissing {
                object: "Event",
                record_id: record_id.to_string(),
            });
        }
        let event = self
            .crm
            .retrieve("Event", &event_id)
            .await
            .map_err(|source| ShapeError::Lookup {
                object: "Event",
                record_id: event_id.clone(),
                source,
            })?;
        correlation_of(&event).ok_or(ShapeError::CorrelationMissing {
            object: "Event",
            record_id: event_id,
        })
    }

    /// Speaker email is advisory: an unresolvable speaker degrades to an
    /// empty element instead of failing the action.
    async fn resolve_guest_speaker(&self, fields: &Map<String, Value>) -> String {
        let speaker_id = text(fields, "GuestSpeakerId");
        if speaker_id.is_empty() {
            return String::new();
        }
        match self.crm.retrieve("Contact", &speaker_id).await {
            Ok(contact) => text(&contact, "Email"),
            Err(error) => {
                warn!(speaker_id, %error, "guest speaker lookup failed");
                String::new()
            }
        }
    }

    async fn shape_create(
        &self,
        notification: &ChangeNotification,
    ) -> Result<Option<ShapedEvent>, ShapeError> {
        let record_id = require_record_id(notification)?;
        let fields = &notification.fields;
        let event_uuid = self.resolve_event_uuid(fields, record_id).await?;
        let uuid = self.correlation.generate();

        let mut write_back = Map::new();
        write_back.insert(CORRELATION_FIELD.to_string(), Value::String(uuid.clone()));
        write_back.insert("EventUuid".to_string(), Value::String(event_uuid.clone()));
        self.crm
            .update("Session", record_id, write_back)
            .await
            .map_err(|source| ShapeError::WriteBack {
                object: "Session",
                record_id: record_id.to_string(),
                source,
            })?;
        info!(record_id, %uuid, "correlation id assigned to session");

        let guest_speakers = self.resolve_guest_speaker(fields).await;
        let mut payload = Map::new();
        payload.insert("SessionUUID".to_string(), Value::String(uuid));
        payload.insert("EventUUID".to_string(), Value::String(event_uuid));
        for map in SESSION_TABLE.fields {
            if map.wire == "EventUUID" {
                continue;
            }
            payload.insert(map.wire.to_string(), Value::String(text(fields, map.crm)));
        }
        payload.insert("GuestSpeakers".to_string(), Value::String(guest_speakers));
        Ok(Some(ShapedEvent {
            schema: SchemaId::SessionCreate,
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
            .retrieve("Session", record_id)
            .await
            .map_err(|source| ShapeError::Lookup {
                object: "Session",
                record_id: record_id.to_string(),
                source,
            })?;
        let uuid = correlation_of(&record).ok_or_else(|| ShapeError::CorrelationMissing {
            object: "Session",
            record_id: record_id.to_string(),
        })?;

        // Sparse contract: only the changed primitive fields travel, as
        // Field{Name,NewValue} pairs under FieldsToUpdate.
        let changes: Vec<Value> = notification
            .fields
            .iter()
            .filter(|(_, value)| value.is_string() || value.is_number() || value.is_boolean())
            .filter_map(|(crm_name, _)| {
                SESSION_TABLE.wire_field(crm_name).map(|wire| {
                    json!({
                        "Name": wire,
                        "NewValue": text(&notification.fields, crm_name),
                    })
                })
            })
            .collect();
        if changes.is_empty() {
            warn!(record_id, "session update touched no mapped fields");
            return Ok(None);
        }

        let payload = json!({
            "SessionUUID": uuid,
            "FieldsToUpdate": { "Field": changes },
        });
        Ok(Some(ShapedEvent {
            schema: SchemaId::SessionUpdate,
            payload,
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
                Query::new("Session")
                    .filter("Id", record_id)
                    .include_deleted()
                    .limit(1),
            )
            .await
            .map_err(|source| ShapeError::Lookup {
                object: "Session",
                record_id: record_id.to_string(),
                source,
            })?;
        let uuid = rows
            .first()
            .and_then(|record| correlation_of(record))
            .ok_or_else(|| ShapeError::CorrelationMissing {
                object: "Session",
                record_id: record_id.to_string(),
            })?;

        let payload = json!({
            "ActionType": "DELETE",
            "SessionUUID": uuid,
            "TimeOfAction": time_of_action(),
        });
        Ok(Some(ShapedEvent {
            schema: SchemaId::SessionDelete,
            payload,
        }))
    }
}

#[async_trait]
impl Shaper for SessionShaper {
    fn entity(&self) -> EntityType {
        EntityType::Session
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
                warn!(action = %other, "unhandled session action");
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::testing::notification;
    use crate::infrastructure::crm::{CrmRecord, InMemoryCrm};
    use serde_json::json;

    fn shaper(crm: Arc<dyn CrmClient>) -> SessionShaper {
        SessionShaper::new(crm, Arc::new(CorrelationGenerator::new()))
    }

    fn record(pairs: &[(&str, Value)]) -> CrmRecord {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[tokio::test]
    async fn create_resolves_the_parent_event_and_speaker() {
        let crm = Arc::new(InMemoryCrm::new());
        crm.insert("Event", "ev1", record(&[("Uuid", json!("ev-uuid"))]));
        crm.insert("Contact", "c1", record(&[("Email", json!("speaker@x.com"))]));
        crm.insert("Session", "s1", record(&[]));

        let n = notification(
            "CREATE",
            Some("s1"),
            json!({ "Name": "Workshop", "EventId": "ev1", "GuestSpeakerId": "c1" }),
        );
        let shaped = shaper(crm.clone()).shape(&n).await.unwrap().unwrap();

        assert_eq!(shaped.schema, SchemaId::SessionCreate);
        assert_eq!(shaped.payload["EventUUID"], json!("ev-uuid"));
        assert_eq!(shaped.payload["SessionName"], json!("Workshop"));
        assert_eq!(shaped.payload["GuestSpeakers"], json!("speaker@x.com"));
        let stored = crm.get("Session", "s1").unwrap();
        assert_eq!(Some(&shaped.payload["SessionUUID"]), stored.get("Uuid"));
        assert_eq!(stored.get("EventUuid"), Some(&json!("ev-uuid")));
    }

    #[tokio::test]
    async fn create_fails_when_the_parent_event_has_no_correlation() {
        let crm = Arc::new(InMemoryCrm::new());
        crm.insert("Event", "ev1", record(&[]));
        crm.insert("Session", "s1", record(&[]));

        let n = notification("CREATE", Some("s1"), json!({ "EventId": "ev1" }));
        assert!(matches!(
            shaper(crm).shape(&n).await,
            Err(ShapeError::CorrelationMissing { object: "Event", .. })
        ));
    }

    #[tokio::test]
    async fn update_carries_only_the_changed_mapped_fields() {
        let crm = Arc::new(InMemoryCrm::new());
        crm.insert("Session", "s1", record(&[("Uuid", json!("s-uuid"))]));

        let n = notification(
            "UPDATE",
            Some("s1"),
            json!({ "Capacity": 40, "Name": "Workshop v2", "Unmapped": "x" }),
        );
        let shaped = shaper(crm).shape(&n).await.unwrap().unwrap();

        assert_eq!(shaped.schema, SchemaId::SessionUpdate);
        assert_eq!(shaped.payload["SessionUUID"], json!("s-uuid"));
        let fields = shaped.payload["FieldsToUpdate"]["Field"]
            .as_array()
            .unwrap();
        assert_eq!(fields.len(), 2);
        assert!(fields.iter().any(|f| f["Name"] == json!("Capacity")
            && f["NewValue"] == json!("40")));
        assert!(fields.iter().any(|f| f["Name"] == json!("SessionName")
            && f["NewValue"] == json!("Workshop v2")));
    }

    #[tokio::test]
    async fn update_with_nothing_mapped_is_a_no_op() {
        let crm = Arc::new(InMemoryCrm::new());
        crm.insert("Session", "s1", record(&[("Uuid", json!("s-uuid"))]));

        let n = notification("UPDATE", Some("s1"), json!({ "Internal": "x" }));
        assert!(shaper(crm).shape(&n).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_recovers_the_uuid_from_the_deleted_view() {
        let crm = Arc::new(InMemoryCrm::new());
        crm.insert("Session", "s1", record(&[("Uuid", json!("s-uuid"))]));
        crm.destroy("Session", "s1").await.unwrap();

        let n = notification("DELETE", Some("s1"), json!({}));
        let shaped = shaper(crm).shape(&n).await.unwrap().unwrap();
        assert_eq!(shaped.schema, SchemaId::SessionDelete);
        assert_eq!(shaped.payload["SessionUUID"], json!("s-uuid"));
    }
}

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::{info, warn};

use crate::application::shaper::{
    correlation_of, require_record_id, text, ShapeError, ShapedEvent, Shaper, CORRELATION_FIELD,
};
use crate::domain::{ChangeNotification, ChangeType, EntityType};
use crate::infrastructure::correlation::CorrelationGenerator;
use crate::infrastructure::crm::{CrmClient, CrmRecord, Query};
use crate::infrastructure::schema::SchemaId;

/// Shapes SessionParticipation changes. Every membership change surfaces
/// downstream as a full roster snapshot of the parent session; the
/// participation record itself never travels.
pub struct ParticipationShaper {
    crm: Arc<dyn CrmClient>,
    correlation: Arc<CorrelationGenerator>,
}

impl ParticipationShaper {
    pub fn new(crm: Arc<dyn CrmClient>, correlation: Arc<CorrelationGenerator>) -> Self {
        Self { crm, correlation }
    }

    async fn session_uuid(&self, session_id: &str) -> Result<(String, String), ShapeError> {
        let session = self
            .crm
            .retrieve("Session", session_id)
            .await
            .map_err(|source| ShapeError::Lookup {
                object: "Session",
                record_id: session_id.to_string(),
                source,
            })?;
        let uuid = correlation_of(&session).ok_or_else(|| ShapeError::CorrelationMissing {
            object: "Session",
            record_id: session_id.to_string(),
        })?;
        Ok((uuid, text(&session, "EventUuid")))
    }

    async fn contact_uuid(&self, contact_id: &str) -> Result<String, ShapeError> {
        let contact = self
            .crm
            .retrieve("Contact", contact_id)
            .await
            .map_err(|source| ShapeError::Lookup {
                object: "Contact",
                record_id: contact_id.to_string(),
                source,
            })?;
        correlation_of(&contact).ok_or_else(|| ShapeError::CorrelationMissing {
            object: "Contact",
            record_id: contact_id.to_string(),
        })
    }

    /// Re-queries every live participation of the session and emits the
    /// roster as an `UpdateSession` document. The snapshot is rebuilt from
    /// scratch each time so a missed change cannot leave a stale member.
    async fn roster(
        &self,
        session_id: &str,
        session_uuid: String,
        event_uuid: String,
    ) -> Result<ShapedEvent, ShapeError> {
        let siblings = self
            .crm
            .query(Query::new("SessionParticipation").filter("SessionId", session_id))
            .await
            .map_err(|source| ShapeError::Lookup {
                object: "SessionParticipation",
                record_id: session_id.to_string(),
                source,
            })?;
        let users: Vec<Value> = siblings
            .iter()
            .map(|row| text(row, "ContactUuid"))
            .filter(|uuid| !uuid.is_empty())
            .map(Value::String)
            .collect();

        let payload = json!({
            "SessionUUID": session_uuid,
            "EventUUID": event_uuid,
            "RegisteredUsers": { "User": users },
        });
        Ok(ShapedEvent {
            schema: SchemaId::SessionRoster,
            payload,
        })
    }

    fn relation_id(fields: &Map<String, Value>, name: &str, record_id: &str) -> Result<String, ShapeError> {
        let id = text(fields, name);
        if id.is_empty() {
            return Err(ShapeError::CorrelationMissing {
                object: if name == "SessionId" { "Session" } else { "Contact" },
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
        let session_id = Self::relation_id(fields, "SessionId", record_id)?;
        let contact_id = Self::relation_id(fields, "ContactId", record_id)?;

        let (session_uuid, event_uuid) = self.session_uuid(&session_id).await?;
        let contact_uuid = self.contact_uuid(&contact_id).await?;
        let uuid = self.correlation.generate();

        // The participation record gets all three identifiers so the
        // roster rebuild can read them back without further joins.
        let mut write_back = CrmRecord::new();
        write_back.insert(CORRELATION_FIELD.to_string(), Value::String(uuid.clone()));
        write_back.insert("SessionUuid".to_string(), Value::String(session_uuid.clone()));
        write_back.insert("ContactUuid".to_string(), Value::String(contact_uuid));
        self.crm
            .update("SessionParticipation", record_id, write_back)
            .await
            .map_err(|source| ShapeError::WriteBack {
                object: "SessionParticipation",
                record_id: record_id.to_string(),
                source,
            })?;
        info!(record_id, %uuid, "correlation id assigned to participation");

        self.roster(&session_id, session_uuid, event_uuid)
            .await
            .map(Some)
    }

    async fn shape_undelete(
        &self,
        notification: &ChangeNotification,
    ) -> Result<Option<ShapedEvent>, ShapeError> {
        let record_id = require_record_id(notification)?;
        // The restored record kept its correlation id; only the roster has
        // to be replayed.
        let row = self
            .crm
            .retrieve("SessionParticipation", record_id)
            .await
            .map_err(|source| ShapeError::Lookup {
                object: "SessionParticipation",
                record_id: record_id.to_string(),
                source,
            })?;
        let session_id = Self::relation_id(&row, "SessionId", record_id)?;
        let (session_uuid, event_uuid) = self.session_uuid(&session_id).await?;
        self.roster(&session_id, session_uuid, event_uuid)
            .await
            .map(Some)
    }

    async fn shape_delete(
        &self,
        notification: &ChangeNotification,
    ) -> Result<Option<ShapedEvent>, ShapeError> {
        let record_id = require_record_id(notification)?;
        let rows = self
            .crm
            .query(
                Query::new("SessionParticipation")
                    .filter("Id", record_id)
                    .include_deleted()
                    .limit(1),
            )
            .await
            .map_err(|source| ShapeError::Lookup {
                object: "SessionParticipation",
                record_id: record_id.to_string(),
                source,
            })?;
        let row = rows.first().ok_or_else(|| ShapeError::CorrelationMissing {
            object: "SessionParticipation",
            record_id: record_id.to_string(),
        })?;
        let session_id = Self::relation_id(row, "SessionId", record_id)?;
        let (session_uuid, event_uuid) = self.session_uuid(&session_id).await?;
        // The deleted row no longer matches the live sibling query, so the
        // snapshot already excludes the leaver.
        self.roster(&session_id, session_uuid, event_uuid)
            .await
            .map(Some)
    }
}

#[async_trait]
impl Shaper for ParticipationShaper {
    fn entity(&self) -> EntityType {
        EntityType::SessionParticipation
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
                // A participation row has no mutable payload of its own.
                warn!("participation update has no downstream representation");
                Ok(None)
            }
            other => {
                warn!(action = %other, "unhandled participation action");
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::testing::notification;
    use crate::infrastructure::crm::InMemoryCrm;
    use serde_json::json;

    fn shaper(crm: Arc<dyn CrmClient>) -> ParticipationShaper {
        ParticipationShaper::new(crm, Arc::new(CorrelationGenerator::new()))
    }

    fn record(pairs: &[(&str, Value)]) -> CrmRecord {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn seed(crm: &InMemoryCrm) {
        crm.insert(
            "Session",
            "s1",
            record(&[("Uuid", json!("s-uuid")), ("EventUuid", json!("ev-uuid"))]),
        );
        crm.insert("Contact", "c1", record(&[("Uuid", json!("c1-uuid"))]));
        crm.insert("Contact", "c2", record(&[("Uuid", json!("c2-uuid"))]));
        crm.insert(
            "SessionParticipation",
            "p1",
            record(&[
                ("SessionId", json!("s1")),
                ("ContactId", json!("c1")),
                ("ContactUuid", json!("c1-uuid")),
            ]),
        );
    }

    #[tokio::test]
    async fn create_writes_back_and_emits_the_full_roster() {
        let crm = Arc::new(InMemoryCrm::new());
        seed(&crm);
        crm.insert(
            "SessionParticipation",
            "p2",
            record(&[("SessionId", json!("s1")), ("ContactId", json!("c2"))]),
        );

        let n = notification(
            "CREATE",
            Some("p2"),
            json!({ "SessionId": "s1", "ContactId": "c2" }),
        );
        let shaped = shaper(crm.clone()).shape(&n).await.unwrap().unwrap();

        assert_eq!(shaped.schema, SchemaId::SessionRoster);
        assert_eq!(shaped.payload["SessionUUID"], json!("s-uuid"));
        assert_eq!(shaped.payload["EventUUID"], json!("ev-uuid"));
        let users = shaped.payload["RegisteredUsers"]["User"].as_array().unwrap();
        assert_eq!(users.len(), 2);
        assert!(users.contains(&json!("c1-uuid")));
        assert!(users.contains(&json!("c2-uuid")));

        let stored = crm.get("SessionParticipation", "p2").unwrap();
        assert_eq!(stored.get("ContactUuid"), Some(&json!("c2-uuid")));
        assert_eq!(stored.get("SessionUuid"), Some(&json!("s-uuid")));
        assert!(stored.get("Uuid").is_some());
    }

    #[tokio::test]
    async fn create_fails_when_the_contact_has_no_correlation() {
        let crm = Arc::new(InMemoryCrm::new());
        seed(&crm);
        crm.insert("Contact", "c3", record(&[]));
        crm.insert(
            "SessionParticipation",
            "p3",
            record(&[("SessionId", json!("s1")), ("ContactId", json!("c3"))]),
        );

        let n = notification(
            "CREATE",
            Some("p3"),
            json!({ "SessionId": "s1", "ContactId": "c3" }),
        );
        assert!(matches!(
            shaper(crm).shape(&n).await,
            Err(ShapeError::CorrelationMissing { object: "Contact", .. })
        ));
    }

    #[tokio::test]
    async fn delete_emits_the_roster_without_the_leaver() {
        let crm = Arc::new(InMemoryCrm::new());
        seed(&crm);
        crm.destroy("SessionParticipation", "p1").await.unwrap();

        let n = notification("DELETE", Some("p1"), json!({}));
        let shaped = shaper(crm).shape(&n).await.unwrap().unwrap();

        assert_eq!(shaped.schema, SchemaId::SessionRoster);
        let users = shaped.payload["RegisteredUsers"]["User"].as_array().unwrap();
        assert!(users.is_empty());
    }

    #[tokio::test]
    async fn undelete_replays_the_roster() {
        let crm = Arc::new(InMemoryCrm::new());
        seed(&crm);

        let n = notification("UNDELETE", Some("p1"), json!({}));
        let shaped = shaper(crm).shape(&n).await.unwrap().unwrap();
        let users = shaped.payload["RegisteredUsers"]["User"].as_array().unwrap();
        assert_eq!(users, &vec![json!("c1-uuid")]);
    }

    #[tokio::test]
    async fn update_is_a_deliberate_no_op() {
        let crm = Arc::new(InMemoryCrm::new());
        seed(&crm);

        let n = notification("UPDATE", Some("p1"), json!({ "SessionId": "s1" }));
        assert!(shaper(crm).shape(&n).await.unwrap().is_none());
    }
}

use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::application::fields::EntityTable;
use crate::application::shaper::{text, CORRELATION_FIELD};
use crate::infrastructure::broker::{BrokerError, MessageBroker};
use crate::infrastructure::crm::{CrmClient, CrmError, CrmRecord, Query};
use crate::infrastructure::ops_log::OpsLogPublisher;
use crate::infrastructure::schema::{self, SchemaId, SchemaViolation};
use crate::infrastructure::xml::{self, as_sequence};

/// Inbound direction a reconciler applies to the record store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundAction {
    Create,
    Update,
    Delete,
}

impl InboundAction {
    pub const ALL: [InboundAction; 3] = [
        InboundAction::Create,
        InboundAction::Update,
        InboundAction::Delete,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            InboundAction::Create => "create",
            InboundAction::Update => "update",
            InboundAction::Delete => "delete",
        }
    }
}

/// Outcome of one inbound message. `Nack` always means
/// nack-without-requeue: a message this reconciler cannot apply now is
/// treated as poison and dead-lettered, never redelivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    Nack,
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("document rejected: {0}")]
    Invalid(#[from] SchemaViolation),
    #[error("document has no field children")]
    EmptyDocument,
    #[error("document carries an empty {0}")]
    MissingUuid(&'static str),
    #[error("no {object} record with correlation id {uuid}")]
    UnknownRecord { object: &'static str, uuid: String },
    #[error("record store operation failed: {0}")]
    Crm(#[from] CrmError),
}

/// Applies one `(entity, action)` message stream to the CRM. Entirely
/// table-driven: the entity table supplies the schema, the correlation
/// carrier and the field mapping, so adding an entity means adding a table
/// row, not a reconciler.
pub struct Reconciler {
    crm: Arc<dyn CrmClient>,
    table: &'static EntityTable,
    action: InboundAction,
    ops_log: OpsLogPublisher,
}

impl Reconciler {
    pub fn new(
        crm: Arc<dyn CrmClient>,
        table: &'static EntityTable,
        action: InboundAction,
        ops_log: OpsLogPublisher,
    ) -> Self {
        Self {
            crm,
            table,
            action,
            ops_log,
        }
    }

    fn schema(&self) -> SchemaId {
        match self.action {
            InboundAction::Create => self.table.create_schema,
            InboundAction::Update => self.table.update_schema,
            InboundAction::Delete => self.table.delete_schema,
        }
    }

    pub async fn on_message(&self, payload: &[u8]) -> Disposition {
        match self.apply(payload).await {
            Ok(()) => Disposition::Ack,
            Err(e) => {
                warn!(
                    entity = %self.table.entity,
                    action = self.action.as_str(),
                    error = %e,
                    "inbound message rejected"
                );
                self.ops_log
                    .warn(
                        "422",
                        &format!(
                            "inbound {} {} rejected: {e}",
                            self.table.entity,
                            self.action.as_str()
                        ),
                    )
                    .await;
                Disposition::Nack
            }
        }
    }

    async fn apply(&self, payload: &[u8]) -> Result<(), ReconcileError> {
        let schema = self.schema();
        schema::validate(schema, payload)?;
        let document = std::str::from_utf8(payload)
            .map_err(|e| SchemaViolation::Malformed(e.to_string()))?;
        let (_, tree) = xml::xml_to_json(document)
            .map_err(|e| SchemaViolation::Malformed(e.to_string()))?;
        let fields = match tree {
            Value::Object(fields) => fields,
            _ => return Err(ReconcileError::EmptyDocument),
        };

        let uuid = text(&fields, self.table.uuid_wire);
        if uuid.is_empty() {
            return Err(ReconcileError::MissingUuid(self.table.uuid_wire));
        }

        let object = self.table.entity.object_name();
        match self.action {
            InboundAction::Create => {
                // Full field set with empty defaults: a created record is
                // complete even when the producer left elements out.
                let mut record = CrmRecord::new();
                record.insert(CORRELATION_FIELD.to_string(), Value::String(uuid.clone()));
                for map in self.table.fields {
                    record.insert(map.crm.to_string(), Value::String(text(&fields, map.wire)));
                }
                let id = self.crm.create(object, record).await?;
                info!(%object, id, %uuid, "record created from inbound message");
            }
            InboundAction::Update => {
                let id = self.resolve(&uuid).await?;
                let changes = if self.table.sparse_update {
                    self.sparse_changes(&fields)
                } else {
                    self.present_changes(&fields)
                };
                if changes.is_empty() {
                    info!(%object, id, %uuid, "inbound update carried no mapped fields");
                    return Ok(());
                }
                self.crm.update(object, &id, changes).await?;
                info!(%object, id, %uuid, "record updated from inbound message");
            }
            InboundAction::Delete => {
                let id = self.resolve(&uuid).await?;
                self.crm.destroy(object, &id).await?;
                info!(%object, id, %uuid, "record destroyed from inbound message");
            }
        }
        Ok(())
    }

    /// Resolves the CRM record id behind a correlation id.
    async fn resolve(&self, uuid: &str) -> Result<String, ReconcileError> {
        let object = self.table.entity.object_name();
        let rows = self
            .crm
            .query(
                Query::new(object)
                    .filter(CORRELATION_FIELD, uuid)
                    .limit(1),
            )
            .await?;
        let id = rows
            .first()
            .map(|row| text(row, "Id"))
            .filter(|id| !id.is_empty());
        id.ok_or_else(|| ReconcileError::UnknownRecord {
            object,
            uuid: uuid.to_string(),
        })
    }

    /// Snapshot updates: every mapped field present in the document is
    /// applied.
    fn present_changes(&self, fields: &serde_json::Map<String, Value>) -> CrmRecord {
        let mut changes = CrmRecord::new();
        for map in self.table.fields {
            if fields.contains_key(map.wire) {
                changes.insert(map.crm.to_string(), Value::String(text(fields, map.wire)));
            }
        }
        changes
    }

    /// Sparse updates arrive as `FieldsToUpdate/Field{Name,NewValue}`
    /// pairs; unmapped names are skipped with a warning.
    fn sparse_changes(&self, fields: &serde_json::Map<String, Value>) -> CrmRecord {
        let mut changes = CrmRecord::new();
        let list = fields
            .get("FieldsToUpdate")
            .and_then(|wrapper| wrapper.get("Field"));
        for entry in list.map(as_sequence).unwrap_or_default() {
            let Some(pair) = entry.as_object() else {
                continue;
            };
            let name = text(pair, "Name");
            match self.table.crm_field(&name) {
                Some(crm_name) => {
                    changes.insert(crm_name.to_string(), Value::String(text(pair, "NewValue")));
                }
                None => warn!(
                    entity = %self.table.entity,
                    field = %name,
                    "sparse update names an unmapped field"
                ),
            }
        }
        changes
    }

    /// Consumes the queue until the broker closes it, acking or
    /// dead-lettering each delivery.
    pub async fn run_queue(
        &self,
        broker: Arc<dyn MessageBroker>,
        queue: &str,
    ) -> Result<(), BrokerError> {
        broker.declare_queue(queue).await?;
        let mut deliveries = broker.consume(queue).await?;
        info!(queue, "reconciler consuming");
        while let Some(delivery) = deliveries.recv().await {
            match self.on_message(&delivery.payload).await {
                Disposition::Ack => {
                    if let Err(e) = broker.ack(&delivery).await {
                        error!(queue, error = %e, "ack failed");
                    }
                }
                Disposition::Nack => {
                    if let Err(e) = broker.nack(&delivery, false).await {
                        error!(queue, error = %e, "nack failed");
                    }
                }
            }
        }
        info!(queue, "queue closed, reconciler stopping");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::fields::{SESSION_TABLE, USER_TABLE};
    use crate::infrastructure::broker::memory::InMemoryBroker;
    use crate::infrastructure::crm::InMemoryCrm;
    use crate::infrastructure::xml::json_to_xml;
    use serde_json::json;

    fn reconciler(
        crm: Arc<InMemoryCrm>,
        table: &'static EntityTable,
        action: InboundAction,
    ) -> Reconciler {
        let ops_log = OpsLogPublisher::new(Arc::new(InMemoryBroker::new()), "CRM_Service");
        Reconciler::new(crm, table, action, ops_log)
    }

    fn seeded_user(crm: &InMemoryCrm, uuid: &str) {
        let mut record = CrmRecord::new();
        record.insert("Uuid".to_string(), json!(uuid));
        record.insert("FirstName".to_string(), json!("Jane"));
        crm.insert("Contact", "001x", record);
    }

    #[tokio::test]
    async fn create_applies_the_full_field_set_with_defaults() {
        let crm = Arc::new(InMemoryCrm::new());
        let r = reconciler(crm.clone(), &USER_TABLE, InboundAction::Create);

        let document = json_to_xml(
            "UserMessage",
            &json!({
                "ActionType": "CREATE",
                "UUID": "u-1",
                "TimeOfAction": "2026-01-05T10:00:00.000Z",
                "FirstName": "Jane",
                "LastName": "Doe",
                "EmailAddress": "jane@x.com"
            }),
        );
        assert_eq!(r.on_message(document.as_bytes()).await, Disposition::Ack);

        assert_eq!(crm.len("Contact"), 1);
        let rows = crm
            .query(Query::new("Contact").filter("Uuid", "u-1"))
            .await
            .unwrap();
        let record = &rows[0];
        assert_eq!(record.get("FirstName"), Some(&json!("Jane")));
        assert_eq!(record.get("Email"), Some(&json!("jane@x.com")));
        // Absent wire fields land as empty defaults.
        assert_eq!(record.get("Phone"), Some(&json!("")));
    }

    #[tokio::test]
    async fn update_applies_only_present_fields() {
        let crm = Arc::new(InMemoryCrm::new());
        seeded_user(&crm, "u-1");
        let r = reconciler(crm.clone(), &USER_TABLE, InboundAction::Update);

        let document = json_to_xml(
            "UserMessage",
            &json!({
                "ActionType": "UPDATE",
                "UUID": "u-1",
                "TimeOfAction": "2026-01-05T10:00:00.000Z",
                "FirstName": "Janet",
                "LastName": "Doe",
                "EmailAddress": "janet@x.com"
            }),
        );
        assert_eq!(r.on_message(document.as_bytes()).await, Disposition::Ack);

        let record = crm.get("Contact", "001x").unwrap();
        assert_eq!(record.get("FirstName"), Some(&json!("Janet")));
        assert_eq!(record.get("Email"), Some(&json!("janet@x.com")));
        // Untouched fields survive.
        assert!(record.get("Phone").is_none());
    }

    #[tokio::test]
    async fn session_update_applies_the_sparse_change_list() {
        let crm = Arc::new(InMemoryCrm::new());
        let mut record = CrmRecord::new();
        record.insert("Uuid".to_string(), json!("s-1"));
        record.insert("Name".to_string(), json!("Workshop"));
        crm.insert("Session", "s1", record);
        let r = reconciler(crm.clone(), &SESSION_TABLE, InboundAction::Update);

        let document = json_to_xml(
            "UpdateSession",
            &json!({
                "SessionUUID": "s-1",
                "FieldsToUpdate": {
                    "Field": [
                        { "Name": "SessionName", "NewValue": "Workshop v2" },
                        { "Name": "Capacity", "NewValue": "40" }
                    ]
                }
            }),
        );
        assert_eq!(r.on_message(document.as_bytes()).await, Disposition::Ack);

        let record = crm.get("Session", "s1").unwrap();
        assert_eq!(record.get("Name"), Some(&json!("Workshop v2")));
        assert_eq!(record.get("Capacity"), Some(&json!("40")));
    }

    #[tokio::test]
    async fn session_update_with_a_single_field_is_still_a_sequence() {
        let crm = Arc::new(InMemoryCrm::new());
        let mut record = CrmRecord::new();
        record.insert("Uuid".to_string(), json!("s-1"));
        crm.insert("Session", "s1", record);
        let r = reconciler(crm.clone(), &SESSION_TABLE, InboundAction::Update);

        let document = json_to_xml(
            "UpdateSession",
            &json!({
                "SessionUUID": "s-1",
                "FieldsToUpdate": {
                    "Field": { "Name": "Capacity", "NewValue": "12" }
                }
            }),
        );
        assert_eq!(r.on_message(document.as_bytes()).await, Disposition::Ack);
        let record = crm.get("Session", "s1").unwrap();
        assert_eq!(record.get("Capacity"), Some(&json!("12")));
    }

    #[tokio::test]
    async fn delete_destroys_the_resolved_record() {
        let crm = Arc::new(InMemoryCrm::new());
        seeded_user(&crm, "u-1");
        let r = reconciler(crm.clone(), &USER_TABLE, InboundAction::Delete);

        let document = json_to_xml(
            "UserMessage",
            &json!({
                "ActionType": "DELETE",
                "UUID": "u-1",
                "TimeOfAction": "2026-01-05T10:00:00.000Z"
            }),
        );
        assert_eq!(r.on_message(document.as_bytes()).await, Disposition::Ack);
        assert!(crm.is_empty("Contact"));
    }

    #[tokio::test]
    async fn unknown_correlation_id_is_poison() {
        let crm = Arc::new(InMemoryCrm::new());
        let r = reconciler(crm, &USER_TABLE, InboundAction::Delete);

        let document = json_to_xml(
            "UserMessage",
            &json!({
                "ActionType": "DELETE",
                "UUID": "nobody",
                "TimeOfAction": "2026-01-05T10:00:00.000Z"
            }),
        );
        assert_eq!(r.on_message(document.as_bytes()).await, Disposition::Nack);
    }

    #[tokio::test]
    async fn undecodable_bytes_are_poison_and_touch_no_records() {
        let crm = Arc::new(InMemoryCrm::new());
        seeded_user(&crm, "u-1");
        let r = reconciler(crm.clone(), &USER_TABLE, InboundAction::Update);

        assert_eq!(r.on_message(b"not xml at all").await, Disposition::Nack);
        let record = crm.get("Contact", "001x").unwrap();
        assert_eq!(record.get("FirstName"), Some(&json!("Jane")));
    }

    #[tokio::test]
    async fn wrong_root_is_poison() {
        let crm = Arc::new(InMemoryCrm::new());
        let r = reconciler(crm, &USER_TABLE, InboundAction::Create);

        let document = json_to_xml("CreateEvent", &json!({ "EventUUID": "x", "EventName": "y" }));
        assert_eq!(r.on_message(document.as_bytes()).await, Disposition::Nack);
    }

    #[tokio::test]
    async fn poison_deliveries_are_dead_lettered_exactly_once() {
        let crm = Arc::new(InMemoryCrm::new());
        let broker = Arc::new(InMemoryBroker::new());
        let r = reconciler(crm, &USER_TABLE, InboundAction::Create);

        broker.enqueue("crm_user_create", b"<garbage>".to_vec());
        let broker_dyn: Arc<dyn MessageBroker> = broker.clone();
        let handle = {
            let broker_dyn = broker_dyn.clone();
            tokio::spawn(async move { r.run_queue(broker_dyn, "crm_user_create").await })
        };

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let nacked = broker.nacked();
        assert_eq!(nacked.len(), 1);
        assert_eq!(nacked[0].queue, "crm_user_create");
        assert!(!nacked[0].requeue);
        assert!(broker.acked().is_empty());
        handle.abort();
    }
}

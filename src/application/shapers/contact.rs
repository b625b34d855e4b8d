use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::{info, warn};

use crate::application::shaper::{
    correlation_of, require_record_id, text, time_of_action, ShapeError, ShapedEvent, Shaper,
    CORRELATION_FIELD,
};
use crate::domain::{ChangeNotification, ChangeType, EntityType};
use crate::infrastructure::address::format_crm_address;
use crate::infrastructure::correlation::CorrelationGenerator;
use crate::infrastructure::crm::{CrmClient, Query};
use crate::infrastructure::schema::SchemaId;

/// Shapes Contact change notifications into `UserMessage` documents.
pub struct ContactShaper {
    crm: Arc<dyn CrmClient>,
    correlation: Arc<CorrelationGenerator>,
}

impl ContactShaper {
    pub fn new(crm: Arc<dyn CrmClient>, correlation: Arc<CorrelationGenerator>) -> Self {
        Self { crm, correlation }
    }

    fn business_block(fields: &Map<String, Value>) -> Value {
        json!({
            "BusinessName": text(fields, "BusinessName"),
            "BusinessEmail": text(fields, "BusinessEmail"),
            "RealAddress": format_crm_address(fields.get("MailingAddress")),
            "BTWNumber": text(fields, "VatNumber"),
            "FacturationAddress": format_crm_address(fields.get("BillingAddress")),
        })
    }

    /// Recomposes an address object from the flat Mailing*/Billing* fields a
    /// retrieved record carries.
    fn record_address(record: &Map<String, Value>, prefix: &str) -> String {
        let object = json!({
            "Street": text(record, &format!("{prefix}Street")),
            "City": text(record, &format!("{prefix}City")),
            "State": text(record, &format!("{prefix}State")),
            "PostalCode": text(record, &format!("{prefix}PostalCode")),
            "Country": text(record, &format!("{prefix}Country")),
        });
        format_crm_address(Some(&object))
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
            .update("Contact", record_id, write_back)
            .await
            .map_err(|source| ShapeError::WriteBack {
                object: "Contact",
                record_id: record_id.to_string(),
                source,
            })?;
        info!(record_id, %uuid, "correlation id assigned to contact");

        let fields = &notification.fields;
        let payload = json!({
            "ActionType": "CREATE",
            "UUID": uuid,
            "TimeOfAction": time_of_action(),
            "EncryptedPassword": text(fields, "Password"),
            "FirstName": text(fields, "FirstName"),
            "LastName": text(fields, "LastName"),
            "PhoneNumber": text(fields, "Phone"),
            "EmailAddress": text(fields, "Email"),
            "Business": Self::business_block(fields),
        });
        Ok(Some(ShapedEvent {
            schema: SchemaId::UserCreate,
            payload,
        }))
    }

    async fn shape_update(
        &self,
        notification: &ChangeNotification,
    ) -> Result<Option<ShapedEvent>, ShapeError> {
        let record_id = require_record_id(notification)?;
        let record = self
            .crm
            .retrieve("Contact", record_id)
            .await
            .map_err(|source| ShapeError::Lookup {
                object: "Contact",
                record_id: record_id.to_string(),
                source,
            })?;
        let uuid = correlation_of(&record).ok_or_else(|| ShapeError::CorrelationMissing {
            object: "Contact",
            record_id: record_id.to_string(),
        })?;

        // Updates publish a full snapshot of the record, not the sparse
        // change set: downstream user consumers replace, they do not patch.
        let payload = json!({
            "ActionType": "UPDATE",
            "UUID": uuid,
            "TimeOfAction": time_of_action(),
            "EncryptedPassword": text(&record, "Password"),
            "FirstName": text(&record, "FirstName"),
            "LastName": text(&record, "LastName"),
            "PhoneNumber": text(&record, "Phone"),
            "EmailAddress": text(&record, "Email"),
            "Business": json!({
                "BusinessName": text(&record, "BusinessName"),
                "BusinessEmail": text(&record, "BusinessEmail"),
                "RealAddress": Self::record_address(&record, "Mailing"),
                "BTWNumber": text(&record, "VatNumber"),
                "FacturationAddress": Self::record_address(&record, "Billing"),
            }),
        });
        Ok(Some(ShapedEvent {
            schema: SchemaId::UserUpdate,
            payload,
        }))
    }

    async fn shape_delete(
        &self,
        notification: &ChangeNotification,
    ) -> Result<Option<ShapedEvent>, ShapeError> {
        let record_id = require_record_id(notification)?;
        // The record is gone from normal queries by now; only the
        // logically-deleted view still knows its correlation id.
        let rows = self
            .crm
            .query(
                Query::new("Contact")
                    .filter("Id", record_id)
                    .include_deleted()
                    .limit(1),
            )
            .await
            .map_err(|source| ShapeError::Lookup {
                object: "Contact",
                record_id: record_id.to_string(),
                source,
            })?;
        let uuid = rows
            .first()
            .and_then(|record| correlation_of(record))
            .ok_or_else(|| ShapeError::CorrelationMissing {
                object: "Contact",
                record_id: record_id.to_string(),
            })?;

        let payload = json!({
            "ActionType": "DELETE",
            "UUID": uuid,
            "TimeOfAction": time_of_action(),
        });
        Ok(Some(ShapedEvent {
            schema: SchemaId::UserDelete,
            payload,
        }))
    }
}

#[async_trait]
impl Shaper for ContactShaper {
    fn entity(&self) -> EntityType {
        EntityType::Contact
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
                warn!(action = %other, "unhandled contact action");
                Ok(None)
            }
        }
    }
}

use crate::domain::EntityType;
use crate::infrastructure::schema::{self, SchemaId};

/// One wire-field-to-CRM-field pairing. The tables below are the single
/// source of truth for inbound field mapping and are checked against the
/// schema registry at startup, so a drifted mapping fails the process
/// instead of silently dropping fields at runtime.
#[derive(Debug, Clone, Copy)]
pub struct FieldMap {
    pub wire: &'static str,
    pub crm: &'static str,
}

/// Per-entity inbound contract: correlation carrier, governing schemas and
/// the field table.
#[derive(Debug, Clone, Copy)]
pub struct EntityTable {
    pub entity: EntityType,
    /// Wire element carrying the correlation id.
    pub uuid_wire: &'static str,
    pub create_schema: SchemaId,
    pub update_schema: SchemaId,
    pub delete_schema: SchemaId,
    /// Sparse updates arrive as a FieldsToUpdate list instead of a snapshot.
    pub sparse_update: bool,
    pub fields: &'static [FieldMap],
}

pub const USER_TABLE: EntityTable = EntityTable {
    entity: EntityType::Contact,
    uuid_wire: "UUID",
    create_schema: SchemaId::UserCreate,
    update_schema: SchemaId::UserUpdate,
    delete_schema: SchemaId::UserDelete,
    sparse_update: false,
    fields: &[
        FieldMap { wire: "TimeOfAction", crm: "TimeOfAction" },
        FieldMap { wire: "EncryptedPassword", crm: "Password" },
        FieldMap { wire: "FirstName", crm: "FirstName" },
        FieldMap { wire: "LastName", crm: "LastName" },
        FieldMap { wire: "PhoneNumber", crm: "Phone" },
        FieldMap { wire: "EmailAddress", crm: "Email" },
    ],
};

pub const EVENT_TABLE: EntityTable = EntityTable {
    entity: EntityType::Event,
    uuid_wire: "EventUUID",
    create_schema: SchemaId::EventCreate,
    update_schema: SchemaId::EventUpdate,
    delete_schema: SchemaId::EventDelete,
    sparse_update: false,
    fields: &[
        FieldMap { wire: "EventName", crm: "Name" },
        FieldMap { wire: "EventDescription", crm: "Description" },
        FieldMap { wire: "StartDateTime", crm: "StartDateTime" },
        FieldMap { wire: "EndDateTime", crm: "EndDateTime" },
        FieldMap { wire: "EventLocation", crm: "Location" },
        FieldMap { wire: "Organisator", crm: "Organiser" },
        FieldMap { wire: "Capacity", crm: "Capacity" },
        FieldMap { wire: "EventType", crm: "EventType" },
    ],
};

pub const SESSION_TABLE: EntityTable = EntityTable {
    entity: EntityType::Session,
    uuid_wire: "SessionUUID",
    create_schema: SchemaId::SessionCreate,
    update_schema: SchemaId::SessionUpdate,
    delete_schema: SchemaId::SessionDelete,
    sparse_update: true,
    fields: &[
        FieldMap { wire: "SessionName", crm: "Name" },
        FieldMap { wire: "SessionDescription", crm: "Description" },
        FieldMap { wire: "Capacity", crm: "Capacity" },
        FieldMap { wire: "StartDateTime", crm: "StartDateTime" },
        FieldMap { wire: "EndDateTime", crm: "EndDateTime" },
        FieldMap { wire: "SessionLocation", crm: "Location" },
        FieldMap { wire: "SessionType", crm: "SessionType" },
        FieldMap { wire: "EventUUID", crm: "EventUuid" },
    ],
};

/// Entities with an inbound reconciliation path. Participation changes are
/// consumed by downstream services only; nothing flows back for them.
pub const INBOUND_TABLES: [&EntityTable; 3] = [&USER_TABLE, &EVENT_TABLE, &SESSION_TABLE];

impl EntityTable {
    pub fn crm_field(&self, wire: &str) -> Option<&'static str> {
        self.fields
            .iter()
            .find(|map| map.wire == wire)
            .map(|map| map.crm)
    }

    pub fn wire_field(&self, crm: &str) -> Option<&'static str> {
        self.fields
            .iter()
            .find(|map| map.crm == crm)
            .map(|map| map.wire)
    }
}

pub fn table_for(entity: EntityType) -> Option<&'static EntityTable> {
    INBOUND_TABLES
        .iter()
        .copied()
        .find(|table| table.entity == entity)
}

/// Startup check: every mapped wire field must be known to the governing
/// create schema, and every schema-required field must be covered by the
/// table, the correlation carrier or the action metadata.
pub fn verify_tables() -> Result<(), String> {
    for table in INBOUND_TABLES {
        let def = schema::definition(table.create_schema);
        for map in table.fields {
            if !def.known_fields().any(|field| field == map.wire) {
                return Err(format!(
                    "{} field table maps unknown wire field {} (schema {:?})",
                    table.entity, map.wire, table.create_schema
                ));
            }
        }
        for required in def.required {
            let covered = *required == "ActionType"
                || *required == table.uuid_wire
                || table.crm_field(required).is_some();
            if !covered {
                return Err(format!(
                    "{} field table does not cover schema-required field {} ({:?})",
                    table.entity, required, table.create_schema
                ));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tables_are_complete_against_the_registry() {
        verify_tables().expect("field tables should cover their schemas");
    }

    #[test]
    fn lookups_work_both_ways() {
        assert_eq!(USER_TABLE.crm_field("PhoneNumber"), Some("Phone"));
        assert_eq!(SESSION_TABLE.wire_field("Location"), Some("SessionLocation"));
        assert_eq!(EVENT_TABLE.crm_field("NoSuchField"), None);
    }

    #[test]
    fn participation_has_no_inbound_table() {
        assert!(table_for(EntityType::SessionParticipation).is_none());
    }
}

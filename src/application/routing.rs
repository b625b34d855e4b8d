use crate::domain::EntityType;
use crate::infrastructure::schema::SchemaId;

/// One downstream binding: `(exchange, routing key)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingTarget {
    pub exchange: &'static str,
    pub routing_key: String,
}

/// Downstream services per document kind. The sets differ per entity:
/// billing never sees events or sessions, planning never sees users.
fn services(schema: SchemaId) -> (&'static str, &'static str, &'static [&'static str]) {
    use SchemaId::*;
    match schema {
        UserCreate => ("user", "create", &["frontend", "facturatie", "kassa"]),
        UserUpdate => ("user", "update", &["frontend", "facturatie", "kassa"]),
        UserDelete => ("user", "delete", &["frontend", "facturatie", "kassa"]),
        EventCreate => ("event", "create", &["frontend", "kassa", "planning"]),
        EventUpdate | EventRoster => ("event", "update", &["frontend", "kassa", "planning"]),
        EventDelete => ("event", "delete", &["frontend", "kassa", "planning"]),
        SessionCreate => ("session", "create", &["planning"]),
        SessionUpdate | SessionRoster => ("session", "update", &["planning"]),
        SessionDelete => ("session", "delete", &["planning"]),
        OpsLog => ("log_monitoring", "event", &[]),
    }
}

/// Every `(exchange, routing key)` a document of this kind fans out to.
/// Keys follow `{service}.{entity}.{action}`.
pub fn targets(schema: SchemaId) -> Vec<RoutingTarget> {
    let (exchange, action, service_names) = services(schema);
    service_names
        .iter()
        .map(|service| RoutingTarget {
            exchange,
            routing_key: format!("{service}.{exchange}.{action}"),
        })
        .collect()
}

/// Inbound work queue for `(entity, action)`, e.g. `crm_user_create`.
pub fn queue_name(entity: EntityType, action: &str) -> String {
    format!("crm_{}_{}", entity.wire_name(), action)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_create_fans_out_to_three_distinct_targets() {
        let targets = targets(SchemaId::UserCreate);
        assert_eq!(targets.len(), 3);
        let keys: Vec<&str> = targets.iter().map(|t| t.routing_key.as_str()).collect();
        assert!(keys.contains(&"frontend.user.create"));
        assert!(keys.contains(&"facturatie.user.create"));
        assert!(keys.contains(&"kassa.user.create"));
        assert!(targets.iter().all(|t| t.exchange == "user"));
    }

    #[test]
    fn event_roster_documents_ride_the_event_update_bindings() {
        let targets = targets(SchemaId::EventRoster);
        assert_eq!(targets, super::targets(SchemaId::EventUpdate));
        assert!(targets
            .iter()
            .any(|t| t.routing_key == "planning.event.update"));
    }

    #[test]
    fn roster_documents_ride_the_session_update_binding() {
        let targets = targets(SchemaId::SessionRoster);
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].exchange, "session");
        assert_eq!(targets[0].routing_key, "planning.session.update");
    }

    #[test]
    fn queue_names_follow_the_crm_prefix() {
        assert_eq!(queue_name(EntityType::Contact, "create"), "crm_user_create");
        assert_eq!(queue_name(EntityType::Event, "delete"), "crm_event_delete");
    }
}

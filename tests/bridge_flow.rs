//! Full-pipeline tests: a change notification enters the dispatcher, the
//! published document travels a bound queue and a reconciler applies it to
//! a second record store, as it would in the deployed topology.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::time::sleep;

use crm_bridge::application::fields::{SESSION_TABLE, USER_TABLE};
use crm_bridge::application::{shapers, CdcDispatcher, InboundAction, Reconciler};
use crm_bridge::domain::EntityType;
use crm_bridge::infrastructure::broker::memory::InMemoryBroker;
use crm_bridge::infrastructure::broker::MessageBroker;
use crm_bridge::infrastructure::correlation::CorrelationGenerator;
use crm_bridge::infrastructure::crm::{CrmClient, CrmRecord, InMemoryCrm, Query};
use crm_bridge::infrastructure::ops_log::OpsLogPublisher;

fn dispatcher(broker: Arc<InMemoryBroker>, crm: Arc<InMemoryCrm>) -> CdcDispatcher {
    let shapers = shapers::standard_set(crm, Arc::new(CorrelationGenerator::new()));
    let ops_log = OpsLogPublisher::new(broker.clone(), "CRM_Service");
    CdcDispatcher::new(broker, shapers, ops_log, "crm/api/bridge")
}

fn raw(action: &str, record_id: &str, fields: Value) -> Value {
    let mut payload = fields.as_object().cloned().unwrap_or_default();
    payload.insert(
        "ChangeEventHeader".to_string(),
        json!({
            "changeType": action,
            "changeOrigin": "crm/platform/ui",
            "recordIds": [record_id],
        }),
    );
    json!({ "payload": payload })
}

fn record(pairs: &[(&str, Value)]) -> CrmRecord {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

#[tokio::test]
async fn contact_create_travels_from_cdc_to_the_downstream_store() {
    let broker = Arc::new(InMemoryBroker::new());
    let source = Arc::new(InMemoryCrm::new());
    source.insert("Contact", "001x", record(&[]));
    let downstream = Arc::new(InMemoryCrm::new());

    broker
        .bind_queue("crm_user_create", "user", "frontend.user.create")
        .await
        .unwrap();
    let reconciler = Reconciler::new(
        downstream.clone(),
        &USER_TABLE,
        InboundAction::Create,
        OpsLogPublisher::new(broker.clone(), "Downstream"),
    );
    let consumer_broker: Arc<dyn MessageBroker> = broker.clone();
    let consumer = tokio::spawn(async move {
        let _ = reconciler.run_queue(consumer_broker, "crm_user_create").await;
    });

    let d = dispatcher(broker.clone(), source.clone());
    d.handle(
        EntityType::Contact,
        &raw(
            "CREATE",
            "001x",
            json!({ "FirstName": "Jane", "LastName": "Doe", "Email": "jane@x.com" }),
        ),
    )
    .await;
    sleep(Duration::from_millis(100)).await;

    // The correlation id assigned at the source identifies the same person
    // in the downstream store.
    let assigned = source
        .get("Contact", "001x")
        .and_then(|r| r.get("Uuid").cloned())
        .expect("source contact should carry a correlation id");
    let rows = downstream
        .query(Query::new("Contact").filter("Uuid", assigned))
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("FirstName"), Some(&json!("Jane")));
    assert_eq!(rows[0].get("Email"), Some(&json!("jane@x.com")));
    assert_eq!(broker.acked(), vec!["crm_user_create".to_string()]);
    consumer.abort();
}

#[tokio::test]
async fn session_update_round_trips_the_sparse_change_list() {
    let broker = Arc::new(InMemoryBroker::new());
    let source = Arc::new(InMemoryCrm::new());
    source.insert(
        "Session",
        "s1",
        record(&[("Uuid", json!("s-uuid")), ("Name", json!("Workshop"))]),
    );
    let downstream = Arc::new(InMemoryCrm::new());
    downstream.insert(
        "Session",
        "remote-7",
        record(&[("Uuid", json!("s-uuid")), ("Name", json!("Workshop"))]),
    );

    broker
        .bind_queue("crm_session_update", "session", "planning.session.update")
        .await
        .unwrap();
    let reconciler = Reconciler::new(
        downstream.clone(),
        &SESSION_TABLE,
        InboundAction::Update,
        OpsLogPublisher::new(broker.clone(), "Downstream"),
    );
    let consumer_broker: Arc<dyn MessageBroker> = broker.clone();
    let consumer = tokio::spawn(async move {
        let _ = reconciler
            .run_queue(consumer_broker, "crm_session_update")
            .await;
    });

    let d = dispatcher(broker.clone(), source);
    d.handle(
        EntityType::Session,
        &raw("UPDATE", "s1", json!({ "Capacity": 25 })),
    )
    .await;
    sleep(Duration::from_millis(100)).await;

    let remote = downstream.get("Session", "remote-7").unwrap();
    assert_eq!(remote.get("Capacity"), Some(&json!("25")));
    // Fields the sparse document did not name are untouched.
    assert_eq!(remote.get("Name"), Some(&json!("Workshop")));
    consumer.abort();
}

#[tokio::test]
async fn event_participation_change_publishes_an_event_roster() {
    let broker = Arc::new(InMemoryBroker::new());
    let crm = Arc::new(InMemoryCrm::new());
    crm.insert("Event", "ev1", record(&[("Uuid", json!("ev-uuid"))]));
    crm.insert("Contact", "c1", record(&[("Uuid", json!("c1-uuid"))]));
    crm.insert(
        "EventParticipation",
        "ep1",
        record(&[("EventId", json!("ev1")), ("ContactId", json!("c1"))]),
    );

    let d = dispatcher(broker.clone(), crm);
    d.handle(
        EntityType::EventParticipation,
        &raw("CREATE", "ep1", json!({ "EventId": "ev1", "ContactId": "c1" })),
    )
    .await;

    let rosters: Vec<_> = broker
        .published()
        .into_iter()
        .filter(|m| m.exchange == "event" && m.routing_key.ends_with(".event.update"))
        .collect();
    assert_eq!(rosters.len(), 3);
    let body = String::from_utf8(rosters[0].payload.clone()).unwrap();
    assert!(body.starts_with("<UpdateEvent>"));
    assert!(body.contains("<EventUUID>ev-uuid</EventUUID>"));
    assert!(body.contains("<User><UUID>c1-uuid</UUID></User>"));
}

#[tokio::test]
async fn participation_change_publishes_a_roster_snapshot() {
    let broker = Arc::new(InMemoryBroker::new());
    let crm = Arc::new(InMemoryCrm::new());
    crm.insert(
        "Session",
        "s1",
        record(&[("Uuid", json!("s-uuid")), ("EventUuid", json!("ev-uuid"))]),
    );
    crm.insert("Contact", "c1", record(&[("Uuid", json!("c1-uuid"))]));
    crm.insert(
        "SessionParticipation",
        "p1",
        record(&[("SessionId", json!("s1")), ("ContactId", json!("c1"))]),
    );

    let d = dispatcher(broker.clone(), crm);
    d.handle(
        EntityType::SessionParticipation,
        &raw("CREATE", "p1", json!({ "SessionId": "s1", "ContactId": "c1" })),
    )
    .await;

    let rosters: Vec<_> = broker
        .published()
        .into_iter()
        .filter(|m| m.routing_key == "planning.session.update")
        .collect();
    assert_eq!(rosters.len(), 1);
    let body = String::from_utf8(rosters[0].payload.clone()).unwrap();
    assert!(body.starts_with("<UpdateSession>"));
    assert!(body.contains("<SessionUUID>s-uuid</SessionUUID>"));
    assert!(body.contains("<EventUUID>ev-uuid</EventUUID>"));
    assert!(body.contains("<User>c1-uuid</User>"));
}

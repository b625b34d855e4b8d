use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::application::routing;
use crate::application::shaper::Shaper;
use crate::domain::{ChangeNotification, EntityType};
use crate::infrastructure::broker::MessageBroker;
use crate::infrastructure::ops_log::OpsLogPublisher;
use crate::infrastructure::schema;
use crate::infrastructure::xml;

/// Entry point for CDC notifications. One dispatcher serves every entity;
/// shaping is delegated per entity, then the document is serialized,
/// validated and fanned out to its routing targets.
///
/// The dispatcher never propagates failures upstream: a notification that
/// cannot be processed is logged, mirrored to the operational log and
/// dropped. CDC replay, not redelivery, is the recovery path.
pub struct CdcDispatcher {
    broker: Arc<dyn MessageBroker>,
    shapers: HashMap<EntityType, Arc<dyn Shaper>>,
    ops_log: OpsLogPublisher,
    self_origin_marker: String,
}

impl CdcDispatcher {
    pub fn new(
        broker: Arc<dyn MessageBroker>,
        shapers: HashMap<EntityType, Arc<dyn Shaper>>,
        ops_log: OpsLogPublisher,
        self_origin_marker: impl Into<String>,
    ) -> Self {
        Self {
            broker,
            shapers,
            ops_log,
            self_origin_marker: self_origin_marker.into(),
        }
    }

    pub async fn handle(&self, entity: EntityType, raw: &Value) {
        let notification = match ChangeNotification::from_raw(raw) {
            Ok(notification) => notification,
            Err(e) => {
                warn!(%entity, error = %e, "unparseable change notification dropped");
                self.ops_log
                    .warn("400", &format!("unparseable {entity} notification: {e}"))
                    .await;
                return;
            }
        };

        // Changes this bridge wrote back to the CRM come around again as
        // CDC traffic; the origin marker breaks the loop.
        if notification
            .header
            .change_origin
            .contains(&self.self_origin_marker)
        {
            debug!(%entity, origin = %notification.header.change_origin, "own echo suppressed");
            return;
        }

        let action = notification.header.change_type.clone();
        if action.requires_record_id() && notification.record_id().is_none() {
            warn!(%entity, %action, "notification without record id dropped");
            self.ops_log
                .warn("400", &format!("{entity} {action} carried no record id"))
                .await;
            return;
        }

        let Some(shaper) = self.shapers.get(&entity) else {
            warn!(%entity, "no shaper registered");
            return;
        };

        let shaped = match shaper.shape(&notification).await {
            Ok(Some(shaped)) => shaped,
            Ok(None) => return,
            Err(e) => {
                error!(%entity, %action, error = %e, "shaping failed, notification dropped");
                self.ops_log
                    .error("500", &format!("{entity} {action} shaping failed: {e}"))
                    .await;
                return;
            }
        };

        let document = xml::json_to_xml(schema::definition(shaped.schema).root, &shaped.payload);
        // Validation gates the exact bytes that go on the wire; an invalid
        // document is never published anywhere.
        if let Err(violation) = schema::validate(shaped.schema, document.as_bytes()) {
            error!(%entity, %action, error = %violation, "document failed validation");
            self.ops_log
                .error("422", &format!("{entity} {action} document invalid: {violation}"))
                .await;
            return;
        }

        let targets = routing::targets(shaped.schema);
        if let Some(first) = targets.first() {
            if let Err(e) = self.broker.declare_exchange(first.exchange).await {
                error!(exchange = first.exchange, error = %e, "exchange declare failed");
                return;
            }
        }

        let mut delivered = 0usize;
        for target in &targets {
            match self
                .broker
                .publish(target.exchange, &target.routing_key, document.as_bytes())
                .await
            {
                Ok(()) => delivered += 1,
                // Targets are independent; one dead consumer must not
                // starve the others.
                Err(e) => {
                    error!(
                        exchange = target.exchange,
                        routing_key = %target.routing_key,
                        error = %e,
                        "publish failed"
                    );
                }
            }
        }
        info!(%entity, %action, delivered, total = targets.len(), "change dispatched");
        self.ops_log
            .info(
                "200",
                &format!("{entity} {action} dispatched to {delivered}/{} targets", targets.len()),
            )
            .await;
    }
}

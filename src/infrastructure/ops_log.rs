use std::sync::Arc;

use serde_json::json;
use tracing::warn;

use crate::infrastructure::broker::MessageBroker;
use crate::infrastructure::schema::{self, SchemaId};
use crate::infrastructure::xml;

pub const OPS_LOG_EXCHANGE: &str = "log_monitoring";
pub const OPS_LOG_ROUTING_KEY: &str = "controlroom.log.event";

/// Side-channel operational log stream. Every significant pipeline outcome
/// is mirrored to the control room as a `<Log>` document; the channel is
/// advisory, so its own failures are logged locally and swallowed.
#[derive(Clone)]
pub struct OpsLogPublisher {
    broker: Arc<dyn MessageBroker>,
    service_name: String,
}

impl OpsLogPublisher {
    pub fn new(broker: Arc<dyn MessageBroker>, service_name: impl Into<String>) -> Self {
        Self {
            broker,
            service_name: service_name.into(),
        }
    }

    pub async fn info(&self, code: &str, message: &str) {
        self.send("info", code, message).await;
    }

    pub async fn warn(&self, code: &str, message: &str) {
        self.send("warn", code, message).await;
    }

    pub async fn error(&self, code: &str, message: &str) {
        self.send("error", code, message).await;
    }

    async fn send(&self, status: &str, code: &str, message: &str) {
        let payload = json!({
            "ServiceName": self.service_name,
            "Status": status,
            "Code": code,
            "Message": message,
        });
        let document = xml::json_to_xml(schema::definition(SchemaId::OpsLog).root, &payload);
        if let Err(violation) = schema::validate(SchemaId::OpsLog, document.as_bytes()) {
            warn!(error = %violation, "operational log document rejected, not sent");
            return;
        }
        if let Err(e) = self
            .broker
            .publish(OPS_LOG_EXCHANGE, OPS_LOG_ROUTING_KEY, document.as_bytes())
            .await
        {
            warn!(error = %e, "operational log publish failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::broker::memory::InMemoryBroker;

    #[tokio::test]
    async fn publishes_validated_log_documents() {
        let broker = Arc::new(InMemoryBroker::new());
        let ops = OpsLogPublisher::new(broker.clone(), "CRM_Service");
        ops.info("200", "pipeline started").await;

        let published = broker.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].exchange, OPS_LOG_EXCHANGE);
        assert_eq!(published[0].routing_key, OPS_LOG_ROUTING_KEY);
        let body = String::from_utf8(published[0].payload.clone()).unwrap();
        assert!(body.starts_with("<Log>"));
        assert!(body.contains("<Code>200</Code>"));
    }
}

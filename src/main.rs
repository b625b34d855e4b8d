use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info, warn};

use crm_bridge::application::{fields, routing, shapers, CdcDispatcher, InboundAction, Reconciler};
use crm_bridge::domain::EntityType;
use crm_bridge::infrastructure::broker::{KafkaBroker, MessageBroker};
use crm_bridge::infrastructure::config::AppConfig;
use crm_bridge::infrastructure::correlation::CorrelationGenerator;
use crm_bridge::infrastructure::crm::{CrmClient, RestCrmClient};
use crm_bridge::infrastructure::logging;
use crm_bridge::infrastructure::ops_log::OpsLogPublisher;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let _log_guards = logging::init_logging(None).context("failed to initialize logging")?;

    // A drifted field table is a wiring bug; refuse to start on one.
    fields::verify_tables().map_err(anyhow::Error::msg)?;

    let config = AppConfig::from_env();
    info!(service = %config.service_name, "starting crm bridge");

    let broker: Arc<dyn MessageBroker> =
        Arc::new(KafkaBroker::new(config.broker.clone()).context("broker connection failed")?);
    let crm: Arc<dyn CrmClient> = Arc::new(RestCrmClient::new(config.crm.clone()));
    let correlation = Arc::new(CorrelationGenerator::new());
    let ops_log = OpsLogPublisher::new(broker.clone(), config.service_name.clone());

    // Inbound: one reconciler task per (entity, action) queue.
    for table in fields::INBOUND_TABLES {
        for action in InboundAction::ALL {
            let queue = routing::queue_name(table.entity, action.as_str());
            let reconciler = Reconciler::new(crm.clone(), table, action, ops_log.clone());
            let broker = broker.clone();
            tokio::spawn(async move {
                if let Err(e) = reconciler.run_queue(broker, &queue).await {
                    error!(%queue, error = %e, "reconciler terminated");
                }
            });
        }
    }

    // Outbound: one intake task per CDC channel, all feeding the shared
    // dispatcher.
    let dispatcher = Arc::new(CdcDispatcher::new(
        broker.clone(),
        shapers::standard_set(crm, correlation),
        ops_log.clone(),
        config.self_origin_marker.clone(),
    ));
    for entity in EntityType::ALL {
        let channel = entity.cdc_channel();
        broker.declare_queue(channel).await?;
        let mut deliveries = broker.consume(channel).await?;
        let dispatcher = dispatcher.clone();
        let broker = broker.clone();
        tokio::spawn(async move {
            info!(channel, "cdc intake consuming");
            while let Some(delivery) = deliveries.recv().await {
                match serde_json::from_slice(&delivery.payload) {
                    Ok(raw) => dispatcher.handle(entity, &raw).await,
                    Err(e) => warn!(channel, error = %e, "non-json cdc delivery dropped"),
                }
                // The CDC stream is drop-on-failure; replay is the recovery
                // path, so every delivery is acknowledged.
                if let Err(e) = broker.ack(&delivery).await {
                    error!(channel, error = %e, "cdc ack failed");
                }
            }
        });
    }

    ops_log.info("200", "bridge started").await;
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown signal received, stopping");
    Ok(())
}

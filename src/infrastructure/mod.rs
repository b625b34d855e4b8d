pub mod address;
pub mod broker;
pub mod config;
pub mod correlation;
pub mod crm;
pub mod logging;
pub mod ops_log;
pub mod schema;
pub mod xml;

pub use broker::{BrokerConfig, BrokerError, Delivery, KafkaBroker, MessageBroker};
pub use config::AppConfig;
pub use correlation::{CorrelationGenerator, CorrelationId};
pub use crm::{CrmClient, CrmConfig, CrmError, CrmRecord, InMemoryCrm, Query, RestCrmClient};
pub use ops_log::OpsLogPublisher;
pub use schema::{SchemaId, SchemaViolation};

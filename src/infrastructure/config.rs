use crate::infrastructure::broker::BrokerConfig;
use crate::infrastructure::crm::CrmConfig;

/// Marker the CRM stamps on change notifications that originate from this
/// system's own API write-backs. Matching notifications are self-echoes and
/// must be discarded before shaping.
pub const DEFAULT_SELF_ORIGIN_MARKER: &str = "crm/api/bridge";

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub broker: BrokerConfig,
    pub crm: CrmConfig,
    pub service_name: String,
    pub self_origin_marker: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            broker: BrokerConfig::default(),
            crm: CrmConfig::default(),
            service_name: "CRM_Service".to_string(),
            self_origin_marker: DEFAULT_SELF_ORIGIN_MARKER.to_string(),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            broker: BrokerConfig::from_env(),
            crm: CrmConfig::from_env(),
            service_name: std::env::var("BRIDGE_SERVICE_NAME").unwrap_or(defaults.service_name),
            self_origin_marker: std::env::var("BRIDGE_SELF_ORIGIN_MARKER")
                .unwrap_or(defaults.self_origin_marker),
        }
    }
}

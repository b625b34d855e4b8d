use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{Map, Value};
use thiserror::Error;

/// A CRM record as a keyed field set. Every record carries its native
/// identifier under `Id`.
pub type CrmRecord = Map<String, Value>;

#[derive(Debug, Error)]
pub enum CrmError {
    #[error("{object} record {id} not found")]
    NotFound { object: String, id: String },
    #[error("CRM request failed: {0}")]
    Request(String),
    #[error("CRM rejected the operation: {status} {detail}")]
    Api { status: u16, detail: String },
    #[error("unexpected CRM response shape: {0}")]
    Response(String),
}

impl From<reqwest::Error> for CrmError {
    fn from(e: reqwest::Error) -> Self {
        CrmError::Request(e.to_string())
    }
}

/// Equality-filtered record query. `include_deleted` scans the logically
/// deleted view as well, which is the only way to recover fields of a
/// record that DELETE has already removed from normal queries.
#[derive(Debug, Clone, Default)]
pub struct Query {
    pub object: String,
    pub filters: Vec<(String, Value)>,
    pub include_deleted: bool,
    pub limit: Option<usize>,
}

impl Query {
    pub fn new(object: impl Into<String>) -> Self {
        Self {
            object: object.into(),
            ..Default::default()
        }
    }

    pub fn filter(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.push((field.into(), value.into()));
        self
    }

    pub fn include_deleted(mut self) -> Self {
        self.include_deleted = true;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Record-store collaborator contract. The bridge only ever needs these
/// five primitives; connection management and auth live behind the
/// implementation.
#[async_trait]
pub trait CrmClient: Send + Sync {
    async fn retrieve(&self, object: &str, id: &str) -> Result<CrmRecord, CrmError>;
    async fn create(&self, object: &str, fields: CrmRecord) -> Result<String, CrmError>;
    async fn update(&self, object: &str, id: &str, fields: CrmRecord) -> Result<(), CrmError>;
    async fn destroy(&self, object: &str, id: &str) -> Result<(), CrmError>;
    async fn query(&self, query: Query) -> Result<Vec<CrmRecord>, CrmError>;
}

#[derive(Debug, Clone)]
pub struct CrmConfig {
    pub base_url: String,
    pub api_token: String,
}

impl Default for CrmConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8088".to_string(),
            api_token: String::new(),
        }
    }
}

impl CrmConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            base_url: std::env::var("CRM_BASE_URL").unwrap_or(defaults.base_url),
            api_token: std::env::var("CRM_API_TOKEN").unwrap_or(defaults.api_token),
        }
    }
}

/// REST adapter over the CRM's record API.
pub struct RestCrmClient {
    http: reqwest::Client,
    config: CrmConfig,
}

impl RestCrmClient {
    pub fn new(config: CrmConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }

    fn record_url(&self, object: &str, id: &str) -> String {
        format!("{}/objects/{object}/{id}", self.config.base_url)
    }

    async fn check(response: reqwest::Response, object: &str, id: &str) -> Result<reqwest::Response, CrmError> {
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(CrmError::NotFound {
                object: object.to_string(),
                id: id.to_string(),
            });
        }
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let detail = response.text().await.unwrap_or_default();
            return Err(CrmError::Api { status, detail });
        }
        Ok(response)
    }
}

#[async_trait]
impl CrmClient for RestCrmClient {
    async fn retrieve(&self, object: &str, id: &str) -> Result<CrmRecord, CrmError> {
        let response = self
            .http
            .get(self.record_url(object, id))
            .bearer_auth(&self.config.api_token)
            .send()
            .await?;
        let response = Self::check(response, object, id).await?;
        Ok(response.json::<CrmRecord>().await?)
    }

    async fn create(&self, object: &str, fields: CrmRecord) -> Result<String, CrmError> {
        let response = self
            .http
            .post(format!("{}/objects/{object}", self.config.base_url))
            .bearer_auth(&self.config.api_token)
            .json(&Value::Object(fields))
            .send()
            .await?;
        let response = Self::check(response, object, "<new>").await?;
        let body: Value = response.json().await?;
        body.get("Id")
            .and_then(Value::as_str)
            .map(|id| id.to_string())
            .ok_or_else(|| CrmError::Response("create response carries no Id".to_string()))
    }

    async fn update(&self, object: &str, id: &str, fields: CrmRecord) -> Result<(), CrmError> {
        let response = self
            .http
            .patch(self.record_url(object, id))
            .bearer_auth(&self.config.api_token)
            .json(&Value::Object(fields))
            .send()
            .await?;
        Self::check(response, object, id).await.map(|_| ())
    }

    async fn destroy(&self, object: &str, id: &str) -> Result<(), CrmError> {
        let response = self
            .http
            .delete(self.record_url(object, id))
            .bearer_auth(&self.config.api_token)
            .send()
            .await?;
        Self::check(response, object, id).await.map(|_| ())
    }

    async fn query(&self, query: Query) -> Result<Vec<CrmRecord>, CrmError> {
        let filters: Map<String, Value> = query.filters.iter().cloned().collect();
        let body = serde_json::json!({
            "object": query.object,
            "filters": filters,
            "includeDeleted": query.include_deleted,
            "limit": query.limit,
        });
        let response = self
            .http
            .post(format!("{}/query", self.config.base_url))
            .bearer_auth(&self.config.api_token)
            .json(&body)
            .send()
            .await?;
        let response = Self::check(response, &query.object, "<query>").await?;
        Ok(response.json::<Vec<CrmRecord>>().await?)
    }
}

/// In-memory record store for tests and local runs. Destroyed records move
/// to a logically-deleted view so include-deleted queries still see them.
#[derive(Default)]
pub struct InMemoryCrm {
    live: DashMap<String, DashMap<String, CrmRecord>>,
    deleted: DashMap<String, DashMap<String, CrmRecord>>,
    next_id: AtomicU64,
}

impl InMemoryCrm {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a record under a caller-chosen id.
    pub fn insert(&self, object: &str, id: &str, mut fields: CrmRecord) {
        fields.insert("Id".to_string(), Value::String(id.to_string()));
        self.live
            .entry(object.to_string())
            .or_default()
            .insert(id.to_string(), fields);
    }

    pub fn get(&self, object: &str, id: &str) -> Option<CrmRecord> {
        self.live.get(object)?.get(id).map(|r| r.clone())
    }

    pub fn len(&self, object: &str) -> usize {
        self.live.get(object).map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self, object: &str) -> bool {
        self.len(object) == 0
    }

    fn matches(record: &CrmRecord, filters: &[(String, Value)]) -> bool {
        filters
            .iter()
            .all(|(field, expected)| record.get(field) == Some(expected))
    }
}

#[async_trait]
impl CrmClient for InMemoryCrm {
    async fn retrieve(&self, object: &str, id: &str) -> Result<CrmRecord, CrmError> {
        self.get(object, id).ok_or_else(|| CrmError::NotFound {
            object: object.to_string(),
            id: id.to_string(),
        })
    }

    async fn create(&self, object: &str, mut fields: CrmRecord) -> Result<String, CrmError> {
        let id = format!(
            "{}-{:04}",
            object.to_ascii_lowercase(),
            self.next_id.fetch_add(1, Ordering::SeqCst)
        );
        fields.insert("Id".to_string(), Value::String(id.clone()));
        self.live
            .entry(object.to_string())
            .or_default()
            .insert(id.clone(), fields);
        Ok(id)
    }

    async fn update(&self, object: &str, id: &str, fields: CrmRecord) -> Result<(), CrmError> {
        let records = self.live.entry(object.to_string()).or_default();
        let mut record = records.get_mut(id).ok_or_else(|| CrmError::NotFound {
            object: object.to_string(),
            id: id.to_string(),
        })?;
        for (field, value) in fields {
            record.insert(field, value);
        }
        Ok(())
    }

    async fn destroy(&self, object: &str, id: &str) -> Result<(), CrmError> {
        let record = self
            .live
            .get(object)
            .and_then(|records| records.remove(id))
            .ok_or_else(|| CrmError::NotFound {
                object: object.to_string(),
                id: id.to_string(),
            })?;
        self.deleted
            .entry(object.to_string())
            .or_default()
            .insert(record.0, record.1);
        Ok(())
    }

    async fn query(&self, query: Query) -> Result<Vec<CrmRecord>, CrmError> {
        let mut results = Vec::new();
        if let Some(records) = self.live.get(&query.object) {
            for record in records.iter() {
                if Self::matches(&record, &query.filters) {
                    results.push(record.clone());
                }
            }
        }
        if query.include_deleted {
            if let Some(records) = self.deleted.get(&query.object) {
                for record in records.iter() {
                    if Self::matches(&record, &query.filters) {
                        results.push(record.clone());
                    }
                }
            }
        }
        if let Some(limit) = query.limit {
            results.truncate(limit);
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(pairs: &[(&str, Value)]) -> CrmRecord {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[tokio::test]
    async fn destroyed_records_only_surface_with_include_deleted() {
        let crm = InMemoryCrm::new();
        crm.insert("Contact", "001x", record(&[("Uuid", json!("u-1"))]));
        crm.destroy("Contact", "001x").await.unwrap();

        let live = crm
            .query(Query::new("Contact").filter("Id", "001x"))
            .await
            .unwrap();
        assert!(live.is_empty());

        let all = crm
            .query(Query::new("Contact").filter("Id", "001x").include_deleted())
            .await
            .unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0]["Uuid"], json!("u-1"));
    }

    #[tokio::test]
    async fn update_merges_fields() {
        let crm = InMemoryCrm::new();
        crm.insert("Contact", "001x", record(&[("FirstName", json!("Jane"))]));
        crm.update("Contact", "001x", record(&[("LastName", json!("Doe"))]))
            .await
            .unwrap();
        let stored = crm.get("Contact", "001x").unwrap();
        assert_eq!(stored["FirstName"], json!("Jane"));
        assert_eq!(stored["LastName"], json!("Doe"));
    }

    #[tokio::test]
    async fn create_assigns_an_id() {
        let crm = InMemoryCrm::new();
        let id = crm
            .create("Event", record(&[("Name", json!("Hack Night"))]))
            .await
            .unwrap();
        assert_eq!(crm.get("Event", &id).unwrap()["Id"], json!(id));
    }
}

//! PostgREST/Supabase remote backend
//!
//! Requires the `rest` feature.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::backend::{RemoteBackend, RemoteError};
use crate::error::{LifesyncError, Result};
use crate::types::Table;

/// Connection settings for the REST backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestConfig {
    /// Project URL, e.g. https://xyz.supabase.co
    pub base_url: String,
    /// Anonymous/service API key sent as `apikey`
    pub api_key: String,
    /// User access token; falls back to the API key
    #[serde(default)]
    pub access_token: Option<String>,
    /// Field used to address records in UPDATE/DELETE filters
    #[serde(default = "default_id_field")]
    pub id_field: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_id_field() -> String {
    "id".to_string()
}

fn default_timeout_secs() -> u64 {
    15
}

impl RestConfig {
    /// Create config from environment variables
    pub fn from_env() -> Option<Self> {
        let base_url = std::env::var("LIFESYNC_REMOTE_URL").ok()?;
        let api_key = std::env::var("LIFESYNC_API_KEY").ok()?;
        let access_token = std::env::var("LIFESYNC_ACCESS_TOKEN").ok();

        Some(Self {
            base_url,
            api_key,
            access_token,
            id_field: default_id_field(),
            timeout_secs: default_timeout_secs(),
        })
    }
}

/// [`RemoteBackend`] speaking the PostgREST dialect used by Supabase
pub struct RestBackend {
    client: reqwest::Client,
    config: RestConfig,
}

impl RestBackend {
    pub fn new(config: RestConfig) -> Result<Self> {
        if config.base_url.trim().is_empty() {
            return Err(LifesyncError::Config("remote URL is empty".to_string()));
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| LifesyncError::Config(format!("HTTP client: {}", e)))?;

        Ok(Self { client, config })
    }

    fn table_url(&self, table: Table) -> String {
        format!(
            "{}/rest/v1/{}",
            self.config.base_url.trim_end_matches('/'),
            table.as_str()
        )
    }

    fn id_filter(&self, id: &str) -> [(String, String); 1] {
        [(self.config.id_field.clone(), format!("eq.{}", id))]
    }

    fn request(&self, method: reqwest::Method, url: String) -> reqwest::RequestBuilder {
        let token = self
            .config
            .access_token
            .as_deref()
            .unwrap_or(&self.config.api_key);
        self.client
            .request(method, url)
            .header("apikey", &self.config.api_key)
            .bearer_auth(token)
    }

    async fn send(
        &self,
        request: reqwest::RequestBuilder,
    ) -> std::result::Result<reqwest::Response, RemoteError> {
        let response = request
            .send()
            .await
            .map_err(|e| RemoteError::Network(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let message = response.text().await.unwrap_or_default();
        Err(match status.as_u16() {
            404 => RemoteError::NotFound(message),
            409 => RemoteError::Conflict(message),
            code => RemoteError::Rejected {
                status: code,
                message,
            },
        })
    }
}

#[async_trait]
impl RemoteBackend for RestBackend {
    async fn insert(&self, table: Table, record: &Value) -> std::result::Result<(), RemoteError> {
        let request = self
            .request(reqwest::Method::POST, self.table_url(table))
            .header("Prefer", "return=minimal")
            .json(record);
        self.send(request).await?;
        Ok(())
    }

    async fn update(
        &self,
        table: Table,
        id: &str,
        changes: &Value,
    ) -> std::result::Result<(), RemoteError> {
        let request = self
            .request(reqwest::Method::PATCH, self.table_url(table))
            .query(&self.id_filter(id))
            .header("Prefer", "return=representation")
            .json(changes);
        let response = self.send(request).await?;

        // PostgREST answers 200 with an empty array when the filter matched nothing
        let rows: Value = response
            .json()
            .await
            .map_err(|e| RemoteError::Network(e.to_string()))?;
        if rows.as_array().is_some_and(|rows| rows.is_empty()) {
            return Err(RemoteError::NotFound(format!("{}/{}", table, id)));
        }
        Ok(())
    }

    async fn delete(&self, table: Table, id: &str) -> std::result::Result<(), RemoteError> {
        let request = self
            .request(reqwest::Method::DELETE, self.table_url(table))
            .query(&self.id_filter(id))
            .header("Prefer", "return=minimal");
        self.send(request).await?;
        Ok(())
    }

    async fn health_check(&self) -> std::result::Result<(), RemoteError> {
        let url = format!("{}/rest/v1/", self.config.base_url.trim_end_matches('/'));
        self.send(self.request(reqwest::Method::HEAD, url)).await?;
        Ok(())
    }

    fn name(&self) -> &str {
        "rest"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> RestConfig {
        RestConfig {
            base_url: "https://example.supabase.co/".to_string(),
            api_key: "anon".to_string(),
            access_token: None,
            id_field: "id".to_string(),
            timeout_secs: 5,
        }
    }

    #[test]
    fn test_table_url() {
        let backend = RestBackend::new(config()).unwrap();
        assert_eq!(
            backend.table_url(Table::JournalEntries),
            "https://example.supabase.co/rest/v1/journal_entries"
        );
        assert_eq!(
            backend.id_filter("t1"),
            [("id".to_string(), "eq.t1".to_string())]
        );
    }

    #[test]
    fn test_empty_url_rejected() {
        let mut config = config();
        config.base_url = "  ".to_string();
        assert!(matches!(
            RestBackend::new(config),
            Err(LifesyncError::Config(_))
        ));
    }

    #[test]
    fn test_config_defaults() {
        let config: RestConfig =
            serde_json::from_str(r#"{"base_url": "http://localhost:54321", "api_key": "k"}"#)
                .unwrap();
        assert_eq!(config.id_field, "id");
        assert_eq!(config.timeout_secs, 15);
    }
}

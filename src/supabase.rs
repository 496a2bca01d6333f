use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::config::SupabaseConfig;
use crate::error::{CrosspostError, Result};

/// PostgREST client for the Supabase tables the relay reads and writes.
#[derive(Clone)]
pub struct SupabaseClient {
    http: reqwest::Client,
    rest_url: String,
    key: String,
}

/// `column=eq.value` filter pair.
pub fn eq(column: &str, value: impl ToString) -> (String, String) {
    (column.to_string(), format!("eq.{}", value.to_string()))
}

impl SupabaseClient {
    pub fn new(config: &SupabaseConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            http,
            rest_url: format!("{}/rest/v1", config.url.trim_end_matches('/')),
            key: config.key.clone(),
        })
    }

    fn request(&self, method: reqwest::Method, table: &str) -> reqwest::RequestBuilder {
        let url = format!("{}/{table}", self.rest_url);
        self.http
            .request(method, url)
            .header("apikey", &self.key)
            .header("Authorization", format!("Bearer {}", self.key))
    }

    pub async fn select<T: DeserializeOwned>(
        &self,
        table: &str,
        columns: &str,
        filters: &[(String, String)],
    ) -> Result<Vec<T>> {
        let mut query = vec![("select".to_string(), columns.to_string())];
        query.extend(filters.iter().cloned());

        debug!("GET {table} {filters:?}");
        let resp = self
            .request(reqwest::Method::GET, table)
            .query(&query)
            .send()
            .await?;
        Self::rows(table, resp).await
    }

    pub async fn insert<B: Serialize, T: DeserializeOwned>(
        &self,
        table: &str,
        row: &B,
    ) -> Result<Vec<T>> {
        debug!("POST {table}");
        let resp = self
            .request(reqwest::Method::POST, table)
            .header("Prefer", "return=representation")
            .json(row)
            .send()
            .await?;
        Self::rows(table, resp).await
    }

    pub async fn update<B: Serialize, T: DeserializeOwned>(
        &self,
        table: &str,
        filters: &[(String, String)],
        patch: &B,
    ) -> Result<Vec<T>> {
        debug!("PATCH {table} {filters:?}");
        let resp = self
            .request(reqwest::Method::PATCH, table)
            .header("Prefer", "return=representation")
            .query(filters)
            .json(patch)
            .send()
            .await?;
        Self::rows(table, resp).await
    }

    /// Reachability check against one table.
    pub async fn ping(&self, table: &str) -> Result<()> {
        let _: Vec<serde_json::Value> = self
            .select(table, "*", &[("limit".to_string(), "1".to_string())])
            .await?;
        Ok(())
    }

    async fn rows<T: DeserializeOwned>(table: &str, resp: reqwest::Response) -> Result<Vec<T>> {
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(CrosspostError::Api(format!(
                "Supabase {table} returned {status}: {body}"
            )));
        }
        Ok(resp.json().await?)
    }
}

//! Hosted backend over HTTP (PostgREST dialect)
//!
//! Rows are read and written through `/rest/v1/<table>`; change
//! subscriptions go through the realtime socket (see [`RealtimeChannel`]).

use crate::sync::backend::realtime::{realtime_url, RealtimeChannel};
use crate::sync::backend::{Backend, Subscription};
use crate::sync::types::{Filter, Query, Row, Table};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION};
use serde_json::Value;
use tracing::{debug, error, info};

/// HTTP client for the hosted database
pub struct RestBackend {
    client: reqwest::Client,
    base_url: String,
    access_key: String,
}

impl RestBackend {
    /// `access_key` is sent as `apikey` and as the bearer token on every request
    pub fn new(base_url: &str, access_key: &str) -> Result<Self> {
        let client = reqwest::ClientBuilder::new()
            .default_headers({
                let mut headers = HeaderMap::new();
                headers.insert(
                    HeaderName::from_static("apikey"),
                    HeaderValue::from_str(access_key).context("invalid access key")?,
                );
                headers.insert(
                    AUTHORIZATION,
                    HeaderValue::from_str(&format!("Bearer {}", access_key))
                        .context("invalid access key")?,
                );
                headers
            })
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            access_key: access_key.to_string(),
        })
    }

    fn table_url(&self, table: Table) -> String {
        format!("{}/rest/v1/{}", self.base_url, table)
    }

    /// Query string pairs for a read
    pub fn query_params(query: &Query) -> Vec<(String, String)> {
        let mut params = vec![("select".to_string(), "*".to_string())];
        for filter in &query.filters {
            match filter {
                Filter::Eq(column, value) => {
                    params.push((column.clone(), format!("eq.{}", filter_text(value))));
                }
                Filter::In(column, values) => {
                    let list = values
                        .iter()
                        .map(|v| format!("\"{}\"", filter_text(v)))
                        .collect::<Vec<_>>()
                        .join(",");
                    params.push((column.clone(), format!("in.({})", list)));
                }
            }
        }
        if let Some(order) = query.order {
            params.push((
                "order".to_string(),
                format!("created_at.{0},id.{0}", order.keyword()),
            ));
        }
        params
    }

    fn id_param(id: &str) -> [(&'static str, String); 1] {
        [("id", format!("eq.{}", id))]
    }

    /// Reads the body, turning non-2xx statuses into errors
    async fn read_body(response: reqwest::Response, what: &str) -> Result<Vec<u8>> {
        let status = response.status();
        let body = response
            .bytes()
            .await
            .with_context(|| format!("{}: failed to read response body", what))?;
        if !status.is_success() {
            let text = String::from_utf8_lossy(&body);
            error!(
                "[RestBackend] {} failed, HTTP status: {}, body: {}",
                what, status, text
            );
            return Err(anyhow!("{}: HTTP {}: {}", what, status, text));
        }
        Ok(body.to_vec())
    }
}

fn filter_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[async_trait]
impl Backend for RestBackend {
    async fn select(&self, table: Table, query: &Query) -> Result<Vec<Row>> {
        query.check_columns(table)?;
        if query.is_empty_match() {
            return Ok(Vec::new());
        }
        let what = format!("select from {}", table);
        let url = self.table_url(table);
        debug!("[RestBackend] GET {} {:?}", url, query);

        let response = self
            .client
            .get(&url)
            .query(&Self::query_params(query))
            .send()
            .await
            .with_context(|| format!("{}: request failed", what))?;
        let body = Self::read_body(response, &what).await?;
        let rows: Vec<Row> = serde_json::from_slice(&body)
            .with_context(|| format!("{}: invalid response body", what))?;
        debug!("[RestBackend] {} -> {} rows", what, rows.len());
        Ok(rows)
    }

    async fn insert(&self, table: Table, row: Row) -> Result<Row> {
        let what = format!("insert into {}", table);
        let response = self
            .client
            .post(self.table_url(table))
            .header("Prefer", "return=representation")
            .json(&row)
            .send()
            .await
            .with_context(|| format!("{}: request failed", what))?;
        let body = Self::read_body(response, &what).await?;
        let rows: Vec<Row> = serde_json::from_slice(&body)
            .with_context(|| format!("{}: invalid response body", what))?;
        let stored = rows
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("{}: no row returned", what))?;
        let id = stored.get("id").and_then(Value::as_str).unwrap_or("?");
        info!("[RestBackend] inserted into {}: {}", table, id);
        Ok(stored)
    }

    async fn update(&self, table: Table, id: &str, patch: Row) -> Result<()> {
        let what = format!("update of {} {}", table, id);
        let response = self
            .client
            .patch(self.table_url(table))
            .query(&Self::id_param(id))
            .header("Prefer", "return=minimal")
            .json(&patch)
            .send()
            .await
            .with_context(|| format!("{}: request failed", what))?;
        Self::read_body(response, &what).await?;
        debug!("[RestBackend] {} done", what);
        Ok(())
    }

    async fn delete(&self, table: Table, id: &str) -> Result<()> {
        let what = format!("delete of {} {}", table, id);
        let response = self
            .client
            .delete(self.table_url(table))
            .query(&Self::id_param(id))
            .send()
            .await
            .with_context(|| format!("{}: request failed", what))?;
        Self::read_body(response, &what).await?;
        debug!("[RestBackend] {} done", what);
        Ok(())
    }

    async fn subscribe(&self, table: Table) -> Result<Subscription> {
        let url = realtime_url(&self.base_url, &self.access_key)?;
        RealtimeChannel::new(table, &self.access_key).open(&url).await
    }
}

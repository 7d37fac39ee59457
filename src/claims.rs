//! # Claims Store
//!
//! Read-only access to the claims table the voice agent talks about. The
//! relay itself never touches claims; the store backs `GET /api/v1/claims`
//! and is the collaborator a response generator would consult.
//!
//! [`RestClaimsStore`] speaks the PostgREST dialect used by hosted Postgres
//! services: `GET {url}/rest/v1/{table}?select=*&order=id.asc` with the
//! service key sent both as `apikey` and as a bearer token.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClaimsError {
    #[error("claims store unavailable: {0}")]
    Unavailable(String),

    #[error("claims store returned an invalid response: {0}")]
    InvalidResponse(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimRecord {
    pub id: i64,
    pub policy_number: String,
    pub first_name: String,
    pub last_name: String,
    #[serde(default)]
    pub status: Option<bool>,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub date: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait ClaimsStore: Send + Sync {
    /// All claims, ordered by `id` ascending.
    async fn list_claims(&self) -> Result<Vec<ClaimRecord>, ClaimsError>;
}

/// Accepts RFC 3339, timezone-less timestamps (read as UTC) and bare dates.
fn lenient_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    let Some(raw) = raw.filter(|s| !s.trim().is_empty()) else {
        return Ok(None);
    };
    parse_timestamp(raw.trim())
        .map(Some)
        .ok_or_else(|| serde::de::Error::custom(format!("unrecognized timestamp '{}'", raw)))
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

pub struct RestClaimsStore {
    client: reqwest::Client,
    url: String,
    table: String,
    api_key: Option<String>,
}

impl RestClaimsStore {
    pub fn new(client: reqwest::Client, url: String, table: String, api_key: Option<String>) -> Self {
        Self {
            client,
            url,
            table,
            api_key,
        }
    }

    fn list_url(&self) -> String {
        format!(
            "{}/rest/v1/{}?select=*&order=id.asc",
            self.url.trim_end_matches('/'),
            self.table
        )
    }
}

#[async_trait]
impl ClaimsStore for RestClaimsStore {
    async fn list_claims(&self) -> Result<Vec<ClaimRecord>, ClaimsError> {
        let mut request = self.client.get(self.list_url());
        if let Some(key) = self.api_key.as_deref().filter(|key| !key.is_empty()) {
            request = request.header("apikey", key).bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ClaimsError::Unavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClaimsError::Unavailable(format!("{}: {}", status, body.trim())));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| ClaimsError::Unavailable(e.to_string()))?;
        let mut claims: Vec<ClaimRecord> =
            serde_json::from_slice(&body).map_err(|e| ClaimsError::InvalidResponse(e.to_string()))?;

        claims.sort_by_key(|claim| claim.id);
        debug!(count = claims.len(), "Fetched claims");
        Ok(claims)
    }
}

/// Fixed set of claims held in memory.
#[derive(Debug, Default)]
pub struct InMemoryClaimsStore {
    claims: Vec<ClaimRecord>,
}

impl InMemoryClaimsStore {
    pub fn new(mut claims: Vec<ClaimRecord>) -> Self {
        claims.sort_by_key(|claim| claim.id);
        Self { claims }
    }
}

#[async_trait]
impl ClaimsStore for InMemoryClaimsStore {
    async fn list_claims(&self) -> Result<Vec<ClaimRecord>, ClaimsError> {
        Ok(self.claims.clone())
    }
}

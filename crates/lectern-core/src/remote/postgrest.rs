//! Supabase PostgREST remote store client.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::Deserialize;

use super::{
    Filter, Precondition, RemoteError, RemoteErrorKind, RemoteQuery, RemoteResult, RemoteStore,
};
use crate::config::RemoteConfig;
use crate::schema::{CollectionSchema, Row};
use crate::util::compact_text;
use crate::{Error, Result};

const UNIQUE_VIOLATION: &str = "23505";

/// PostgREST client authorized as the signed-in principal.
#[derive(Clone)]
pub struct PostgrestRemote {
    rest_url: String,
    anon_key: String,
    access_token: Option<String>,
    client: reqwest::Client,
}

impl std::fmt::Debug for PostgrestRemote {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("PostgrestRemote")
            .field("rest_url", &self.rest_url)
            .field("anon_key", &"[REDACTED]")
            .field(
                "access_token",
                &self.access_token.as_ref().map(|_| "[REDACTED]"),
            )
            .finish_non_exhaustive()
    }
}

impl PostgrestRemote {
    pub fn new(config: RemoteConfig, timeout: Duration) -> Result<Self> {
        let config = config.validated()?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|error| Error::InvalidInput(format!("failed to build HTTP client: {error}")))?;
        Ok(Self {
            rest_url: config.rest_url(),
            anon_key: config.anon_key,
            access_token: config.access_token,
            client,
        })
    }

    fn request(&self, method: Method, table: &str) -> RequestBuilder {
        let token = self.access_token.as_deref().unwrap_or(&self.anon_key);
        self.client
            .request(method, format!("{}/{table}", self.rest_url))
            .header("apikey", &self.anon_key)
            .bearer_auth(token)
            .header("Accept", "application/json")
    }

    async fn send_for_rows(&self, request: RequestBuilder) -> RemoteResult<Vec<Row>> {
        let response = request.send().await.map_err(map_transport_error)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_response(status, &body));
        }
        response.json::<Vec<Row>>().await.map_err(map_transport_error)
    }
}

#[async_trait]
impl RemoteStore for PostgrestRemote {
    async fn select(&self, query: &RemoteQuery) -> RemoteResult<Vec<Row>> {
        let request = self
            .request(Method::GET, &query.table)
            .query(&select_params(query));
        self.send_for_rows(request).await
    }

    async fn fetch(&self, table: &str, id: &str) -> RemoteResult<Option<Row>> {
        let request = self.request(Method::GET, table).query(&[
            ("select", "*".to_string()),
            (CollectionSchema::ID_FIELD, format!("eq.{id}")),
            ("limit", "1".to_string()),
        ]);
        Ok(self.send_for_rows(request).await?.into_iter().next())
    }

    async fn insert(&self, table: &str, row: &Row) -> RemoteResult<Row> {
        let request = self
            .request(Method::POST, table)
            .header("Prefer", "return=representation")
            .json(row);
        self.send_for_rows(request)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| RemoteError::transient("insert returned no representation"))
    }

    async fn update(
        &self,
        table: &str,
        id: &str,
        row: &Row,
        precondition: Option<&Precondition>,
    ) -> RemoteResult<Option<Row>> {
        let request = self
            .request(Method::PATCH, table)
            .header("Prefer", "return=representation")
            .query(&update_params(id, precondition))
            .json(row);
        Ok(self.send_for_rows(request).await?.into_iter().next())
    }

    async fn delete(&self, table: &str, id: &str) -> RemoteResult<bool> {
        let request = self
            .request(Method::DELETE, table)
            .header("Prefer", "return=representation")
            .query(&[(CollectionSchema::ID_FIELD, format!("eq.{id}"))]);
        Ok(!self.send_for_rows(request).await?.is_empty())
    }
}

fn filter_param(filter: &Filter) -> (String, String) {
    (
        filter.field.clone(),
        format!("{}.{}", filter.op.as_str(), filter.value_text()),
    )
}

fn select_params(query: &RemoteQuery) -> Vec<(String, String)> {
    let mut params = vec![("select".to_string(), "*".to_string())];
    params.extend(query.filters.iter().map(filter_param));
    if let Some(after) = &query.after_id {
        params.push(filter_param(&Filter::gt(
            CollectionSchema::ID_FIELD,
            after.as_str(),
        )));
    }
    params.push(("order".to_string(), "id.asc".to_string()));
    params.push(("limit".to_string(), query.limit.to_string()));
    params
}

fn update_params(id: &str, precondition: Option<&Precondition>) -> Vec<(String, String)> {
    let mut params = vec![filter_param(&Filter::eq(CollectionSchema::ID_FIELD, id))];
    if let Some(precondition) = precondition {
        params.push(filter_param(&Filter::eq(
            precondition.field.clone(),
            precondition.value.clone(),
        )));
    }
    params
}

#[derive(Debug, Deserialize)]
struct PostgrestErrorBody {
    code: Option<String>,
    message: Option<String>,
    error: Option<String>,
}

fn classify_response(status: StatusCode, body: &str) -> RemoteError {
    let parsed = serde_json::from_str::<PostgrestErrorBody>(body).ok();
    let code = parsed.as_ref().and_then(|payload| payload.code.clone());
    let message = parse_api_error(status, parsed, body);

    // 409 also covers foreign-key and exclusion violations; only 23505 is a replay
    let kind = if code.as_deref() == Some(UNIQUE_VIOLATION) {
        RemoteErrorKind::DuplicateKey
    } else if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        RemoteErrorKind::Unauthorized
    } else if status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
    {
        RemoteErrorKind::Transient
    } else {
        RemoteErrorKind::Rejected
    };
    RemoteError::new(kind, message)
}

fn parse_api_error(status: StatusCode, parsed: Option<PostgrestErrorBody>, body: &str) -> String {
    if let Some(message) = parsed.and_then(|payload| payload.message.or(payload.error)) {
        return format!("{} ({})", compact_text(&message), status.as_u16());
    }

    let trimmed = body.trim();
    if trimmed.is_empty() {
        format!("HTTP {}", status.as_u16())
    } else {
        format!("{} ({})", compact_text(trimmed), status.as_u16())
    }
}

fn map_transport_error(error: reqwest::Error) -> RemoteError {
    if error.is_timeout() {
        RemoteError::new(RemoteErrorKind::Timeout, error.to_string())
    } else if error.is_decode() {
        RemoteError::rejected(error.to_string())
    } else {
        RemoteError::transient(error.to_string())
    }
}

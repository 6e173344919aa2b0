//! REST implementation of the Remote Gateway.

use std::time::Duration;

use reqwest::{RequestBuilder, Response, StatusCode, Url};
use serde::Deserialize;

use super::gateway::{GatewayError, GatewayResult, RemoteGateway, Session};
use crate::error::{Error, Result};
use crate::models::{Payload, RemoteRecord};
use crate::util::{compact_text, is_http_url, normalize_text_option};

const DEFAULT_TIMEOUT_SECS: u64 = 20;

/// Remote Gateway speaking the `/v1/entities` REST API.
#[derive(Clone)]
pub struct HttpRemoteGateway {
    base_url: String,
    endpoint: Url,
    client: reqwest::Client,
}

impl std::fmt::Debug for HttpRemoteGateway {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("HttpRemoteGateway")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl HttpRemoteGateway {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        Self::with_timeout(base_url, Duration::from_secs(DEFAULT_TIMEOUT_SECS))
    }

    pub fn with_timeout(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let base_url = normalize_endpoint(base_url.into())?;
        let endpoint = Url::parse(&base_url)
            .map_err(|error| Error::Config(format!("invalid API URL: {error}")))?;
        if endpoint.cannot_be_a_base() {
            return Err(Error::Config(format!("API URL {base_url} cannot take a path")));
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|error| Error::Config(format!("failed to build HTTP client: {error}")))?;
        Ok(Self {
            base_url,
            endpoint,
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// `{base}/v1/entities/{segments..}`, each segment percent-encoded.
    fn entities_url(&self, segments: &[&str]) -> Url {
        let mut url = self.endpoint.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty()
                .extend(["v1", "entities"])
                .extend(segments);
        }
        url
    }

    fn collection_url(&self, entity_type: &str, since: Option<i64>) -> Url {
        let mut url = self.entities_url(&[entity_type]);
        if let Some(since) = since {
            url.query_pairs_mut()
                .append_pair("since", &since.to_string());
        }
        url
    }

    fn record_url(&self, entity_type: &str, remote_id: &str) -> Url {
        self.entities_url(&[entity_type, remote_id])
    }

    async fn send(&self, session: &Session, request: RequestBuilder) -> GatewayResult<Response> {
        let response = request
            .bearer_auth(&session.access_token)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(|error| GatewayError::Transient(error.to_string()))?;

        if response.status().is_success() {
            return Ok(response);
        }

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Err(classify_failure(status, &body))
    }
}

async fn read_record(response: Response) -> GatewayResult<RemoteRecord> {
    response
        .json::<RemoteRecord>()
        .await
        .map_err(|error| GatewayError::Transient(format!("invalid record response: {error}")))
}

impl RemoteGateway for HttpRemoteGateway {
    async fn create(
        &self,
        session: &Session,
        entity_type: &str,
        payload: &Payload,
    ) -> GatewayResult<RemoteRecord> {
        let request = self
            .client
            .post(self.collection_url(entity_type, None))
            .json(payload);
        let response = self.send(session, request).await?;
        let mut record = read_record(response).await?;
        if record.payload.is_empty() {
            record.payload = payload.clone();
        }
        Ok(record)
    }

    async fn update(
        &self,
        session: &Session,
        entity_type: &str,
        remote_id: &str,
        payload: &Payload,
        expected_version: i64,
    ) -> GatewayResult<RemoteRecord> {
        let request = self
            .client
            .put(self.record_url(entity_type, remote_id))
            .header(reqwest::header::IF_MATCH, expected_version.to_string())
            .json(payload);
        let response = self.send(session, request).await?;
        let mut record = read_record(response).await?;
        if record.payload.is_empty() {
            record.payload = payload.clone();
        }
        Ok(record)
    }

    async fn delete(
        &self,
        session: &Session,
        entity_type: &str,
        remote_id: &str,
        expected_version: i64,
    ) -> GatewayResult<()> {
        let request = self
            .client
            .delete(self.record_url(entity_type, remote_id))
            .header(reqwest::header::IF_MATCH, expected_version.to_string());
        self.send(session, request).await?;
        Ok(())
    }

    async fn get(
        &self,
        session: &Session,
        entity_type: &str,
        remote_id: &str,
    ) -> GatewayResult<RemoteRecord> {
        let request = self.client.get(self.record_url(entity_type, remote_id));
        let response = self.send(session, request).await?;
        let record = read_record(response).await?;
        if record.deleted {
            return Err(GatewayError::NotFound);
        }
        Ok(record)
    }

    async fn list(
        &self,
        session: &Session,
        entity_type: &str,
        since: Option<i64>,
    ) -> GatewayResult<Vec<RemoteRecord>> {
        let request = self.client.get(self.collection_url(entity_type, since));
        let response = self.send(session, request).await?;
        let body = response
            .json::<ListResponse>()
            .await
            .map_err(|error| GatewayError::Transient(format!("invalid list response: {error}")))?;
        Ok(body.into_records())
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ListResponse {
    Bare(Vec<RemoteRecord>),
    Wrapped { records: Vec<RemoteRecord> },
}

impl ListResponse {
    fn into_records(self) -> Vec<RemoteRecord> {
        match self {
            Self::Bare(records) | Self::Wrapped { records } => records,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: Option<String>,
    message: Option<String>,
    current: Option<RemoteRecord>,
}

/// Map a non-success response onto the gateway error taxonomy.
fn classify_failure(status: StatusCode, body: &str) -> GatewayError {
    match status.as_u16() {
        401 | 403 => GatewayError::AuthExpired(parse_api_error(status, body)),
        404 | 410 => GatewayError::NotFound,
        409 | 412 => GatewayError::VersionConflict(parse_conflict_copy(body)),
        400 | 422 => GatewayError::Validation(parse_api_error(status, body)),
        _ => GatewayError::Transient(parse_api_error(status, body)),
    }
}

/// Current remote copy carried by a conflict response, either as the whole
/// body or under `current`.
fn parse_conflict_copy(body: &str) -> Option<RemoteRecord> {
    if let Ok(record) = serde_json::from_str::<RemoteRecord>(body) {
        return Some(record);
    }
    serde_json::from_str::<ApiErrorBody>(body)
        .ok()
        .and_then(|payload| payload.current)
}

fn parse_api_error(status: StatusCode, body: &str) -> String {
    if let Ok(payload) = serde_json::from_str::<ApiErrorBody>(body) {
        if let Some(message) = payload.message.or(payload.error) {
            return format!("{} ({})", message.trim(), status.as_u16());
        }
    }

    let trimmed = compact_text(body);
    if trimmed.is_empty() {
        format!("HTTP {}", status.as_u16())
    } else {
        format!("{} ({})", trimmed, status.as_u16())
    }
}

fn normalize_endpoint(raw: String) -> Result<String> {
    let endpoint = normalize_text_option(Some(raw))
        .ok_or_else(|| Error::Config("API URL must not be empty".to_string()))?;
    if is_http_url(&endpoint) {
        Ok(endpoint.trim_end_matches('/').to_string())
    } else {
        Err(Error::Config(
            "API URL must include http:// or https://".to_string(),
        ))
    }
}

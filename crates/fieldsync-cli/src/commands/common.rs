use std::env;
use std::path::{Path, PathBuf};

use chrono::Utc;
use fieldsync_core::config::{FieldsyncConfig, RemoteConfig};
use fieldsync_core::models::{OutboxDescriptor, Payload};
use fieldsync_core::{EntityRecord, LocalId, SyncStore};
use serde::Serialize;

use crate::error::CliError;

/// Everything a command needs, resolved once from flags, environment and config.
#[derive(Debug)]
pub struct CliContext {
    pub db_path: PathBuf,
    pub config: FieldsyncConfig,
    pub remote: RemoteConfig,
}

impl CliContext {
    pub fn open_store(&self) -> Result<SyncStore, CliError> {
        open_store(&self.db_path)
    }
}

#[derive(Debug, Serialize)]
pub struct EntityListItem {
    pub id: String,
    pub entity_type: String,
    pub remote_id: Option<String>,
    pub sync_state: String,
    pub local_version: i64,
    pub updated_at: i64,
    pub relative_time: String,
    pub payload: Payload,
}

#[derive(Debug, Serialize)]
pub struct OutboxItem {
    pub id: String,
    pub entity_type: String,
    pub operation: String,
    pub status: String,
    pub attempt_count: u32,
    pub next_attempt_at: i64,
    pub next_attempt_at_iso: String,
    pub last_error: Option<String>,
    pub in_flight: bool,
}

pub fn resolve_config_path(cli_config: Option<PathBuf>) -> Option<PathBuf> {
    cli_config
        .or_else(|| env::var_os("FIELDSYNC_CONFIG").map(PathBuf::from))
        .or_else(|| dirs::config_dir().map(|dir| dir.join("fieldsync").join("config.json")))
}

pub fn load_config(path: Option<&Path>) -> Result<FieldsyncConfig, CliError> {
    match path {
        Some(path) => Ok(FieldsyncConfig::load(path)?),
        None => Ok(FieldsyncConfig::default()),
    }
}

/// Flag, then `FIELDSYNC_DB_PATH`, then the config file, then the data directory.
pub fn resolve_db_path(
    cli_db_path: Option<PathBuf>,
    config: &FieldsyncConfig,
) -> Result<PathBuf, CliError> {
    resolve_db_path_from(
        cli_db_path,
        env::var_os("FIELDSYNC_DB_PATH").map(PathBuf::from),
        config,
    )
}

pub fn resolve_db_path_from(
    cli_db_path: Option<PathBuf>,
    env_db_path: Option<PathBuf>,
    config: &FieldsyncConfig,
) -> Result<PathBuf, CliError> {
    if let Some(path) = cli_db_path.or(env_db_path) {
        return Ok(path);
    }
    if let Some(path) = config
        .db_path
        .as_deref()
        .map(str::trim)
        .filter(|path| !path.is_empty())
    {
        return Ok(PathBuf::from(path));
    }
    default_db_path()
}

pub fn default_db_path() -> Result<PathBuf, CliError> {
    dirs::data_dir()
        .map(|dir| dir.join("fieldsync").join("fieldsync.db"))
        .ok_or_else(|| CliError::Config("failed to resolve CLI data directory".to_string()))
}

/// Flags win over environment, environment over the config file.
pub fn resolve_remote_config(
    api_url: Option<String>,
    token: Option<String>,
    config: &FieldsyncConfig,
) -> Result<RemoteConfig, CliError> {
    let from_flags = RemoteConfig {
        api_url,
        access_token: token,
    };
    let from_env = RemoteConfig {
        api_url: env::var("FIELDSYNC_API_URL").ok(),
        access_token: env::var("FIELDSYNC_ACCESS_TOKEN").ok(),
    };
    let remote = from_flags.or(from_env).or(config.remote.clone());
    remote.validate()?;
    Ok(remote)
}

pub fn open_store(path: &Path) -> Result<SyncStore, CliError> {
    Ok(SyncStore::open_path(path)?)
}

pub fn parse_payload(raw: &str) -> Result<Payload, CliError> {
    let value: serde_json::Value = serde_json::from_str(raw.trim())
        .map_err(|error| CliError::InvalidPayload(error.to_string()))?;
    match value {
        serde_json::Value::Object(payload) => Ok(payload),
        other => Err(CliError::InvalidPayload(format!(
            "expected a JSON object, got {}",
            json_kind(&other)
        ))),
    }
}

pub fn parse_draft_payload(raw: &str) -> Result<serde_json::Value, CliError> {
    serde_json::from_str(raw.trim()).map_err(|error| CliError::InvalidPayload(error.to_string()))
}

const fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a boolean",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "an array",
        serde_json::Value::Object(_) => "an object",
    }
}

pub fn normalize_entity_identifier(id: &str) -> Result<String, CliError> {
    let trimmed = id.trim();
    if trimmed.is_empty() {
        Err(CliError::EmptyEntityId)
    } else {
        Ok(trimmed.to_string())
    }
}

pub async fn resolve_entity(query: &str, store: &SyncStore) -> Result<EntityRecord, CliError> {
    let query = normalize_entity_identifier(query)?;
    if let Ok(local_id) = query.parse::<LocalId>() {
        if let Some(record) = store.get(&local_id).await? {
            return Ok(record);
        }
    }

    let matching_ids = store.find_ids_by_prefix(&query, 3).await?;

    match matching_ids.len() {
        0 => Err(CliError::EntityNotFound(query)),
        1 => {
            let resolved_id = matching_ids[0]
                .parse::<LocalId>()
                .map_err(|_| CliError::EntityNotFound(query.clone()))?;
            store
                .get(&resolved_id)
                .await?
                .ok_or(CliError::EntityNotFound(query))
        }
        _ => {
            let options = matching_ids
                .iter()
                .map(|id| short_id(id))
                .collect::<Vec<_>>()
                .join(", ");

            Err(CliError::AmbiguousEntityId(format!(
                "ID prefix '{query}' is ambiguous; matches: {options}"
            )))
        }
    }
}

pub async fn resolve_parent(
    parent: Option<&str>,
    store: &SyncStore,
) -> Result<Option<LocalId>, CliError> {
    match parent {
        Some(query) => Ok(Some(resolve_entity(query, store).await?.local_id)),
        None => Ok(None),
    }
}

pub fn short_id(id: &str) -> String {
    id.chars().take(13).collect()
}

pub fn payload_preview(payload: &Payload, max_chars: usize) -> String {
    let rendered = serde_json::Value::Object(payload.clone()).to_string();
    if rendered.chars().count() <= max_chars {
        rendered
    } else {
        let mut truncated = rendered
            .chars()
            .take(max_chars.saturating_sub(3))
            .collect::<String>();
        truncated.push_str("...");
        truncated
    }
}

pub fn format_entity_lines(records: &[EntityRecord]) -> Vec<String> {
    let now_ms = Utc::now().timestamp_millis();
    records
        .iter()
        .map(|record| {
            let id = short_id(&record.local_id.to_string());
            let state = record.sync_state.as_str();
            let preview = payload_preview(&record.payload, 40);
            let relative_time = format_relative_time(record.updated_at, now_ms);
            format!(
                "{id:<13}  {:<22}  {state:<14}  {preview:<40}  {relative_time}",
                record.entity_type
            )
        })
        .collect()
}

pub fn entity_to_list_item(record: &EntityRecord) -> EntityListItem {
    let now_ms = Utc::now().timestamp_millis();
    EntityListItem {
        id: record.local_id.to_string(),
        entity_type: record.entity_type.clone(),
        remote_id: record.remote_id.clone(),
        sync_state: record.sync_state.as_str().to_string(),
        local_version: record.local_version,
        updated_at: record.updated_at,
        relative_time: format_relative_time(record.updated_at, now_ms),
        payload: record.payload.clone(),
    }
}

pub fn descriptor_to_item(descriptor: &OutboxDescriptor) -> OutboxItem {
    OutboxItem {
        id: descriptor.local_id.to_string(),
        entity_type: descriptor.entity_type.clone(),
        operation: descriptor.operation.as_str().to_string(),
        status: descriptor.status.as_str().to_string(),
        attempt_count: descriptor.attempt_count,
        next_attempt_at: descriptor.next_attempt_at,
        next_attempt_at_iso: format_timestamp(descriptor.next_attempt_at),
        last_error: descriptor.last_error.clone(),
        in_flight: descriptor.in_flight,
    }
}

pub fn format_outbox_lines(descriptors: &[OutboxDescriptor]) -> Vec<String> {
    descriptors
        .iter()
        .map(|descriptor| {
            let id = short_id(&descriptor.local_id.to_string());
            let mut line = format!(
                "{id:<13}  {:<6}  {:<7}  attempts={}  next={}",
                descriptor.operation.as_str(),
                descriptor.status.as_str(),
                descriptor.attempt_count,
                format_timestamp(descriptor.next_attempt_at)
            );
            if descriptor.in_flight {
                line.push_str("  in-flight");
            }
            if let Some(error) = descriptor.last_error.as_deref() {
                line.push_str("  error=");
                line.push_str(error);
            }
            line
        })
        .collect()
}

pub fn format_timestamp(timestamp_ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(timestamp_ms).map_or_else(
        || timestamp_ms.to_string(),
        |date_time| date_time.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
    )
}

pub fn format_relative_time(timestamp_ms: i64, now_ms: i64) -> String {
    let diff = now_ms.saturating_sub(timestamp_ms);
    let minute = 60_000;
    let hour = 60 * minute;
    let day = 24 * hour;
    let week = 7 * day;

    if diff < minute {
        "just now".to_string()
    } else if diff < hour {
        format!("{}m ago", diff / minute)
    } else if diff < day {
        format!("{}h ago", diff / hour)
    } else if diff < week {
        format!("{}d ago", diff / day)
    } else {
        format!("{}w ago", diff / week)
    }
}

use std::path::{Path, PathBuf};

use clap::Parser;
use fieldsync_core::config::{FieldsyncConfig, RemoteConfig};
use fieldsync_core::db::{Database, EntityRepository, SqliteEntityRepository};
use fieldsync_core::models::{DescriptorStatus, Operation, OutboxDescriptor};
use fieldsync_core::services::Resolution;
use fieldsync_core::sync::CycleReport;
use fieldsync_core::{EntityRecord, SyncState};
use pretty_assertions::assert_eq;
use serde_json::json;
use tempfile::tempdir;

use crate::cli::{Cli, Commands};
use crate::commands::common::{
    format_outbox_lines, format_relative_time, format_timestamp, normalize_entity_identifier,
    open_store, parse_payload, payload_preview, resolve_db_path_from, resolve_entity, CliContext,
};
use crate::commands::draft::{run_draft_save, run_draft_submit};
use crate::commands::entity::{resolution_from_flags, run_add, run_edit};
use crate::commands::sync::{format_cycle_report, run_sync};
use crate::error::CliError;

fn context(db_path: &Path) -> CliContext {
    CliContext {
        db_path: db_path.to_path_buf(),
        config: FieldsyncConfig::default(),
        remote: RemoteConfig::default(),
    }
}

fn seeded_record(id: &str, name: &str) -> EntityRecord {
    let mut record = EntityRecord::new_pending(
        "equipment",
        json!({"name": name}).as_object().cloned().unwrap(),
        None,
        1_000,
    );
    record.local_id = id.parse().unwrap();
    record.sync_state = SyncState::Synced;
    record
}

#[test]
fn parse_payload_requires_json_object() {
    let payload = parse_payload(r#" {"name": "Pump"} "#).unwrap();
    assert_eq!(payload["name"], json!("Pump"));

    assert!(matches!(
        parse_payload("[1, 2]"),
        Err(CliError::InvalidPayload(message)) if message.contains("an array")
    ));
    assert!(matches!(
        parse_payload("{not json"),
        Err(CliError::InvalidPayload(_))
    ));
}

#[test]
fn normalize_entity_identifier_rejects_empty() {
    assert!(matches!(
        normalize_entity_identifier(" \n "),
        Err(CliError::EmptyEntityId)
    ));
    assert_eq!(normalize_entity_identifier("  abc123  ").unwrap(), "abc123");
}

#[test]
fn resolution_flags_map_to_exactly_one_choice() {
    assert_eq!(
        resolution_from_flags(true, false, None).unwrap(),
        Resolution::UseLocal
    );
    assert_eq!(
        resolution_from_flags(false, true, None).unwrap(),
        Resolution::UseRemote
    );
    let Resolution::Custom(payload) =
        resolution_from_flags(false, false, Some(r#"{"status": "ok"}"#)).unwrap()
    else {
        panic!("expected custom resolution");
    };
    assert_eq!(payload["status"], json!("ok"));
    assert!(resolution_from_flags(true, true, None).is_err());
}

#[test]
fn resolve_command_requires_a_choice() {
    assert!(Cli::try_parse_from(["fieldsync", "resolve", "abc"]).is_err());
    assert!(Cli::try_parse_from(["fieldsync", "resolve", "abc", "--local", "--remote"]).is_err());

    let cli = Cli::try_parse_from(["fieldsync", "resolve", "abc", "--remote"]).unwrap();
    assert!(matches!(
        cli.command,
        Commands::Resolve {
            remote: true,
            local: false,
            payload: None,
            ..
        }
    ));
}

#[test]
fn global_flags_are_accepted_after_subcommand() {
    let cli = Cli::try_parse_from([
        "fieldsync",
        "list",
        "--type",
        "equipment",
        "--db-path",
        "/tmp/fieldsync.db",
        "--api-url",
        "https://api.example.com",
    ])
    .unwrap();
    assert_eq!(cli.db_path, Some(PathBuf::from("/tmp/fieldsync.db")));
    assert_eq!(cli.api_url.as_deref(), Some("https://api.example.com"));
    assert!(matches!(
        cli.command,
        Commands::List { entity_type: Some(ref kind), .. } if kind == "equipment"
    ));
}

#[test]
fn db_path_prefers_flag_then_env_then_config() {
    let config = FieldsyncConfig {
        db_path: Some("/data/config.db".to_string()),
        ..FieldsyncConfig::default()
    };

    let resolved = resolve_db_path_from(
        Some(PathBuf::from("/flag.db")),
        Some(PathBuf::from("/env.db")),
        &config,
    )
    .unwrap();
    assert_eq!(resolved, PathBuf::from("/flag.db"));

    let resolved = resolve_db_path_from(None, Some(PathBuf::from("/env.db")), &config).unwrap();
    assert_eq!(resolved, PathBuf::from("/env.db"));

    let resolved = resolve_db_path_from(None, None, &config).unwrap();
    assert_eq!(resolved, PathBuf::from("/data/config.db"));
}

#[test]
fn format_relative_time_units() {
    let now = 10_000_000_000;
    assert_eq!(format_relative_time(now - 30_000, now), "just now");
    assert_eq!(format_relative_time(now - 120_000, now), "2m ago");
    assert_eq!(format_relative_time(now - 2 * 60 * 60_000, now), "2h ago");
    assert_eq!(format_relative_time(now - 3 * 24 * 60 * 60_000, now), "3d ago");
}

#[test]
fn format_timestamp_returns_utc_label() {
    assert_eq!(format_timestamp(0), "1970-01-01 00:00:00 UTC");
}

#[test]
fn payload_preview_truncates_with_ellipsis() {
    let payload = json!({"name": "A very long equipment name"})
        .as_object()
        .cloned()
        .unwrap();
    assert_eq!(payload_preview(&payload, 20), "{\"name\":\"A very l...");
}

#[test]
fn outbox_lines_show_status_attempts_and_error() {
    let descriptor = OutboxDescriptor {
        local_id: "11111111-1111-7111-8111-111111111111".parse().unwrap(),
        entity_type: "equipment".to_string(),
        operation: Operation::Update,
        payload: None,
        local_version: 2,
        enqueued_at: 0,
        attempt_count: 5,
        next_attempt_at: 0,
        last_backoff_ms: 8_000,
        last_error: Some("remote unreachable".to_string()),
        status: DescriptorStatus::Stalled,
        in_flight: false,
    };

    let rendered = format_outbox_lines(&[descriptor]);
    assert_eq!(rendered.len(), 1);
    assert!(rendered[0].starts_with("11111111-1111"));
    assert!(rendered[0].contains("UPDATE"));
    assert!(rendered[0].contains("STALLED"));
    assert!(rendered[0].contains("attempts=5"));
    assert!(rendered[0].contains("error=remote unreachable"));
}

#[test]
fn cycle_report_mentions_pause() {
    let report = CycleReport {
        pushed: 2,
        paused: true,
        ..CycleReport::default()
    };
    let lines = format_cycle_report(&report);
    assert!(lines[0].starts_with("pushed=2"));
    assert!(lines.iter().any(|line| line.contains("paused")));
}

#[tokio::test(flavor = "current_thread")]
async fn resolve_entity_supports_exact_and_prefix_id() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("fieldsync.db");
    {
        let db = Database::open(&db_path).unwrap();
        let repo = SqliteEntityRepository::new(db.connection());
        repo.insert(&seeded_record("11111111-1111-7111-8111-111111111111", "A"))
            .unwrap();
        repo.insert(&seeded_record("11111111-1111-7111-8111-222222222222", "B"))
            .unwrap();
    }
    let store = open_store(&db_path).unwrap();

    let exact = resolve_entity("11111111-1111-7111-8111-222222222222", &store)
        .await
        .unwrap();
    assert_eq!(exact.payload["name"], json!("B"));

    let by_prefix = resolve_entity("11111111-1111-7111-8111-1", &store)
        .await
        .unwrap();
    assert_eq!(by_prefix.payload["name"], json!("A"));

    assert!(matches!(
        resolve_entity("11111111", &store).await,
        Err(CliError::AmbiguousEntityId(message)) if message.contains("ambiguous")
    ));
    assert!(matches!(
        resolve_entity("ffff", &store).await,
        Err(CliError::EntityNotFound(_))
    ));
}

#[tokio::test(flavor = "current_thread")]
async fn add_then_edit_queues_single_descriptor() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("fieldsync.db");
    let context = context(&db_path);

    run_add("equipment", r#"{"name": "Pump"}"#, None, &context)
        .await
        .unwrap();
    let store = open_store(&db_path).unwrap();
    let created = store.list(Some("equipment"), 10, 0).await.unwrap();
    assert_eq!(created.len(), 1);

    let id = created[0].local_id.to_string();
    run_edit(&id[..13], r#"{"name": "Pump B"}"#, &context)
        .await
        .unwrap();

    let outbox = store.list_outbox(10).await.unwrap();
    assert_eq!(outbox.len(), 1);
    assert_eq!(outbox[0].operation, Operation::Create);
    assert_eq!(outbox[0].payload.as_ref().unwrap()["name"], json!("Pump B"));
}

#[tokio::test(flavor = "current_thread")]
async fn draft_save_and_submit_create_entity() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("fieldsync.db");
    let context = context(&db_path);

    run_draft_save("maintenance:new", r#"{"notes": "check belts"}"#, &context)
        .await
        .unwrap();
    run_draft_submit("maintenance:new", "maintenance_session", None, &context)
        .await
        .unwrap();

    let store = open_store(&db_path).unwrap();
    assert!(store.load_draft("maintenance:new").await.unwrap().is_none());
    let sessions = store
        .list(Some("maintenance_session"), 10, 0)
        .await
        .unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].payload["notes"], json!("check belts"));
}

#[tokio::test(flavor = "current_thread")]
async fn sync_without_remote_reports_not_configured() {
    let dir = tempdir().unwrap();
    let context = context(&dir.path().join("fieldsync.db"));

    assert!(matches!(
        run_sync(&context).await,
        Err(CliError::SyncNotConfigured)
    ));
}

use fieldsync_core::services::Resolution;

use crate::commands::common::{
    entity_to_list_item, format_entity_lines, format_timestamp, parse_payload, resolve_entity,
    resolve_parent, CliContext, EntityListItem,
};
use crate::error::CliError;

pub async fn run_add(
    entity_type: &str,
    payload: &str,
    parent: Option<&str>,
    context: &CliContext,
) -> Result<(), CliError> {
    let payload = parse_payload(payload)?;
    let store = context.open_store()?;
    let parent = resolve_parent(parent, &store).await?;

    let record = store.create(entity_type.trim(), payload, parent).await?;
    println!("{}", record.local_id);
    Ok(())
}

pub async fn run_edit(id: &str, payload: &str, context: &CliContext) -> Result<(), CliError> {
    let payload = parse_payload(payload)?;
    let store = context.open_store()?;
    let record = resolve_entity(id, &store).await?;

    if record.payload == payload {
        println!("{}", record.local_id);
        return Ok(());
    }

    let updated = store.update(record.local_id, payload).await?;
    println!("{}", updated.local_id);
    Ok(())
}

pub async fn run_delete(id: &str, context: &CliContext) -> Result<(), CliError> {
    let store = context.open_store()?;
    let record = resolve_entity(id, &store).await?;

    store.delete(record.local_id).await?;
    println!("{}", record.local_id);
    Ok(())
}

pub async fn run_list(
    entity_type: Option<&str>,
    limit: usize,
    as_json: bool,
    context: &CliContext,
) -> Result<(), CliError> {
    let store = context.open_store()?;
    let records = store.list(entity_type, limit, 0).await?;

    if as_json {
        let json_items = records
            .iter()
            .map(entity_to_list_item)
            .collect::<Vec<EntityListItem>>();
        println!("{}", serde_json::to_string_pretty(&json_items)?);
    } else {
        for line in format_entity_lines(&records) {
            println!("{line}");
        }
    }

    Ok(())
}

pub async fn run_show(id: &str, context: &CliContext) -> Result<(), CliError> {
    let store = context.open_store()?;
    let record = resolve_entity(id, &store).await?;
    println!("{}", serde_json::to_string_pretty(&record)?);
    Ok(())
}

pub async fn run_status(id: Option<&str>, context: &CliContext) -> Result<(), CliError> {
    let store = context.open_store()?;

    let Some(id) = id else {
        let overview = store.overview().await?;
        if overview.is_clean() {
            println!("All changes synced.");
        } else {
            println!(
                "pending={}  conflicts={}  stalled={}",
                overview.pending, overview.conflicts, overview.stalled
            );
        }
        return Ok(());
    };

    let record = resolve_entity(id, &store).await?;
    let status = store
        .sync_status(&record.local_id)
        .await?
        .ok_or_else(|| CliError::EntityNotFound(id.to_string()))?;
    let mut line = format!("{}  {status}", record.local_id);

    if let Some(descriptor) = store.descriptor(&record.local_id).await? {
        line.push_str(&format!(
            "  attempts={}  next={}",
            descriptor.attempt_count,
            format_timestamp(descriptor.next_attempt_at)
        ));
        if let Some(error) = descriptor.last_error {
            line.push_str(&format!("  error={error}"));
        }
    } else if let Some(error) = record.last_error {
        line.push_str(&format!("  error={error}"));
    }

    println!("{line}");
    Ok(())
}

pub fn resolution_from_flags(
    local: bool,
    remote: bool,
    payload: Option<&str>,
) -> Result<Resolution, CliError> {
    match (local, remote, payload) {
        (true, false, None) => Ok(Resolution::UseLocal),
        (false, true, None) => Ok(Resolution::UseRemote),
        (false, false, Some(raw)) => Ok(Resolution::Custom(parse_payload(raw)?)),
        _ => Err(CliError::InvalidPayload(
            "choose exactly one of --local, --remote or --payload".to_string(),
        )),
    }
}

pub async fn run_resolve(
    id: &str,
    resolution: Resolution,
    context: &CliContext,
) -> Result<(), CliError> {
    let store = context.open_store()?;
    let record = resolve_entity(id, &store).await?;

    match store.resolve_conflict(&record.local_id, resolution).await? {
        Some(resolved) => println!("{}  {}", resolved.local_id, resolved.sync_state.as_str()),
        None => println!("{}  removed", record.local_id),
    }
    Ok(())
}

pub async fn run_retry(id: &str, context: &CliContext) -> Result<(), CliError> {
    let store = context.open_store()?;
    let record = resolve_entity(id, &store).await?;

    if store.retry_stalled(&record.local_id).await? {
        println!("{}", record.local_id);
    } else {
        println!("{} has no stalled mutation", record.local_id);
    }
    Ok(())
}

use crate::commands::common::{
    format_relative_time, parse_draft_payload, resolve_parent, CliContext,
};
use crate::error::CliError;

pub async fn run_draft_save(
    key: &str,
    payload: &str,
    context: &CliContext,
) -> Result<(), CliError> {
    let payload = parse_draft_payload(payload)?;
    let store = context.open_store()?;
    let draft = store.save_draft(key.trim(), payload).await?;
    println!("{}", draft.key);
    Ok(())
}

pub async fn run_draft_load(key: &str, context: &CliContext) -> Result<(), CliError> {
    let store = context.open_store()?;
    let draft = store
        .load_draft(key.trim())
        .await?
        .ok_or_else(|| CliError::DraftNotFound(key.to_string()))?;
    println!("{}", serde_json::to_string_pretty(&draft.payload)?);
    Ok(())
}

pub async fn run_draft_clear(key: &str, context: &CliContext) -> Result<(), CliError> {
    let store = context.open_store()?;
    if !store.clear_draft(key.trim()).await? {
        return Err(CliError::DraftNotFound(key.to_string()));
    }
    println!("{}", key.trim());
    Ok(())
}

pub async fn run_draft_list(
    prefix: Option<&str>,
    limit: usize,
    as_json: bool,
    context: &CliContext,
) -> Result<(), CliError> {
    let store = context.open_store()?;
    let drafts = store.list_drafts(prefix, limit).await?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&drafts)?);
        return Ok(());
    }

    let now_ms = chrono::Utc::now().timestamp_millis();
    for draft in drafts {
        println!(
            "{:<32}  {}",
            draft.key,
            format_relative_time(draft.updated_at, now_ms)
        );
    }
    Ok(())
}

pub async fn run_draft_submit(
    key: &str,
    entity_type: &str,
    parent: Option<&str>,
    context: &CliContext,
) -> Result<(), CliError> {
    let store = context.open_store()?;
    let parent = resolve_parent(parent, &store).await?;
    let record = store
        .submit_draft(key.trim(), entity_type.trim(), parent)
        .await?;
    println!("{}", record.local_id);
    Ok(())
}

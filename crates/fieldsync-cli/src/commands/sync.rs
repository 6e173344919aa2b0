use fieldsync_core::sync::{
    CycleContext, CycleReport, HttpRemoteGateway, ReconciliationEngine, Session,
};

use crate::commands::common::{
    descriptor_to_item, entity_to_list_item, format_entity_lines, format_outbox_lines,
    CliContext, EntityListItem, OutboxItem,
};
use crate::error::CliError;

const CLI_USER: &str = "fieldsync-cli";

pub async fn run_sync(context: &CliContext) -> Result<(), CliError> {
    let (Some(api_url), Some(token)) = (
        context.remote.api_url.as_deref(),
        context.remote.access_token.as_deref(),
    ) else {
        return Err(CliError::SyncNotConfigured);
    };

    let store = context.open_store()?;
    let recovery = store.recover().await?;
    if recovery.released + recovery.resynthesized + recovery.quarantined > 0 {
        tracing::info!(
            "Recovered outbox: released {}, resynthesized {}, quarantined {}",
            recovery.released,
            recovery.resynthesized,
            recovery.quarantined
        );
    }

    let gateway = HttpRemoteGateway::new(api_url)?;
    let engine = ReconciliationEngine::new(store, gateway, context.config.sync.clone())?;
    let report = engine
        .run_cycle(&CycleContext::online(Session::new(CLI_USER, token)))
        .await?;

    for line in format_cycle_report(&report) {
        println!("{line}");
    }
    Ok(())
}

pub fn format_cycle_report(report: &CycleReport) -> Vec<String> {
    let mut lines = vec![format!(
        "pushed={}  merged={}  pulled={}  conflicts={}  retried={}  stalled={}",
        report.pushed,
        report.merged,
        report.pulled,
        report.conflicts,
        report.retried,
        report.stalled
    )];
    if report.skipped > 0 {
        lines.push(format!("{} mutation(s) waiting on a failed parent", report.skipped));
    }
    if report.quarantined > 0 {
        lines.push(format!("{} corrupt row(s) moved to conflict", report.quarantined));
    }
    if report.paused {
        lines.push(
            "Sync paused after repeated authentication failures; refresh the token.".to_string(),
        );
    }
    lines
}

pub async fn run_outbox(limit: usize, as_json: bool, context: &CliContext) -> Result<(), CliError> {
    let store = context.open_store()?;
    let descriptors = store.list_outbox(limit).await?;

    if as_json {
        let json_items = descriptors
            .iter()
            .map(descriptor_to_item)
            .collect::<Vec<OutboxItem>>();
        println!("{}", serde_json::to_string_pretty(&json_items)?);
        return Ok(());
    }

    if descriptors.is_empty() {
        println!("Outbox is empty.");
        return Ok(());
    }

    for line in format_outbox_lines(&descriptors) {
        println!("{line}");
    }
    Ok(())
}

pub async fn run_conflicts(as_json: bool, context: &CliContext) -> Result<(), CliError> {
    let store = context.open_store()?;
    let conflicts = store.list_conflicts().await?;

    if as_json {
        let json_items = conflicts
            .iter()
            .map(entity_to_list_item)
            .collect::<Vec<EntityListItem>>();
        println!("{}", serde_json::to_string_pretty(&json_items)?);
        return Ok(());
    }

    if conflicts.is_empty() {
        println!("No sync conflicts.");
        return Ok(());
    }

    for line in format_entity_lines(&conflicts) {
        println!("{line}");
    }
    Ok(())
}

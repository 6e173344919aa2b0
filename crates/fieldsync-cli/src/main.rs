//! fieldsync CLI - inspect, edit and sync the offline field maintenance store
//!
//! Every write lands in the local store first; `fieldsync sync` pushes the
//! queued mutations when the remote service is reachable.

mod cli;
mod commands;
mod error;

#[cfg(test)]
mod tests;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Commands, DraftCommands};
use crate::commands::common::{
    load_config, resolve_config_path, resolve_db_path, resolve_remote_config, CliContext,
};
use crate::commands::draft::{
    run_draft_clear, run_draft_list, run_draft_load, run_draft_save, run_draft_submit,
};
use crate::commands::entity::{
    resolution_from_flags, run_add, run_delete, run_edit, run_list, run_resolve, run_retry,
    run_show, run_status,
};
use crate::commands::sync::{run_conflicts, run_outbox, run_sync};
use crate::error::CliError;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("Error: {error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("fieldsync=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config_path = resolve_config_path(cli.config);
    let config = load_config(config_path.as_deref())?;
    let context = CliContext {
        db_path: resolve_db_path(cli.db_path, &config)?,
        remote: resolve_remote_config(cli.api_url, cli.token, &config)?,
        config,
    };

    match cli.command {
        Commands::Add {
            entity_type,
            payload,
            parent,
        } => run_add(&entity_type, &payload, parent.as_deref(), &context).await?,
        Commands::Edit { id, payload } => run_edit(&id, &payload, &context).await?,
        Commands::Delete { id } => run_delete(&id, &context).await?,
        Commands::List {
            entity_type,
            limit,
            json,
        } => run_list(entity_type.as_deref(), limit, json, &context).await?,
        Commands::Show { id } => run_show(&id, &context).await?,
        Commands::Status { id } => run_status(id.as_deref(), &context).await?,
        Commands::Outbox { limit, json } => run_outbox(limit, json, &context).await?,
        Commands::Conflicts { json } => run_conflicts(json, &context).await?,
        Commands::Resolve {
            id,
            local,
            remote,
            payload,
        } => {
            let resolution = resolution_from_flags(local, remote, payload.as_deref())?;
            run_resolve(&id, resolution, &context).await?;
        }
        Commands::Retry { id } => run_retry(&id, &context).await?,
        Commands::Sync => run_sync(&context).await?,
        Commands::Draft { command } => match command {
            DraftCommands::Save { key, payload } => run_draft_save(&key, &payload, &context).await?,
            DraftCommands::Load { key } => run_draft_load(&key, &context).await?,
            DraftCommands::Clear { key } => run_draft_clear(&key, &context).await?,
            DraftCommands::List {
                prefix,
                limit,
                json,
            } => run_draft_list(prefix.as_deref(), limit, json, &context).await?,
            DraftCommands::Submit {
                key,
                entity_type,
                parent,
            } => run_draft_submit(&key, &entity_type, parent.as_deref(), &context).await?,
        },
    }

    Ok(())
}

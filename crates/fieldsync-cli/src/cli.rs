use std::path::PathBuf;

use clap::{ArgGroup, Parser, Subcommand};

#[derive(Parser)]
#[command(name = "fieldsync")]
#[command(about = "Offline-first field maintenance records from the command line")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Optional path to local database file
    #[arg(long, global = true, value_name = "PATH")]
    pub db_path: Option<PathBuf>,

    /// Optional path to JSON config file
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Remote API base URL (overrides FIELDSYNC_API_URL)
    #[arg(long, global = true, value_name = "URL")]
    pub api_url: Option<String>,

    /// Remote access token (overrides FIELDSYNC_ACCESS_TOKEN)
    #[arg(long, global = true, value_name = "TOKEN")]
    pub token: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create an entity locally and queue it for sync
    #[command(alias = "new")]
    Add {
        /// Entity type, e.g. equipment
        #[arg(long = "type", value_name = "TYPE")]
        entity_type: String,
        /// Entity payload as a JSON object
        #[arg(long, value_name = "JSON")]
        payload: String,
        /// Parent entity ID or unique ID prefix
        #[arg(long, value_name = "ID")]
        parent: Option<String>,
    },
    /// Replace an entity's payload
    Edit {
        /// Entity ID or unique ID prefix
        id: String,
        /// New payload as a JSON object
        #[arg(long, value_name = "JSON")]
        payload: String,
    },
    /// Delete an entity
    Delete {
        /// Entity ID or unique ID prefix
        id: String,
    },
    /// List local entities
    List {
        /// Only show entities of this type
        #[arg(long = "type", value_name = "TYPE")]
        entity_type: Option<String>,
        /// Number of entities to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show one entity with its sync metadata
    Show {
        /// Entity ID or unique ID prefix
        id: String,
    },
    /// Show sync status for one entity, or overall counts
    Status {
        /// Entity ID or unique ID prefix
        id: Option<String>,
    },
    /// List queued mutations
    Outbox {
        /// Number of descriptors to show
        #[arg(short, long, default_value = "50")]
        limit: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List entities waiting for conflict resolution
    Conflicts {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Resolve a conflicted entity
    #[command(group(ArgGroup::new("choice").required(true).args(["local", "remote", "payload"])))]
    Resolve {
        /// Entity ID or unique ID prefix
        id: String,
        /// Keep the local copy
        #[arg(long)]
        local: bool,
        /// Take the remote copy
        #[arg(long)]
        remote: bool,
        /// Use a hand-merged payload (JSON object)
        #[arg(long, value_name = "JSON")]
        payload: Option<String>,
    },
    /// Re-arm a stalled mutation for immediate retry
    Retry {
        /// Entity ID or unique ID prefix
        id: String,
    },
    /// Run one reconciliation cycle against the remote service
    Sync,
    /// Manage unsubmitted form drafts
    Draft {
        #[command(subcommand)]
        command: DraftCommands,
    },
}

#[derive(Subcommand)]
pub enum DraftCommands {
    /// Save (or overwrite) a draft
    Save {
        /// Draft key, e.g. maintenance:new
        key: String,
        /// Draft contents as JSON
        #[arg(long, value_name = "JSON")]
        payload: String,
    },
    /// Print a draft
    Load {
        /// Draft key
        key: String,
    },
    /// Discard a draft
    Clear {
        /// Draft key
        key: String,
    },
    /// List drafts
    List {
        /// Only show keys starting with this prefix
        #[arg(long, value_name = "PREFIX")]
        prefix: Option<String>,
        /// Number of drafts to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Turn a draft into a new entity
    Submit {
        /// Draft key
        key: String,
        /// Entity type to create
        #[arg(long = "type", value_name = "TYPE")]
        entity_type: String,
        /// Parent entity ID or unique ID prefix
        #[arg(long, value_name = "ID")]
        parent: Option<String>,
    },
}

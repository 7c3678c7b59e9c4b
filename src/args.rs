//! The CLI surface: `--config`/`--env` choose how configuration is
//! populated; `--snapshot`/`--sync-snapshot`/`--bootstrap` select a mode
//! mutually exclusive with plain sync; `--poll-seconds` re-runs sync on an
//! interval and cannot be combined with either snapshot operation.

use clap::Parser;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(version, about = "Mirror YUM/DNF repositories into an S3-compatible bucket")]
pub struct Args {
    /// Increase logging output (can be used multiple times)
    #[arg(short, long, action(clap::ArgAction::Count))]
    pub verbose: u8,

    /// Load configuration from a JSON file
    #[arg(long, conflicts_with = "env", value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Load configuration from environment variables
    #[arg(long, conflicts_with = "config")]
    pub env: bool,

    /// Build a named point-in-time snapshot of the mirror
    #[arg(long, value_name = "ID", conflicts_with_all = ["sync_snapshot", "bootstrap", "poll_seconds"])]
    pub snapshot: Option<String>,

    /// Replicate a named snapshot from another mirror's `--source` base URL
    #[arg(long, value_name = "ID", conflicts_with_all = ["snapshot", "bootstrap", "poll_seconds", "diff", "list_snapshots"])]
    pub sync_snapshot: Option<String>,

    /// Base URL of the mirror to replicate `--sync-snapshot` from
    #[arg(long, value_name = "URL", requires = "sync_snapshot")]
    pub source: Option<String>,

    /// Bootstrap an empty mirror: every upstream package is treated as new
    /// and existence-checked before transfer
    #[arg(long, conflicts_with_all = ["snapshot", "sync_snapshot", "diff", "list_snapshots"])]
    pub bootstrap: bool,

    /// Re-run sync every N seconds instead of exiting after one pass
    #[arg(long, value_name = "SECONDS", conflicts_with_all = ["snapshot", "sync_snapshot", "diff", "list_snapshots"])]
    pub poll_seconds: Option<u64>,

    /// Diff two snapshots of one repository, given as `<repo-path>:<old-id>:<new-id>`
    #[arg(long, value_name = "REPO:OLD:NEW", conflicts_with_all = ["snapshot", "sync_snapshot", "bootstrap", "poll_seconds", "list_snapshots"])]
    pub diff: Option<String>,

    /// List every committed snapshot across all configured repositories
    #[arg(long, conflicts_with_all = ["snapshot", "sync_snapshot", "bootstrap", "poll_seconds", "diff"])]
    pub list_snapshots: bool,
}

impl Args {
    /// `--config` xor `--env` is required; clap's derive can't express
    /// "exactly one of, and required" directly, so it's checked here.
    pub fn validate(&self) -> Result<(), String> {
        match (&self.config, self.env) {
            (Some(_), false) | (None, true) => Ok(()),
            (Some(_), true) => Err("--config and --env are mutually exclusive".to_string()),
            (None, false) => Err("one of --config or --env is required".to_string()),
        }
    }
}

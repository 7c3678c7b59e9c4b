//! Thin `clap` front-end over `rpm_s3_mirror`: resolves `--config`/`--env`
//! into a [`MirrorConfig`], builds a [`Mirror`], and dispatches to
//! sync/bootstrap/snapshot/sync-snapshot per the flags in [`Args`].

use clap::Parser;
use env_logger::Env;
use rpm_s3_mirror::args::Args;
use rpm_s3_mirror::config::{ConfigSource, EnvConfig, JsonFileConfig, MirrorConfig};
use rpm_s3_mirror::errors::*;
use rpm_s3_mirror::metrics::LoggingMetricsSink;
use rpm_s3_mirror::mirror::Mirror;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let log_level = match args.verbose {
        0 => "rpm_s3_mirror=info",
        1 => "info,rpm_s3_mirror=debug",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level)).init();

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<()> {
    args.validate().map_err(Error::Config)?;

    let source: Box<dyn ConfigSource> = if let Some(path) = &args.config {
        Box::new(JsonFileConfig::new(path))
    } else {
        Box::new(EnvConfig)
    };
    let config = MirrorConfig::load(source.as_ref())?;

    let mirror = Mirror::new(config, Arc::new(LoggingMetricsSink))?;

    if let Some(id) = &args.snapshot {
        info!("Building snapshot: {id}");
        return mirror.snapshot(id).await;
    }

    if let Some(id) = &args.sync_snapshot {
        let source_base_url = args
            .source
            .as_deref()
            .ok_or_else(|| Error::Config("--sync-snapshot requires --source".to_string()))?;
        info!("Replicating snapshot {id} from {source_base_url}");
        return mirror.sync_snapshot(id, source_base_url).await;
    }

    if let Some(spec) = &args.diff {
        let (repo_path, old_id, new_id) = parse_diff_spec(spec)?;
        let diff = mirror.diff_snapshots(repo_path, old_id, new_id).await?;
        if diff.is_empty() {
            info!("No package changes between {old_id} and {new_id}");
        }
        for (name, change) in &diff {
            info!("{name}: {:?} -> {:?}", change.before, change.after);
        }
        return Ok(());
    }

    if args.list_snapshots {
        for snapshot in mirror.list_snapshots().await? {
            info!("{}{} (last modified {})", snapshot.repo_path, snapshot.id, snapshot.last_modified);
        }
        return Ok(());
    }

    match args.poll_seconds {
        Some(poll_seconds) => loop {
            mirror.sync(args.bootstrap).await?;
            tokio::time::sleep(Duration::from_secs(poll_seconds)).await;
        },
        None => mirror.sync(args.bootstrap).await,
    }
}

/// `--diff REPO:OLD:NEW` -> `(repo_path, old_id, new_id)`.
fn parse_diff_spec(spec: &str) -> Result<(&str, &str, &str)> {
    let parts: Vec<&str> = spec.splitn(3, ':').collect();
    match parts[..] {
        [repo_path, old_id, new_id] => Ok((repo_path, old_id, new_id)),
        _ => Err(Error::Config(format!("--diff: expected REPO:OLD:NEW, got {spec:?}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_diff_spec() {
        let (repo, old, new) = parse_diff_spec("fedora/39/os/:2025-Q1:2025-Q2").unwrap();
        assert_eq!(repo, "fedora/39/os/");
        assert_eq!(old, "2025-Q1");
        assert_eq!(new, "2025-Q2");
    }

    #[test]
    fn test_parse_diff_spec_rejects_missing_fields() {
        assert!(parse_diff_spec("fedora/39/os/:2025-Q1").is_err());
    }
}

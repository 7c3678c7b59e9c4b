//! Polymorphic configuration: a `ConfigSource` trait with three concrete
//! populators (JSON file, environment, in-memory map), all of which build a
//! `RawConfig` that's then validated into a typed `MirrorConfig` — the only
//! thing the engine (`mirror.rs` et al.) ever consumes. `mirror.rs` never
//! talks to a `ConfigSource` directly.

use crate::errors::*;
use serde_json::Value;
use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};

pub const DEFAULT_SCRATCH_DIR: &str = "/var/tmp/";
pub const DEFAULT_MAX_WORKERS: i64 = 4;

const REQUIRED: &[&str] = &[
    "aws_access_key_id",
    "aws_secret_access_key",
    "bucket_name",
    "bucket_region",
    "max_workers",
    "upstream_repositories",
];

/// One loosely-typed configuration value, before it's validated into the
/// typed fields of `MirrorConfig`.
#[derive(Debug, Clone)]
pub enum RawValue {
    Str(String),
    Int(i64),
    List(Vec<String>),
}

pub type RawConfig = BTreeMap<String, RawValue>;

/// A source capable of populating the required configuration keys.
pub trait ConfigSource {
    fn populate_required(&self) -> Result<RawConfig>;
}

/// `--config <path>`: a JSON file on disk.
pub struct JsonFileConfig {
    pub path: PathBuf,
}

impl JsonFileConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        JsonFileConfig { path: path.into() }
    }
}

impl ConfigSource for JsonFileConfig {
    fn populate_required(&self) -> Result<RawConfig> {
        let text = std::fs::read_to_string(&self.path)?;
        let value: Value = serde_json::from_str(&text)?;
        let Value::Object(map) = value else {
            return Err(Error::Config(format!(
                "{}: expected a JSON object at the top level",
                self.path.display()
            )));
        };

        let mut raw = RawConfig::new();
        for (key, value) in map {
            raw.insert(key.clone(), json_to_raw(&key, value)?);
        }
        Ok(raw)
    }
}

fn json_to_raw(key: &str, value: Value) -> Result<RawValue> {
    match value {
        Value::String(s) => Ok(RawValue::Str(s)),
        Value::Number(n) if n.is_i64() || n.is_u64() => Ok(RawValue::Int(n.as_i64().unwrap())),
        Value::Array(items) => {
            let items = items
                .into_iter()
                .map(|item| match item {
                    Value::String(s) => Ok(s),
                    other => Err(Error::Config(format!("{key}: expected a string in list, found {other}"))),
                })
                .collect::<Result<Vec<_>>>()?;
            Ok(RawValue::List(items))
        }
        other => Err(Error::Config(format!("{key}: unsupported configuration value {other}"))),
    }
}

/// `--env`: read configuration from environment variables, uppercased.
/// `upstream_repositories` is comma-split.
pub struct EnvConfig;

impl ConfigSource for EnvConfig {
    fn populate_required(&self) -> Result<RawConfig> {
        let mut raw = RawConfig::new();
        for key in REQUIRED.iter().chain(["scratch_dir"].iter()) {
            let Ok(value) = env::var(key.to_uppercase()) else {
                continue;
            };
            let value = match *key {
                "upstream_repositories" => RawValue::List(value.split(',').map(str::to_string).collect()),
                "max_workers" => RawValue::Int(
                    value
                        .parse()
                        .map_err(|_| Error::Config(format!("MAX_WORKERS: not an integer: {value:?}")))?,
                ),
                _ => RawValue::Str(value),
            };
            raw.insert((*key).to_string(), value);
        }
        Ok(raw)
    }
}

/// Used by tests (and anything that already has a fully-formed config in
/// memory, e.g. loaded from some other process).
pub struct DictConfig(pub RawConfig);

impl ConfigSource for DictConfig {
    fn populate_required(&self) -> Result<RawConfig> {
        Ok(self.0.clone())
    }
}

/// The validated, typed configuration the engine actually runs on.
///
/// `Debug` is implemented by hand to redact `aws_secret_access_key` so it
/// never ends up in logs.
#[derive(Clone)]
pub struct MirrorConfig {
    pub aws_access_key_id: String,
    pub aws_secret_access_key: String,
    pub bucket_name: String,
    pub bucket_region: String,
    pub upstream_repositories: Vec<String>,
    pub max_workers: usize,
    pub scratch_dir: PathBuf,
}

impl std::fmt::Debug for MirrorConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MirrorConfig")
            .field("aws_access_key_id", &self.aws_access_key_id)
            .field("aws_secret_access_key", &"[redacted]")
            .field("bucket_name", &self.bucket_name)
            .field("bucket_region", &self.bucket_region)
            .field("upstream_repositories", &self.upstream_repositories)
            .field("max_workers", &self.max_workers)
            .field("scratch_dir", &self.scratch_dir)
            .finish()
    }
}

impl MirrorConfig {
    /// Populate from `source`, apply defaults, then validate that every
    /// required key is present. `max_workers`'s "required but also has a
    /// default" tension is resolved as: an explicit value from `source`
    /// always wins; the default is only used when the source didn't supply
    /// one.
    pub fn load(source: &dyn ConfigSource) -> Result<Self> {
        let mut raw = source.populate_required()?;

        raw.entry("scratch_dir".to_string())
            .or_insert_with(|| RawValue::Str(DEFAULT_SCRATCH_DIR.to_string()));
        raw.entry("max_workers".to_string())
            .or_insert(RawValue::Int(DEFAULT_MAX_WORKERS));

        let missing: Vec<&str> = REQUIRED.iter().filter(|key| !raw.contains_key(**key)).copied().collect();
        if !missing.is_empty() {
            return Err(Error::Config(format!("missing required configuration keys: {}", missing.join(", "))));
        }

        Ok(MirrorConfig {
            aws_access_key_id: take_str(&mut raw, "aws_access_key_id")?,
            aws_secret_access_key: take_str(&mut raw, "aws_secret_access_key")?,
            bucket_name: take_str(&mut raw, "bucket_name")?,
            bucket_region: take_str(&mut raw, "bucket_region")?,
            upstream_repositories: take_list(&mut raw, "upstream_repositories")?,
            max_workers: take_int(&mut raw, "max_workers")?.try_into().map_err(|_| {
                Error::Config("max_workers: must be a positive integer".to_string())
            })?,
            scratch_dir: PathBuf::from(take_str(&mut raw, "scratch_dir")?),
        })
    }
}

fn take_str(raw: &mut RawConfig, key: &str) -> Result<String> {
    match raw.remove(key) {
        Some(RawValue::Str(s)) => Ok(s),
        Some(_) => Err(Error::Config(format!("{key}: expected a string"))),
        None => Err(Error::Config(format!("missing required configuration key: {key}"))),
    }
}

fn take_int(raw: &mut RawConfig, key: &str) -> Result<i64> {
    match raw.remove(key) {
        Some(RawValue::Int(n)) => Ok(n),
        Some(RawValue::Str(s)) => s.parse().map_err(|_| Error::Config(format!("{key}: not an integer: {s:?}"))),
        Some(_) => Err(Error::Config(format!("{key}: expected an integer"))),
        None => Err(Error::Config(format!("missing required configuration key: {key}"))),
    }
}

fn take_list(raw: &mut RawConfig, key: &str) -> Result<Vec<String>> {
    match raw.remove(key) {
        Some(RawValue::List(items)) => Ok(items),
        Some(RawValue::Str(s)) => Ok(s.split(',').map(str::to_string).collect()),
        Some(_) => Err(Error::Config(format!("{key}: expected a list"))),
        None => Err(Error::Config(format!("missing required configuration key: {key}"))),
    }
}

/// The `us-east-1`-is-special URL rule, shared between the mirror
/// controller (building the mirror's own HTTPS URL for freshness
/// comparisons) and the object store adapter (its own S3 API endpoint).
pub fn bucket_host(region: &str) -> String {
    if region == "us-east-1" {
        "s3.amazonaws.com".to_string()
    } else {
        format!("s3-{region}.amazonaws.com")
    }
}

pub fn repo_path_from_url(base_url: &str) -> Result<String> {
    let path = url::Url::parse(base_url)?.path().trim_start_matches('/').to_string();
    Ok(path)
}

pub fn scratch_dir_or_default(path: &Path) -> PathBuf {
    if path.as_os_str().is_empty() {
        PathBuf::from(DEFAULT_SCRATCH_DIR)
    } else {
        path.to_path_buf()
    }
}

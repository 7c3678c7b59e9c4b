//! `rpm-s3-mirror`: mirrors upstream YUM/DNF repositories into an
//! S3-compatible object store, with incremental sync, bootstrap, named
//! snapshots, cross-mirror snapshot replication, and snapshot diffing.
//!
//! The binary (`src/main.rs`) is a thin `clap` front-end over this library;
//! the engine itself — metadata parsing, the transfer pool, the snapshot
//! builder, and the mirror controller — lives here so it can be exercised
//! directly in tests without going through a CLI.

pub mod args;
pub mod chksums;
pub mod compression;
pub mod config;
pub mod errors;
pub mod metadata;
pub mod metrics;
pub mod mirror;
pub mod repository;
pub mod s3;
pub mod s3_presign;
pub mod snapshot;
pub mod transfer;
pub mod utils;

//! # tephra-compactor
//!
//! Manual compaction CLI for Tephra fragment storage.
//!
//! Runs the merge pipeline against a local bucket mirror, for debugging
//! and recovery. The production trigger path (HTTP + scheduler) lives in
//! front of the same engine and is not part of this binary.
//!
//! ## Usage
//!
//! ```bash
//! # Compact every schema group of a dataset
//! tephra-compactor --root ./bucket compact --dataset metrics-prod
//!
//! # Show a fragment's parsed metadata
//! tephra-compactor --root ./bucket inspect --key datasets/metrics-prod/fragments/01ABC.tph
//!
//! # Structurally validate a fragment (optionally quarantine it)
//! tephra-compactor --root ./bucket validate --key ... [--delete-invalid]
//! ```

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};

use tephra_core::{FsBackend, LogFormat, StorageBackend, init_logging};
use tephra_store::{
    FragmentRef, JobCoordinator, JobStatus, MemoryIndexStore, MergeOptions, TriggerRequest,
    ValidateMode, Validator, fragment, keys,
};

/// Tephra fragment compactor.
#[derive(Debug, Parser)]
#[command(name = "tephra-compactor")]
#[command(about = "Compacts small columnar fragments into larger ones")]
#[command(version)]
struct Args {
    /// Root directory of the local bucket mirror.
    #[arg(long, env = "TEPHRA_STORAGE_ROOT", global = true, default_value = ".")]
    root: String,

    /// Emit JSON logs instead of pretty ones.
    #[arg(long, env = "TEPHRA_LOG_JSON", global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run a single compaction pass for a dataset.
    Compact {
        /// Dataset ID to compact.
        #[arg(long)]
        dataset: String,

        /// Bucket size threshold in bytes for one output fragment.
        #[arg(long, env = "TEPHRA_THRESHOLD_BYTES", default_value = "67108864")]
        threshold_bytes: u64,

        /// Optional table filter, recorded on the job.
        #[arg(long)]
        table: Option<String>,

        /// Optional schema-version filter, recorded on the job.
        #[arg(long)]
        schema_version: Option<u32>,
    },

    /// Parse a fragment and print its metadata.
    Inspect {
        /// Storage key of the fragment.
        #[arg(long)]
        key: String,
    },

    /// Structurally validate a fragment.
    Validate {
        /// Storage key of the fragment.
        #[arg(long)]
        key: String,

        /// Delete the fragment when invalid. Only safe for fragments this
        /// engine wrote.
        #[arg(long)]
        delete_invalid: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(if args.json_logs {
        LogFormat::Json
    } else {
        LogFormat::Pretty
    });

    let storage = Arc::new(FsBackend::new(args.root.clone()));

    match args.command {
        Commands::Compact {
            dataset,
            threshold_bytes,
            table,
            schema_version,
        } => compact(storage, &dataset, threshold_bytes, table, schema_version).await,
        Commands::Inspect { key } => inspect(&storage, &key).await,
        Commands::Validate { key, delete_invalid } => {
            validate(storage, &key, delete_invalid).await
        }
    }
}

async fn compact(
    storage: Arc<FsBackend>,
    dataset: &str,
    threshold_bytes: u64,
    table: Option<String>,
    schema_version: Option<u32>,
) -> Result<()> {
    // The CLI has no live index store; seed an in-memory one from the
    // bucket listing so the engine sees every fragment as pending.
    let index = Arc::new(MemoryIndexStore::new());
    let objects = storage
        .list(&keys::fragment_prefix(dataset))
        .await
        .context("listing fragments")?;
    if objects.is_empty() {
        bail!("no fragments found for dataset {dataset}");
    }
    let mut sorted = objects;
    sorted.sort_by(|a, b| a.key.cmp(&b.key));
    for object in &sorted {
        index.add_pending_fragment(
            dataset,
            FragmentRef {
                key: object.key.clone(),
                size: object.size,
            },
        );
    }
    println!("found {} fragments under {}", sorted.len(), keys::fragment_prefix(dataset));

    let coordinator = JobCoordinator::new(
        storage,
        index,
        MergeOptions {
            threshold_bytes,
            ..MergeOptions::default()
        },
    );

    let job_id = coordinator
        .trigger(TriggerRequest {
            dataset_id: dataset.to_string(),
            table,
            schema_version,
        })
        .await
        .context("triggering compaction")?;
    println!("accepted job {job_id}");

    loop {
        tokio::time::sleep(Duration::from_millis(100)).await;
        let Some(record) = coordinator.status(dataset).await.context("status query")? else {
            bail!("job record vanished");
        };
        match record.status {
            JobStatus::Pending | JobStatus::Processing => {
                tracing::debug!(progress = record.progress, "job running");
            }
            JobStatus::Completed => {
                println!("job {} completed", record.job_id);
                return Ok(());
            }
            JobStatus::Failed => {
                bail!(
                    "job {} failed: {}",
                    record.job_id,
                    record.error.unwrap_or_else(|| "unknown error".to_string())
                );
            }
        }
    }
}

async fn inspect(storage: &FsBackend, key: &str) -> Result<()> {
    let bytes = storage.get(key).await.context("fetching fragment")?;
    let meta = fragment::parse_fragment(&bytes).context("parsing fragment")?;

    println!("fragment        {key}");
    println!("file size       {} bytes", meta.file_size);
    println!("footer          {} bytes at offset {}", meta.footer_len, meta.footer_start);
    println!("format version  {}", meta.version);
    println!("producer        {}", meta.created_by);
    println!("total rows      {}", meta.total_rows);
    println!("row groups      {}", meta.row_groups.len());
    for rg in &meta.row_groups {
        println!(
            "  [{:>3}] offset {:>10}  size {:>10}  rows {:>8}  columns {}",
            rg.index,
            rg.file_offset,
            rg.byte_size,
            rg.row_count,
            rg.columns.len()
        );
    }
    Ok(())
}

async fn validate(storage: Arc<FsBackend>, key: &str, delete_invalid: bool) -> Result<()> {
    let validator = Validator::new(storage);
    let mode = if delete_invalid {
        ValidateMode::QuarantineOwnOutput
    } else {
        ValidateMode::ReportOnly
    };

    let report = validator
        .validate_key(key, mode)
        .await
        .context("validating fragment")?;

    for warning in &report.warnings {
        println!("warning: {warning}");
    }
    for error in &report.errors {
        println!("error: {error}");
    }

    if report.valid {
        println!("{key}: valid");
        Ok(())
    } else if report.deleted {
        bail!("{key}: invalid ({} errors), quarantined", report.errors.len());
    } else {
        bail!("{key}: invalid ({} errors)", report.errors.len());
    }
}

//! The `run-chunk` command: plan and execute one bounded chunk per partition.
//!
//! Coordinates the full flow: manifest → gap analysis → chunk selection →
//! orchestrated fetch → summary. Partitions run strictly one after another,
//! each with its own circuit breaker. All resumability comes from the
//! manifest; there is no run state to carry between invocations.

use anyhow::{bail, Result};
use std::time::Duration;

use crate::config::Config;
use crate::fetch::build_fetcher;
use crate::gaps::{gaps_for, remaining};
use crate::manifest::ManifestStore;
use crate::models::{ChunkSummary, PartitionBand};
use crate::orchestrate::{run_chunk, RunOptions};
use crate::progress::{format_number, FetchProgressReporter};
use crate::schedule::{next_chunk, override_chunk};
use crate::storage::RawStore;

pub struct RunChunkArgs {
    pub partition: Option<String>,
    pub start: Option<u64>,
    pub end: Option<u64>,
    pub chunk_size: Option<u64>,
    pub delay_ms: Option<u64>,
    pub force: bool,
    /// Ignore recorded not-found ids when planning, re-probing them.
    pub retry_missing: bool,
}

pub async fn run_chunks(
    config: &Config,
    args: &RunChunkArgs,
    progress: &dyn FetchProgressReporter,
) -> Result<()> {
    let override_range = match (args.start, args.end) {
        (Some(start), Some(end)) => {
            if args.partition.is_none() {
                bail!("--start/--end require --partition");
            }
            Some(
                override_chunk(start, end)
                    .ok_or_else(|| anyhow::anyhow!("invalid range: {} > {}", start, end))?,
            )
        }
        (None, None) => None,
        _ => bail!("--start and --end must be given together"),
    };

    let bands: Vec<PartitionBand> = match args.partition.as_deref() {
        Some(key) => vec![config
            .band(key)
            .ok_or_else(|| anyhow::anyhow!("Unknown partition: '{}'", key))?],
        None => config.bands(),
    };

    let manifest = ManifestStore::open(&config.db.path).await?;
    let raw = RawStore::new(&config.storage.root);
    let fetcher = build_fetcher(&config.source)?;

    let opts = RunOptions {
        delay: Duration::from_millis(args.delay_ms.unwrap_or(config.source.delay_ms)),
        max_consecutive_misses: config.source.max_consecutive_misses,
        flush_every: config.source.flush_every,
        force: args.force,
    };
    let chunk_size = args.chunk_size.unwrap_or(config.source.chunk_size);
    if chunk_size == 0 {
        bail!("--chunk-size must be > 0");
    }

    let mut summaries: Vec<ChunkSummary> = Vec::new();
    for band in &bands {
        let chunk = match override_range {
            Some(range) => range,
            None => {
                let covered = planned_coverage(&manifest, &band.key, args.retry_missing).await?;
                let gaps = gaps_for(band, &covered);
                match next_chunk(&gaps, chunk_size) {
                    Some(chunk) => chunk,
                    None => {
                        println!("run-chunk {}", band.key);
                        println!("  complete");
                        continue;
                    }
                }
            }
        };

        let summary = run_chunk(
            &manifest,
            &raw,
            fetcher.as_ref(),
            &config.source.dataset,
            &config.source.category,
            &band.key,
            chunk,
            &opts,
            progress,
        )
        .await?;

        let covered = planned_coverage(&manifest, &band.key, args.retry_missing).await?;
        let left = remaining(&gaps_for(band, &covered));

        println!("run-chunk {}", band.key);
        println!("  chunk: {}-{}", chunk.start, chunk.end);
        println!("  fetched: {}", summary.success_ids.len());
        println!("  not found: {}", summary.notfound_ids.len());
        println!("  transient errors: {}", summary.error_ids.len());
        if summary.tripped {
            let at = summary.notfound_ids.last().copied().unwrap_or(chunk.end);
            println!("  circuit breaker: tripped at {at}");
        }
        if left == 0 {
            println!("  remaining in band: complete");
        } else {
            println!("  remaining in band: {}", format_number(left));
        }
        summaries.push(summary);
    }

    let fetched: usize = summaries.iter().map(|s| s.success_ids.len()).sum();
    let notfound: usize = summaries.iter().map(|s| s.notfound_ids.len()).sum();
    let errors: usize = summaries.iter().map(|s| s.error_ids.len()).sum();
    println!("totals");
    println!("  fetched: {fetched}");
    println!("  not found: {notfound}");
    println!("  transient errors: {errors}");
    println!("ok");

    manifest.close().await;
    Ok(())
}

/// Ids treated as already handled when planning the next chunk: everything
/// fetched, plus recorded not-found ids unless the caller asked to re-probe
/// them.
async fn planned_coverage(
    manifest: &ManifestStore,
    partition: &str,
    retry_missing: bool,
) -> Result<Vec<u64>> {
    let mut covered = manifest.fetched_ids(partition).await?;
    if !retry_missing {
        covered.extend(manifest.missed_ids(partition).await?);
        covered.sort_unstable();
        covered.dedup();
    }
    Ok(covered)
}

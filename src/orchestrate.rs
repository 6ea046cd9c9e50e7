//! Rate-limited chunk execution with per-partition circuit breaking.
//!
//! One request in flight at a time, always. The configured delay is a hard
//! courtesy floor toward the source, measured from the completion of the
//! previous request, not a best-effort target. Outcomes are flushed durably
//! to the manifest every `flush_every` completed probes and again at chunk
//! end, so an interruption loses at most the current flush window.

use anyhow::Result;
use std::time::{Duration, Instant};

use crate::fetch::Fetcher;
use crate::manifest::ManifestStore;
use crate::models::{ChunkSummary, FetchOutcome, Gap, ManifestEntry};
use crate::progress::{FetchProgressEvent, FetchProgressReporter};
use crate::storage::RawStore;

pub struct RunOptions {
    pub delay: Duration,
    pub max_consecutive_misses: u32,
    pub flush_every: usize,
    /// Re-fetch ids already present in the manifest, replacing their rows.
    pub force: bool,
}

/// Execute one chunk for one partition.
///
/// Ids already present in the manifest are skipped (unless forced), so an
/// override range overlapping prior coverage stays idempotent. A trip of the
/// consecutive-miss breaker abandons the remainder of the chunk; everything
/// probed so far has already been, or is now, flushed.
pub async fn run_chunk(
    manifest: &ManifestStore,
    raw: &RawStore,
    fetcher: &dyn Fetcher,
    dataset: &str,
    category: &str,
    partition: &str,
    chunk: Gap,
    opts: &RunOptions,
    progress: &dyn FetchProgressReporter,
) -> Result<ChunkSummary> {
    let mut summary = ChunkSummary::new(partition);
    let mut consecutive_misses: u32 = 0;
    let mut pending_entries: Vec<ManifestEntry> = Vec::new();
    let mut pending_misses: Vec<u64> = Vec::new();
    let mut last_request: Option<Instant> = None;
    let total = chunk.len();

    for (n, id) in (chunk.start..=chunk.end).enumerate() {
        if !opts.force && manifest.contains(id, partition).await? {
            continue;
        }

        if let Some(prev) = last_request {
            let elapsed = prev.elapsed();
            if elapsed < opts.delay {
                tokio::time::sleep(opts.delay - elapsed).await;
            }
        }

        progress.report(FetchProgressEvent::Probing {
            partition: partition.to_string(),
            id,
            n: n as u64 + 1,
            total,
        });

        let outcome = fetcher.probe(partition, id).await;
        last_request = Some(Instant::now());

        match outcome {
            FetchOutcome::Success(payload) => {
                raw.write_record(dataset, partition, category, id, &payload)?;
                pending_entries.push(ManifestEntry {
                    id,
                    partition_key: partition.to_string(),
                    category: category.to_string(),
                    fetched_at: chrono::Utc::now().timestamp(),
                });
                summary.success_ids.push(id);
                consecutive_misses = 0;
            }
            FetchOutcome::NotFound => {
                summary.notfound_ids.push(id);
                pending_misses.push(id);
                consecutive_misses += 1;
                if consecutive_misses >= opts.max_consecutive_misses {
                    summary.tripped = true;
                    progress.report(FetchProgressEvent::Tripped {
                        partition: partition.to_string(),
                        id,
                    });
                    break;
                }
            }
            FetchOutcome::TransientError(reason) => {
                // Left for a future run; the id stays absent from the
                // manifest and reappears in the next gap computation.
                eprintln!("Warning: transient failure probing {partition} id {id}: {reason}");
                summary.error_ids.push(id);
            }
        }

        if pending_entries.len() + pending_misses.len() >= opts.flush_every {
            flush(
                manifest,
                partition,
                &mut pending_entries,
                &mut pending_misses,
                opts.force,
                progress,
            )
            .await?;
        }
    }

    flush(
        manifest,
        partition,
        &mut pending_entries,
        &mut pending_misses,
        opts.force,
        progress,
    )
    .await?;

    Ok(summary)
}

async fn flush(
    manifest: &ManifestStore,
    partition: &str,
    entries: &mut Vec<ManifestEntry>,
    misses: &mut Vec<u64>,
    force: bool,
    progress: &dyn FetchProgressReporter,
) -> Result<()> {
    let count = (entries.len() + misses.len()) as u64;
    if count == 0 {
        return Ok(());
    }
    manifest.append(entries, force).await?;
    manifest.record_misses(partition, misses).await?;
    entries.clear();
    misses.clear();
    progress.report(FetchProgressEvent::Flushed {
        partition: partition.to_string(),
        count,
    });
    Ok(())
}

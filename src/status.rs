//! Backfill status: coverage, gaps, and remaining work per partition.

use anyhow::Result;

use crate::config::Config;
use crate::gaps::{gaps_for, remaining};
use crate::manifest::ManifestStore;
use crate::models::{Gap, PartitionBand};
use crate::progress::format_number;

struct PartitionStatus {
    band: PartitionBand,
    fetched: u64,
    missing: u64,
    gaps: Vec<Gap>,
}

/// Run the `status` command: print coverage and remaining work for every
/// configured partition (or just one).
pub async fn run_status(config: &Config, partition: Option<&str>) -> Result<()> {
    let manifest = ManifestStore::open(&config.db.path).await?;

    let bands: Vec<PartitionBand> = match partition {
        Some(key) => vec![config
            .band(key)
            .ok_or_else(|| anyhow::anyhow!("Unknown partition: '{}'", key))?],
        None => config.bands(),
    };

    let mut statuses = Vec::new();
    for band in bands {
        let fetched = manifest.fetched_ids(&band.key).await?;
        let missed = manifest.missed_ids(&band.key).await?;

        let mut covered = fetched.clone();
        covered.extend(&missed);
        covered.sort_unstable();
        covered.dedup();

        let gaps = gaps_for(&band, &covered);
        statuses.push(PartitionStatus {
            band,
            fetched: fetched.len() as u64,
            missing: missed.len() as u64,
            gaps,
        });
    }

    println!(
        "{:<16} {:<24} {:>10} {:>10} {:>12}   STATE",
        "PARTITION", "BAND", "FETCHED", "NOT FOUND", "REMAINING"
    );
    println!("{}", "-".repeat(88));

    let mut total_remaining = 0u64;
    for s in &statuses {
        let left = remaining(&s.gaps);
        total_remaining += left;
        let state = if s.gaps.is_empty() {
            "complete".to_string()
        } else {
            format!("{} gap{}", s.gaps.len(), if s.gaps.len() == 1 { "" } else { "s" })
        };
        println!(
            "{:<16} {:<24} {:>10} {:>10} {:>12}   {}",
            s.band.key,
            format!("{}-{}", s.band.min_id, s.band.max_id),
            format_number(s.fetched),
            format_number(s.missing),
            format_number(left),
            state
        );
    }

    println!();
    println!("  remaining ids to probe: {}", format_number(total_remaining));
    if config.source.delay_ms > 0 && total_remaining > 0 {
        let secs = total_remaining * config.source.delay_ms / 1000;
        println!("  estimated time at current delay: ~{}", format_duration(secs));
    }

    // With a single partition selected, show where the work actually is.
    if partition.is_some() {
        if let Some(s) = statuses.first() {
            if !s.gaps.is_empty() {
                println!();
                println!("  next gaps:");
                for gap in s.gaps.iter().take(10) {
                    println!(
                        "    {}-{}  ({} ids)",
                        gap.start,
                        gap.end,
                        format_number(gap.len())
                    );
                }
                if s.gaps.len() > 10 {
                    println!("    ... and {} more", s.gaps.len() - 10);
                }
            }
        }
    }

    manifest.close().await;
    Ok(())
}

fn format_duration(secs: u64) -> String {
    if secs < 60 {
        format!("{secs}s")
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    }
}

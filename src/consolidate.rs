//! Full-rebuild consolidation of partitioned raw outputs.
//!
//! `rebuild` folds every raw record of a dataset into one JSON Lines
//! artifact, one envelope per record carrying its partition, category, and
//! id alongside the raw payload (which is copied through uninspected). The
//! artifact is a derived, disposable cache; the partitioned raw tree stays
//! the source of truth.
//!
//! Because this is a rebuild from local disk, an incomplete local checkout
//! would silently produce a truncated artifact and clobber a complete one.
//! `rebuild` therefore refuses to run unless every partition known to the
//! manifest or already present in the existing artifact has raw outputs
//! locally. Callers can assert the checkout is complete (`assume_synced`) or
//! ask for a partial, single-partition `merge_partition` that folds fresh
//! records into the existing artifact instead of replacing it.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use std::collections::BTreeSet;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::config::Config;
use crate::error::DragnetError;
use crate::manifest::ManifestStore;
use crate::progress::format_number;
use crate::storage::{RawRecord, RawStore};

/// One line of a consolidated artifact.
#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    partition: String,
    category: String,
    id: u64,
    record: Box<RawValue>,
}

#[derive(Debug)]
pub struct ConsolidateReport {
    pub artifact: PathBuf,
    pub lines: u64,
    pub partitions: Vec<String>,
    pub duplicates_dropped: u64,
}

fn artifact_path(out_dir: &Path, dataset: &str) -> PathBuf {
    out_dir.join(format!("{dataset}.jsonl"))
}

/// Payloads are normally JSON and embedded verbatim; anything else is
/// carried as a JSON string so the artifact stays line-parseable.
fn payload_to_raw(payload: &str) -> Result<Box<RawValue>> {
    let trimmed = payload.trim();
    if !trimmed.contains('\n') {
        if let Ok(raw) = RawValue::from_string(trimmed.to_string()) {
            return Ok(raw);
        }
    } else if let Ok(value) = serde_json::from_str::<serde_json::Value>(trimmed) {
        // A payload spanning lines would break the JSONL framing; re-encode
        // it compactly.
        return Ok(serde_json::value::to_raw_value(&value)?);
    }
    Ok(serde_json::value::to_raw_value(&payload)?)
}

fn envelope_line(record: &RawRecord) -> Result<String> {
    let payload = std::fs::read_to_string(&record.path)
        .with_context(|| format!("Failed to read {}", record.path.display()))?;
    let envelope = Envelope {
        partition: record.partition.clone(),
        category: record.category.clone(),
        id: record.id,
        record: payload_to_raw(&payload)?,
    };
    Ok(serde_json::to_string(&envelope)?)
}

/// Partitions represented in an existing artifact. Unparseable lines are
/// skipped here; the merge path preserves them verbatim.
fn artifact_partitions(path: &Path) -> Result<BTreeSet<String>> {
    let mut partitions = BTreeSet::new();
    if !path.exists() {
        return Ok(partitions);
    }
    for line in BufReader::new(File::open(path)?).lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        if let Ok(envelope) = serde_json::from_str::<Envelope>(&line) {
            partitions.insert(envelope.partition);
        }
    }
    Ok(partitions)
}

fn write_artifact(artifact: &Path, lines: impl Iterator<Item = String>) -> Result<u64> {
    let dir = artifact.parent().expect("artifact path has a parent");
    std::fs::create_dir_all(dir)?;
    let tmp = dir.join(format!(
        ".{}.tmp",
        artifact.file_name().unwrap_or_default().to_string_lossy()
    ));

    let mut written = 0u64;
    let mut writer = BufWriter::new(
        File::create(&tmp).with_context(|| format!("Failed to create {}", tmp.display()))?,
    );
    for line in lines {
        writeln!(writer, "{line}")?;
        written += 1;
    }
    writer.flush()?;
    drop(writer);

    std::fs::rename(&tmp, artifact)
        .with_context(|| format!("Failed to move artifact into place at {}", artifact.display()))?;
    Ok(written)
}

/// Rebuild the consolidated artifact for `dataset` from all local raw
/// outputs, overwriting the previous artifact.
///
/// `known_partitions` is what the manifest currently knows records for;
/// together with the partitions already in the existing artifact it forms
/// the precondition set that must be present on local disk.
pub fn rebuild(
    raw: &RawStore,
    known_partitions: &[String],
    out_dir: &Path,
    dataset: &str,
    assume_synced: bool,
) -> Result<ConsolidateReport> {
    let artifact = artifact_path(out_dir, dataset);
    let local: BTreeSet<String> = raw.partitions(dataset)?.into_iter().collect();

    if !assume_synced {
        let mut required: BTreeSet<String> = known_partitions.iter().cloned().collect();
        required.extend(artifact_partitions(&artifact)?);
        let missing: Vec<String> = required.difference(&local).cloned().collect();
        if !missing.is_empty() {
            return Err(DragnetError::IncompletePartitionSet {
                dataset: dataset.to_string(),
                missing,
            }
            .into());
        }
    }

    let records = raw.records(dataset)?;
    if records.is_empty() {
        anyhow::bail!(
            "no raw outputs for dataset '{}' under {}",
            dataset,
            raw.root().display()
        );
    }

    let mut seen = BTreeSet::new();
    let mut duplicates_dropped = 0u64;
    let mut lines = Vec::with_capacity(records.len());
    for record in &records {
        if !seen.insert(record.id) {
            duplicates_dropped += 1;
            continue;
        }
        lines.push(envelope_line(record)?);
    }

    let written = write_artifact(&artifact, lines.into_iter())?;
    Ok(ConsolidateReport {
        artifact,
        lines: written,
        partitions: local.into_iter().collect(),
        duplicates_dropped,
    })
}

/// Partial, single-partition consolidation: fold `partition`'s local raw
/// records into the existing artifact, leaving every other partition's lines
/// untouched. Never requires other partitions to be present locally.
pub fn merge_partition(
    raw: &RawStore,
    out_dir: &Path,
    dataset: &str,
    partition: &str,
) -> Result<ConsolidateReport> {
    let artifact = artifact_path(out_dir, dataset);

    let fresh = raw.partition_records(dataset, partition)?;
    if fresh.is_empty() {
        anyhow::bail!(
            "no local raw outputs for partition '{}' of dataset '{}'",
            partition,
            dataset
        );
    }
    let fresh_ids: BTreeSet<u64> = fresh.iter().map(|r| r.id).collect();

    let mut kept: Vec<String> = Vec::new();
    let mut partitions: BTreeSet<String> = BTreeSet::new();
    let mut duplicates_dropped = 0u64;
    if artifact.exists() {
        for line in BufReader::new(File::open(&artifact)?).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Envelope>(&line) {
                Ok(envelope) if envelope.partition == partition => {
                    duplicates_dropped += 1;
                }
                Ok(envelope) if fresh_ids.contains(&envelope.id) => {
                    duplicates_dropped += 1;
                }
                Ok(envelope) => {
                    partitions.insert(envelope.partition);
                    kept.push(line);
                }
                Err(e) => {
                    // Never destroy data we cannot interpret.
                    eprintln!(
                        "Warning: keeping unparseable line in {}: {}",
                        artifact.display(),
                        e
                    );
                    kept.push(line);
                }
            }
        }
    }

    partitions.insert(partition.to_string());
    let mut lines = kept;
    for record in &fresh {
        lines.push(envelope_line(record)?);
    }

    let written = write_artifact(&artifact, lines.into_iter())?;
    Ok(ConsolidateReport {
        artifact,
        lines: written,
        partitions: partitions.into_iter().collect(),
        duplicates_dropped,
    })
}

/// Run the `consolidate` command.
pub async fn run_consolidate(
    config: &Config,
    dataset: &str,
    partition: Option<&str>,
    assume_synced: bool,
) -> Result<()> {
    let raw = RawStore::new(&config.storage.root);
    let out_dir = &config.storage.consolidated;

    let report = match partition {
        Some(p) => merge_partition(&raw, out_dir, dataset, p)?,
        None => {
            let manifest = ManifestStore::open(&config.db.path).await?;
            let known = manifest.partitions().await?;
            manifest.close().await;
            rebuild(&raw, &known, out_dir, dataset, assume_synced)?
        }
    };

    println!("consolidate {dataset}");
    if let Some(p) = partition {
        println!("  merged partition: {p}");
    }
    println!("  partitions: {}", report.partitions.join(", "));
    println!("  records: {}", format_number(report.lines));
    if report.duplicates_dropped > 0 {
        println!(
            "  superseded lines dropped: {}",
            format_number(report.duplicates_dropped)
        );
    }
    println!("  artifact: {}", report.artifact.display());
    println!("ok");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seed(store: &RawStore) {
        store
            .write_record("stats", "A", "2024-2025", 100, r#"{"goals":2}"#)
            .unwrap();
        store
            .write_record("stats", "A", "2024-2025", 101, r#"{"goals":0}"#)
            .unwrap();
        store
            .write_record("stats", "B", "2023-2024", 300, r#"{"goals":5}"#)
            .unwrap();
    }

    fn read_envelopes(path: &Path) -> Vec<Envelope> {
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[test]
    fn rebuild_concatenates_all_partitions() {
        let tmp = tempfile::tempdir().unwrap();
        let raw = RawStore::new(tmp.path().join("raw"));
        let out = tmp.path().join("consolidated");
        seed(&raw);

        let report = rebuild(&raw, &["A".into(), "B".into()], &out, "stats", false).unwrap();
        assert_eq!(report.lines, 3);
        assert_eq!(report.partitions, vec!["A", "B"]);
        assert_eq!(report.duplicates_dropped, 0);

        let envelopes = read_envelopes(&report.artifact);
        assert_eq!(envelopes.len(), 3);
        assert_eq!(envelopes[0].partition, "A");
        assert_eq!(envelopes[0].id, 100);
        assert_eq!(envelopes[0].record.get(), r#"{"goals":2}"#);
        assert_eq!(envelopes[2].partition, "B");
        assert_eq!(envelopes[2].category, "2023-2024");
    }

    #[test]
    fn rebuild_refuses_when_a_known_partition_is_not_local() {
        let tmp = tempfile::tempdir().unwrap();
        let raw = RawStore::new(tmp.path().join("raw"));
        let out = tmp.path().join("consolidated");
        seed(&raw);
        rebuild(&raw, &["A".into(), "B".into()], &out, "stats", false).unwrap();

        // Simulate a fresh checkout that only synced partition A.
        std::fs::remove_dir_all(tmp.path().join("raw/stats/B")).unwrap();

        // Even with a lost manifest (no known partitions), the existing
        // artifact still names B, so the rebuild must refuse.
        let err = rebuild(&raw, &[], &out, "stats", false).unwrap_err();
        match err.downcast_ref::<DragnetError>() {
            Some(DragnetError::IncompletePartitionSet { missing, .. }) => {
                assert_eq!(missing, &vec!["B".to_string()]);
            }
            other => panic!("expected IncompletePartitionSet, got {other:?}"),
        }

        // The stale-but-correct artifact is untouched.
        let envelopes = read_envelopes(&artifact_path(&out, "stats"));
        assert_eq!(envelopes.len(), 3);
    }

    #[test]
    fn assume_synced_overrides_the_precondition() {
        let tmp = tempfile::tempdir().unwrap();
        let raw = RawStore::new(tmp.path().join("raw"));
        let out = tmp.path().join("consolidated");
        seed(&raw);
        rebuild(&raw, &["A".into(), "B".into()], &out, "stats", false).unwrap();
        std::fs::remove_dir_all(tmp.path().join("raw/stats/B")).unwrap();

        let report = rebuild(&raw, &["A".into(), "B".into()], &out, "stats", true).unwrap();
        assert_eq!(report.lines, 2);
        assert_eq!(report.partitions, vec!["A"]);
    }

    #[test]
    fn merge_preserves_other_partitions_lines() {
        let tmp = tempfile::tempdir().unwrap();
        let raw = RawStore::new(tmp.path().join("raw"));
        let out = tmp.path().join("consolidated");
        seed(&raw);
        rebuild(&raw, &["A".into(), "B".into()], &out, "stats", false).unwrap();
        std::fs::remove_dir_all(tmp.path().join("raw/stats/B")).unwrap();

        // A gained a record and revised an old one; B is not local anymore.
        raw.write_record("stats", "A", "2024-2025", 100, r#"{"goals":3}"#)
            .unwrap();
        raw.write_record("stats", "A", "2024-2025", 102, r#"{"goals":1}"#)
            .unwrap();

        let report = merge_partition(&raw, &out, "stats", "A").unwrap();
        assert_eq!(report.lines, 4);
        assert_eq!(report.partitions, vec!["A", "B"]);

        let envelopes = read_envelopes(&report.artifact);
        let b = envelopes.iter().find(|e| e.partition == "B").unwrap();
        assert_eq!(b.id, 300);
        let revised = envelopes.iter().find(|e| e.id == 100).unwrap();
        assert_eq!(revised.record.get(), r#"{"goals":3}"#);
        assert!(envelopes.iter().any(|e| e.id == 102));
    }

    #[test]
    fn merge_into_missing_artifact_creates_it() {
        let tmp = tempfile::tempdir().unwrap();
        let raw = RawStore::new(tmp.path().join("raw"));
        let out = tmp.path().join("consolidated");
        seed(&raw);

        let report = merge_partition(&raw, &out, "stats", "A").unwrap();
        assert_eq!(report.lines, 2);
        assert_eq!(report.partitions, vec!["A"]);
    }

    #[test]
    fn non_json_payload_is_carried_as_a_string() {
        let tmp = tempfile::tempdir().unwrap();
        let raw = RawStore::new(tmp.path().join("raw"));
        let out = tmp.path().join("consolidated");
        raw.write_record("stats", "A", "2024-2025", 1, "<html>oops</html>")
            .unwrap();

        let report = rebuild(&raw, &["A".into()], &out, "stats", false).unwrap();
        let envelopes = read_envelopes(&report.artifact);
        assert_eq!(envelopes[0].record.get(), r#""<html>oops</html>""#);
        assert_eq!(report.lines, 1);
    }

    #[test]
    fn pretty_printed_payload_is_compacted_onto_one_line() {
        let tmp = tempfile::tempdir().unwrap();
        let raw = RawStore::new(tmp.path().join("raw"));
        let out = tmp.path().join("consolidated");
        raw.write_record("stats", "A", "2024-2025", 1, "{\n  \"goals\": 2\n}")
            .unwrap();

        let report = rebuild(&raw, &["A".into()], &out, "stats", false).unwrap();
        let content = std::fs::read_to_string(&report.artifact).unwrap();
        assert_eq!(content.lines().count(), 1);
        let envelopes = read_envelopes(&report.artifact);
        assert_eq!(envelopes[0].record.get(), r#"{"goals":2}"#);
    }

    #[test]
    fn rebuild_with_nothing_local_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let raw = RawStore::new(tmp.path().join("raw"));
        let out = tmp.path().join("consolidated");
        let err = rebuild(&raw, &[], &out, "stats", true).unwrap_err();
        assert!(err.to_string().contains("no raw outputs"));
    }
}

//! Partitioned raw record storage.
//!
//! Records live at `{root}/{dataset}/{partition}/{category}/{id}.json`. The
//! payload bytes are opaque to the engine; this module only writes, lists,
//! and locates them. Writes go to a temp file first and are renamed into
//! place, so a crash mid-write never leaves a half-record behind.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// One raw record file located on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
    pub partition: String,
    pub category: String,
    pub id: u64,
    pub path: PathBuf,
}

pub struct RawStore {
    root: PathBuf,
}

impl RawStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn record_path(&self, dataset: &str, partition: &str, category: &str, id: u64) -> PathBuf {
        self.root
            .join(dataset)
            .join(partition)
            .join(category)
            .join(format!("{id}.json"))
    }

    /// Write one record atomically (temp file, then rename).
    pub fn write_record(
        &self,
        dataset: &str,
        partition: &str,
        category: &str,
        id: u64,
        payload: &str,
    ) -> Result<PathBuf> {
        let path = self.record_path(dataset, partition, category, id);
        let dir = path.parent().expect("record path has a parent");
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;

        let tmp = dir.join(format!(".{id}.json.tmp"));
        std::fs::write(&tmp, payload)
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &path)
            .with_context(|| format!("Failed to move record into place at {}", path.display()))?;
        Ok(path)
    }

    /// Partition keys that have any raw output for `dataset`. Empty when the
    /// dataset directory does not exist yet.
    pub fn partitions(&self, dataset: &str) -> Result<Vec<String>> {
        let dir = self.root.join(dataset);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut keys = Vec::new();
        for entry in std::fs::read_dir(&dir)
            .with_context(|| format!("Failed to list {}", dir.display()))?
        {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                keys.push(entry.file_name().to_string_lossy().to_string());
            }
        }
        keys.sort();
        Ok(keys)
    }

    /// Every record for `dataset`, sorted by (partition, category, id).
    /// Files that do not look like `{id}.json` are skipped with a warning.
    pub fn records(&self, dataset: &str) -> Result<Vec<RawRecord>> {
        self.collect_records(&self.root.join(dataset), None)
    }

    /// Every record for one partition of `dataset`.
    pub fn partition_records(&self, dataset: &str, partition: &str) -> Result<Vec<RawRecord>> {
        self.collect_records(&self.root.join(dataset), Some(partition))
    }

    fn collect_records(&self, dataset_dir: &Path, only: Option<&str>) -> Result<Vec<RawRecord>> {
        let mut records = Vec::new();
        if !dataset_dir.exists() {
            return Ok(records);
        }

        for entry in WalkDir::new(dataset_dir) {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            let relative = path.strip_prefix(dataset_dir).unwrap_or(path);

            // Expect {partition}/{category}/{id}.json below the dataset dir.
            let parts: Vec<String> = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy().to_string())
                .collect();
            if parts.len() != 3 {
                continue;
            }
            let (partition, category, file) = (&parts[0], &parts[1], &parts[2]);
            if let Some(only) = only {
                if partition != only {
                    continue;
                }
            }
            if file.starts_with('.') {
                continue; // leftover temp file
            }

            let id = match file.strip_suffix(".json").and_then(|s| s.parse::<u64>().ok()) {
                Some(id) => id,
                None => {
                    eprintln!("Warning: skipping unrecognized record file {}", path.display());
                    continue;
                }
            };

            records.push(RawRecord {
                partition: partition.clone(),
                category: category.clone(),
                id,
                path: path.to_path_buf(),
            });
        }

        records.sort_by(|a, b| {
            (&a.partition, &a.category, a.id).cmp(&(&b.partition, &b.category, b.id))
        });
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_enumerate_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let store = RawStore::new(tmp.path());

        store
            .write_record("stats", "EPL", "2024-2025", 102, r#"{"a":1}"#)
            .unwrap();
        store
            .write_record("stats", "EPL", "2024-2025", 100, r#"{"a":2}"#)
            .unwrap();
        store
            .write_record("stats", "LIGA", "2023-2024", 300, r#"{"a":3}"#)
            .unwrap();

        assert_eq!(store.partitions("stats").unwrap(), vec!["EPL", "LIGA"]);
        assert!(store.partitions("other").unwrap().is_empty());

        let records = store.records("stats").unwrap();
        let ids: Vec<u64> = records.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![100, 102, 300]);
        assert_eq!(records[0].partition, "EPL");
        assert_eq!(records[0].category, "2024-2025");

        let epl = store.partition_records("stats", "EPL").unwrap();
        assert_eq!(epl.len(), 2);
    }

    #[test]
    fn rewrite_replaces_record_in_place() {
        let tmp = tempfile::tempdir().unwrap();
        let store = RawStore::new(tmp.path());

        let path = store
            .write_record("stats", "EPL", "2024-2025", 7, "old")
            .unwrap();
        store
            .write_record("stats", "EPL", "2024-2025", 7, "new")
            .unwrap();
        assert_eq!(std::fs::read_to_string(path).unwrap(), "new");
        assert_eq!(store.records("stats").unwrap().len(), 1);
    }

    #[test]
    fn unrecognized_files_are_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        let store = RawStore::new(tmp.path());
        store
            .write_record("stats", "EPL", "2024-2025", 1, "{}")
            .unwrap();
        let dir = tmp.path().join("stats/EPL/2024-2025");
        std::fs::write(dir.join("notes.txt"), "n/a").unwrap();

        assert_eq!(store.records("stats").unwrap().len(), 1);
    }
}

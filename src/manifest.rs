//! The manifest: a durable record of every successfully fetched id.
//!
//! Backed by a single SQLite database (WAL journal mode) holding two flat
//! tables: `manifest` for confirmed fetches and `misses` for ids the source
//! has confirmed do not exist. Every append commits its own transaction, so
//! a crash mid-backfill loses at most the in-flight flush window.
//!
//! A database that cannot be opened is set aside with a `.corrupt` suffix
//! and replaced by a fresh empty one; `rebuild-manifest` reconstructs the
//! contents from the raw record tree.

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::DragnetError;
use crate::models::ManifestEntry;
use crate::storage::RawStore;

pub struct ManifestStore {
    pool: SqlitePool,
    path: PathBuf,
}

impl ManifestStore {
    /// Open the manifest database, creating it (and its schema) if missing.
    ///
    /// An unreadable database is surfaced as a warning, renamed out of the
    /// way, and replaced with an empty one; the engine must keep working
    /// and offer `rebuild-manifest` as the recovery path.
    pub async fn open(path: &Path) -> Result<Self> {
        match Self::try_open(path).await {
            Ok(store) => Ok(store),
            Err(e) => {
                let corrupt = DragnetError::ManifestCorrupt {
                    path: path.to_path_buf(),
                    reason: e.to_string(),
                };
                eprintln!(
                    "Warning: {corrupt}; starting with an empty manifest \
                     (run `dragnet rebuild-manifest` to recover from raw storage)"
                );
                let aside = path.with_extension(format!(
                    "corrupt-{}",
                    chrono::Utc::now().format("%Y%m%d%H%M%S")
                ));
                std::fs::rename(path, &aside).with_context(|| {
                    format!("Failed to set aside corrupt manifest at {}", path.display())
                })?;
                Self::try_open(path).await
            }
        }
    }

    async fn try_open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS manifest (
                id INTEGER PRIMARY KEY,
                partition_key TEXT NOT NULL,
                category TEXT NOT NULL,
                fetched_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS misses (
                id INTEGER PRIMARY KEY,
                partition_key TEXT NOT NULL,
                observed_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_manifest_partition ON manifest(partition_key)",
        )
        .execute(&pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_misses_partition ON misses(partition_key)")
            .execute(&pool)
            .await?;

        // Force a read so an unreadable file fails here, not on first use.
        let _: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM manifest")
            .fetch_one(&pool)
            .await?;

        Ok(Self {
            pool,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All manifest entries, ordered by id.
    pub async fn load(&self) -> Result<Vec<ManifestEntry>> {
        let rows = sqlx::query(
            "SELECT id, partition_key, category, fetched_at FROM manifest ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| ManifestEntry {
                id: row.get::<i64, _>("id") as u64,
                partition_key: row.get("partition_key"),
                category: row.get("category"),
                fetched_at: row.get("fetched_at"),
            })
            .collect())
    }

    pub async fn contains(&self, id: u64, partition_key: &str) -> Result<bool> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM manifest WHERE id = ? AND partition_key = ?",
        )
        .bind(id as i64)
        .bind(partition_key)
        .fetch_one(&self.pool)
        .await?;
        Ok(count > 0)
    }

    /// Append entries in one transaction. Idempotent: ids already present
    /// are skipped, never duplicated. With `force`, present rows are
    /// replaced wholesale instead. Returns the number of rows written.
    pub async fn append(&self, entries: &[ManifestEntry], force: bool) -> Result<u64> {
        if entries.is_empty() {
            return Ok(0);
        }

        let verb = if force { "REPLACE" } else { "IGNORE" };
        let sql = format!(
            "INSERT OR {verb} INTO manifest (id, partition_key, category, fetched_at) \
             VALUES (?, ?, ?, ?)"
        );

        let mut written = 0u64;
        let mut tx = self.pool.begin().await?;
        for entry in entries {
            let result = sqlx::query(&sql)
                .bind(entry.id as i64)
                .bind(&entry.partition_key)
                .bind(&entry.category)
                .bind(entry.fetched_at)
                .execute(&mut *tx)
                .await?;
            written += result.rows_affected();

            // A forced re-fetch supersedes any recorded miss for the id.
            if force {
                sqlx::query("DELETE FROM misses WHERE id = ?")
                    .bind(entry.id as i64)
                    .execute(&mut *tx)
                    .await?;
            }
        }
        tx.commit().await?;
        Ok(written)
    }

    /// Successfully fetched ids for one partition, ascending.
    pub async fn fetched_ids(&self, partition_key: &str) -> Result<Vec<u64>> {
        let rows: Vec<i64> =
            sqlx::query_scalar("SELECT id FROM manifest WHERE partition_key = ? ORDER BY id")
                .bind(partition_key)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(|id| id as u64).collect())
    }

    /// Ids the source confirmed missing for one partition, ascending.
    pub async fn missed_ids(&self, partition_key: &str) -> Result<Vec<u64>> {
        let rows: Vec<i64> =
            sqlx::query_scalar("SELECT id FROM misses WHERE partition_key = ? ORDER BY id")
                .bind(partition_key)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(|id| id as u64).collect())
    }

    /// Record confirmed-missing ids in one transaction. Idempotent.
    pub async fn record_misses(&self, partition_key: &str, ids: &[u64]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;
        for &id in ids {
            sqlx::query(
                "INSERT OR IGNORE INTO misses (id, partition_key, observed_at) VALUES (?, ?, ?)",
            )
            .bind(id as i64)
            .bind(partition_key)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Partition keys the manifest holds any entry for.
    pub async fn partitions(&self) -> Result<Vec<String>> {
        let rows: Vec<String> =
            sqlx::query_scalar("SELECT DISTINCT partition_key FROM manifest ORDER BY partition_key")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows)
    }

    /// Reconstruct the manifest from the raw record tree, replacing the
    /// current contents. Misses cannot be recovered from storage and are
    /// cleared; re-probing a genuinely missing id is safe.
    pub async fn rebuild_from(&self, raw: &RawStore, dataset: &str) -> Result<u64> {
        let records = raw.records(dataset)?;

        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM manifest").execute(&mut *tx).await?;
        sqlx::query("DELETE FROM misses").execute(&mut *tx).await?;

        let mut restored = 0u64;
        for record in &records {
            let fetched_at = std::fs::metadata(&record.path)
                .and_then(|m| m.modified())
                .ok()
                .and_then(|t| t.duration_since(std::time::SystemTime::UNIX_EPOCH).ok())
                .map(|d| d.as_secs() as i64)
                .unwrap_or_else(|| chrono::Utc::now().timestamp());

            sqlx::query(
                "INSERT OR IGNORE INTO manifest (id, partition_key, category, fetched_at) \
                 VALUES (?, ?, ?, ?)",
            )
            .bind(record.id as i64)
            .bind(&record.partition)
            .bind(&record.category)
            .bind(fetched_at)
            .execute(&mut *tx)
            .await?;
            restored += 1;
        }
        tx.commit().await?;
        Ok(restored)
    }

    pub async fn close(self) {
        self.pool.close().await;
    }
}

/// Run the `rebuild-manifest` command: scan raw storage and replace the
/// manifest contents.
pub async fn run_rebuild(config: &crate::config::Config) -> Result<()> {
    let store = ManifestStore::open(&config.db.path).await?;
    let raw = RawStore::new(&config.storage.root);

    let restored = store.rebuild_from(&raw, &config.source.dataset).await?;
    println!("rebuild-manifest");
    println!("  scanned: {}", config.storage.root.display());
    println!("  restored entries: {restored}");
    println!("ok");

    store.close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open_temp() -> (tempfile::TempDir, ManifestStore) {
        let tmp = tempfile::tempdir().unwrap();
        let store = ManifestStore::open(&tmp.path().join("manifest.sqlite"))
            .await
            .unwrap();
        (tmp, store)
    }

    fn entry(id: u64, partition: &str) -> ManifestEntry {
        ManifestEntry {
            id,
            partition_key: partition.to_string(),
            category: "2024-2025".to_string(),
            fetched_at: 1_700_000_000,
        }
    }

    #[tokio::test]
    async fn append_is_idempotent() {
        let (_tmp, store) = open_temp().await;

        let entries = vec![entry(100, "EPL"), entry(101, "EPL")];
        assert_eq!(store.append(&entries, false).await.unwrap(), 2);
        assert_eq!(store.append(&entries, false).await.unwrap(), 0);

        assert_eq!(store.fetched_ids("EPL").await.unwrap(), vec![100, 101]);
        assert_eq!(store.load().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn force_replaces_row_and_clears_miss() {
        let (_tmp, store) = open_temp().await;

        store.record_misses("EPL", &[100]).await.unwrap();
        let mut fresh = entry(100, "EPL");
        fresh.fetched_at = 1_800_000_000;
        store.append(&[fresh], true).await.unwrap();

        assert!(store.missed_ids("EPL").await.unwrap().is_empty());
        let loaded = store.load().await.unwrap();
        assert_eq!(loaded[0].fetched_at, 1_800_000_000);
    }

    #[tokio::test]
    async fn contains_is_partition_scoped() {
        let (_tmp, store) = open_temp().await;
        store.append(&[entry(100, "EPL")], false).await.unwrap();

        assert!(store.contains(100, "EPL").await.unwrap());
        assert!(!store.contains(100, "LIGA").await.unwrap());
        assert!(!store.contains(101, "EPL").await.unwrap());
    }

    #[tokio::test]
    async fn misses_are_recorded_once() {
        let (_tmp, store) = open_temp().await;
        store.record_misses("EPL", &[103, 104]).await.unwrap();
        store.record_misses("EPL", &[104]).await.unwrap();
        assert_eq!(store.missed_ids("EPL").await.unwrap(), vec![103, 104]);
    }

    #[tokio::test]
    async fn rebuild_restores_entries_from_raw_tree() {
        let (_tmp, store) = open_temp().await;
        let raw_tmp = tempfile::tempdir().unwrap();
        let raw = RawStore::new(raw_tmp.path());

        raw.write_record("stats", "EPL", "2024-2025", 100, "{}").unwrap();
        raw.write_record("stats", "EPL", "2024-2025", 105, "{}").unwrap();
        raw.write_record("stats", "LIGA", "2023-2024", 300, "{}").unwrap();

        // Pre-existing state must be replaced, not merged.
        store.append(&[entry(999, "OLD")], false).await.unwrap();
        store.record_misses("OLD", &[998]).await.unwrap();

        let restored = store.rebuild_from(&raw, "stats").await.unwrap();
        assert_eq!(restored, 3);
        assert_eq!(store.fetched_ids("EPL").await.unwrap(), vec![100, 105]);
        assert_eq!(store.fetched_ids("LIGA").await.unwrap(), vec![300]);
        assert!(store.fetched_ids("OLD").await.unwrap().is_empty());
        assert!(store.missed_ids("OLD").await.unwrap().is_empty());

        let liga = store.load().await.unwrap();
        let liga_entry = liga.iter().find(|e| e.id == 300).unwrap();
        assert_eq!(liga_entry.category, "2023-2024");
    }

    #[tokio::test]
    async fn corrupt_database_is_set_aside() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("manifest.sqlite");
        std::fs::write(&path, "this is not a sqlite database at all").unwrap();

        let store = ManifestStore::open(&path).await.unwrap();
        assert!(store.load().await.unwrap().is_empty());

        let set_aside = std::fs::read_dir(tmp.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .any(|e| e.file_name().to_string_lossy().contains("corrupt"));
        assert!(set_aside, "corrupt file should be renamed, not deleted");
    }
}

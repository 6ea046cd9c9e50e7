//! Typed errors for the failure modes callers need to distinguish.
//!
//! Everything else in the crate uses `anyhow` directly; these variants exist
//! because commands and tests match on them.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DragnetError {
    /// Consolidation precondition violation: one or more partitions that the
    /// manifest or the existing artifact knows about have no raw outputs on
    /// local disk. Rebuilding anyway would silently truncate the artifact.
    #[error(
        "incomplete partition set for dataset '{dataset}': no local raw outputs for {missing:?} \
         (sync them first, pass --assume-synced, or use --partition for a partial merge)"
    )]
    IncompletePartitionSet {
        dataset: String,
        missing: Vec<String>,
    },

    /// The manifest database could not be opened or read. Recoverable: the
    /// broken file is set aside and `rebuild-manifest` reconstructs the
    /// contents from raw storage.
    #[error("manifest unreadable at {path}: {reason}")]
    ManifestCorrupt { path: PathBuf, reason: String },
}

//! Cache snapshot export/import for warm restarts.
//!
//! The cache is in-process and ephemeral; a snapshot is the one supported
//! persistence escape hatch. Export captures every resident entry verbatim;
//! import skips entries that expired in the meantime, recomputes sizes, and
//! reports what happened. The version tag is required and unknown versions
//! fail the import.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{ErrorCode, FacetError, Result};

use super::key::CacheKey;
use super::store::{AttributeCache, CacheEntry};

/// Snapshot format version written by this build.
pub const SNAPSHOT_VERSION: &str = "1.0";

// ═══════════════════════════════════════════════════════════════════════════════
// Snapshot Types
// ═══════════════════════════════════════════════════════════════════════════════

/// A portable snapshot of the cache contents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSnapshot {
    /// Format version; imports of unknown versions fail
    pub version: String,

    /// When the snapshot was taken
    pub timestamp: DateTime<Utc>,

    /// The entries, keyed by canonical key string
    pub entries: Vec<SnapshotEntry>,
}

/// One entry inside a snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotEntry {
    /// Canonical key string
    pub key: String,

    /// The entry with its metadata
    pub entry: CacheEntry,
}

/// What an import did.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImportReport {
    /// Entries restored
    pub imported: u64,
    /// Entries skipped because they had expired
    pub skipped: u64,
    /// Entries rejected as malformed
    pub errors: u64,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Export / Import
// ═══════════════════════════════════════════════════════════════════════════════

impl AttributeCache {
    /// Export every resident entry into a versioned snapshot.
    pub fn export(&self) -> CacheSnapshot {
        let entries = self
            .entries_snapshot()
            .into_iter()
            .map(|(key, entry)| SnapshotEntry { key, entry })
            .collect::<Vec<_>>();

        info!(entries = entries.len(), "Cache snapshot exported");
        CacheSnapshot {
            version: SNAPSHOT_VERSION.to_string(),
            timestamp: Utc::now(),
            entries,
        }
    }

    /// Import a snapshot. Entries that expired since the export are skipped;
    /// malformed keys are counted as errors; sizes are recomputed on the way
    /// in. Existing entries with the same key are replaced.
    pub fn import(&self, snapshot: CacheSnapshot) -> Result<ImportReport> {
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(FacetError::new(
                ErrorCode::SnapshotVersionMismatch,
                format!(
                    "Unknown snapshot version '{}', expected '{}'",
                    snapshot.version, SNAPSHOT_VERSION
                ),
            ));
        }

        let now = Utc::now();
        let mut report = ImportReport::default();

        for SnapshotEntry { key, entry } in snapshot.entries {
            if CacheKey::parse(&key).is_none() {
                report.errors += 1;
                continue;
            }
            if entry.is_expired_at(now) {
                report.skipped += 1;
                continue;
            }
            self.restore_entry(key, entry);
            report.imported += 1;
        }

        info!(
            imported = report.imported,
            skipped = report.skipped,
            errors = report.errors,
            "Cache snapshot imported"
        );
        Ok(report)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

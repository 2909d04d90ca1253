//! The single row type persisted in the `etcd` table.
//!
//! Revision encodes sync state: `-1` marks a locally-authored row the
//! reverse path has not yet applied to etcd; positive values are real etcd
//! modification revisions. Zero and other negatives are reserved.

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

use crate::error::RecordError;

/// Sentinel revision for rows authored locally and awaiting application
/// to etcd. The primary key `(key, revision)` guarantees at most one such
/// row per key: a second local write collides and is merged by upsert.
pub const PENDING_REVISION: i64 = -1;

/// A key–value row with revision-encoded sync state.
///
/// `value` is a sum: either concrete bytes or absent for a tombstone. The
/// persistence layer maps absence to a nullable column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValueRecord {
    /// Opaque non-empty key.
    pub key: String,
    /// Value bytes; `None` for tombstones.
    pub value: Option<String>,
    /// `-1` pending, positive = etcd ModRevision.
    pub revision: i64,
    /// Insertion wall-clock time; ordering key for the pending FIFO.
    pub ts: DateTime<Utc>,
    /// True when this row records a deletion.
    pub tombstone: bool,
}

impl KeyValueRecord {
    /// Row for an etcd put observed by the forward path.
    pub fn put(key: impl Into<String>, value: impl Into<String>, revision: i64) -> Self {
        Self {
            key: key.into(),
            value: Some(value.into()),
            revision,
            ts: Utc::now(),
            tombstone: false,
        }
    }

    /// Row for an etcd delete observed by the forward path.
    pub fn tombstone(key: impl Into<String>, revision: i64) -> Self {
        Self {
            key: key.into(),
            value: None,
            revision,
            ts: Utc::now(),
            tombstone: true,
        }
    }

    /// Locally-authored put, awaiting reverse-path application.
    pub fn pending_put(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: Some(value.into()),
            revision: PENDING_REVISION,
            ts: Utc::now(),
            tombstone: false,
        }
    }

    /// Locally-authored delete, awaiting reverse-path application.
    pub fn pending_delete(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: None,
            revision: PENDING_REVISION,
            ts: Utc::now(),
            tombstone: true,
        }
    }

    /// Whether this row still awaits application to etcd.
    pub fn is_pending(&self) -> bool {
        self.revision == PENDING_REVISION
    }

    /// The value the reverse path writes to etcd for a non-tombstone row.
    ///
    /// Empty value with `tombstone = false` is a legal empty string, not
    /// a delete.
    pub fn value_or_empty(&self) -> &str {
        self.value.as_deref().unwrap_or("")
    }

    /// Validate the row invariants before persistence.
    pub fn validate(&self) -> Result<(), RecordError> {
        if self.key.is_empty() {
            return Err(RecordError::EmptyKey);
        }
        if self.revision != PENDING_REVISION && self.revision <= 0 {
            return Err(RecordError::ReservedRevision {
                revision: self.revision,
            });
        }
        if self.tombstone && self.value.is_some() {
            return Err(RecordError::TombstoneWithValue {
                key: self.key.clone(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_record_carries_value() {
        let record = KeyValueRecord::put("/a", "1", 7);
        assert_eq!(record.key, "/a");
        assert_eq!(record.value.as_deref(), Some("1"));
        assert_eq!(record.revision, 7);
        assert!(!record.tombstone);
        assert!(!record.is_pending());
        record.validate().unwrap();
    }

    #[test]
    fn tombstone_record_has_no_value() {
        let record = KeyValueRecord::tombstone("/b", 11);
        assert_eq!(record.value, None);
        assert!(record.tombstone);
        assert_eq!(record.value_or_empty(), "");
        record.validate().unwrap();
    }

    #[test]
    fn pending_records_use_sentinel() {
        let put = KeyValueRecord::pending_put("/c", "3");
        assert_eq!(put.revision, PENDING_REVISION);
        assert!(put.is_pending());
        put.validate().unwrap();

        let delete = KeyValueRecord::pending_delete("/c");
        assert_eq!(delete.revision, PENDING_REVISION);
        assert!(delete.tombstone);
        delete.validate().unwrap();
    }

    #[test]
    fn empty_value_is_not_a_tombstone() {
        let record = KeyValueRecord::pending_put("/c", "");
        assert!(!record.tombstone);
        assert_eq!(record.value.as_deref(), Some(""));
        assert_eq!(record.value_or_empty(), "");
        record.validate().unwrap();
    }

    #[test]
    fn validate_rejects_empty_key() {
        let record = KeyValueRecord::put("", "v", 1);
        assert_eq!(record.validate(), Err(RecordError::EmptyKey));
    }

    #[test]
    fn validate_rejects_reserved_revisions() {
        let mut record = KeyValueRecord::put("/a", "v", 1);
        record.revision = 0;
        assert!(matches!(record.validate(), Err(RecordError::ReservedRevision { revision: 0 })));

        record.revision = -2;
        assert!(matches!(
            record.validate(),
            Err(RecordError::ReservedRevision { revision: -2 })
        ));
    }

    #[test]
    fn validate_rejects_tombstone_with_value() {
        let mut record = KeyValueRecord::tombstone("/a", 5);
        record.value = Some("leftover".to_string());
        assert!(matches!(record.validate(), Err(RecordError::TombstoneWithValue { .. })));
    }
}

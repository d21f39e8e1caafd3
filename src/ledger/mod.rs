//! Crash-safe progress ledger for the harvest loop.
//!
//! The ledger is one durable JSON record: a `(course, lesson)` cursor plus
//! the set of completed lesson keys. It is loaded once at startup, owned and
//! mutated only by the orchestration task, and overwritten atomically (temp
//! file + rename) after every lesson so a killed process resumes from the
//! last committed record. An unreadable or corrupt record is treated as
//! absent, never as fatal.
//!
//! The completed set is a superset check independent of the cursor: a lesson
//! already in the set is skippable even if the cursor was reset.

use std::collections::BTreeSet;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

/// File name of the ledger record inside the download directory.
pub const LEDGER_FILE_NAME: &str = ".progress.json";

/// Errors from persisting the ledger.
///
/// Load never errors: a bad record degrades to the zero value.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// Writing the record failed.
    #[error("IO error persisting ledger at {path}: {source}")]
    Io {
        /// The ledger path.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// Serializing the record failed.
    #[error("failed to serialize ledger: {source}")]
    Serialize {
        /// The underlying serde error.
        #[source]
        source: serde_json::Error,
    },
}

/// Durable cursor + completed-set record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressLedger {
    /// Index of the course the walk should resume at.
    #[serde(default)]
    pub course_index: usize,
    /// Index of the lesson within that course to resume at.
    #[serde(default)]
    pub lesson_index: usize,
    /// Completed lesson keys, `"<course title>::<lesson title>"`.
    #[serde(default)]
    completed_lessons: BTreeSet<String>,
}

impl ProgressLedger {
    /// Ledger path inside a download directory.
    #[must_use]
    pub fn path_in(download_dir: &Path) -> PathBuf {
        download_dir.join(LEDGER_FILE_NAME)
    }

    /// Loads the ledger from `path`, or returns the zero value when the
    /// record is absent, unreadable, or corrupt. Never fatal.
    #[must_use]
    #[instrument]
    pub fn load(path: &Path) -> Self {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) => {
                debug!(error = %e, "no saved progress, starting fresh");
                return Self::default();
            }
        };

        match serde_json::from_str::<Self>(&raw) {
            Ok(ledger) => {
                info!(
                    course = ledger.course_index + 1,
                    lesson = ledger.lesson_index + 1,
                    completed = ledger.completed_lessons.len(),
                    "progress loaded"
                );
                ledger
            }
            Err(e) => {
                warn!(error = %e, "saved progress is corrupt, starting fresh");
                Self::default()
            }
        }
    }

    /// Returns a zero-value ledger, discarding prior cursor and completed
    /// set. Used only on explicit operator request.
    #[must_use]
    pub fn reset() -> Self {
        info!("progress reset");
        Self::default()
    }

    /// Builds the opaque composite key for a lesson within a course.
    ///
    /// Consumers must not parse these beyond equality comparison.
    #[must_use]
    pub fn composite_key(course_title: &str, lesson_title: &str) -> String {
        format!("{course_title}::{lesson_title}")
    }

    /// Membership test against the completed set; independent of the cursor.
    #[must_use]
    pub fn is_done(&self, key: &str) -> bool {
        self.completed_lessons.contains(key)
    }

    /// Idempotent insert into the completed set.
    pub fn mark_done(&mut self, key: impl Into<String>) {
        self.completed_lessons.insert(key.into());
    }

    /// Number of completed lessons recorded.
    #[must_use]
    pub fn completed_count(&self) -> usize {
        self.completed_lessons.len()
    }

    /// Moves the cursor and atomically overwrites the durable record with
    /// the new cursor and the current completed-set snapshot.
    ///
    /// The prior record stays valid until the replacement is fully written:
    /// the new record lands in a temp file in the same directory, is flushed
    /// and synced, then renamed over the old one. Killing the process at any
    /// point leaves one of the two complete records on disk.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] when the record cannot be written; the
    /// in-memory state is advanced regardless.
    #[instrument(skip(self))]
    pub fn advance_and_persist(
        &mut self,
        course_index: usize,
        lesson_index: usize,
        path: &Path,
    ) -> Result<(), LedgerError> {
        self.course_index = course_index;
        self.lesson_index = lesson_index;
        self.persist(path)
    }

    /// Atomically writes the current record to `path`.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] when the record cannot be written.
    pub fn persist(&self, path: &Path) -> Result<(), LedgerError> {
        let json =
            serde_json::to_string_pretty(self).map_err(|source| LedgerError::Serialize { source })?;

        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(parent).map_err(|e| LedgerError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;

        let mut temp = tempfile::NamedTempFile::new_in(parent).map_err(|e| LedgerError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        temp.write_all(json.as_bytes()).map_err(|e| LedgerError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        temp.flush().map_err(|e| LedgerError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        temp.as_file().sync_all().map_err(|e| LedgerError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        temp.persist(path).map_err(|e| LedgerError::Io {
            path: path.to_path_buf(),
            source: e.error,
        })?;

        // Fsync the directory so the rename itself survives a crash.
        if let Ok(dir) = std::fs::File::open(parent) {
            let _ = dir.sync_all();
        }

        debug!(
            path = %path.display(),
            completed = self.completed_lessons.len(),
            "progress persisted"
        );
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_load_absent_returns_zero_value() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = ProgressLedger::load(&ProgressLedger::path_in(dir.path()));
        assert_eq!(ledger, ProgressLedger::default());
    }

    #[test]
    fn test_load_corrupt_returns_zero_value() {
        let dir = tempfile::tempdir().unwrap();
        let path = ProgressLedger::path_in(dir.path());
        std::fs::write(&path, "{ not json").unwrap();
        let ledger = ProgressLedger::load(&path);
        assert_eq!(ledger, ProgressLedger::default());
    }

    #[test]
    fn test_round_trip_preserves_cursor_and_completed_set() {
        let dir = tempfile::tempdir().unwrap();
        let path = ProgressLedger::path_in(dir.path());

        let mut ledger = ProgressLedger::default();
        ledger.mark_done(ProgressLedger::composite_key("Course A", "Lesson 1"));
        ledger.mark_done(ProgressLedger::composite_key("Course A", "Lesson 2"));
        ledger.advance_and_persist(0, 2, &path).unwrap();

        let reloaded = ProgressLedger::load(&path);
        assert_eq!(reloaded, ledger);
        assert_eq!(reloaded.course_index, 0);
        assert_eq!(reloaded.lesson_index, 2);
        assert_eq!(reloaded.completed_count(), 2);
    }

    #[test]
    fn test_is_done_independent_of_cursor() {
        let dir = tempfile::tempdir().unwrap();
        let path = ProgressLedger::path_in(dir.path());
        let key = ProgressLedger::composite_key("Course A", "Lesson 1");

        let mut ledger = ProgressLedger::default();
        ledger.mark_done(key.clone());
        ledger.advance_and_persist(7, 3, &path).unwrap();

        // A reset cursor does not forget completed lessons.
        let mut reloaded = ProgressLedger::load(&path);
        reloaded.course_index = 0;
        reloaded.lesson_index = 0;
        assert!(reloaded.is_done(&key));
        assert!(!reloaded.is_done("Course A::Lesson 9"));
    }

    #[test]
    fn test_mark_done_is_idempotent() {
        let mut ledger = ProgressLedger::default();
        let key = ProgressLedger::composite_key("C", "L");
        ledger.mark_done(key.clone());
        ledger.mark_done(key.clone());
        assert_eq!(ledger.completed_count(), 1);
        assert!(ledger.is_done(&key));
    }

    #[test]
    fn test_reset_discards_everything() {
        let mut ledger = ProgressLedger::default();
        ledger.mark_done("C::L");
        ledger.course_index = 4;
        ledger.lesson_index = 2;

        let fresh = ProgressLedger::reset();
        assert_eq!(fresh, ProgressLedger::default());
        assert!(!fresh.is_done("C::L"));
        // The old value is untouched; reset produces a new zero value.
        assert!(ledger.is_done("C::L"));
    }

    #[test]
    fn test_persist_overwrites_previous_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = ProgressLedger::path_in(dir.path());

        let mut ledger = ProgressLedger::default();
        ledger.advance_and_persist(0, 1, &path).unwrap();
        ledger.mark_done("C::L2");
        ledger.advance_and_persist(0, 2, &path).unwrap();

        let reloaded = ProgressLedger::load(&path);
        assert_eq!(reloaded.lesson_index, 2);
        assert!(reloaded.is_done("C::L2"));
    }

    #[test]
    fn test_composite_key_format() {
        assert_eq!(
            ProgressLedger::composite_key("Course A", "Lesson 1"),
            "Course A::Lesson 1"
        );
    }

    #[test]
    fn test_load_tolerates_missing_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = ProgressLedger::path_in(dir.path());
        std::fs::write(&path, r#"{"course_index": 3}"#).unwrap();
        let ledger = ProgressLedger::load(&path);
        assert_eq!(ledger.course_index, 3);
        assert_eq!(ledger.lesson_index, 0);
        assert_eq!(ledger.completed_count(), 0);
    }
}

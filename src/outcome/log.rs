//! Append-only outcome log.
//!
//! - One text file per day per category: `<dir>/<YYYY-MM-DD>/<category>.txt`
//! - One record per line, prefixed with timestamp and outcome kind
//! - Flushed and synced before `append` returns

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{NaiveDate, Utc};

use super::errors::OutcomeResult;
use super::record::OutcomeRecord;

/// Default log category for the replication worker
pub const CONSUMER_CATEGORY: &str = "database-consumer";

/// Outcome log sink
pub trait OutcomeLog: Send + Sync {
    /// Append one record; durable once this returns `Ok`
    fn append(&self, record: &OutcomeRecord) -> OutcomeResult<()>;
}

struct OpenDay {
    date: NaiveDate,
    writer: BufWriter<File>,
}

/// File-backed outcome log that rolls over at UTC midnight
pub struct DailyFileOutcomeLog {
    dir: PathBuf,
    category: String,
    current: Mutex<Option<OpenDay>>,
}

impl DailyFileOutcomeLog {
    /// Create a log rooted at `dir`. Files are opened lazily.
    pub fn new(dir: impl AsRef<Path>, category: impl Into<String>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            category: category.into(),
            current: Mutex::new(None),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File holding the records of `date`
    pub fn path_for(&self, date: NaiveDate) -> PathBuf {
        self.dir
            .join(date.format("%Y-%m-%d").to_string())
            .join(format!("{}.txt", self.category))
    }

    fn open_day(&self, date: NaiveDate) -> OutcomeResult<OpenDay> {
        let path = self.path_for(date);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(OpenDay {
            date,
            writer: BufWriter::new(file),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Option<OpenDay>> {
        self.current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl OutcomeLog for DailyFileOutcomeLog {
    fn append(&self, record: &OutcomeRecord) -> OutcomeResult<()> {
        let line = record.to_line()?;
        let today = Utc::now().date_naive();

        let mut current = self.lock();
        if current.as_ref().map(|day| day.date) != Some(today) {
            *current = Some(self.open_day(today)?);
        }

        if let Some(day) = current.as_mut() {
            writeln!(day.writer, "{}", line)?;
            day.writer.flush()?;
            day.writer.get_ref().sync_data()?;
        }
        Ok(())
    }
}

/// In-memory outcome log for testing
#[derive(Debug, Clone, Default)]
pub struct MemoryOutcomeLog {
    records: Arc<Mutex<Vec<OutcomeRecord>>>,
}

impl MemoryOutcomeLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<OutcomeRecord> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<OutcomeRecord>> {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl OutcomeLog for MemoryOutcomeLog {
    fn append(&self, record: &OutcomeRecord) -> OutcomeResult<()> {
        self.lock().push(record.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outcome::record::Disposition;
    use tempfile::tempdir;

    #[test]
    fn test_file_log_appends_lines_per_day() {
        let dir = tempdir().unwrap();
        let log = DailyFileOutcomeLog::new(dir.path(), CONSUMER_CATEGORY);

        log.append(&OutcomeRecord::bare(Disposition::Acked)).unwrap();
        log.append(
            &OutcomeRecord::bare(Disposition::NackedNoRequeue).with_error("Invalid payload"),
        )
        .unwrap();

        let path = log.path_for(Utc::now().date_naive());
        assert!(path.ends_with("database-consumer.txt"));

        let content = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("] Success: "));
        assert!(lines[1].contains("] Failed: "));
        assert!(lines[1].contains("Invalid payload"));
    }

    #[test]
    fn test_file_log_reopen_appends() {
        let dir = tempdir().unwrap();
        {
            let log = DailyFileOutcomeLog::new(dir.path(), "audit");
            log.append(&OutcomeRecord::bare(Disposition::Acked)).unwrap();
        }
        let log = DailyFileOutcomeLog::new(dir.path(), "audit");
        log.append(&OutcomeRecord::bare(Disposition::NackedRequeue))
            .unwrap();

        let content = fs::read_to_string(log.path_for(Utc::now().date_naive())).unwrap();
        assert_eq!(content.lines().count(), 2);
    }

    #[test]
    fn test_memory_log() {
        let log = MemoryOutcomeLog::new();
        assert!(log.is_empty());

        log.append(&OutcomeRecord::bare(Disposition::DeadLettered))
            .unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log.records()[0].disposition, Disposition::DeadLettered);
    }
}

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::error::ExportError;
use crate::stream::CsvRecord;

#[cfg(windows)]
const LINE_ENDING: &str = "\r\n";
#[cfg(not(windows))]
const LINE_ENDING: &str = "\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportOutcome {
    Appended,
    /// The record rendered to nothing; the file was not touched.
    Skipped,
}

/// Hands out one write lock per export path, so exporters sharing a file
/// never interleave their appends.
#[derive(Debug, Default)]
pub struct ExportLocks {
    locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl ExportLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, path: &Path) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(path.to_path_buf()).or_default())
    }
}

#[derive(Debug, Default)]
pub struct ExportStats {
    appended: AtomicUsize,
    skipped: AtomicUsize,
    failed: AtomicUsize,
}

impl ExportStats {
    pub fn appended(&self) -> usize {
        self.appended.load(Ordering::Relaxed)
    }

    pub fn skipped(&self) -> usize {
        self.skipped.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> usize {
        self.failed.load(Ordering::Relaxed)
    }
}

/// Appends one line per record to a single export file.
///
/// The file is opened and closed on every call so readers always see whole
/// lines without coordinating with the exporter.
#[derive(Debug)]
pub struct IncrementalExporter {
    path: PathBuf,
    lock: Arc<Mutex<()>>,
    stats: ExportStats,
}

impl IncrementalExporter {
    pub fn new(path: impl Into<PathBuf>, locks: &ExportLocks) -> Self {
        let path = path.into();
        let lock = locks.lock_for(&path);
        Self {
            path,
            lock,
            stats: ExportStats::default(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn stats(&self) -> &ExportStats {
        &self.stats
    }

    pub fn export<R: CsvRecord + ?Sized>(&self, record: &R) -> Result<ExportOutcome, ExportError> {
        let mut line = String::new();
        record.build_csv(&mut line);
        if line.trim().is_empty() {
            self.stats.skipped.fetch_add(1, Ordering::Relaxed);
            return Ok(ExportOutcome::Skipped);
        }
        line.push_str(LINE_ENDING);

        let result = self.append(line.as_bytes());
        match &result {
            Ok(()) => self.stats.appended.fetch_add(1, Ordering::Relaxed),
            Err(_) => self.stats.failed.fetch_add(1, Ordering::Relaxed),
        };
        result.map(|()| ExportOutcome::Appended)
    }

    fn append(&self, bytes: &[u8]) -> Result<(), ExportError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut file| file.write_all(bytes))
            .map_err(|source| ExportError {
                path: self.path.clone(),
                source,
            })
    }
}

//! Test case persistence
//!
//! The capture sweep hands every completed exchange to a [`TestCaseWriter`].
//! Writes are synchronous and best effort: the caller logs a failure and
//! moves on to the next connection.

use crate::models::TestCase;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;

/// Error types for persistence operations
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to serialize test case: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Test case rejected: {0}")]
    Rejected(String),
}

/// Sink for test cases captured in record mode
pub trait TestCaseWriter: Send + Sync {
    fn write_test_case(&self, test_case: &TestCase) -> Result<(), PersistenceError>;
}

/// Appends test cases to a file, one JSON document per line
pub struct JsonLinesWriter {
    path: PathBuf,
    file: Mutex<BufWriter<File>>,
}

impl JsonLinesWriter {
    /// Open (or create) the output file in append mode
    pub fn open(path: impl AsRef<Path>) -> Result<Self, PersistenceError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        Ok(Self {
            path,
            file: Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl TestCaseWriter for JsonLinesWriter {
    fn write_test_case(&self, test_case: &TestCase) -> Result<(), PersistenceError> {
        let line = serde_json::to_string(test_case)?;

        let mut file = self
            .file
            .lock()
            .map_err(|_| PersistenceError::Rejected("writer lock poisoned".to_string()))?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
        file.flush()?;

        debug!(id = %test_case.id, kind = %test_case.kind, path = %self.path.display(), "Wrote test case");
        Ok(())
    }
}

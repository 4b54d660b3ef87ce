//! Record persistence
//!
//! Batches are appended as JSON Lines. Each line carries its own field names,
//! so repeated appends to one file never duplicate a header.

use crate::models::ApiRecord;
use anyhow::{Context, Result};
use std::fs::{self, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use tracing::debug;

/// Durable append-only storage for record batches
pub trait RecordStore: Send + Sync {
    /// Append `records` to the destination named `file_name`, returning its path
    fn append(&self, records: &[ApiRecord], file_name: &str) -> Result<PathBuf>;
}

/// JSON Lines files under a data directory
#[derive(Debug, Clone)]
pub struct JsonlRecordStore {
    data_dir: PathBuf,
}

impl JsonlRecordStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Result<Self> {
        let data_dir = data_dir.into();
        fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory {:?}", data_dir))?;
        Ok(Self { data_dir })
    }

    pub fn path_for(&self, file_name: &str) -> PathBuf {
        self.data_dir.join(file_name)
    }
}

impl RecordStore for JsonlRecordStore {
    fn append(&self, records: &[ApiRecord], file_name: &str) -> Result<PathBuf> {
        let path = self.path_for(file_name);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open {:?} for append", path))?;

        let mut writer = BufWriter::new(file);
        for record in records {
            serde_json::to_writer(&mut writer, record).context("Failed to serialize record")?;
            writer.write_all(b"\n")?;
        }
        writer.flush().with_context(|| format!("Failed to flush {:?}", path))?;

        debug!(path = %path.display(), count = records.len(), "Appended records");
        Ok(path)
    }
}

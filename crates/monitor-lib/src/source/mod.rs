//! Record sources feeding the monitor

mod synthetic;

pub use synthetic::{SyntheticConfig, SyntheticRecordSource, ENVIRONMENTS, SERVICES};

use crate::models::ApiRecord;
use anyhow::Result;
use async_trait::async_trait;

/// Supplies batches of API records on demand
#[async_trait]
pub trait RecordSource: Send + Sync {
    /// Records observed since the previous call; an empty batch means no new data
    async fn fetch_batch(&self) -> Result<Vec<ApiRecord>>;

    /// A historical corpus of roughly `count` records for initial training
    async fn fetch_history(&self, count: usize) -> Result<Vec<ApiRecord>>;
}

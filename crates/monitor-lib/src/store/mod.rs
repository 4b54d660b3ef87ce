//! Persistence for segment models and API records

mod model_store;
pub mod naming;
mod records;

pub use model_store::{ModelStore, StoreError, ARTIFACT_FORMAT_VERSION};
pub use records::{JsonlRecordStore, RecordStore};

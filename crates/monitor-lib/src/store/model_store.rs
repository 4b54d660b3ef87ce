//! Segment model store
//!
//! Holds one trained scorer and at most one traffic baseline per segment, and
//! persists them to a directory:
//! - `<service>+<environment>.model.json` per segment (checksummed envelope)
//! - `traffic_baselines.json` with every baseline keyed by segment
//!
//! Saves are best-effort per item: one failed write is logged and the
//! remaining items are still attempted.

use super::naming::{model_file_name, segment_from_file_name, BASELINES_FILE};
use crate::anomaly::TrafficBaseline;
use crate::detector::{OutlierScorer, SegmentScorer};
use crate::models::Segment;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Version written into every model artifact
pub const ARTIFACT_FORMAT_VERSION: u32 = 1;

/// Per-item persistence failure
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Serialization error on {path}: {source}")]
    Serialization {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("Checksum mismatch in {path}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },
    #[error("Artifact {path} belongs to segment {found}, file name says {expected}")]
    SegmentMismatch {
        path: PathBuf,
        expected: Segment,
        found: Segment,
    },
    #[error("Unsupported artifact format version {version} in {path}")]
    UnsupportedVersion { path: PathBuf, version: u32 },
    #[error("Artifact {path} holds an unfitted scorer")]
    Unfitted { path: PathBuf },
}

/// On-disk envelope for one segment's scorer
#[derive(Debug, Serialize, Deserialize)]
struct ModelArtifact {
    format_version: u32,
    service: String,
    environment: String,
    /// SHA-256 of the serialized scorer
    checksum: String,
    scorer: SegmentScorer,
}

#[derive(Debug, Serialize, Deserialize)]
struct BaselineEntry {
    service: String,
    environment: String,
    #[serde(flatten)]
    baseline: TrafficBaseline,
}

/// Per-segment models and baselines with directory persistence
pub struct ModelStore {
    dir: PathBuf,
    models: HashMap<Segment, SegmentScorer>,
    baselines: HashMap<Segment, TrafficBaseline>,
}

impl ModelStore {
    /// Create a store rooted at `dir`, creating the directory if needed
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create model directory {:?}", dir))?;

        Ok(Self {
            dir,
            models: HashMap::new(),
            baselines: HashMap::new(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn model(&self, segment: &Segment) -> Option<&SegmentScorer> {
        self.models.get(segment)
    }

    pub fn baseline(&self, segment: &Segment) -> Option<&TrafficBaseline> {
        self.baselines.get(segment)
    }

    pub fn baselines(&self) -> &HashMap<Segment, TrafficBaseline> {
        &self.baselines
    }

    pub fn model_count(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    /// Segments with a trained model, sorted
    pub fn segments(&self) -> Vec<Segment> {
        let mut segments: Vec<Segment> = self.models.keys().cloned().collect();
        segments.sort();
        segments
    }

    /// Install a freshly trained model and its baseline for one segment.
    ///
    /// A `None` baseline drops any previous one, so a segment never pairs a
    /// new model with a baseline from an older corpus.
    pub fn replace_segment(
        &mut self,
        segment: Segment,
        model: SegmentScorer,
        baseline: Option<TrafficBaseline>,
    ) {
        match baseline {
            Some(baseline) => {
                self.baselines.insert(segment.clone(), baseline);
            }
            None => {
                self.baselines.remove(&segment);
            }
        }
        self.models.insert(segment, model);
    }

    /// Persist every model and the baseline collection.
    ///
    /// Returns true only if every item was written.
    pub fn save(&self) -> bool {
        let mut failures = 0usize;

        for segment in self.segments() {
            let Some(model) = self.models.get(&segment) else {
                continue;
            };
            let path = self.dir.join(model_file_name(&segment));
            match write_artifact(&path, &segment, model) {
                Ok(()) => debug!(segment = %segment, path = %path.display(), "Saved segment model"),
                Err(e) => {
                    failures += 1;
                    error!(segment = %segment, error = %e, "Failed to save segment model");
                }
            }
        }

        let baselines_path = self.dir.join(BASELINES_FILE);
        if let Err(e) = self.write_baselines(&baselines_path) {
            failures += 1;
            error!(error = %e, "Failed to save traffic baselines");
        }

        if failures == 0 {
            info!(
                models = self.models.len(),
                baselines = self.baselines.len(),
                dir = %self.dir.display(),
                "Model store saved"
            );
        } else {
            warn!(failures, dir = %self.dir.display(), "Model store saved partially");
        }

        failures == 0
    }

    /// Load every readable model artifact and the baselines from disk.
    ///
    /// Malformed names and corrupt artifacts are skipped. Returns true if at
    /// least one model loaded, in which case the in-memory maps are replaced.
    pub fn load(&mut self) -> bool {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(dir = %self.dir.display(), error = %e, "Cannot read model directory");
                return false;
            }
        };

        let mut models = HashMap::new();
        for entry in entries.flatten() {
            let path = entry.path();
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if file_name == BASELINES_FILE {
                continue;
            }
            let Some(segment) = segment_from_file_name(file_name) else {
                debug!(file = %file_name, "Skipping file with unrecognized name");
                continue;
            };

            match read_artifact(&path, &segment) {
                Ok(model) => {
                    models.insert(segment, model);
                }
                Err(e) => warn!(
                    segment = %segment,
                    error = %e,
                    "Skipping unreadable segment model"
                ),
            }
        }

        if models.is_empty() {
            info!(dir = %self.dir.display(), "No persisted models found");
            return false;
        }

        let baselines = match self.read_baselines() {
            Ok(baselines) => baselines
                .into_iter()
                .filter(|(segment, _)| models.contains_key(segment))
                .collect(),
            Err(e) => {
                warn!(
                    error = %e,
                    "Traffic baselines unavailable, spike detection disabled until retrain"
                );
                HashMap::new()
            }
        };

        self.models = models;
        self.baselines = baselines;

        info!(
            models = self.models.len(),
            baselines = self.baselines.len(),
            dir = %self.dir.display(),
            "Model store loaded"
        );
        true
    }

    fn write_baselines(&self, path: &Path) -> Result<(), StoreError> {
        let mut entries: Vec<BaselineEntry> = self
            .baselines
            .iter()
            .map(|(segment, baseline)| BaselineEntry {
                service: segment.service.clone(),
                environment: segment.environment.clone(),
                baseline: *baseline,
            })
            .collect();
        entries.sort_by(|a, b| (&a.service, &a.environment).cmp(&(&b.service, &b.environment)));

        let bytes = serde_json::to_vec_pretty(&entries).map_err(|source| StoreError::Serialization {
            path: path.to_path_buf(),
            source,
        })?;
        write_atomic(path, &bytes)
    }

    fn read_baselines(&self) -> Result<HashMap<Segment, TrafficBaseline>, StoreError> {
        let path = self.dir.join(BASELINES_FILE);
        let bytes = fs::read(&path).map_err(|source| StoreError::Io {
            path: path.clone(),
            source,
        })?;
        let entries: Vec<BaselineEntry> = serde_json::from_slice(&bytes)
            .map_err(|source| StoreError::Serialization { path, source })?;

        Ok(entries
            .into_iter()
            .map(|entry| (Segment::new(entry.service, entry.environment), entry.baseline))
            .collect())
    }
}

fn write_artifact(path: &Path, segment: &Segment, model: &SegmentScorer) -> Result<(), StoreError> {
    let serialization_error = |source| StoreError::Serialization {
        path: path.to_path_buf(),
        source,
    };

    let scorer_bytes = serde_json::to_vec(model).map_err(serialization_error)?;
    let artifact = ModelArtifact {
        format_version: ARTIFACT_FORMAT_VERSION,
        service: segment.service.clone(),
        environment: segment.environment.clone(),
        checksum: compute_checksum(&scorer_bytes),
        scorer: model.clone(),
    };
    let bytes = serde_json::to_vec(&artifact).map_err(serialization_error)?;
    write_atomic(path, &bytes)
}

fn read_artifact(path: &Path, expected: &Segment) -> Result<SegmentScorer, StoreError> {
    let bytes = fs::read(path).map_err(|source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let artifact: ModelArtifact =
        serde_json::from_slice(&bytes).map_err(|source| StoreError::Serialization {
            path: path.to_path_buf(),
            source,
        })?;

    if artifact.format_version != ARTIFACT_FORMAT_VERSION {
        return Err(StoreError::UnsupportedVersion {
            path: path.to_path_buf(),
            version: artifact.format_version,
        });
    }

    let found = Segment::new(artifact.service, artifact.environment);
    if &found != expected {
        return Err(StoreError::SegmentMismatch {
            path: path.to_path_buf(),
            expected: expected.clone(),
            found,
        });
    }

    let scorer_bytes =
        serde_json::to_vec(&artifact.scorer).map_err(|source| StoreError::Serialization {
            path: path.to_path_buf(),
            source,
        })?;
    let actual = compute_checksum(&scorer_bytes);
    if actual != artifact.checksum {
        return Err(StoreError::ChecksumMismatch {
            path: path.to_path_buf(),
            expected: artifact.checksum,
            actual,
        });
    }

    if !artifact.scorer.is_fitted() {
        return Err(StoreError::Unfitted {
            path: path.to_path_buf(),
        });
    }

    Ok(artifact.scorer)
}

/// Write to a temp file, sync, then rename into place
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let io_error = |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    };

    let mut temp_name = path.as_os_str().to_owned();
    temp_name.push(".tmp");
    let temp_path = PathBuf::from(temp_name);

    let mut file = File::create(&temp_path).map_err(io_error)?;
    file.write_all(bytes).map_err(io_error)?;
    file.sync_all().map_err(io_error)?;
    fs::rename(&temp_path, path).map_err(io_error)?;

    Ok(())
}

/// Compute SHA256 checksum of data
fn compute_checksum(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

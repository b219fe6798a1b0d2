use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{HarnessError, Result};
use crate::metrics::TestMetrics;

/// Timestamp layout embedded in result filenames. Fixed width, so plain
/// string ordering matches chronological ordering.
const STAMP_FORMAT: &str = "%Y%m%d-%H%M%S%3f";

/// Filename prefix for persisted result sets.
const FILE_PREFIX: &str = "test-results-";

/// Outcome of running one scenario once against one instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestResult {
    pub test_name: String,
    pub success: bool,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    /// Wall-clock duration in milliseconds (derived from end − start).
    pub duration_ms: u64,
    /// Captured scenario output.
    pub output: String,
    /// Non-empty exactly when `success` is false.
    pub error: String,
    /// Owning instance.
    pub instance_id: String,
    /// Present only when metrics collection succeeded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<TestMetrics>,
}

/// One persisted run on disk.
#[derive(Debug, Clone)]
pub struct RunRecord {
    pub instance_id: String,
    /// The filename-embedded timestamp, already sortable as a string.
    pub stamp: String,
    pub path: PathBuf,
}

/// Disk-backed store of result sets.
///
/// Each run is one JSON array at
/// `{root}/test-results-<instanceID>-<stamp>.json`; files are never
/// overwritten, and "most recent" is decided by the embedded stamp, not by
/// filesystem metadata.
pub struct ResultStore {
    root: PathBuf,
}

impl ResultStore {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Persist a run's result set, creating the directory if absent.
    ///
    /// Returns the path written.
    pub fn save(&self, results: &[TestResult], instance_id: &str) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.root)?;
        let json = serde_json::to_string_pretty(results)?;

        // create_new refuses to clobber an existing run file; two saves in
        // the same millisecond retry with a fresh stamp.
        loop {
            let stamp = Utc::now().format(STAMP_FORMAT).to_string();
            let path = self
                .root
                .join(format!("{FILE_PREFIX}{instance_id}-{stamp}.json"));
            match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
            {
                Ok(mut file) => {
                    std::io::Write::write_all(&mut file, json.as_bytes())?;
                    debug!(instance_id, path = %path.display(), "results saved");
                    return Ok(path);
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    std::thread::sleep(std::time::Duration::from_millis(1));
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Load the most recent result set for one instance.
    ///
    /// # Errors
    /// `ResultsNotFound` when no run exists for the id; expected and
    /// non-fatal on a first run.
    pub fn load_latest(&self, instance_id: &str) -> Result<Vec<TestResult>> {
        let run = self
            .list_runs(Some(instance_id))?
            .into_iter()
            .max_by(|a, b| a.stamp.cmp(&b.stamp))
            .ok_or_else(|| HarnessError::ResultsNotFound(instance_id.to_string()))?;
        self.load_file(&run.path)
    }

    /// Load the most recent result set across all instances.
    pub fn load_latest_any(&self) -> Result<Vec<TestResult>> {
        let run = self
            .list_runs(None)?
            .into_iter()
            .max_by(|a, b| a.stamp.cmp(&b.stamp))
            .ok_or_else(|| HarnessError::ResultsNotFound("any".to_string()))?;
        self.load_file(&run.path)
    }

    /// Enumerate persisted runs, newest first, optionally filtered by
    /// instance id. Filenames that do not parse are skipped with a warning.
    pub fn list_runs(&self, instance_id: Option<&str>) -> Result<Vec<RunRecord>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let mut runs = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            match parse_run_filename(name) {
                Some((id, stamp)) => {
                    if instance_id.is_some_and(|want| want != id) {
                        continue;
                    }
                    runs.push(RunRecord {
                        instance_id: id.to_string(),
                        stamp: stamp.to_string(),
                        path: entry.path(),
                    });
                }
                None => {
                    if name.starts_with(FILE_PREFIX) {
                        warn!(file = name, "skipping unparseable result filename");
                    }
                }
            }
        }
        runs.sort_by(|a, b| b.stamp.cmp(&a.stamp));
        Ok(runs)
    }

    /// Read and parse one persisted run file.
    pub fn load_file(&self, path: &Path) -> Result<Vec<TestResult>> {
        let json = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }
}

/// Split `test-results-<id>-<stamp>.json` into (id, stamp), validating the
/// stamp actually parses as a timestamp.
fn parse_run_filename(name: &str) -> Option<(&str, &str)> {
    let rest = name.strip_prefix(FILE_PREFIX)?.strip_suffix(".json")?;
    // The stamp itself contains one '-' (<date>-<time+millis>), so the id
    // ends at the second-to-last dash.
    let dashes: Vec<usize> = rest.match_indices('-').map(|(i, _)| i).collect();
    let id_dash = *dashes.get(dashes.len().checked_sub(2)?)?;
    let (id, stamp) = (&rest[..id_dash], &rest[id_dash + 1..]);
    NaiveDateTime::parse_from_str(stamp, STAMP_FORMAT).ok()?;
    Some((id, stamp))
}

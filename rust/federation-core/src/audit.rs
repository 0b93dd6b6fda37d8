// rust/federation-core/src/audit.rs

//! Append-only record of terminal round outcomes.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::coordinator::round::{AbortReason, RoundId};
use crate::error::{FederationError, Result};
use crate::registry::NodeId;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AuditOutcome {
    Committed { version: u64 },
    Aborted { reason: AbortReason },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub round_id: RoundId,
    #[serde(flatten)]
    pub outcome: AuditOutcome,
    pub cohort: Vec<NodeId>,
    pub contributors: Vec<NodeId>,
    pub epsilon_spent: f64,
    pub delta_spent: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aggregate_digest: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

struct JsonLines {
    path: PathBuf,
    file: File,
}

/// In-memory audit trail, mirrored to a JSON-lines file when configured.
pub struct AuditLog {
    records: RwLock<Vec<AuditRecord>>,
    sink: Option<Mutex<JsonLines>>,
}

impl AuditLog {
    pub fn in_memory() -> Self {
        Self {
            records: RwLock::new(Vec::new()),
            sink: None,
        }
    }

    /// Open `path` for appending, creating it if needed.
    pub fn with_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| FederationError::io_with_source(path, "failed to open audit log", e))?;
        Ok(Self {
            records: RwLock::new(Vec::new()),
            sink: Some(Mutex::new(JsonLines {
                path: path.to_path_buf(),
                file,
            })),
        })
    }

    pub fn from_config(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::with_file(path),
            None => Ok(Self::in_memory()),
        }
    }

    /// Record an outcome. The in-memory record is kept even if the file
    /// write fails; the error is returned for the caller to log.
    pub fn append(&self, record: AuditRecord) -> Result<()> {
        let line = serde_json::to_string(&record)
            .map_err(|e| FederationError::serialization(format!("audit record: {}", e)));
        self.records.write().push(record);

        let line = line?;
        if let Some(sink) = &self.sink {
            let mut sink = sink.lock();
            let JsonLines { path, file } = &mut *sink;
            writeln!(file, "{}", line)
                .and_then(|_| file.flush())
                .map_err(|e| FederationError::io_with_source(path.clone(), "failed to append audit record", e))?;
        }
        Ok(())
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        self.records.read().clone()
    }

    pub fn for_round(&self, round_id: RoundId) -> Option<AuditRecord> {
        self.records
            .read()
            .iter()
            .find(|r| r.round_id == round_id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader};
    use tempfile::tempdir;

    fn record(round_id: u64, outcome: AuditOutcome) -> AuditRecord {
        AuditRecord {
            round_id,
            outcome,
            cohort: vec![NodeId::from("a"), NodeId::from("b"), NodeId::from("c")],
            contributors: vec![NodeId::from("a"), NodeId::from("b")],
            epsilon_spent: 0.5,
            delta_spent: 1e-5,
            aggregate_digest: Some("ab12".to_string()),
            recorded_at: Utc::now(),
        }
    }

    #[test]
    fn test_in_memory_append() {
        let log = AuditLog::in_memory();
        assert!(log.is_empty());
        log.append(record(1, AuditOutcome::Committed { version: 1 }))
            .unwrap();
        log.append(record(
            2,
            AuditOutcome::Aborted {
                reason: AbortReason::QuorumLost {
                    required: 3,
                    remaining: 2,
                },
            },
        ))
        .unwrap();

        assert_eq!(log.len(), 2);
        assert!(matches!(
            log.for_round(2).unwrap().outcome,
            AuditOutcome::Aborted { .. }
        ));
        assert!(log.for_round(3).is_none());
    }

    #[test]
    fn test_json_lines_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");

        {
            let log = AuditLog::with_file(&path).unwrap();
            log.append(record(1, AuditOutcome::Committed { version: 1 }))
                .unwrap();
        }
        // Reopening appends rather than truncating.
        {
            let log = AuditLog::with_file(&path).unwrap();
            log.append(record(
                2,
                AuditOutcome::Aborted {
                    reason: AbortReason::Cancelled {
                        detail: "operator".to_string(),
                    },
                },
            ))
            .unwrap();
        }

        let lines: Vec<String> = BufReader::new(File::open(&path).unwrap())
            .lines()
            .map(|l| l.unwrap())
            .collect();
        assert_eq!(lines.len(), 2);

        let first: serde_json::Value = serde_json::from_str(&lines[0]).unwrap();
        assert_eq!(first["outcome"], "committed");
        assert_eq!(first["version"], 1);

        let second: AuditRecord = serde_json::from_str(&lines[1]).unwrap();
        assert_eq!(second.round_id, 2);
    }

    #[test]
    fn test_with_file_bad_path() {
        let result = AuditLog::with_file("/nonexistent/dir/audit.jsonl");
        assert!(matches!(result, Err(FederationError::Io { .. })));
    }
}

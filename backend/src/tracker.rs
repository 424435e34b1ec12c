//! Run tracking.
//!
//! An in-memory record of one pipeline run: per-target status, dropped
//! scans, averaging history and timestamped log entries. The CLI writes the
//! final [`RunReport`] as JSON.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use uuid::Uuid;

/// A single log entry with timestamp and message.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct LogEntry {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub level: LogLevel,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scan: Option<u32>,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Success,
    Warning,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetStatus {
    Pending,
    Merging,
    Imaging,
    Converged,
    Exhausted,
    Failed,
    /// No visibilities survived averaging; not imaged
    Empty,
    /// Merged and kept on disk without imaging
    Exported,
}

impl TargetStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TargetStatus::Converged
                | TargetStatus::Exhausted
                | TargetStatus::Failed
                | TargetStatus::Empty
                | TargetStatus::Exported
        )
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct DroppedScan {
    pub scan: u32,
    pub reason: String,
}

/// Everything recorded about one target.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TargetReport {
    pub name: String,
    pub status: TargetStatus,
    pub scans_merged: Vec<u32>,
    pub scans_dropped: Vec<DroppedScan>,
    pub nvis: u64,
    pub iterations: u32,
    pub engine_invocations: u32,
    /// Best dynamic range reached
    pub quality: Option<f64>,
    pub error: Option<String>,
    pub published_keys: Vec<String>,
    /// Files written for this target outside the catalog
    #[serde(default)]
    pub products: Vec<String>,
}

impl TargetReport {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            status: TargetStatus::Pending,
            scans_merged: Vec::new(),
            scans_dropped: Vec::new(),
            nvis: 0,
            iterations: 0,
            engine_invocations: 0,
            quality: None,
            error: None,
            published_keys: Vec::new(),
            products: Vec::new(),
        }
    }
}

/// Run metadata, per-target results and logs.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub observation: String,
    pub status: RunStatus,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
    pub targets: BTreeMap<String, TargetReport>,
    pub averaging_history: Vec<String>,
    pub logs: Vec<LogEntry>,
    pub error: Option<String>,
}

impl RunReport {
    /// Process exit code: 0 on full success, 1 if any target failed, 2 when
    /// the run itself failed or was cancelled.
    pub fn exit_code(&self) -> i32 {
        match self.status {
            RunStatus::Failed | RunStatus::Cancelled | RunStatus::Running => 2,
            RunStatus::Completed => {
                if self
                    .targets
                    .values()
                    .any(|t| t.status == TargetStatus::Failed)
                {
                    1
                } else {
                    0
                }
            }
        }
    }

    pub fn dropped_scans(&self) -> usize {
        self.targets.values().map(|t| t.scans_dropped.len()).sum()
    }
}

/// Shared, cloneable run tracker.
#[derive(Clone)]
pub struct RunTracker {
    report: Arc<RwLock<RunReport>>,
}

impl RunTracker {
    pub fn new(observation: &str) -> Self {
        Self {
            report: Arc::new(RwLock::new(RunReport {
                run_id: Uuid::new_v4().to_string(),
                observation: observation.to_string(),
                status: RunStatus::Running,
                started_at: chrono::Utc::now(),
                completed_at: None,
                targets: BTreeMap::new(),
                averaging_history: Vec::new(),
                logs: Vec::new(),
                error: None,
            })),
        }
    }

    pub fn run_id(&self) -> String {
        self.report.read().run_id.clone()
    }

    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.push_log(level, None, None, message.into());
    }

    pub fn target_log(
        &self,
        target: &str,
        scan: Option<u32>,
        level: LogLevel,
        message: impl Into<String>,
    ) {
        self.push_log(level, Some(target.to_string()), scan, message.into());
    }

    fn push_log(&self, level: LogLevel, target: Option<String>, scan: Option<u32>, message: String) {
        self.report.write().logs.push(LogEntry {
            timestamp: chrono::Utc::now(),
            level,
            target,
            scan,
            message,
        });
    }

    /// Register `target` as pending; a no-op if already known.
    pub fn add_target(&self, target: &str) {
        self.report
            .write()
            .targets
            .entry(target.to_string())
            .or_insert_with(|| TargetReport::new(target));
    }

    /// Apply `f` to the report of `target`, creating it if needed.
    pub fn update_target(&self, target: &str, f: impl FnOnce(&mut TargetReport)) {
        let mut report = self.report.write();
        let entry = report
            .targets
            .entry(target.to_string())
            .or_insert_with(|| TargetReport::new(target));
        f(entry);
    }

    pub fn set_target_status(&self, target: &str, status: TargetStatus) {
        self.update_target(target, |t| t.status = status);
    }

    pub fn scan_merged(&self, target: &str, scan: u32, nvis: u64) {
        self.update_target(target, |t| {
            t.scans_merged.push(scan);
            t.nvis += nvis;
        });
    }

    /// Record a dropped scan and log a warning for it.
    pub fn scan_dropped(&self, target: &str, scan: u32, reason: impl Into<String>) {
        let reason = reason.into();
        self.target_log(
            target,
            Some(scan),
            LogLevel::Warning,
            format!("Dropped scan {}: {}", scan, reason),
        );
        self.update_target(target, |t| t.scans_dropped.push(DroppedScan { scan, reason }));
    }

    pub fn record_history(&self, line: impl Into<String>) {
        self.report.write().averaging_history.push(line.into());
    }

    pub fn fail_target(&self, target: &str, error: impl Into<String>) {
        let error = error.into();
        self.target_log(target, None, LogLevel::Error, error.clone());
        self.update_target(target, |t| {
            t.status = TargetStatus::Failed;
            t.error = Some(error);
        });
    }

    pub fn complete(&self) {
        let mut report = self.report.write();
        report.status = RunStatus::Completed;
        report.completed_at = Some(chrono::Utc::now());
    }

    pub fn fail(&self, error: impl Into<String>) {
        let error = error.into();
        let mut report = self.report.write();
        report.status = RunStatus::Failed;
        report.completed_at = Some(chrono::Utc::now());
        report.logs.push(LogEntry {
            timestamp: chrono::Utc::now(),
            level: LogLevel::Error,
            target: None,
            scan: None,
            message: error.clone(),
        });
        report.error = Some(error);
    }

    pub fn cancel(&self) {
        let mut report = self.report.write();
        report.status = RunStatus::Cancelled;
        report.completed_at = Some(chrono::Utc::now());
    }

    pub fn target(&self, target: &str) -> Option<TargetReport> {
        self.report.read().targets.get(target).cloned()
    }

    pub fn snapshot(&self) -> RunReport {
        self.report.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        let tracker = RunTracker::new("1234_continuum");
        tracker.add_target("A");
        tracker.set_target_status("A", TargetStatus::Converged);
        assert_eq!(tracker.snapshot().exit_code(), 2);

        tracker.complete();
        assert_eq!(tracker.snapshot().exit_code(), 0);

        tracker.fail_target("B", "MFImage exit 1");
        assert_eq!(tracker.snapshot().exit_code(), 1);

        tracker.fail("staging capacity exceeded");
        let report = tracker.snapshot();
        assert_eq!(report.exit_code(), 2);
        assert_eq!(report.error.as_deref(), Some("staging capacity exceeded"));
    }

    #[test]
    fn test_scan_bookkeeping() {
        let tracker = RunTracker::new("obs");
        tracker.scan_merged("A", 1, 100);
        tracker.scan_merged("A", 3, 50);
        tracker.scan_dropped("A", 2, "UVBlAvg failed 2 times");

        let target = tracker.target("A").unwrap();
        assert_eq!(target.scans_merged, vec![1, 3]);
        assert_eq!(target.nvis, 150);
        assert_eq!(target.scans_dropped[0].scan, 2);

        let report = tracker.snapshot();
        assert_eq!(report.dropped_scans(), 1);
        assert!(report
            .logs
            .iter()
            .any(|l| l.level == LogLevel::Warning && l.scan == Some(2)));
    }

    #[test]
    fn test_exported_targets_are_terminal() {
        let tracker = RunTracker::new("obs");
        tracker.update_target("A", |t| {
            t.status = TargetStatus::Exported;
            t.products.push("/work/A.merge.1.uv".to_string());
        });
        tracker.complete();

        let report = tracker.snapshot();
        assert!(report.targets["A"].status.is_terminal());
        assert_eq!(report.exit_code(), 0);
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["targets"]["A"]["status"], "exported");
        assert_eq!(json["targets"]["A"]["products"][0], "/work/A.merge.1.uv");
    }
}

//! Append-only feedback log with per-stage statistics.
//!
//! The in-memory log is authoritative. When a log directory is configured,
//! every record and retry outcome is also appended to a daily JSONL file
//! (`feedback_YYYYMMDD.jsonl`) and replayed by [`FeedbackTracker::open`].
//! Retry outcomes point at their entry by id. Both kinds of write hold one
//! lock from the in-memory change through the append, so an outcome line
//! always follows its entry line.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::types::FeedbackEntry;
use crate::error::StoreError;

/// Number of issues reported by the common-issue queries.
pub const TOP_ISSUES: usize = 5;

/// Feedback excerpts in run summaries are cut to this many characters.
const SUMMARY_FEEDBACK_CHARS: usize = 100;

/// A line in the JSONL feedback log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
enum LogRecord {
    Entry(FeedbackEntry),
    RetryOutcome {
        timestamp: DateTime<Utc>,
        entry_id: String,
        success: bool,
    },
}

/// Aggregate statistics for the feedback a stage has received.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageFeedbackStats {
    pub received_count: usize,
    /// Most frequent issues, most common first.
    pub common_issues: Vec<String>,
    /// Successful retries over retries with a known outcome; 0 when none.
    pub retry_success_rate: f64,
    pub avg_confidence: f64,
}

/// Condensed view of one feedback entry inside a run summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackDigest {
    pub from: String,
    pub feedback: String,
    pub confidence: f64,
    pub retry_successful: Option<bool>,
}

/// Feedback summary attached to a pipeline run report.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeedbackSummary {
    pub total_feedback_instances: usize,
    /// Digests grouped by receiving stage.
    pub feedback_by_stage: BTreeMap<String, Vec<FeedbackDigest>>,
    /// Distinct issues in first-seen order.
    pub common_issues: Vec<String>,
    pub retry_success_rate: f64,
}

/// Tracks feedback between stages.
pub struct FeedbackTracker {
    entries: RwLock<Vec<FeedbackEntry>>,
    log_dir: Option<PathBuf>,
    write_lock: Mutex<()>,
}

impl Default for FeedbackTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl FeedbackTracker {
    /// An in-memory tracker with no log file.
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            log_dir: None,
            write_lock: Mutex::new(()),
        }
    }

    /// A tracker persisting to `log_dir`, pre-loaded with its existing logs.
    ///
    /// Unreadable lines are skipped with a warning.
    pub async fn open(log_dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let log_dir = log_dir.into();
        fs::create_dir_all(&log_dir)
            .await
            .map_err(|source| StoreError::CreateDir {
                path: log_dir.display().to_string(),
                source,
            })?;

        let records = read_log_dir(&log_dir).await?;
        let mut entries: Vec<FeedbackEntry> = Vec::new();
        for record in records {
            match record {
                LogRecord::Entry(entry) => entries.push(entry),
                LogRecord::RetryOutcome {
                    entry_id, success, ..
                } => match entries.iter_mut().find(|e| e.id == entry_id) {
                    Some(entry) => entry.retry_successful = Some(success),
                    None => warn!(entry_id = %entry_id, "Retry outcome for unknown feedback entry"),
                },
            }
        }
        info!(
            dir = %log_dir.display(),
            entries = entries.len(),
            "Feedback log loaded"
        );

        Ok(Self {
            entries: RwLock::new(entries),
            log_dir: Some(log_dir),
            write_lock: Mutex::new(()),
        })
    }

    pub fn log_dir(&self) -> Option<&Path> {
        self.log_dir.as_deref()
    }

    /// Append an entry.
    ///
    /// The entry is in the log once this returns, even if persisting it
    /// failed; the error only reports that the file copy is behind.
    pub async fn record(&self, entry: FeedbackEntry) -> Result<(), StoreError> {
        info!(
            from = %entry.from_stage,
            to = %entry.to_stage,
            task_id = %entry.task_id,
            confidence = entry.confidence,
            feedback = %truncate(&entry.feedback, SUMMARY_FEEDBACK_CHARS),
            "Feedback recorded"
        );
        let _guard = self.write_lock.lock().await;
        {
            let mut entries = self.entries.write().expect("feedback log lock poisoned");
            entries.push(entry.clone());
        }
        self.append(&LogRecord::Entry(entry)).await
    }

    /// Set the outcome of the most recent matching entry without one.
    ///
    /// Returns false when no unset entry matches. If several runs for the
    /// same task and stages overlap, the latest entry wins.
    pub async fn update_retry_result(
        &self,
        task_id: &str,
        from_stage: &str,
        to_stage: &str,
        success: bool,
    ) -> Result<bool, StoreError> {
        let _guard = self.write_lock.lock().await;
        let entry_id = {
            let mut entries = self.entries.write().expect("feedback log lock poisoned");
            apply_retry_outcome(&mut entries, task_id, from_stage, to_stage, success)
        };
        let Some(entry_id) = entry_id else {
            return Ok(false);
        };

        self.append(&LogRecord::RetryOutcome {
            timestamp: Utc::now(),
            entry_id,
            success,
        })
        .await?;
        Ok(true)
    }

    pub fn len(&self) -> usize {
        self.entries.read().expect("feedback log lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the whole log, oldest first.
    pub fn entries(&self) -> Vec<FeedbackEntry> {
        self.entries
            .read()
            .expect("feedback log lock poisoned")
            .clone()
    }

    pub fn entries_for_task(&self, task_id: &str) -> Vec<FeedbackEntry> {
        self.entries
            .read()
            .expect("feedback log lock poisoned")
            .iter()
            .filter(|e| e.task_id == task_id)
            .cloned()
            .collect()
    }

    /// Statistics for the feedback received by `stage`.
    pub fn stage_stats(&self, stage: &str) -> StageFeedbackStats {
        let entries = self.entries.read().expect("feedback log lock poisoned");
        let received: Vec<&FeedbackEntry> = entries.iter().filter(|e| e.to_stage == stage).collect();
        compute_stats(&received)
    }

    /// Statistics for every stage that has received feedback.
    pub fn all_stats(&self) -> BTreeMap<String, StageFeedbackStats> {
        let entries = self.entries.read().expect("feedback log lock poisoned");
        let mut by_stage: BTreeMap<String, Vec<&FeedbackEntry>> = BTreeMap::new();
        for entry in entries.iter() {
            by_stage.entry(entry.to_stage.clone()).or_default().push(entry);
        }
        by_stage
            .into_iter()
            .map(|(stage, received)| (stage, compute_stats(&received)))
            .collect()
    }

    /// The `limit` most frequent issues reported against `stage`.
    pub fn common_issues_for(&self, stage: &str, limit: usize) -> Vec<String> {
        let entries = self.entries.read().expect("feedback log lock poisoned");
        top_issues(entries.iter().filter(|e| e.to_stage == stage), limit)
    }

    /// Entries newer than `window_hours`, newest first, at most `limit`.
    pub fn recent(&self, window_hours: u32, limit: usize) -> Vec<FeedbackEntry> {
        let cutoff = Utc::now() - Duration::hours(i64::from(window_hours));
        let entries = self.entries.read().expect("feedback log lock poisoned");
        let mut recent: Vec<FeedbackEntry> = entries
            .iter()
            .filter(|e| e.timestamp > cutoff)
            .cloned()
            .collect();
        recent.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        recent.truncate(limit);
        recent
    }

    /// Summary of the feedback exchanged while processing one task.
    pub fn summary_for_task(&self, task_id: &str) -> FeedbackSummary {
        let entries = self.entries_for_task(task_id);
        let mut summary = FeedbackSummary {
            total_feedback_instances: entries.len(),
            ..FeedbackSummary::default()
        };

        for entry in &entries {
            summary
                .feedback_by_stage
                .entry(entry.to_stage.clone())
                .or_default()
                .push(FeedbackDigest {
                    from: entry.from_stage.clone(),
                    feedback: truncate(&entry.feedback, SUMMARY_FEEDBACK_CHARS),
                    confidence: entry.confidence,
                    retry_successful: entry.retry_successful,
                });
            for issue in &entry.issues {
                if !summary.common_issues.contains(issue) {
                    summary.common_issues.push(issue.clone());
                }
            }
        }

        let refs: Vec<&FeedbackEntry> = entries.iter().collect();
        summary.retry_success_rate = retry_success_rate(&refs);
        summary
    }

    /// Append one record to the day's log file. Callers hold `write_lock`.
    async fn append(&self, record: &LogRecord) -> Result<(), StoreError> {
        let Some(ref dir) = self.log_dir else {
            return Ok(());
        };

        let timestamp = match record {
            LogRecord::Entry(entry) => entry.timestamp,
            LogRecord::RetryOutcome { timestamp, .. } => *timestamp,
        };
        let path = dir.join(format!("feedback_{}.jsonl", timestamp.format("%Y%m%d")));
        let mut line = serde_json::to_string(record)?;
        line.push('\n');

        let result = async {
            let mut file = fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await?;
            file.write_all(line.as_bytes()).await?;
            file.flush().await
        }
        .await;

        result.map_err(|source| {
            warn!(path = %path.display(), error = %source, "Failed to persist feedback record");
            StoreError::Io {
                path: path.display().to_string(),
                source,
            }
        })
    }
}

/// Returns the id of the entry that took the outcome.
fn apply_retry_outcome(
    entries: &mut [FeedbackEntry],
    task_id: &str,
    from_stage: &str,
    to_stage: &str,
    success: bool,
) -> Option<String> {
    let target = entries.iter_mut().rev().find(|e| {
        e.task_id == task_id
            && e.from_stage == from_stage
            && e.to_stage == to_stage
            && e.retry_successful.is_none()
    });
    match target {
        Some(entry) => {
            entry.retry_successful = Some(success);
            Some(entry.id.clone())
        }
        None => None,
    }
}

fn compute_stats(received: &[&FeedbackEntry]) -> StageFeedbackStats {
    if received.is_empty() {
        return StageFeedbackStats::default();
    }
    let avg_confidence =
        received.iter().map(|e| e.confidence).sum::<f64>() / received.len() as f64;
    StageFeedbackStats {
        received_count: received.len(),
        common_issues: top_issues(received.iter().copied(), TOP_ISSUES),
        retry_success_rate: retry_success_rate(received),
        avg_confidence,
    }
}

fn retry_success_rate(entries: &[&FeedbackEntry]) -> f64 {
    let outcomes: Vec<bool> = entries.iter().filter_map(|e| e.retry_successful).collect();
    if outcomes.is_empty() {
        return 0.0;
    }
    outcomes.iter().filter(|ok| **ok).count() as f64 / outcomes.len() as f64
}

/// Most frequent issues; ties keep first-appearance order.
fn top_issues<'a, I>(entries: I, limit: usize) -> Vec<String>
where
    I: Iterator<Item = &'a FeedbackEntry>,
{
    let mut counts: HashMap<&str, (usize, usize)> = HashMap::new();
    for issue in entries.flat_map(|e| e.issues.iter()) {
        let next_index = counts.len();
        counts.entry(issue.as_str()).or_insert((0, next_index)).0 += 1;
    }

    let mut ranked: Vec<(&str, usize, usize)> = counts
        .into_iter()
        .map(|(issue, (count, first_seen))| (issue, count, first_seen))
        .collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.2.cmp(&b.2)));
    ranked
        .into_iter()
        .take(limit)
        .map(|(issue, _, _)| issue.to_string())
        .collect()
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let head: String = text.chars().take(max_chars).collect();
    format!("{}...", head)
}

async fn read_log_dir(dir: &Path) -> Result<Vec<LogRecord>, StoreError> {
    let io_err = |source| StoreError::Io {
        path: dir.display().to_string(),
        source,
    };

    let mut files = Vec::new();
    let mut read_dir = fs::read_dir(dir).await.map_err(io_err)?;
    while let Some(entry) = read_dir.next_entry().await.map_err(io_err)? {
        let path = entry.path();
        let is_log = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.starts_with("feedback_") && n.ends_with(".jsonl"))
            .unwrap_or(false);
        if is_log {
            files.push(path);
        }
    }
    files.sort();

    let mut records = Vec::new();
    for path in files {
        let contents = fs::read_to_string(&path).await.map_err(|source| StoreError::Io {
            path: path.display().to_string(),
            source,
        })?;
        for (line_no, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<LogRecord>(line) {
                Ok(record) => records.push(record),
                Err(e) => warn!(
                    path = %path.display(),
                    line = line_no + 1,
                    error = %e,
                    "Skipping unreadable feedback record"
                ),
            }
        }
    }
    Ok(records)
}

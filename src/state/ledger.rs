//! RunLedger - durable record of task outcomes across invocations.
//!
//! Two files live in the ledger directory:
//! - `records.jsonl`: one [`LedgerRecord`] per line, append-only
//! - `resume.json`: the current [`ResumePoint`], replaced atomically
//!
//! A record is flushed and synced before the resume point is rewritten, so
//! a crash can leave the resume point stale but never loses a record. What
//! is done is always reconstructed from the records alone.

use std::collections::{BTreeMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::core::task::{SkipReason, TaskId, TaskStatus};
use crate::orchestration::TaskExecution;
use crate::Result;

const RECORDS_FILE: &str = "records.jsonl";
const RESUME_FILE: &str = "resume.json";

/// One appended outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerRecord {
    pub run_id: Uuid,
    pub wave: usize,
    pub recorded_at: DateTime<Utc>,
    pub execution: TaskExecution,
}

impl LedgerRecord {
    /// Whether this record says anything about the task's own result.
    ///
    /// Blocked and aborted skips only reflect what happened around the
    /// task, so they never override an earlier real outcome.
    fn is_outcome(&self) -> bool {
        !matches!(
            self.execution.status,
            TaskStatus::Skipped {
                reason: SkipReason::Blocked | SkipReason::Aborted
            }
        )
    }
}

/// Minimal pointer for continuing an interrupted run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumePoint {
    pub run_id: Uuid,
    pub last_completed: Option<TaskId>,
    pub next_pending: Option<TaskId>,
    pub failure_reason: Option<String>,
    /// `wave-<n>` of the most recent record.
    pub checkpoint: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
}

/// Summary of the ledger for status readouts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerStatus {
    pub total_records: usize,
    pub latest_run: Option<Uuid>,
    /// Latest outcome per task.
    pub tasks: BTreeMap<TaskId, TaskStatus>,
    pub counts: StatusCounts,
    pub resume: Option<ResumePoint>,
}

#[derive(Debug, Default)]
struct RunState {
    run_id: Option<Uuid>,
    order: Vec<TaskId>,
    done: HashSet<TaskId>,
    last_completed: Option<TaskId>,
    failure_reason: Option<String>,
}

/// Append-only outcome ledger, safe to share between workers.
pub struct RunLedger {
    dir: PathBuf,
    state: Mutex<RunState>,
}

impl RunLedger {
    /// Open (creating if needed) the ledger directory.
    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)?;
        debug!(dir = %dir.display(), "ledger opened");
        Ok(Self {
            dir: dir.to_path_buf(),
            state: Mutex::new(RunState::default()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn records_path(&self) -> PathBuf {
        self.dir.join(RECORDS_FILE)
    }

    fn resume_path(&self) -> PathBuf {
        self.dir.join(RESUME_FILE)
    }

    fn state(&self) -> std::sync::MutexGuard<'_, RunState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Start a new run over tasks in plan order.
    ///
    /// Tasks already done according to the records count as done for the
    /// resume point's `next_pending`.
    pub fn begin_run(&self, run_id: Uuid, order: Vec<TaskId>) -> Result<()> {
        let done = self.completed_tasks()?;
        let mut state = self.state();
        *state = RunState {
            run_id: Some(run_id),
            order,
            done,
            last_completed: None,
            failure_reason: None,
        };
        debug!(%run_id, "ledger run started");
        Ok(())
    }

    /// Append one outcome, then update the resume point.
    pub fn record(&self, execution: &TaskExecution, wave: usize) -> Result<()> {
        let mut state = self.state();
        let run_id = state.run_id.unwrap_or_else(Uuid::nil);
        let record = LedgerRecord {
            run_id,
            wave,
            recorded_at: Utc::now(),
            execution: execution.clone(),
        };

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(self.records_path())?;
        let mut line = String::new();
        if ends_with_torn_line(&mut file)? {
            warn!("ledger ends with a partial line, terminating it before append");
            line.push('\n');
        }
        line.push_str(&serde_json::to_string(&record)?);
        line.push('\n');
        file.write_all(line.as_bytes())?;
        file.flush()?;
        file.sync_data()?;

        let task_id = &execution.task_id;
        if execution.status.is_success() {
            state.done.insert(task_id.clone());
            state.last_completed = Some(task_id.clone());
        } else if record.is_outcome() {
            state.done.remove(task_id);
        }
        if execution.status == TaskStatus::Failed {
            state.failure_reason = Some(match &execution.error {
                Some(error) => format!("{}: {}", task_id, error),
                None => format!("{} failed", task_id),
            });
        }

        let resume = ResumePoint {
            run_id,
            last_completed: state.last_completed.clone(),
            next_pending: state
                .order
                .iter()
                .find(|id| !state.done.contains(*id))
                .cloned(),
            failure_reason: state.failure_reason.clone(),
            checkpoint: format!("wave-{}", wave),
            updated_at: Utc::now(),
        };
        self.write_resume_point(&resume)?;
        debug!(task_id = %task_id, status = %execution.status, "ledger record appended");
        Ok(())
    }

    fn write_resume_point(&self, resume: &ResumePoint) -> Result<()> {
        let tmp = self.dir.join(format!(".{}.tmp", RESUME_FILE));
        fs::write(&tmp, serde_json::to_vec_pretty(resume)?)?;
        fs::rename(&tmp, self.resume_path())?;
        Ok(())
    }

    /// All records in append order.
    ///
    /// A torn final line (crash mid-append) is skipped with a warning.
    pub fn records(&self) -> Result<Vec<LedgerRecord>> {
        let file = match File::open(self.records_path()) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut records = Vec::new();
        for (number, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(&line) {
                Ok(record) => records.push(record),
                Err(e) => warn!(line = number + 1, error = %e, "skipping unreadable ledger line"),
            }
        }
        Ok(records)
    }

    /// Tasks whose latest real outcome is a success.
    pub fn completed_tasks(&self) -> Result<HashSet<TaskId>> {
        let mut latest: BTreeMap<TaskId, TaskStatus> = BTreeMap::new();
        for record in self.records()?.into_iter().filter(LedgerRecord::is_outcome) {
            latest.insert(record.execution.task_id, record.execution.status);
        }
        Ok(latest
            .into_iter()
            .filter(|(_, status)| status.is_success())
            .map(|(id, _)| id)
            .collect())
    }

    /// Last written resume point, which may lag the records.
    pub fn resume_point(&self) -> Result<Option<ResumePoint>> {
        match fs::read_to_string(self.resume_path()) {
            Ok(text) => Ok(Some(serde_json::from_str(&text)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn status(&self) -> Result<LedgerStatus> {
        let records = self.records()?;
        let mut tasks = BTreeMap::new();
        for record in &records {
            tasks.insert(record.execution.task_id.clone(), record.execution.status);
        }

        let mut counts = StatusCounts::default();
        for status in tasks.values() {
            match status {
                TaskStatus::Succeeded => counts.succeeded += 1,
                TaskStatus::Failed => counts.failed += 1,
                TaskStatus::Skipped { .. } => counts.skipped += 1,
                _ => {}
            }
        }

        Ok(LedgerStatus {
            total_records: records.len(),
            latest_run: records.last().map(|r| r.run_id),
            tasks,
            counts,
            resume: self.resume_point().unwrap_or_else(|e| {
                warn!(error = %e, "unreadable resume point");
                None
            }),
        })
    }

    /// Delete all records and the resume point.
    pub fn reset(&self) -> Result<()> {
        let mut state = self.state();
        for path in [self.records_path(), self.resume_path()] {
            match fs::remove_file(&path) {
                Err(e) if e.kind() != ErrorKind::NotFound => return Err(e.into()),
                _ => {}
            }
        }
        *state = RunState::default();
        Ok(())
    }
}

/// Whether the file is non-empty and its last byte is not a newline.
fn ends_with_torn_line(file: &mut File) -> Result<bool> {
    if file.metadata()?.len() == 0 {
        return Ok(false);
    }
    let mut last = [0u8; 1];
    file.seek(SeekFrom::End(-1))?;
    file.read_exact(&mut last)?;
    Ok(last[0] != b'\n')
}

//! Job run repository: one row per execution of a job specification.
//!
//! Status only moves forward: `pending -> running -> success|failed|skipped`.
//! Every update is guarded by a `WHERE status IN (...)` clause listing the
//! allowed predecessors, so a late or repeated writer cannot regress a row.

use std::fmt;

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use super::{now_timestamp, parse_timestamp, subject_repo, Database, DatabaseError};
use crate::config::{Category, ExecutionKind, JobSpecification, TimeFilter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Success,
    Failed,
    Skipped,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Failed => "failed",
            RunStatus::Skipped => "skipped",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(RunStatus::Pending),
            "running" => Some(RunStatus::Running),
            "success" => Some(RunStatus::Success),
            "failed" => Some(RunStatus::Failed),
            "skipped" => Some(RunStatus::Skipped),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Success | RunStatus::Failed | RunStatus::Skipped
        )
    }

    /// SQL list of statuses this one may be entered from.
    fn predecessors(&self) -> &'static str {
        match self {
            RunStatus::Pending => "()",
            RunStatus::Running => "('pending')",
            RunStatus::Success | RunStatus::Failed | RunStatus::Skipped => {
                "('pending', 'running')"
            }
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct RunRow {
    pub id: String,
    pub job_id: String,
    pub kind: String,
    pub subject_id: i64,
    pub category: String,
    pub n_results: Option<i64>,
    pub keywords: Option<String>,
    pub time_filter: Option<String>,
    pub status: RunStatus,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub duration_secs: Option<f64>,
    pub items_found: i64,
    pub items_persisted: i64,
    pub children_persisted: i64,
    pub artifact_path: Option<String>,
    pub error_message: Option<String>,
    pub retry_count: i64,
    pub created_at: String,
}

impl RunRow {
    pub(crate) fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        let status: String = row.get("status")?;
        let status = RunStatus::parse(&status).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                format!("unknown run status '{}'", status).into(),
            )
        })?;

        Ok(Self {
            id: row.get("id")?,
            job_id: row.get("job_id")?,
            kind: row.get("kind")?,
            subject_id: row.get("subject_id")?,
            category: row.get("category")?,
            n_results: row.get("n_results")?,
            keywords: row.get("keywords")?,
            time_filter: row.get("time_filter")?,
            status,
            started_at: row.get("started_at")?,
            completed_at: row.get("completed_at")?,
            duration_secs: row.get("duration_secs")?,
            items_found: row.get("items_found")?,
            items_persisted: row.get("items_persisted")?,
            children_persisted: row.get("children_persisted")?,
            artifact_path: row.get("artifact_path")?,
            error_message: row.get("error_message")?,
            retry_count: row.get("retry_count")?,
            created_at: row.get("created_at")?,
        })
    }
}

/// The defining fields of a run, copied from its job specification.
#[derive(Debug, Clone)]
pub struct NewRun<'a> {
    pub job_id: String,
    pub kind: ExecutionKind,
    pub subject: &'a str,
    pub category: Category,
    pub n_results: Option<u32>,
    pub keywords: Option<&'a str>,
    pub time_filter: Option<TimeFilter>,
    pub retry_count: u32,
}

impl<'a> NewRun<'a> {
    pub fn for_job(job: &'a JobSpecification, kind: ExecutionKind, retry_count: u32) -> Self {
        Self {
            job_id: job.job_id().to_string(),
            kind,
            subject: &job.name,
            category: job.category,
            n_results: job.n_results,
            keywords: job.keywords.as_deref(),
            time_filter: job.effective_time_filter(),
            retry_count,
        }
    }
}

/// Terminal values written by [`finish`].
#[derive(Debug, Clone)]
pub struct RunCompletion {
    pub status: RunStatus,
    pub items_found: u64,
    pub items_persisted: u64,
    pub children_persisted: u64,
    pub artifact_path: Option<String>,
    pub error_message: Option<String>,
}

impl RunCompletion {
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: RunStatus::Failed,
            items_found: 0,
            items_persisted: 0,
            children_persisted: 0,
            artifact_path: None,
            error_message: Some(message.into()),
        }
    }

    pub fn skipped(reason: impl Into<String>) -> Self {
        Self {
            status: RunStatus::Skipped,
            error_message: Some(reason.into()),
            ..Self::failed("")
        }
    }
}

fn insert(conn: &Connection, run: &NewRun<'_>, status: RunStatus) -> Result<String, DatabaseError> {
    let subject_id = subject_repo::ensure(conn, run.subject)?;
    let id = uuid::Uuid::new_v4().to_string();
    let now = now_timestamp();
    let started_at = (status != RunStatus::Pending).then(|| now.clone());

    conn.execute(
        "INSERT INTO job_runs (id, job_id, kind, subject_id, category, n_results, keywords,
         time_filter, status, started_at, retry_count, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        params![
            id,
            run.job_id,
            run.kind.as_str(),
            subject_id,
            run.category.as_str(),
            run.n_results,
            run.keywords,
            run.time_filter.map(|tf| tf.as_str()),
            status.as_str(),
            started_at,
            run.retry_count,
            now,
        ],
    )?;
    Ok(id)
}

/// Creates a run in `pending` status.
pub fn create(db: &Database, run: &NewRun<'_>) -> Result<String, DatabaseError> {
    db.with_conn(|conn| insert(conn, run, RunStatus::Pending))
}

/// Creates a run that is already `running`, with `started_at` set.
pub fn begin(db: &Database, run: &NewRun<'_>) -> Result<String, DatabaseError> {
    db.with_conn(|conn| insert(conn, run, RunStatus::Running))
}

/// Records a run that never started, carrying the skip reason.
pub fn record_skipped(
    db: &Database,
    run: &NewRun<'_>,
    reason: &str,
) -> Result<String, DatabaseError> {
    let id = create(db, run)?;
    finish(db, &id, &RunCompletion::skipped(reason))?;
    Ok(id)
}

/// Moves a pending run to `running`.
pub fn start(db: &Database, id: &str) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            &format!(
                "UPDATE job_runs SET status = 'running', started_at = ?2
                 WHERE id = ?1 AND status IN {}",
                RunStatus::Running.predecessors()
            ),
            params![id, now_timestamp()],
        )?;
        guard_transition(conn, id, RunStatus::Running, changed)
    })
}

/// Moves a run to a terminal status with its final counters. `duration_secs`
/// is only written when the run has a start time.
pub fn finish(db: &Database, id: &str, completion: &RunCompletion) -> Result<(), DatabaseError> {
    db.with_conn(|conn| finish_on(conn, id, completion))
}

pub(crate) fn finish_on(
    conn: &Connection,
    id: &str,
    completion: &RunCompletion,
) -> Result<(), DatabaseError> {
    if !completion.status.is_terminal() {
        return Err(DatabaseError::InvalidTransition {
            id: id.to_string(),
            to: completion.status.to_string(),
        });
    }

    let started_at: Option<Option<String>> = conn
        .query_row(
            "SELECT started_at FROM job_runs WHERE id = ?1",
            params![id],
            |r| r.get(0),
        )
        .optional()?;
    let Some(started_at) = started_at else {
        return Err(DatabaseError::NotFound(format!("job run {}", id)));
    };

    let completed = chrono::Utc::now();
    let duration = started_at
        .as_deref()
        .and_then(parse_timestamp)
        .map(|started| ((completed - started).num_milliseconds().max(0) as f64) / 1000.0);

    let changed = conn.execute(
        &format!(
            "UPDATE job_runs SET status = ?2, completed_at = ?3, duration_secs = ?4,
             items_found = ?5, items_persisted = ?6, children_persisted = ?7,
             artifact_path = COALESCE(?8, artifact_path), error_message = ?9
             WHERE id = ?1 AND status IN {}",
            completion.status.predecessors()
        ),
        params![
            id,
            completion.status.as_str(),
            super::format_timestamp(completed),
            duration,
            completion.items_found as i64,
            completion.items_persisted as i64,
            completion.children_persisted as i64,
            completion.artifact_path,
            completion.error_message,
        ],
    )?;
    guard_transition(conn, id, completion.status, changed)
}

fn guard_transition(
    conn: &Connection,
    id: &str,
    to: RunStatus,
    changed: usize,
) -> Result<(), DatabaseError> {
    if changed > 0 {
        return Ok(());
    }
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM job_runs WHERE id = ?1)",
        params![id],
        |r| r.get(0),
    )?;
    if exists {
        Err(DatabaseError::InvalidTransition {
            id: id.to_string(),
            to: to.to_string(),
        })
    } else {
        Err(DatabaseError::NotFound(format!("job run {}", id)))
    }
}

pub fn find_by_id(db: &Database, id: &str) -> Result<Option<RunRow>, DatabaseError> {
    db.with_conn(|conn| {
        let row = conn
            .query_row(
                "SELECT * FROM job_runs WHERE id = ?1",
                params![id],
                RunRow::from_row,
            )
            .optional()?;
        Ok(row)
    })
}

pub fn count_by_status(db: &Database, status: RunStatus) -> Result<u64, DatabaseError> {
    db.with_conn(|conn| {
        let count: u64 = conn.query_row(
            "SELECT COUNT(*) FROM job_runs WHERE status = ?1",
            params![status.as_str()],
            |r| r.get(0),
        )?;
        Ok(count)
    })
}

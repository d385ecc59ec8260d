//! Read-only queries for downstream consumers, plus the queue
//! claim/complete surface they drive.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use rusqlite::types::ToSql;
use serde::Serialize;

use super::content_repo::{ChildRow, ParentRow};
use super::run_repo::RunRow;
use super::{format_timestamp, Database, DatabaseError};

pub use super::queue_repo::{
    claim, claim_next, complete, fail, pending_entries, ContentType, ProcessingStatus, QueueEntry,
};

const DEFAULT_LIMIT: u32 = 100;

/// Filters shared by the content queries. Every field is optional.
#[derive(Debug, Default, Clone)]
pub struct ContentFilter {
    pub subject: Option<String>,
    /// Only content created at or after this instant.
    pub since: Option<DateTime<Utc>>,
    /// Case-insensitive substring of title or body.
    pub keyword: Option<String>,
    pub author: Option<String>,
    pub limit: Option<u32>,
}

impl ContentFilter {
    fn build(&self, text_columns: &[&str]) -> (String, Vec<Box<dyn ToSql>>) {
        let mut conditions = Vec::new();
        let mut param_values: Vec<Box<dyn ToSql>> = Vec::new();

        if let Some(ref subject) = self.subject {
            param_values.push(Box::new(subject.clone()));
            conditions.push(format!("s.name = ?{}", param_values.len()));
        }
        if let Some(since) = self.since {
            param_values.push(Box::new(format_timestamp(since)));
            conditions.push(format!("c.created_utc >= ?{}", param_values.len()));
        }
        if let Some(ref keyword) = self.keyword {
            param_values.push(Box::new(format!("%{}%", keyword.to_lowercase())));
            let n = param_values.len();
            let matches: Vec<String> = text_columns
                .iter()
                .map(|col| format!("LOWER(COALESCE(c.{}, '')) LIKE ?{}", col, n))
                .collect();
            conditions.push(format!("({})", matches.join(" OR ")));
        }
        if let Some(ref author) = self.author {
            param_values.push(Box::new(author.clone()));
            conditions.push(format!("c.author = ?{}", param_values.len()));
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        param_values.push(Box::new(self.limit.unwrap_or(DEFAULT_LIMIT)));
        let tail = format!(
            "{} ORDER BY c.created_utc DESC, c.id DESC LIMIT ?{}",
            where_clause,
            param_values.len()
        );
        (tail, param_values)
    }
}

/// Most recent parent items matching the filter.
pub fn recent_parents(db: &Database, filter: &ContentFilter) -> Result<Vec<ParentRow>, DatabaseError> {
    let (tail, param_values) = filter.build(&["title", "body"]);
    let sql = format!(
        "SELECT c.* FROM parent_content c JOIN subjects s ON s.id = c.subject_id {}",
        tail
    );
    db.with_conn(|conn| {
        let params_ref: Vec<&dyn ToSql> = param_values.iter().map(|p| p.as_ref()).collect();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_ref.as_slice(), ParentRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// Most recent child items matching the filter.
pub fn recent_children(db: &Database, filter: &ContentFilter) -> Result<Vec<ChildRow>, DatabaseError> {
    let (tail, param_values) = filter.build(&["body"]);
    let sql = format!(
        "SELECT c.* FROM child_content c JOIN subjects s ON s.id = c.subject_id {}",
        tail
    );
    db.with_conn(|conn| {
        let params_ref: Vec<&dyn ToSql> = param_values.iter().map(|p| p.as_ref()).collect();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_ref.as_slice(), ChildRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

#[derive(Debug, Clone)]
pub struct Thread {
    pub parent: ParentRow,
    /// Children in thread order: depth first, then score.
    pub children: Vec<ChildRow>,
}

pub fn parent_with_children(db: &Database, natural_key: &str) -> Result<Option<Thread>, DatabaseError> {
    db.with_conn(|conn| {
        let parent = conn
            .query_row(
                "SELECT * FROM parent_content WHERE natural_key = ?1",
                params![natural_key],
                ParentRow::from_row,
            )
            .optional()?;
        let Some(parent) = parent else {
            return Ok(None);
        };

        let mut stmt = conn.prepare(
            "SELECT * FROM child_content WHERE parent_content_id = ?1
             ORDER BY depth ASC, score DESC, id ASC",
        )?;
        let children = stmt
            .query_map(params![parent.id], ChildRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Some(Thread { parent, children }))
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct SubjectStats {
    pub name: String,
    pub total_scrapes: i64,
    pub runs_by_status: BTreeMap<String, u64>,
    pub parent_count: u64,
    pub child_count: u64,
    pub last_scraped_at: Option<String>,
    pub last_successful_run: Option<String>,
}

pub fn subject_stats(db: &Database, name: &str) -> Result<Option<SubjectStats>, DatabaseError> {
    db.with_conn(|conn| {
        let subject: Option<(i64, i64, Option<String>)> = conn
            .query_row(
                "SELECT id, total_scrapes, last_scraped_at FROM subjects WHERE name = ?1",
                params![name],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .optional()?;
        let Some((id, total_scrapes, last_scraped_at)) = subject else {
            return Ok(None);
        };

        let mut stmt =
            conn.prepare("SELECT status, COUNT(*) FROM job_runs WHERE subject_id = ?1 GROUP BY status")?;
        let runs_by_status = stmt
            .query_map(params![id], |r| Ok((r.get::<_, String>(0)?, r.get::<_, u64>(1)?)))?
            .collect::<Result<BTreeMap<_, _>, _>>()?;

        let parent_count: u64 = conn.query_row(
            "SELECT COUNT(*) FROM parent_content WHERE subject_id = ?1",
            params![id],
            |r| r.get(0),
        )?;
        let child_count: u64 = conn.query_row(
            "SELECT COUNT(*) FROM child_content WHERE subject_id = ?1",
            params![id],
            |r| r.get(0),
        )?;
        let last_successful_run: Option<String> = conn.query_row(
            "SELECT MAX(completed_at) FROM job_runs WHERE subject_id = ?1 AND status = 'success'",
            params![id],
            |r| r.get(0),
        )?;

        Ok(Some(SubjectStats {
            name: name.to_string(),
            total_scrapes,
            runs_by_status,
            parent_count,
            child_count,
            last_scraped_at,
            last_successful_run,
        }))
    })
}

/// Runs created at or after `since`, newest first.
pub fn run_history(
    db: &Database,
    since: Option<DateTime<Utc>>,
    limit: Option<u32>,
) -> Result<Vec<RunRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT * FROM job_runs WHERE ?1 IS NULL OR created_at >= ?1
             ORDER BY created_at DESC, rowid DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(
                params![since.map(format_timestamp), limit.unwrap_or(DEFAULT_LIMIT)],
                RunRow::from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

//! Downstream processing queue.
//!
//! One entry is created per newly inserted content row. Consumers claim
//! entries with an atomic `pending -> processing` update and finish them
//! with [`complete`] or [`fail`]. Every status change is mirrored onto the
//! referenced content row's `processing_status`.

use std::fmt;

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use super::{now_timestamp, Database, DatabaseError};

pub const PARENT_PRIORITY: i64 = 1;
pub const CHILD_PRIORITY: i64 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    Parent,
    Child,
}

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentType::Parent => "parent",
            ContentType::Child => "child",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "parent" => Some(ContentType::Parent),
            "child" => Some(ContentType::Child),
            _ => None,
        }
    }

    fn table(&self) -> &'static str {
        match self {
            ContentType::Parent => "parent_content",
            ContentType::Child => "child_content",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Skipped,
}

impl ProcessingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingStatus::Pending => "pending",
            ProcessingStatus::Processing => "processing",
            ProcessingStatus::Completed => "completed",
            ProcessingStatus::Failed => "failed",
            ProcessingStatus::Skipped => "skipped",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(ProcessingStatus::Pending),
            "processing" => Some(ProcessingStatus::Processing),
            "completed" => Some(ProcessingStatus::Completed),
            "failed" => Some(ProcessingStatus::Failed),
            "skipped" => Some(ProcessingStatus::Skipped),
            _ => None,
        }
    }

    pub(crate) fn from_column(row: &Row<'_>, column: &str) -> Result<Self, rusqlite::Error> {
        let value: String = row.get(column)?;
        Self::parse(&value).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                format!("unknown processing status '{}'", value).into(),
            )
        })
    }
}

impl fmt::Display for ProcessingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub id: i64,
    pub content_type: ContentType,
    pub content_id: i64,
    pub natural_key: String,
    pub priority: i64,
    pub status: ProcessingStatus,
    pub processor_name: Option<String>,
    pub retry_count: i64,
    pub max_retries: i64,
    pub result: Option<String>,
    pub error_message: Option<String>,
    pub queued_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
}

impl QueueEntry {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        let content_type: String = row.get("content_type")?;
        let content_type = ContentType::parse(&content_type).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                format!("unknown content type '{}'", content_type).into(),
            )
        })?;

        Ok(Self {
            id: row.get("id")?,
            content_type,
            content_id: row.get("content_id")?,
            natural_key: row.get("natural_key")?,
            priority: row.get("priority")?,
            status: ProcessingStatus::from_column(row, "status")?,
            processor_name: row.get("processor_name")?,
            retry_count: row.get("retry_count")?,
            max_retries: row.get("max_retries")?,
            result: row.get("result")?,
            error_message: row.get("error_message")?,
            queued_at: row.get("queued_at")?,
            started_at: row.get("started_at")?,
            completed_at: row.get("completed_at")?,
        })
    }
}

/// Adds a queue entry for a freshly inserted content row.
pub fn enqueue(
    conn: &Connection,
    content_type: ContentType,
    content_id: i64,
    natural_key: &str,
    priority: i64,
) -> Result<i64, DatabaseError> {
    conn.execute(
        "INSERT INTO processing_queue (content_type, content_id, natural_key, priority, queued_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            content_type.as_str(),
            content_id,
            natural_key,
            priority,
            now_timestamp()
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

fn mirror_status(
    conn: &Connection,
    entry_id: i64,
    status: ProcessingStatus,
) -> Result<(), DatabaseError> {
    let target: Option<(String, i64)> = conn
        .query_row(
            "SELECT content_type, content_id FROM processing_queue WHERE id = ?1",
            params![entry_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?;

    let Some((content_type, content_id)) = target else {
        return Ok(());
    };
    let Some(content_type) = ContentType::parse(&content_type) else {
        return Err(DatabaseError::Corrupt {
            column: "processing_queue.content_type",
            value: content_type,
        });
    };

    conn.execute(
        &format!(
            "UPDATE {} SET processing_status = ?2 WHERE id = ?1",
            content_type.table()
        ),
        params![content_id, status.as_str()],
    )?;
    Ok(())
}

fn claim_on(conn: &Connection, entry_id: i64, processor_name: &str) -> Result<bool, DatabaseError> {
    let changed = conn.execute(
        "UPDATE processing_queue SET status = 'processing', processor_name = ?2, started_at = ?3
         WHERE id = ?1 AND status = 'pending'",
        params![entry_id, processor_name, now_timestamp()],
    )?;
    if changed == 0 {
        return Ok(false);
    }
    mirror_status(conn, entry_id, ProcessingStatus::Processing)?;
    Ok(true)
}

/// Claims a pending entry for `processor_name`. Returns `false` if another
/// consumer got there first or the entry is not pending.
pub fn claim(db: &Database, entry_id: i64, processor_name: &str) -> Result<bool, DatabaseError> {
    db.with_transaction(|tx| claim_on(tx, entry_id, processor_name))
}

/// Claims the highest-priority, oldest pending entry.
pub fn claim_next(
    db: &Database,
    processor_name: &str,
    content_type: Option<ContentType>,
) -> Result<Option<QueueEntry>, DatabaseError> {
    db.with_transaction(|tx| {
        let next: Option<i64> = tx
            .query_row(
                "SELECT id FROM processing_queue
                 WHERE status = 'pending'
                   AND (?1 IS NULL OR content_type = ?1)
                   AND (processor_name IS NULL OR processor_name = ?2)
                 ORDER BY priority DESC, queued_at ASC, id ASC
                 LIMIT 1",
                params![content_type.map(|c| c.as_str()), processor_name],
                |r| r.get(0),
            )
            .optional()?;

        let Some(id) = next else {
            return Ok(None);
        };
        if !claim_on(tx, id, processor_name)? {
            return Ok(None);
        }
        let entry = tx.query_row(
            "SELECT * FROM processing_queue WHERE id = ?1",
            params![id],
            QueueEntry::from_row,
        )?;
        Ok(Some(entry))
    })
}

/// Marks a processing entry completed with an optional result payload.
pub fn complete(db: &Database, entry_id: i64, result: Option<&str>) -> Result<bool, DatabaseError> {
    db.with_transaction(|tx| {
        let changed = tx.execute(
            "UPDATE processing_queue SET status = 'completed', result = ?2, completed_at = ?3
             WHERE id = ?1 AND status = 'processing'",
            params![entry_id, result, now_timestamp()],
        )?;
        if changed == 0 {
            return Ok(false);
        }
        mirror_status(tx, entry_id, ProcessingStatus::Completed)?;
        Ok(true)
    })
}

/// Records a failed attempt. The entry goes back to `pending` until it has
/// failed `max_retries` times, then stays `failed`. Returns the new status,
/// or `None` if the entry was not being processed.
pub fn fail(
    db: &Database,
    entry_id: i64,
    error: &str,
) -> Result<Option<ProcessingStatus>, DatabaseError> {
    db.with_transaction(|tx| {
        let counts: Option<(i64, i64)> = tx
            .query_row(
                "SELECT retry_count, max_retries FROM processing_queue
                 WHERE id = ?1 AND status = 'processing'",
                params![entry_id],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;

        let Some((retry_count, max_retries)) = counts else {
            return Ok(None);
        };

        let attempts = retry_count + 1;
        let status = if attempts >= max_retries {
            ProcessingStatus::Failed
        } else {
            ProcessingStatus::Pending
        };
        let completed_at = (status == ProcessingStatus::Failed).then(now_timestamp);

        tx.execute(
            "UPDATE processing_queue SET status = ?2, retry_count = ?3, error_message = ?4,
             completed_at = ?5, started_at = CASE WHEN ?2 = 'pending' THEN NULL ELSE started_at END
             WHERE id = ?1",
            params![entry_id, status.as_str(), attempts, error, completed_at],
        )?;
        mirror_status(tx, entry_id, status)?;
        Ok(Some(status))
    })
}

/// Pending entries, highest priority first. With a processor name, only
/// entries unassigned or previously assigned to that processor are listed.
pub fn pending_entries(
    db: &Database,
    processor_name: Option<&str>,
    content_type: Option<ContentType>,
    limit: u32,
) -> Result<Vec<QueueEntry>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT * FROM processing_queue
             WHERE status = 'pending'
               AND (?1 IS NULL OR processor_name IS NULL OR processor_name = ?1)
               AND (?2 IS NULL OR content_type = ?2)
             ORDER BY priority DESC, queued_at ASC, id ASC
             LIMIT ?3",
        )?;
        let rows = stmt
            .query_map(
                params![processor_name, content_type.map(|c| c.as_str()), limit],
                QueueEntry::from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

pub fn find_by_id(db: &Database, entry_id: i64) -> Result<Option<QueueEntry>, DatabaseError> {
    db.with_conn(|conn| {
        let row = conn
            .query_row(
                "SELECT * FROM processing_queue WHERE id = ?1",
                params![entry_id],
                QueueEntry::from_row,
            )
            .optional()?;
        Ok(row)
    })
}

pub fn count(db: &Database, content_type: Option<ContentType>) -> Result<u64, DatabaseError> {
    db.with_conn(|conn| {
        let count = conn.query_row(
            "SELECT COUNT(*) FROM processing_queue WHERE ?1 IS NULL OR content_type = ?1",
            params![content_type.map(|c| c.as_str())],
            |r| r.get(0),
        )?;
        Ok(count)
    })
}

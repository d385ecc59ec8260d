//! Parent/child content rows. The natural key is the only deduplication
//! mechanism: inserts use `ON CONFLICT(natural_key) DO NOTHING`, so a
//! re-ingested item is a no-op rather than an update.

use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{now_timestamp, queue_repo::ProcessingStatus, Database, DatabaseError};
use crate::scraper::artifact::{ChildItem, ParentItem};

#[derive(Debug, Clone)]
pub struct ParentRow {
    pub id: i64,
    pub natural_key: String,
    pub subject_id: i64,
    pub job_run_id: Option<String>,
    pub title: String,
    pub body: Option<String>,
    pub url: Option<String>,
    pub permalink: Option<String>,
    pub author: Option<String>,
    pub created_utc: Option<String>,
    pub score: i64,
    pub upvote_ratio: Option<f64>,
    pub num_comments: i64,
    pub link_flair_text: Option<String>,
    pub distinguished: Option<String>,
    pub is_nsfw: bool,
    pub is_spoiler: bool,
    pub is_stickied: bool,
    pub is_locked: bool,
    pub is_self: bool,
    pub is_original_content: bool,
    pub processing_status: ProcessingStatus,
    pub scraped_at: String,
}

impl ParentRow {
    pub(crate) fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            natural_key: row.get("natural_key")?,
            subject_id: row.get("subject_id")?,
            job_run_id: row.get("job_run_id")?,
            title: row.get("title")?,
            body: row.get("body")?,
            url: row.get("url")?,
            permalink: row.get("permalink")?,
            author: row.get("author")?,
            created_utc: row.get("created_utc")?,
            score: row.get("score")?,
            upvote_ratio: row.get("upvote_ratio")?,
            num_comments: row.get("num_comments")?,
            link_flair_text: row.get("link_flair_text")?,
            distinguished: row.get("distinguished")?,
            is_nsfw: row.get("is_nsfw")?,
            is_spoiler: row.get("is_spoiler")?,
            is_stickied: row.get("is_stickied")?,
            is_locked: row.get("is_locked")?,
            is_self: row.get("is_self")?,
            is_original_content: row.get("is_original_content")?,
            processing_status: ProcessingStatus::from_column(row, "processing_status")?,
            scraped_at: row.get("scraped_at")?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ChildRow {
    pub id: i64,
    pub natural_key: String,
    pub parent_content_id: i64,
    pub subject_id: i64,
    pub job_run_id: Option<String>,
    pub body: Option<String>,
    pub author: Option<String>,
    pub created_utc: Option<String>,
    pub score: i64,
    pub parent_ref: Option<String>,
    pub root_ref: Option<String>,
    pub depth: i64,
    pub distinguished: Option<String>,
    pub is_submitter: bool,
    pub is_stickied: bool,
    pub is_edited: bool,
    pub processing_status: ProcessingStatus,
    pub scraped_at: String,
}

impl ChildRow {
    pub(crate) fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            natural_key: row.get("natural_key")?,
            parent_content_id: row.get("parent_content_id")?,
            subject_id: row.get("subject_id")?,
            job_run_id: row.get("job_run_id")?,
            body: row.get("body")?,
            author: row.get("author")?,
            created_utc: row.get("created_utc")?,
            score: row.get("score")?,
            parent_ref: row.get("parent_ref")?,
            root_ref: row.get("root_ref")?,
            depth: row.get("depth")?,
            distinguished: row.get("distinguished")?,
            is_submitter: row.get("is_submitter")?,
            is_stickied: row.get("is_stickied")?,
            is_edited: row.get("is_edited")?,
            processing_status: ProcessingStatus::from_column(row, "processing_status")?,
            scraped_at: row.get("scraped_at")?,
        })
    }
}

/// Inserts a parent item. Returns the new row id, or `None` when a row with
/// the same natural key already exists.
pub fn insert_parent(
    conn: &Connection,
    subject_id: i64,
    job_run_id: Option<&str>,
    item: &ParentItem,
) -> Result<Option<i64>, DatabaseError> {
    let changed = conn.execute(
        "INSERT INTO parent_content (natural_key, subject_id, job_run_id, title, body, url,
         permalink, author, created_utc, score, upvote_ratio, num_comments, link_flair_text,
         distinguished, is_nsfw, is_spoiler, is_stickied, is_locked, is_self,
         is_original_content, scraped_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17,
                 ?18, ?19, ?20, ?21)
         ON CONFLICT(natural_key) DO NOTHING",
        params![
            item.natural_key,
            subject_id,
            job_run_id,
            item.title,
            item.body,
            item.url,
            item.permalink,
            item.author,
            item.created_utc,
            item.score,
            item.upvote_ratio,
            item.num_comments,
            item.link_flair_text,
            item.distinguished,
            item.is_nsfw,
            item.is_spoiler,
            item.is_stickied,
            item.is_locked,
            item.is_self,
            item.is_original_content,
            now_timestamp(),
        ],
    )?;

    Ok((changed > 0).then(|| conn.last_insert_rowid()))
}

/// Inserts a child item under an existing parent row. Same duplicate
/// semantics as [`insert_parent`].
pub fn insert_child(
    conn: &Connection,
    parent_content_id: i64,
    subject_id: i64,
    job_run_id: Option<&str>,
    item: &ChildItem,
) -> Result<Option<i64>, DatabaseError> {
    let changed = conn.execute(
        "INSERT INTO child_content (natural_key, parent_content_id, subject_id, job_run_id,
         body, author, created_utc, score, parent_ref, root_ref, depth, distinguished,
         is_submitter, is_stickied, is_edited, scraped_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
         ON CONFLICT(natural_key) DO NOTHING",
        params![
            item.natural_key,
            parent_content_id,
            subject_id,
            job_run_id,
            item.body,
            item.author,
            item.created_utc,
            item.score,
            item.parent_ref,
            item.root_ref,
            item.depth,
            item.distinguished,
            item.is_submitter,
            item.is_stickied,
            item.is_edited,
            now_timestamp(),
        ],
    )?;

    Ok((changed > 0).then(|| conn.last_insert_rowid()))
}

/// Row id and subject of the parent with the given natural key.
pub fn find_parent_ids(
    conn: &Connection,
    natural_key: &str,
) -> Result<Option<(i64, i64)>, DatabaseError> {
    let ids = conn
        .query_row(
            "SELECT id, subject_id FROM parent_content WHERE natural_key = ?1",
            params![natural_key],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?;
    Ok(ids)
}

pub fn find_parent(db: &Database, natural_key: &str) -> Result<Option<ParentRow>, DatabaseError> {
    db.with_conn(|conn| {
        let row = conn
            .query_row(
                "SELECT * FROM parent_content WHERE natural_key = ?1",
                params![natural_key],
                ParentRow::from_row,
            )
            .optional()?;
        Ok(row)
    })
}

pub fn find_child(db: &Database, natural_key: &str) -> Result<Option<ChildRow>, DatabaseError> {
    db.with_conn(|conn| {
        let row = conn
            .query_row(
                "SELECT * FROM child_content WHERE natural_key = ?1",
                params![natural_key],
                ChildRow::from_row,
            )
            .optional()?;
        Ok(row)
    })
}

pub fn count_parents(db: &Database) -> Result<u64, DatabaseError> {
    db.with_conn(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM parent_content", [], |r| r.get(0))?))
}

pub fn count_children(db: &Database) -> Result<u64, DatabaseError> {
    db.with_conn(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM child_content", [], |r| r.get(0))?))
}

/// Parent and child rows first inserted by the given run.
pub fn count_for_run(conn: &Connection, job_run_id: &str) -> Result<(u64, u64), DatabaseError> {
    let parents = conn.query_row(
        "SELECT COUNT(*) FROM parent_content WHERE job_run_id = ?1",
        params![job_run_id],
        |r| r.get(0),
    )?;
    let children = conn.query_row(
        "SELECT COUNT(*) FROM child_content WHERE job_run_id = ?1",
        params![job_run_id],
        |r| r.get(0),
    )?;
    Ok((parents, children))
}

/// Deletes a child row. Refused by the database while the row still has
/// pending or processing queue work.
pub fn delete_child(db: &Database, natural_key: &str) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "DELETE FROM child_content WHERE natural_key = ?1",
            params![natural_key],
        )?;
        Ok(changed > 0)
    })
}

/// Deletes a parent row and its children in one transaction. Refused while
/// any of them still has pending or processing queue work.
pub fn delete_parent(db: &Database, natural_key: &str) -> Result<bool, DatabaseError> {
    db.with_transaction(|tx| {
        let Some((id, _)) = find_parent_ids(tx, natural_key)? else {
            return Ok(false);
        };
        tx.execute(
            "DELETE FROM child_content WHERE parent_content_id = ?1",
            params![id],
        )?;
        tx.execute("DELETE FROM parent_content WHERE id = ?1", params![id])?;
        Ok(true)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::queue_repo::{self, ContentType};
    use crate::db::subject_repo;

    fn test_db() -> Database {
        Database::open_in_memory().expect("Failed to create test database")
    }

    fn parent(key: &str) -> ParentItem {
        ParentItem {
            natural_key: key.to_string(),
            subject: Some("rust".to_string()),
            title: format!("Title {}", key),
            body: None,
            url: None,
            permalink: Some(format!("/r/rust/comments/{}/t/", key)),
            author: Some("ferris".to_string()),
            created_utc: Some("2026-03-01T12:00:00Z".to_string()),
            score: 10,
            upvote_ratio: Some(0.9),
            num_comments: 1,
            link_flair_text: None,
            distinguished: None,
            is_nsfw: false,
            is_spoiler: false,
            is_stickied: false,
            is_locked: false,
            is_self: true,
            is_original_content: false,
        }
    }

    fn child(key: &str) -> ChildItem {
        ChildItem {
            natural_key: key.to_string(),
            body: "body".to_string(),
            author: None,
            created_utc: None,
            score: 1,
            parent_ref: Some("t3_p1".to_string()),
            root_ref: None,
            depth: 0,
            link_ref: Some("t3_p1".to_string()),
            distinguished: None,
            is_submitter: false,
            is_stickied: false,
            is_edited: false,
        }
    }

    #[test]
    fn test_insert_parent_skips_duplicates() {
        let db = test_db();
        let (first, second) = db
            .with_conn(|conn| {
                let subject = subject_repo::ensure(conn, "rust")?;
                Ok((
                    insert_parent(conn, subject, None, &parent("p1"))?,
                    insert_parent(conn, subject, None, &parent("p1"))?,
                ))
            })
            .unwrap();

        assert!(first.is_some());
        assert!(second.is_none());
        assert_eq!(count_parents(&db).unwrap(), 1);

        let row = find_parent(&db, "p1").unwrap().unwrap();
        assert_eq!(row.processing_status, ProcessingStatus::Pending);
        assert!(row.is_self);
    }

    #[test]
    fn test_insert_child_under_parent() {
        let db = test_db();
        db.with_conn(|conn| {
            let subject = subject_repo::ensure(conn, "rust")?;
            let parent_id = insert_parent(conn, subject, None, &parent("p1"))?.unwrap();
            assert!(insert_child(conn, parent_id, subject, None, &child("c1"))?.is_some());
            assert!(insert_child(conn, parent_id, subject, None, &child("c1"))?.is_none());
            Ok(())
        })
        .unwrap();

        assert_eq!(count_children(&db).unwrap(), 1);
        let row = find_child(&db, "c1").unwrap().unwrap();
        assert_eq!(row.parent_ref.as_deref(), Some("t3_p1"));
    }

    #[test]
    fn test_delete_refused_while_queue_pending() {
        let db = test_db();
        let entry = db
            .with_conn(|conn| {
                let subject = subject_repo::ensure(conn, "rust")?;
                let id = insert_parent(conn, subject, None, &parent("p1"))?.unwrap();
                queue_repo::enqueue(conn, ContentType::Parent, id, "p1", 1)
            })
            .unwrap();

        let refused = delete_parent(&db, "p1");
        assert!(refused.is_err());
        assert!(refused.unwrap_err().is_constraint_violation());
        assert!(find_parent(&db, "p1").unwrap().is_some());

        assert!(queue_repo::claim(&db, entry, "tester").unwrap());
        assert!(queue_repo::complete(&db, entry, Some("{}")).unwrap());

        assert!(delete_parent(&db, "p1").unwrap());
        assert!(find_parent(&db, "p1").unwrap().is_none());
        assert!(queue_repo::find_by_id(&db, entry).unwrap().is_none());
    }

    #[test]
    fn test_delete_missing_parent() {
        let db = test_db();
        assert!(!delete_parent(&db, "nope").unwrap());
        assert!(!delete_child(&db, "nope").unwrap());
    }
}

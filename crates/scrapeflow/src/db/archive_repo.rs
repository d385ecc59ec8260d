//! Archive records. A row is written once, after a confirmed upload; the
//! only later change is the deleted-locally flag.

use std::collections::BTreeMap;

use rusqlite::{params, OptionalExtension, Row};

use super::{now_timestamp, Database, DatabaseError};

#[derive(Debug, Clone)]
pub struct NewArchive {
    pub filename: String,
    pub archive_category: String,
    pub local_path: Option<String>,
    pub object_key: String,
    pub original_size: u64,
    pub compressed_size: u64,
    pub file_count: u64,
    pub subjects: Vec<String>,
    pub item_counts: BTreeMap<String, u64>,
    pub uploaded_at: String,
}

impl NewArchive {
    pub fn compression_ratio(&self) -> Option<f64> {
        (self.original_size > 0).then(|| self.compressed_size as f64 / self.original_size as f64)
    }
}

#[derive(Debug, Clone)]
pub struct ArchiveRow {
    pub id: i64,
    pub filename: String,
    pub archive_category: String,
    pub local_path: Option<String>,
    pub object_key: String,
    pub original_size: i64,
    pub compressed_size: i64,
    pub compression_ratio: Option<f64>,
    pub file_count: i64,
    pub subjects: Vec<String>,
    pub item_counts: BTreeMap<String, u64>,
    pub uploaded_at: Option<String>,
    pub is_uploaded: bool,
    pub is_deleted_locally: bool,
    pub created_at: String,
}

impl ArchiveRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        let json_column = |column: &str| -> Result<String, rusqlite::Error> { row.get(column) };
        let subjects: Vec<String> = serde_json::from_str(&json_column("subjects")?)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e)))?;
        let item_counts: BTreeMap<String, u64> = serde_json::from_str(&json_column("item_counts")?)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e)))?;

        Ok(Self {
            id: row.get("id")?,
            filename: row.get("filename")?,
            archive_category: row.get("archive_category")?,
            local_path: row.get("local_path")?,
            object_key: row.get("object_key")?,
            original_size: row.get("original_size")?,
            compressed_size: row.get("compressed_size")?,
            compression_ratio: row.get("compression_ratio")?,
            file_count: row.get("file_count")?,
            subjects,
            item_counts,
            uploaded_at: row.get("uploaded_at")?,
            is_uploaded: row.get("is_uploaded")?,
            is_deleted_locally: row.get("is_deleted_locally")?,
            created_at: row.get("created_at")?,
        })
    }
}

/// Records an uploaded archive. Returns `None` if the object key is already
/// recorded (a retried unit re-uploading the same archive).
pub fn record(db: &Database, archive: &NewArchive) -> Result<Option<i64>, DatabaseError> {
    let subjects = serde_json::to_string(&archive.subjects)?;
    let item_counts = serde_json::to_string(&archive.item_counts)?;

    db.with_conn(|conn| {
        let changed = conn.execute(
            "INSERT INTO archives (filename, archive_category, local_path, object_key,
             original_size, compressed_size, compression_ratio, file_count, subjects,
             item_counts, uploaded_at, is_uploaded, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, 1, ?12)
             ON CONFLICT(object_key) DO NOTHING",
            params![
                archive.filename,
                archive.archive_category,
                archive.local_path,
                archive.object_key,
                archive.original_size as i64,
                archive.compressed_size as i64,
                archive.compression_ratio(),
                archive.file_count as i64,
                subjects,
                item_counts,
                archive.uploaded_at,
                now_timestamp(),
            ],
        )?;
        Ok((changed > 0).then(|| conn.last_insert_rowid()))
    })
}

pub fn mark_deleted_locally(db: &Database, object_key: &str) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE archives SET is_deleted_locally = 1, local_path = NULL WHERE object_key = ?1",
            params![object_key],
        )?;
        Ok(changed > 0)
    })
}

pub fn find_by_key(db: &Database, object_key: &str) -> Result<Option<ArchiveRow>, DatabaseError> {
    db.with_conn(|conn| {
        let row = conn
            .query_row(
                "SELECT * FROM archives WHERE object_key = ?1",
                params![object_key],
                ArchiveRow::from_row,
            )
            .optional()?;
        Ok(row)
    })
}

pub fn list_recent(db: &Database, limit: u32) -> Result<Vec<ArchiveRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt =
            conn.prepare("SELECT * FROM archives ORDER BY created_at DESC, id DESC LIMIT ?1")?;
        let rows = stmt
            .query_map(params![limit], ArchiveRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

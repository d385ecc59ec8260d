//! Subject repository: the scraped namespaces, created lazily by name.

use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{now_timestamp, Database, DatabaseError};

#[derive(Debug, Clone)]
pub struct SubjectRow {
    pub id: i64,
    pub name: String,
    pub display_name: Option<String>,
    pub description: Option<String>,
    pub subscribers: Option<i64>,
    pub is_active: bool,
    pub first_scraped_at: Option<String>,
    pub last_scraped_at: Option<String>,
    pub total_scrapes: i64,
    pub created_at: String,
    pub updated_at: String,
}

impl SubjectRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            name: row.get("name")?,
            display_name: row.get("display_name")?,
            description: row.get("description")?,
            subscribers: row.get("subscribers")?,
            is_active: row.get("is_active")?,
            first_scraped_at: row.get("first_scraped_at")?,
            last_scraped_at: row.get("last_scraped_at")?,
            total_scrapes: row.get("total_scrapes")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

/// Metadata the scraper may report about a subject. Absent fields leave
/// the stored values untouched.
#[derive(Debug, Clone, Default)]
pub struct SubjectMetadata {
    pub display_name: Option<String>,
    pub description: Option<String>,
    pub subscribers: Option<i64>,
}

/// Returns the id of the subject named `name`, creating it if needed.
pub fn ensure(conn: &Connection, name: &str) -> Result<i64, DatabaseError> {
    let now = now_timestamp();
    conn.execute(
        "INSERT INTO subjects (name, created_at, updated_at) VALUES (?1, ?2, ?2)
         ON CONFLICT(name) DO NOTHING",
        params![name, now],
    )?;
    let id = conn.query_row(
        "SELECT id FROM subjects WHERE name = ?1",
        params![name],
        |r| r.get(0),
    )?;
    Ok(id)
}

/// Records a scrape of the subject: sets the scrape timestamps, bumps the
/// run counter and merges any provided metadata.
pub fn record_scrape(
    conn: &Connection,
    name: &str,
    metadata: &SubjectMetadata,
) -> Result<i64, DatabaseError> {
    let id = ensure(conn, name)?;
    let now = now_timestamp();
    conn.execute(
        "UPDATE subjects SET
            first_scraped_at = COALESCE(first_scraped_at, ?2),
            last_scraped_at = ?2,
            total_scrapes = total_scrapes + 1,
            display_name = COALESCE(?3, display_name),
            description = COALESCE(?4, description),
            subscribers = COALESCE(?5, subscribers),
            updated_at = ?2
         WHERE id = ?1",
        params![
            id,
            now,
            metadata.display_name,
            metadata.description,
            metadata.subscribers
        ],
    )?;
    Ok(id)
}

pub fn find_by_name(db: &Database, name: &str) -> Result<Option<SubjectRow>, DatabaseError> {
    db.with_conn(|conn| {
        let row = conn
            .query_row(
                "SELECT * FROM subjects WHERE name = ?1",
                params![name],
                SubjectRow::from_row,
            )
            .optional()?;
        Ok(row)
    })
}

pub fn list(db: &Database) -> Result<Vec<SubjectRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare("SELECT * FROM subjects ORDER BY name")?;
        let rows = stmt
            .query_map([], SubjectRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

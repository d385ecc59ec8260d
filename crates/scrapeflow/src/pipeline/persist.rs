//! Writes a finished scrape into the store.
//!
//! Items are inserted in small transactions with one savepoint per item,
//! so a rejected item never takes its neighbours down with it. Every new
//! row is queued for downstream processing in the same savepoint.
//! Re-persisting the same artifact inserts nothing: rows are keyed by
//! their natural key.

use std::path::{Path, PathBuf};

use rusqlite::{Connection, Transaction};
use serde::Serialize;
use tracing::{debug, info, info_span, warn};

use crate::config::JobSpecification;
use crate::db::content_repo;
use crate::db::queue_repo::{self, ContentType, CHILD_PRIORITY, PARENT_PRIORITY};
use crate::db::run_repo::{self, RunCompletion, RunStatus};
use crate::db::subject_repo::{self, SubjectMetadata};
use crate::db::{Database, DatabaseError};
use crate::error::ArtifactError;
use crate::scraper::{ChildArtifact, ChildItem, ParentArtifact, ParentItem};

use super::error::{PersistError, PipelineWarning};
use super::job_processor::ScrapeOutcome;

/// Rows written per transaction.
pub const BATCH_SIZE: usize = 10;

#[derive(Debug, Clone, Default, Serialize)]
pub struct PersistOutcome {
    pub items_found: u64,
    pub parents_inserted: u64,
    pub parents_duplicate: u64,
    pub parents_rejected: u64,
    pub children_inserted: u64,
    pub children_duplicate: u64,
    pub children_rejected: u64,
    pub child_artifacts_skipped: u64,
    /// Rows attributed to the run, including those written by earlier
    /// attempts of the same persistence unit.
    pub run_parents: u64,
    pub run_children: u64,
    #[serde(skip)]
    pub warnings: Vec<PipelineWarning>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InsertResult {
    Inserted,
    Duplicate,
    Rejected,
}

#[derive(Clone)]
pub struct Persister {
    db: Database,
    batch_size: usize,
    delete_artifacts: bool,
}

impl Persister {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            batch_size: BATCH_SIZE,
            delete_artifacts: true,
        }
    }

    /// Keep consumed artifacts on disk instead of deleting them.
    pub fn keep_artifacts(mut self) -> Self {
        self.delete_artifacts = false;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Persists the parent artifact and every child artifact of `outcome`
    /// under the run `run_id`, then finishes the run as `success`.
    ///
    /// A malformed parent artifact fails the run and is not retryable.
    /// Retryable database errors leave the run open for another attempt.
    pub fn persist(
        &self,
        run_id: &str,
        job: &JobSpecification,
        outcome: &ScrapeOutcome,
    ) -> Result<PersistOutcome, PersistError> {
        let _span = info_span!("persist", run_id = %run_id, subject = %job.name).entered();

        let Some(artifact_path) = outcome.artifact_path.as_deref() else {
            return Err(self.fail_run(run_id, None, PersistError::NoArtifact));
        };

        let artifact = match read_parent_artifact(artifact_path) {
            Ok(artifact) => artifact,
            Err(e) => return Err(self.fail_run(run_id, Some(artifact_path), e.into())),
        };

        let mut result = PersistOutcome {
            items_found: artifact.items.len() as u64,
            ..PersistOutcome::default()
        };

        let subject_id = self
            .db
            .with_conn(|conn| subject_repo::ensure(conn, &job.name))?;

        let items: Vec<(usize, Result<ParentItem, ArtifactError>)> = artifact.parse_items().collect();
        for batch in items.chunks(self.batch_size) {
            self.db.with_transaction(|tx| {
                for (index, item) in batch {
                    let item = match item {
                        Ok(item) => item,
                        Err(e) => {
                            warn!(index, error = %e, "Rejected parent item");
                            result.parents_rejected += 1;
                            result.warnings.push(PipelineWarning::ItemRejected {
                                key: None,
                                error: e.to_string(),
                            });
                            continue;
                        }
                    };
                    match insert_in_savepoint(tx, |conn| {
                        insert_parent_queued(conn, subject_id, run_id, item)
                    })? {
                        InsertResult::Inserted => result.parents_inserted += 1,
                        InsertResult::Duplicate => result.parents_duplicate += 1,
                        InsertResult::Rejected => {
                            result.parents_rejected += 1;
                            result.warnings.push(PipelineWarning::ItemRejected {
                                key: Some(item.natural_key.clone()),
                                error: "insert rejected".to_string(),
                            });
                        }
                    }
                }
                Ok(())
            })?;
        }

        let mut consumed = Vec::new();
        for child in &outcome.children {
            if self.persist_child_artifact(run_id, &child.parent_key, &child.artifact_path, &mut result)? {
                consumed.push(child.artifact_path.clone());
            }
        }

        let (run_parents, run_children) = self.db.with_transaction(|tx| {
            subject_repo::record_scrape(tx, &job.name, &SubjectMetadata::default())?;
            let counts = content_repo::count_for_run(tx, run_id)?;
            run_repo::finish_on(
                tx,
                run_id,
                &RunCompletion {
                    status: RunStatus::Success,
                    items_found: result.items_found,
                    items_persisted: counts.0,
                    children_persisted: counts.1,
                    artifact_path: Some(artifact_path.display().to_string()),
                    error_message: None,
                },
            )?;
            Ok(counts)
        })?;
        result.run_parents = run_parents;
        result.run_children = run_children;

        if self.delete_artifacts {
            for path in &consumed {
                self.remove_artifact(path, &mut result);
            }
            if run_parents > 0 {
                self.remove_artifact(artifact_path, &mut result);
            }
        }

        info!(
            parents = result.parents_inserted,
            duplicates = result.parents_duplicate,
            rejected = result.parents_rejected,
            children = result.children_inserted,
            "Persisted scrape"
        );
        Ok(result)
    }

    /// Marks the run failed after persistence gave up on it.
    pub fn mark_failed(&self, run_id: &str, error: &PersistError) {
        if let Err(e) = run_repo::finish(&self.db, run_id, &RunCompletion::failed(error.to_string())) {
            debug!(run_id = %run_id, error = %e, "Run already finished");
        }
    }

    /// Returns `true` when the artifact was fully consumed.
    fn persist_child_artifact(
        &self,
        run_id: &str,
        parent_key: &str,
        path: &Path,
        result: &mut PersistOutcome,
    ) -> Result<bool, PersistError> {
        let artifact = match ChildArtifact::read(path) {
            Ok(artifact) => artifact,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Skipping malformed child artifact");
                result.child_artifacts_skipped += 1;
                result.warnings.push(PipelineWarning::ChildArtifactSkipped {
                    path: path.display().to_string(),
                    error: e.to_string(),
                });
                return Ok(false);
            }
        };

        let parent = self
            .db
            .with_conn(|conn| content_repo::find_parent_ids(conn, parent_key))?;
        let Some((parent_id, subject_id)) = parent else {
            warn!(parent = %parent_key, "Parent row missing; skipping child artifact");
            result.child_artifacts_skipped += 1;
            result.warnings.push(PipelineWarning::ChildArtifactSkipped {
                path: path.display().to_string(),
                error: format!("parent '{}' not stored", parent_key),
            });
            return Ok(false);
        };

        let comments: &[Result<ChildItem, ArtifactError>] = &artifact.comments;
        for batch in comments.chunks(self.batch_size) {
            self.db.with_transaction(|tx| {
                for item in batch {
                    let item = match item {
                        Ok(item) => item,
                        Err(e) => {
                            warn!(error = %e, "Rejected child item");
                            result.children_rejected += 1;
                            result.warnings.push(PipelineWarning::ItemRejected {
                                key: None,
                                error: e.to_string(),
                            });
                            continue;
                        }
                    };
                    match insert_in_savepoint(tx, |conn| {
                        insert_child_queued(conn, parent_id, subject_id, run_id, item)
                    })? {
                        InsertResult::Inserted => result.children_inserted += 1,
                        InsertResult::Duplicate => result.children_duplicate += 1,
                        InsertResult::Rejected => {
                            result.children_rejected += 1;
                            result.warnings.push(PipelineWarning::ItemRejected {
                                key: Some(item.natural_key.clone()),
                                error: "insert rejected".to_string(),
                            });
                        }
                    }
                }
                Ok(())
            })?;
        }
        Ok(true)
    }

    fn fail_run(&self, run_id: &str, artifact_path: Option<&Path>, error: PersistError) -> PersistError {
        warn!(run_id = %run_id, error = %error, "Persistence failed");
        let completion = RunCompletion {
            artifact_path: artifact_path.map(|p| p.display().to_string()),
            ..RunCompletion::failed(error.to_string())
        };
        if let Err(e) = run_repo::finish(&self.db, run_id, &completion) {
            warn!(run_id = %run_id, error = %e, "Could not mark run failed");
        }
        error
    }

    fn remove_artifact(&self, path: &Path, result: &mut PersistOutcome) {
        match std::fs::remove_file(path) {
            Ok(()) => debug!(path = %path.display(), "Removed consumed artifact"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Could not remove artifact");
                result.warnings.push(PipelineWarning::ArtifactCleanupFailed {
                    path: path.display().to_string(),
                    error: e.to_string(),
                });
            }
        }
    }
}

fn read_parent_artifact(path: &Path) -> Result<ParentArtifact, ArtifactError> {
    let is_json = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
    if !is_json {
        return Err(ArtifactError::UnsupportedFormat(PathBuf::from(path)));
    }
    ParentArtifact::read(path)
}

/// Runs `insert` inside a savepoint. Non-retryable errors roll back just
/// this item; retryable ones abort the whole batch.
fn insert_in_savepoint<F>(tx: &mut Transaction<'_>, insert: F) -> Result<InsertResult, DatabaseError>
where
    F: FnOnce(&Connection) -> Result<Option<i64>, DatabaseError>,
{
    let savepoint = tx.savepoint()?;
    match insert(&savepoint) {
        Ok(Some(_)) => {
            savepoint.commit()?;
            Ok(InsertResult::Inserted)
        }
        Ok(None) => Ok(InsertResult::Duplicate),
        Err(e) if e.is_retryable() => Err(e),
        Err(e) => {
            warn!(error = %e, "Insert rolled back");
            Ok(InsertResult::Rejected)
        }
    }
}

fn insert_parent_queued(
    conn: &Connection,
    subject_id: i64,
    run_id: &str,
    item: &ParentItem,
) -> Result<Option<i64>, DatabaseError> {
    let Some(id) = content_repo::insert_parent(conn, subject_id, Some(run_id), item)? else {
        return Ok(None);
    };
    queue_repo::enqueue(conn, ContentType::Parent, id, &item.natural_key, PARENT_PRIORITY)?;
    Ok(Some(id))
}

fn insert_child_queued(
    conn: &Connection,
    parent_id: i64,
    subject_id: i64,
    run_id: &str,
    item: &ChildItem,
) -> Result<Option<i64>, DatabaseError> {
    let Some(id) = content_repo::insert_child(conn, parent_id, subject_id, Some(run_id), item)? else {
        return Ok(None);
    };
    queue_repo::enqueue(conn, ContentType::Child, id, &item.natural_key, CHILD_PRIORITY)?;
    Ok(Some(id))
}

//! Durable workflow transitions, error recording, and retry scheduling.
//!
//! The batch embedding processor is the primary caller; the operator API uses
//! `restart` for manual re-processing.

use std::sync::Arc;

use chrono::{Duration, Utc};
use rand::Rng;
use tracing::{info, warn};

use crate::db::{Database, Document};
use crate::error::{
    ErrorCategory, ServiceError, ServiceResult, WorkflowError, format_error_chain,
};
use crate::workflow::{DocumentState, is_valid_transition};

/// First retry waits this long; each subsequent attempt doubles it.
const BACKOFF_BASE_SECS: u64 = 30;
/// Backoff ceiling.
const BACKOFF_CAP_SECS: u64 = 3600;

pub struct WorkflowService {
    db: Arc<Database>,
}

impl WorkflowService {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Transition a document to a new workflow state.
    ///
    /// Fails with an invalid-transition error when the state machine rejects
    /// the move. Entering Retrying consumes a retry attempt and records the
    /// state the document failed from (a document already parked in Failed
    /// keeps the earlier recording, which is where it actually failed).
    pub fn transition(
        &self,
        document_id: &str,
        new_state: DocumentState,
        reason: &str,
    ) -> ServiceResult<()> {
        let doc = self
            .db
            .get_document(document_id)?
            .ok_or_else(|| ServiceError::DocumentNotFound {
                document_id: document_id.to_string(),
            })?;
        let current = doc.workflow_state;

        if !is_valid_transition(Some(current), new_state) {
            return Err(WorkflowError::InvalidTransition {
                document_id: document_id.to_string(),
                from: current.to_string(),
                to: new_state.to_string(),
            }
            .into());
        }

        let now = Utc::now();
        let previous = if new_state == DocumentState::Retrying {
            if current == DocumentState::Failed {
                doc.previous_state
            } else {
                Some(current)
            }
        } else {
            doc.previous_state
        };

        self.db
            .update_workflow_state(document_id, new_state, previous, now)?;

        if new_state == DocumentState::Retrying {
            // The attempt is consumed now; the pending schedule is cleared so
            // the document leaves the retry queue.
            self.db
                .update_retry_bookkeeping(document_id, doc.retry_count + 1, Some(now), None)?;
        }

        info!(
            doc_id = %document_id,
            from = %current,
            to = %new_state,
            reason = %reason,
            "workflow transition"
        );

        Ok(())
    }

    /// Record an error against a document, with its inferred category and
    /// retryability.
    pub fn record_error(
        &self,
        document_id: &str,
        error: &ServiceError,
        category: ErrorCategory,
    ) -> ServiceResult<()> {
        let chain = format_error_chain(error);
        let detail = serde_json::json!({ "chain": chain });

        self.db.update_error_fields(
            document_id,
            &category.to_string(),
            &error.to_string(),
            Some(&detail),
            category.is_retryable(),
        )?;

        warn!(
            doc_id = %document_id,
            category = %category,
            retryable = category.is_retryable(),
            error = %chain,
            "error recorded"
        );

        Ok(())
    }

    /// Schedule the next retry attempt for a document.
    ///
    /// Applies exponential backoff with jitter based on the current retry
    /// count. A document whose retry budget is exhausted is moved to
    /// PermanentFailure instead.
    pub fn schedule_retry(&self, document_id: &str) -> ServiceResult<()> {
        let doc = self
            .db
            .get_document(document_id)?
            .ok_or_else(|| ServiceError::DocumentNotFound {
                document_id: document_id.to_string(),
            })?;

        if doc.retry_count >= doc.max_retries {
            warn!(
                doc_id = %document_id,
                retry_count = doc.retry_count,
                max_retries = doc.max_retries,
                "retry budget exhausted, moving to permanent failure"
            );
            return self.fail_permanently(&doc);
        }

        let delay = backoff_delay(doc.retry_count);
        let next_retry_at = Utc::now() + delay;
        self.db.update_retry_bookkeeping(
            document_id,
            doc.retry_count,
            doc.last_retry_at,
            Some(next_retry_at),
        )?;

        info!(
            doc_id = %document_id,
            retry_count = doc.retry_count,
            next_retry_at = %next_retry_at.to_rfc3339(),
            "retry scheduled"
        );

        Ok(())
    }

    /// Documents whose scheduled retry time has arrived.
    pub fn documents_ready_for_retry(&self, max_count: usize) -> ServiceResult<Vec<Document>> {
        self.db.documents_ready_for_retry(Utc::now(), max_count)
    }

    /// Manual restart: re-enter Extracting and reset the retry budget.
    ///
    /// Legal from Completed, Failed, PermanentFailure, and Cancelled.
    pub fn restart(&self, document_id: &str) -> ServiceResult<()> {
        self.transition(document_id, DocumentState::Extracting, "manual restart")?;
        self.db
            .update_retry_bookkeeping(document_id, 0, None, None)?;
        Ok(())
    }

    fn fail_permanently(&self, doc: &Document) -> ServiceResult<()> {
        if is_valid_transition(Some(doc.workflow_state), DocumentState::PermanentFailure) {
            self.transition(
                &doc.id,
                DocumentState::PermanentFailure,
                "retry budget exhausted",
            )?;
        } else {
            self.transition(&doc.id, DocumentState::Failed, "retry budget exhausted")?;
            self.transition(
                &doc.id,
                DocumentState::PermanentFailure,
                "retry budget exhausted",
            )?;
        }
        // Leave the retry queue for good.
        self.db
            .update_retry_bookkeeping(&doc.id, doc.retry_count, doc.last_retry_at, None)
    }
}

/// Exponential backoff with ±20% jitter.
fn backoff_delay(retry_count: u32) -> Duration {
    let exp = BACKOFF_BASE_SECS.saturating_mul(1u64 << retry_count.min(10));
    let capped = exp.min(BACKOFF_CAP_SECS);
    let jitter: f64 = rand::thread_rng().gen_range(0.8..1.2);
    Duration::seconds((capped as f64 * jitter).round() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::EmbeddingStatus;
    use crate::error::{DatabaseError, EmbeddingError};
    use tempfile::TempDir;

    fn open_db() -> (TempDir, Arc<Database>) {
        let dir = TempDir::new().unwrap();
        let db = Database::open(&dir.path().join("test.db")).unwrap();
        (dir, Arc::new(db))
    }

    fn insert_doc(db: &Database, text: &str) -> Document {
        let doc = Document::new("test doc", text.to_string(), None, 3);
        db.insert_document(&doc).unwrap();
        doc
    }

    #[test]
    fn test_transition_rejects_illegal_move() {
        let (_dir, db) = open_db();
        let workflow = WorkflowService::new(db.clone());
        let doc = insert_doc(&db, "text");

        // Queued -> Completed is not in the table
        let err = workflow
            .transition(&doc.id, DocumentState::Completed, "nope")
            .unwrap_err();
        assert!(matches!(
            err,
            ServiceError::Workflow(WorkflowError::InvalidTransition { .. })
        ));

        // Queued -> Extracting is
        workflow
            .transition(&doc.id, DocumentState::Extracting, "start")
            .unwrap();
        let doc = db.get_document(&doc.id).unwrap().unwrap();
        assert_eq!(doc.workflow_state, DocumentState::Extracting);
    }

    #[test]
    fn test_entering_retrying_records_previous_and_counts_attempt() {
        let (_dir, db) = open_db();
        let workflow = WorkflowService::new(db.clone());
        let doc = insert_doc(&db, "text");

        workflow
            .transition(&doc.id, DocumentState::Extracting, "start")
            .unwrap();
        workflow
            .transition(&doc.id, DocumentState::Retrying, "retry attempt 1")
            .unwrap();

        let doc = db.get_document(&doc.id).unwrap().unwrap();
        assert_eq!(doc.workflow_state, DocumentState::Retrying);
        assert_eq!(doc.previous_state, Some(DocumentState::Extracting));
        assert_eq!(doc.retry_count, 1);
        assert!(doc.last_retry_at.is_some());
        assert!(doc.next_retry_at.is_none());
    }

    #[test]
    fn test_retrying_from_failed_keeps_failure_origin() {
        let (_dir, db) = open_db();
        let workflow = WorkflowService::new(db.clone());
        let doc = insert_doc(&db, "text");

        workflow
            .transition(&doc.id, DocumentState::Extracting, "start")
            .unwrap();
        workflow
            .transition(&doc.id, DocumentState::Analyzing, "extracted")
            .unwrap();
        workflow
            .transition(&doc.id, DocumentState::Chunking, "analyzed")
            .unwrap();
        // Fails at chunking, retried, fails again while retrying
        workflow
            .transition(&doc.id, DocumentState::Retrying, "retry attempt 1")
            .unwrap();
        workflow
            .transition(&doc.id, DocumentState::Failed, "chunking failed")
            .unwrap();
        workflow
            .transition(&doc.id, DocumentState::Retrying, "retry attempt 2")
            .unwrap();

        let doc = db.get_document(&doc.id).unwrap().unwrap();
        // previous_state still points at Chunking, where it actually failed
        assert_eq!(doc.previous_state, Some(DocumentState::Chunking));
        assert_eq!(doc.retry_count, 2);
    }

    #[test]
    fn test_record_error_persists_fields() {
        let (_dir, db) = open_db();
        let workflow = WorkflowService::new(db.clone());
        let doc = insert_doc(&db, "text");

        let error = ServiceError::Embedding(EmbeddingError::Generation {
            status: 500,
            message: "boom".to_string(),
        });
        workflow
            .record_error(&doc.id, &error, ErrorCategory::EmbeddingProvider)
            .unwrap();

        let doc = db.get_document(&doc.id).unwrap().unwrap();
        assert_eq!(doc.error_category.as_deref(), Some("embedding_provider"));
        assert!(doc.error_retryable);
        assert!(doc.error_message.is_some());
        let detail = doc.error_detail.unwrap();
        assert!(detail["chain"].as_str().unwrap().contains("boom"));
    }

    #[test]
    fn test_schedule_retry_sets_future_timestamp() {
        let (_dir, db) = open_db();
        let workflow = WorkflowService::new(db.clone());
        let doc = insert_doc(&db, "text");

        workflow.schedule_retry(&doc.id).unwrap();

        let doc = db.get_document(&doc.id).unwrap().unwrap();
        let next = doc.next_retry_at.unwrap();
        assert!(next > Utc::now());
        // first attempt: ~30s with +-20% jitter
        assert!(next <= Utc::now() + Duration::seconds(40));
    }

    #[test]
    fn test_exhausted_retry_budget_becomes_permanent_failure() {
        let (_dir, db) = open_db();
        let workflow = WorkflowService::new(db.clone());
        let doc = insert_doc(&db, "text");

        workflow
            .transition(&doc.id, DocumentState::Extracting, "start")
            .unwrap();
        for attempt in 1..=3 {
            workflow
                .transition(
                    &doc.id,
                    DocumentState::Retrying,
                    &format!("retry attempt {attempt}"),
                )
                .unwrap();
            workflow
                .transition(&doc.id, DocumentState::Failed, "failed again")
                .unwrap();
        }

        // retry_count == max_retries == 3
        workflow.schedule_retry(&doc.id).unwrap();

        let doc = db.get_document(&doc.id).unwrap().unwrap();
        assert_eq!(doc.workflow_state, DocumentState::PermanentFailure);
        assert!(doc.next_retry_at.is_none());
    }

    #[test]
    fn test_documents_ready_for_retry_honors_schedule_and_limit() {
        let (_dir, db) = open_db();
        let workflow = WorkflowService::new(db.clone());

        let mut due_ids = Vec::new();
        for i in 0..3 {
            let mut doc = Document::new(format!("due {i}"), "text".to_string(), None, 5);
            doc.workflow_state = DocumentState::Failed;
            doc.error_retryable = true;
            doc.next_retry_at = Some(Utc::now() - Duration::seconds(10 - i));
            db.insert_document(&doc).unwrap();
            due_ids.push(doc.id);
        }
        // not yet due
        let mut future_doc = Document::new("future", "text".to_string(), None, 5);
        future_doc.workflow_state = DocumentState::Failed;
        future_doc.error_retryable = true;
        future_doc.next_retry_at = Some(Utc::now() + Duration::seconds(3600));
        db.insert_document(&future_doc).unwrap();
        // due but not retryable
        let mut fatal_doc = Document::new("fatal", "text".to_string(), None, 5);
        fatal_doc.workflow_state = DocumentState::Failed;
        fatal_doc.error_retryable = false;
        fatal_doc.next_retry_at = Some(Utc::now() - Duration::seconds(10));
        db.insert_document(&fatal_doc).unwrap();

        let ready = workflow.documents_ready_for_retry(10).unwrap();
        let ready_ids: Vec<_> = ready.iter().map(|d| d.id.clone()).collect();
        assert_eq!(ready_ids.len(), 3);
        for id in &due_ids {
            assert!(ready_ids.contains(id));
        }

        let limited = workflow.documents_ready_for_retry(2).unwrap();
        assert_eq!(limited.len(), 2);
    }

    #[test]
    fn test_restart_resets_retry_budget() {
        let (_dir, db) = open_db();
        let workflow = WorkflowService::new(db.clone());
        let doc = insert_doc(&db, "text");

        workflow
            .transition(&doc.id, DocumentState::Extracting, "start")
            .unwrap();
        workflow
            .transition(&doc.id, DocumentState::Retrying, "retry attempt 1")
            .unwrap();
        workflow
            .transition(&doc.id, DocumentState::Failed, "failed")
            .unwrap();
        workflow
            .transition(&doc.id, DocumentState::PermanentFailure, "gave up")
            .unwrap();

        workflow.restart(&doc.id).unwrap();

        let doc = db.get_document(&doc.id).unwrap().unwrap();
        assert_eq!(doc.workflow_state, DocumentState::Extracting);
        assert_eq!(doc.retry_count, 0);
        assert!(doc.next_retry_at.is_none());
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        for _ in 0..10 {
            let first = backoff_delay(0).num_seconds();
            assert!((24..=36).contains(&first), "first delay {first}");
            let capped = backoff_delay(30).num_seconds();
            assert!(capped <= (BACKOFF_CAP_SECS as f64 * 1.2).round() as i64);
            assert!(capped >= (BACKOFF_CAP_SECS as f64 * 0.8).round() as i64);
        }
    }

    // keep the dimension-mismatch guard close to the workflow tests that
    // exercise the same database
    #[test]
    fn test_document_embedding_dimension_is_immutable() {
        let (_dir, db) = open_db();
        let doc = insert_doc(&db, "text");

        db.set_document_embedding(&doc.id, &[0.1, 0.2, 0.3]).unwrap();
        // same dimension is fine (idempotent rewrite)
        db.set_document_embedding(&doc.id, &[0.4, 0.5, 0.6]).unwrap();

        let err = db
            .set_document_embedding(&doc.id, &[0.1, 0.2, 0.3, 0.4])
            .unwrap_err();
        assert!(matches!(
            err,
            ServiceError::Database(DatabaseError::DimensionMismatch {
                stored: 3,
                attempted: 4,
                ..
            })
        ));

        let doc = db.get_document(&doc.id).unwrap().unwrap();
        assert_eq!(doc.embedding_dim, Some(3));
        assert_eq!(doc.embedding_status, EmbeddingStatus::Pending);
    }
}

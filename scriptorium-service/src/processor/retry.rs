//! Retry pass: resume documents whose scheduled retry time has arrived at
//! the correct prior pipeline stage.

use metrics::counter;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::BatchEmbeddingProcessor;
use crate::error::{ErrorCategory, ServiceResult, format_error_chain};
use crate::workflow::DocumentState;

impl BatchEmbeddingProcessor {
    /// Drain the retry queue, up to the configured retry batch size.
    ///
    /// Each document makes a two-step transition: into Retrying (consuming an
    /// attempt), then immediately into the state it should resume from. A
    /// failure in either step is recorded against that document alone and a
    /// fresh retry is scheduled; the rest of the batch continues.
    pub(crate) async fn run_retry_pass(
        &self,
        shutdown: &CancellationToken,
    ) -> ServiceResult<usize> {
        let due = self
            .workflow
            .documents_ready_for_retry(self.config.retry_batch_size)?;
        if due.is_empty() {
            return Ok(0);
        }

        info!(count = due.len(), "processing retry queue");
        let mut resumed = 0;

        for doc in due {
            if shutdown.is_cancelled() {
                break;
            }

            let attempt = doc.retry_count + 1;
            let target = DocumentState::resume_after_retry(doc.previous_state);

            let result = self
                .workflow
                .transition(
                    &doc.id,
                    DocumentState::Retrying,
                    &format!("retry attempt {attempt}"),
                )
                .and_then(|()| self.workflow.transition(&doc.id, target, "resuming after retry"));

            match result {
                Ok(()) => {
                    if self.config.verbose_logging {
                        debug!(doc_id = %doc.id, target = %target, attempt, "document resumed");
                    }
                    resumed += 1;
                }
                Err(e) => {
                    error!(
                        doc_id = %doc.id,
                        target = %target,
                        error = %format_error_chain(&e),
                        "failed to resume document"
                    );
                    let category = ErrorCategory::from_error(&e);
                    if let Err(record_err) = self.workflow.record_error(&doc.id, &e, category) {
                        warn!(
                            doc_id = %doc.id,
                            error = %format_error_chain(&record_err),
                            "failed to record resume error"
                        );
                    }
                    if let Err(sched_err) = self.workflow.schedule_retry(&doc.id) {
                        warn!(
                            doc_id = %doc.id,
                            error = %format_error_chain(&sched_err),
                            "failed to re-schedule retry"
                        );
                    }
                }
            }
        }

        counter!("pipeline_documents_resumed_total").increment(resumed as u64);
        Ok(resumed)
    }
}

//! Document lifecycle state machine.
//!
//! Pure data plus lookup functions: the set of workflow states and the
//! directed graph of legal transitions between them. States persist as
//! snake_case strings, so the string round-trip here is part of the durable
//! contract.

use serde::{Deserialize, Serialize};

/// Named position of a document in its end-to-end processing lifecycle.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DocumentState {
    Queued,
    Extracting,
    Analyzing,
    AwaitingConfirmation,
    Chunking,
    Embedding,
    Indexing,
    Completed,
    Failed,
    PermanentFailure,
    Cancelled,
    Retrying,
}

impl DocumentState {
    /// Allowed destination states from this state.
    ///
    /// Completed and PermanentFailure are effectively terminal; both accept a
    /// manual re-entry into Extracting for reprocessing.
    pub fn valid_next_states(self) -> &'static [DocumentState] {
        use DocumentState::*;
        match self {
            Queued => &[Extracting, Failed, Cancelled],
            Extracting => &[Analyzing, Failed, Retrying, Cancelled],
            // Confirmation may be skipped entirely
            Analyzing => &[AwaitingConfirmation, Chunking, Failed, Retrying, Cancelled],
            AwaitingConfirmation => &[Chunking, Cancelled],
            Chunking => &[Embedding, Failed, Retrying, Cancelled],
            Embedding => &[Indexing, Failed, Retrying, Cancelled],
            Indexing => &[Completed, Failed, Retrying],
            Completed => &[Extracting],
            Failed => &[Retrying, PermanentFailure, Extracting],
            PermanentFailure => &[Extracting],
            Cancelled => &[Extracting],
            Retrying => &[
                Extracting,
                Analyzing,
                Chunking,
                Embedding,
                Indexing,
                Failed,
                PermanentFailure,
            ],
        }
    }

    /// Resolve the state a document should resume at after a retry, from the
    /// state it held before entering Retrying.
    ///
    /// AwaitingConfirmation re-runs analysis so confirmation can be offered
    /// again; terminal-ish prior states restart from extraction; a state that
    /// is itself a legal retry target resumes in place. Anything else (or no
    /// recorded prior state) starts over at Extracting.
    pub fn resume_after_retry(previous: Option<DocumentState>) -> DocumentState {
        use DocumentState::*;
        match previous {
            None => Extracting,
            Some(AwaitingConfirmation) => Analyzing,
            Some(Completed) | Some(Cancelled) => Extracting,
            Some(state) if Retrying.valid_next_states().contains(&state) => state,
            Some(_) => Extracting,
        }
    }
}

/// Whether `from -> to` is a legal transition.
///
/// A `from` of `None` models the first assignment of a state and is always
/// valid.
pub fn is_valid_transition(from: Option<DocumentState>, to: DocumentState) -> bool {
    match from {
        None => true,
        Some(from) => from.valid_next_states().contains(&to),
    }
}

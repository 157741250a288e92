//! Document workflow: lifecycle states and the service that owns durable
//! transitions, error recording, and retry scheduling.

mod service;
mod states;

pub use service::WorkflowService;
pub use states::{DocumentState, is_valid_transition};

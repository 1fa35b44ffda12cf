//! Adapters for the collaborator traits the workflow engine calls.

pub mod execution_context;
pub mod http;
pub mod notifier;
pub mod status_sync;

//! Workflow engine core: validation, evaluation, step execution and the
//! instance state machine.
//!
//! - `validator` -- structural and graph checks on definitions
//! - `context` -- evaluation context, dot-path lookup and `{{path}}` templates
//! - `expression` -- structured and JEXL condition evaluation
//! - `transition` -- pure next-step resolution
//! - `retry` / `dead_letter` -- exponential backoff and the dead-letter queue
//! - `collaborators` -- narrow traits for tasks, notifications, sync and HTTP
//! - `step_runner` -- per-type step dispatch
//! - `handlers` -- parallel, for-each, sub-workflow and webhook steps
//! - `engine` -- the instance lifecycle state machine

pub mod collaborators;
pub mod context;
pub mod dead_letter;
pub mod engine;
pub mod expression;
pub mod handlers;
pub mod retry;
pub mod step_runner;
pub mod transition;
pub mod validator;

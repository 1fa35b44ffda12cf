//! Step handlers for the step types that fan out, loop or leave the process.

pub mod for_each;
pub mod parallel;
pub mod sub_workflow;
pub mod webhook;

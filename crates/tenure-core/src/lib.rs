//! Business logic and repository trait definitions for tenure.
//!
//! This crate defines the "ports" (repository and collaborator traits) that
//! the infrastructure layer implements, plus the workflow engine itself. It
//! depends only on `tenure-types` -- never on `tenure-infra` or any
//! database/IO crate.

pub mod repository;
pub mod service;
pub mod workflow;

#[cfg(test)]
pub(crate) mod test_support;

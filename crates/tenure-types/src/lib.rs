//! Shared domain types for tenure.
//!
//! This crate contains the types shared by every layer of the joiner/mover/leaver
//! workflow orchestrator: workflow definitions and their step configuration,
//! running instances and per-step records, validation results, dead-letter
//! items, engine configuration, and the repository error type.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod config;
pub mod dead_letter;
pub mod error;
pub mod instance;
pub mod validation;
pub mod workflow;

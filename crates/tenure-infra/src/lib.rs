//! Infrastructure layer for tenure.
//!
//! Contains implementations of the ports defined in `tenure-core`: SQLite
//! repositories, the work-item store behind task and approval steps, the
//! reqwest-backed HTTP transport and status sync, a logging notification
//! dispatcher, and the `config.toml` loader.

pub mod config;
pub mod sqlite;
pub mod workflow;

//! Repository trait definitions (ports) for tenure persistence.

pub mod definition;
pub mod instance;

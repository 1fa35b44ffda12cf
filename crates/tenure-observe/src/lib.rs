//! Observability setup for tenure: structured logging via `tracing` with an
//! optional OpenTelemetry span export.

pub mod tracing_setup;

//! Observability setup for flowgate: `tracing` subscriber with optional
//! OpenTelemetry export.

pub mod tracing_setup;

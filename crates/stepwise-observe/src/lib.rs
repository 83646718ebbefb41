//! Observability for Stepwise: subscriber setup for the `tracing` events the
//! engine emits, with optional OpenTelemetry span export.

pub mod tracing_setup;

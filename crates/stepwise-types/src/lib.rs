//! Shared domain types for Stepwise.
//!
//! This crate contains the data model used across the execution engine:
//! workflow definitions, runs and their audit entries, checkpoints,
//! guardrail policies, classified execution errors, and configuration.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod checkpoint;
pub mod config;
pub mod error;
pub mod event;
pub mod execution;
pub mod guardrail;
pub mod llm;
pub mod run;
pub mod workflow;

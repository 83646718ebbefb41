//! Infrastructure for Stepwise.
//!
//! File-backed configuration loading. Depends on `stepwise-types` only;
//! durable storage backends implement `stepwise_core::repository::RunStorage`
//! elsewhere.

pub mod config;

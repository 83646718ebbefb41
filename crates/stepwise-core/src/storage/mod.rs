//! Storage backends shipped with the core.
//!
//! Durable backends (file, SQL) implement [`crate::repository::RunStorage`]
//! outside this crate.

pub mod memory;

pub use memory::InMemoryRunStorage;

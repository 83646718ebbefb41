//! Storage trait definitions (ports).
//!
//! The ledger and checkpoint store depend only on these traits, never on a
//! specific storage engine.

pub mod run;

pub use run::RunStorage;

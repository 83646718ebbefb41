//! Tool and function registries the worker dispatches into.
//!
//! Both are explicit registry objects populated at startup with
//! `register(...)`; nothing is registered implicitly.

pub mod executor;
pub mod function;
pub mod registry;

pub use executor::{ToolExecutor, ToolOutput};
pub use function::{FunctionRegistry, FunctionReturn};
pub use registry::ToolRegistry;

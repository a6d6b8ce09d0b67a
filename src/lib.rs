//! Tarry – a suspendable activity execution core
//!
//! This crate runs trees of activities as long-lived instances that can pause
//! on bookmarks and resume where they left off:
//! - Chained variable and argument storage (environments and locations)
//! - Named and internal bookmarks, bookmark scopes and exclusive handles
//! - Scoped handles and execution properties with guaranteed teardown
//! - Pooled activity contexts with fault propagation up the instance tree
//! - A reference executor built on a double-ended work queue

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

/// Execution core and reference executor
pub mod runtime;

pub use runtime::{RuntimeConfig, WorkflowExecutor};

/// Current version of tarry
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

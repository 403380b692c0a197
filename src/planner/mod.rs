//! Planning and apply.
//!
//! This module compares desired resources with prior state, produces
//! ordered plans and executes them against providers.

mod diff;
mod executor;
mod plan;

pub use diff::DiffEngine;
pub use executor::{ApplyExecutor, ApplyResult, ExecutorSettings, NodeError, NodeReport, NodeStatus};
pub use plan::{Action, ActionKind, Plan};

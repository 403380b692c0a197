// ============================================================================
// Strict linting - Dangerous or non-idiomatic practices are forbidden
// ============================================================================

#![deny(unsafe_code)]                 // Unsafe code is forbidden
#![deny(missing_docs)]                // All public items must be documented
#![deny(non_camel_case_types)]        // Types must follow CamelCase convention

// Additional strictness - Leave nothing unchecked
#![deny(unused_imports)]              // Unused imports are forbidden
#![deny(unused_variables)]            // Unused variables are forbidden
#![deny(unused_must_use)]             // Must handle Result and Option explicitly
#![deny(non_snake_case)]              // Variables and functions must be snake_case
#![deny(non_upper_case_globals)]      // Constants must be UPPER_CASE
#![deny(nonstandard_style)]           // Non-standard code style is forbidden
#![forbid(unsafe_op_in_unsafe_fn)]    // Unsafe ops in unsafe fns are forbidden

// Clippy lints (warnings only)
#![warn(clippy::all)]                 // All standard Clippy lints
#![warn(clippy::pedantic)]            // Very strict Clippy lints
#![warn(clippy::nursery)]             // Experimental lints
#![warn(clippy::unwrap_used)]         // unwrap() warning
#![warn(clippy::panic)]               // panic!() warning
#![warn(clippy::print_stdout)]        // println!() warning
#![warn(clippy::todo)]                // TODO warning
#![warn(clippy::unimplemented)]       // unimplemented!() warning
#![warn(clippy::unwrap_in_result)]    // unwrap() in Result warning
#![warn(clippy::redundant_clone)]     // Useless clones warning
#![warn(clippy::too_many_arguments)]  // Limit function arguments
#![warn(clippy::cognitive_complexity)] // Limit cognitive complexity

// Safety and robustness lints
#![deny(overflowing_literals)]        // Overflowing literals are forbidden
#![deny(arithmetic_overflow)]         // Arithmetic overflow is forbidden

// ============================================================================
// Crate Documentation
// ============================================================================

//! # Stackweave
//!
//! A cross-stack dependency resolution and convergence engine for
//! declarative infrastructure.
//!
//! ## Overview
//!
//! Resources are declared in named stacks. Inputs may be literals, outputs
//! of other resources in the same stack, or published outputs of other
//! stacks. Stackweave:
//!
//! - Orders resources topologically and rejects cycles before touching anything
//! - Compares desired inputs with stored state to plan creates, updates, replacements and deletes
//! - Applies plans concurrently with retries, scoping failures to dependents
//! - Publishes stack outputs for downstream stacks
//!
//! ## Architecture
//!
//! 1. **Model**: Stacks, resources and deferred values
//! 2. **Resolver**: Reads other stacks' published outputs from state
//! 3. **Graph**: Per-stack and cross-stack dependency ordering
//! 4. **Planner**: Diff, plan and apply executor
//! 5. **Providers**: Pluggable create/update/delete backends
//! 6. **State**: Versioned per-stack records (local, S3, memory)
//!
//! ## Modules
//!
//! - [`model`]: Resource model
//! - [`resolver`]: Cross-stack output resolution
//! - [`graph`]: Dependency graphs
//! - [`planner`]: Diff computation, plans and execution
//! - [`orchestrator`]: Multi-stack preview, up and destroy
//! - [`provider`]: Provider trait and bundled providers
//! - [`state`]: State storage backends
//! - [`config`]: Configuration parsing and validation
//! - [`cli`]: Command-line interface
//!
//! ## Example
//!
//! ```yaml
//! project:
//!   name: platform
//!   environment: dev
//!
//! providers:
//!   - name: echo
//!     type: echo
//!
//! stacks:
//!   - name: network
//!     resources:
//!       - id: vpc
//!         kind: echo:vpc
//!         inputs:
//!           cidr: 10.0.0.0/16
//!     outputs:
//!       vpcId: { $ref: vpc.id }
//!
//!   - name: cluster
//!     resources:
//!       - id: cluster
//!         kind: echo:cluster
//!         inputs:
//!           vpc: { $stack: network.vpcId }
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod cli;
pub mod config;
pub mod error;
pub mod graph;
pub mod model;
pub mod orchestrator;
pub mod planner;
pub mod provider;
pub mod resolver;
pub mod state;

// ============================================================================
// Re-exports
// ============================================================================

pub use cli::{Cli, Commands, OutputFormatter};
pub use config::{ConfigParser, ConfigValidator, InputsHasher, ProjectFile};
pub use error::{Result, StackweaveError};
pub use graph::DependencyGraph;
pub use model::{Resource, ResourceId, Stack, Value};
pub use orchestrator::{Orchestrator, RunReport};
pub use planner::{ApplyExecutor, ApplyResult, DiffEngine, Plan};
pub use provider::{Provider, ProviderRegistry};
pub use resolver::StackReferenceResolver;
pub use state::{LocalStateStore, MemoryStateStore, S3StateStore, StateStore};

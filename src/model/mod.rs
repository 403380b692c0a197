//! Desired-state resource model.
//!
//! A [`Stack`] holds [`Resource`]s declared in order. Resource inputs are
//! [`Value`] trees that may contain placeholders for outputs of other
//! resources (`Deferred`) or of other stacks (`StackOutput`).

mod resource;
mod stack;
mod value;

pub use resource::{Inputs, ProviderId, REPLACED_SEPARATOR, Resource, ResolvedInputs, ResourceId};
pub use stack::Stack;
pub use value::{Reference, Value};

//! Identifiers, the state machine, submission envelopes and wire types.

pub mod module;
pub mod task;
pub mod wire;

pub use module::*;
pub use task::*;
pub use wire::*;

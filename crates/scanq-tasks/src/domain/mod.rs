//! Domain types for stored task state.
//!
//! [`TaskRecord`] is what the store persists and pollers ultimately read.
//! The wire shape derived from it lives in [`types::wire`](crate::types::wire).

pub mod progress;
pub mod record;

pub use progress::*;
pub use record::*;

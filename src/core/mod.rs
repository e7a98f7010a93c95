//! Core types: identifiers, the handler trait, and the clock.

pub mod clock;
pub mod task;
pub mod types;

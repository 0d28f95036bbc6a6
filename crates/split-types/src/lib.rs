//! Core types shared across the split settlement system.

pub mod address;
pub mod bill;
pub mod chain;
pub mod errors;

pub use bill::*;
pub use chain::*;
pub use errors::{Result, SplitError};

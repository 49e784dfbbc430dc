//! Core types for Strongbox.

mod audit;
mod environment;
mod identifiers;
mod tenant;

pub use audit::*;
pub use environment::*;
pub use identifiers::*;
pub use tenant::*;

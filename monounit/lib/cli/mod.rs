//! Command-line surface of the `monounit` binary.

mod args;
mod styles;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use args::*;
pub use styles::*;

//! Utility functions and types.

mod command;
mod file;
mod path;
mod size;
mod time;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use command::*;
pub use file::*;
pub use path::*;
pub use size::*;
pub use time::*;

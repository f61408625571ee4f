//! Handles on the container runtime that hosts units.

pub mod lxd;
mod memory;
mod server;
mod types;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use memory::*;
pub use server::*;
pub use types::*;

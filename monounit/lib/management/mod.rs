//! Orchestration of builds, deployments, shares and host operations.

mod admission;
mod build;
mod compose;
mod context;
mod deploy;
mod host;
mod registry;
mod rollback;
mod share;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use admission::*;
pub use build::*;
pub use compose::*;
pub use context::*;
pub use deploy::*;
pub use host::*;
pub use registry::*;
pub use rollback::*;
pub use share::*;

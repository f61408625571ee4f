//! Configuration types: host settings, unit specs and compose specs.

mod compose;
mod host;
mod port_forward;
mod unit;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use compose::*;
pub use host::*;
pub use port_forward::*;
pub use unit::*;

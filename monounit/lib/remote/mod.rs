//! Named endpoints of a daemon's control API and the trust established with them.

mod connector;
mod record;
mod trust;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use connector::*;
pub use record::*;
pub use trust::*;

//! Image identities, the local archive store and resolution of image references.

mod identity;
mod resolve;
mod store;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use identity::*;
pub use resolve::*;
pub use store::*;

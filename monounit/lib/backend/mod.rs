//! The runtimes units are hosted on: a local daemon, one nested in a managed VM, or a remote
//! endpoint provisioned elsewhere.

mod info;
mod local;
mod lxc;
mod remote;
mod vm;

use crate::{
    config::{BackendKind, HostSettings},
    utils::HomeLayout,
};

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use info::*;
pub use local::*;
pub use lxc::*;
pub use remote::*;
pub use vm::*;

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Builds the backend variant `settings` describes.
pub fn from_settings(
    layout: &HomeLayout,
    settings: &HostSettings,
    user: &str,
) -> Box<dyn Backend> {
    match settings.backend.kind {
        BackendKind::Lxd => Box::new(LocalBackend::new(layout.clone(), settings.clone(), user)),
        BackendKind::Multipass => Box::new(VmBackend::new(layout.clone(), settings.clone(), user)),
        BackendKind::Remote => Box::new(RemoteBackend::new(layout.clone(), settings.clone())),
    }
}

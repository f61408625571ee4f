//! `monounit` builds, deploys and operates system containers ("units") on a local daemon, on a
//! daemon nested inside a managed VM, or on a remote endpoint.
//!
//! # Overview
//!
//! monounit drives a container runtime through an authenticated handle and provides:
//! - Image builds from declarative unit specs, with full cleanup on failure
//! - Deployments with admission checks against disk, memory and port capacity
//! - Multi-service compose runs in dependency order
//! - Directories shared between units through reference-counted volumes
//! - A local registry of deployed units
//!
//! # Architecture
//!
//! - **Backend**: the runtime hosting units and its one-time initialisation
//! - **Remote**: named endpoints of a daemon's API and the trust established with them
//! - **Runtime**: the [`UnitServer`](runtime::UnitServer) handle every pipeline talks to
//! - **Image**: identities, the local archive store and reference resolution
//! - **Management**: the build, deploy, compose and share pipelines plus host operations
//!
//! Every pipeline receives an explicit [`Context`](management::Context) carrying settings, paths,
//! the handle connector, the registry and a cancellation token. Mutations on the backend record
//! compensating actions on a [`Rollback`](management::Rollback) stack that runs in reverse when a
//! pipeline fails or is cancelled.
//!
//! # Usage Example
//!
//! ```rust,no_run
//! use monounit::{management::{self, Context}, utils::HomeLayout};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let ctx = Context::open(HomeLayout::from_env()).await?;
//!
//!     let built = management::build_image(&ctx, "web/Unitfile".as_ref()).await?;
//!     println!("built {} ({})", built.identity, built.hash);
//!
//!     let record = management::deploy_image(&ctx, "web/Unitfile".as_ref()).await?;
//!     println!("deployed {}", record.name);
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]

mod error;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub mod backend;
pub mod cli;
pub mod config;
pub mod image;
pub mod management;
pub mod remote;
pub mod runtime;
pub mod utils;

pub use error::*;

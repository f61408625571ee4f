use std::time::Duration;

use tokio::net::TcpStream;
use typed_builder::TypedBuilder;

use crate::{
    runtime::{HostResources, PoolUsage, UnitServer},
    utils::format_size,
    MonounitError, MonounitResult,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Unpacked images take up to this many times their archive size on disk.
pub const DISK_GROWTH_FACTOR: u64 = 5;

const PORT_PROBE_TIMEOUT: Duration = Duration::from_millis(500);

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// What a unit about to be created asks of the backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, TypedBuilder)]
pub struct AdmissionRequest {
    /// Name of the unit. It must not exist yet.
    #[builder(setter(into))]
    pub name: String,

    /// Archive size of the image the unit is created from, in bytes.
    #[builder(default)]
    pub image_size: u64,

    /// Memory the unit is limited to, in bytes. Zero skips the memory check.
    #[builder(default)]
    pub ram: u64,

    /// Host-facing ports the unit will listen on.
    #[builder(default)]
    pub host_ports: Vec<u16>,
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Checks that a new unit fits on the backend. Nothing is mutated.
///
/// The unit name must be free, the pool must hold [`DISK_GROWTH_FACTOR`] times the image size,
/// the host must have the requested memory available, and no requested host port may already
/// accept connections on `address`.
pub async fn admit(
    server: &dyn UnitServer,
    pool: &str,
    address: &str,
    request: &AdmissionRequest,
) -> MonounitResult<()> {
    if server.unit_exists(&request.name).await? {
        return Err(MonounitError::Conflict(format!(
            "unit {} already exists",
            request.name
        )));
    }

    check_disk(request.image_size, &server.pool_usage(pool).await?)?;

    if request.ram > 0 {
        check_memory(request.ram, &server.host_resources().await?)?;
    }

    for port in &request.host_ports {
        if port_in_use(address, *port).await {
            return Err(MonounitError::ResourceExhaustion(format!(
                "port {port} is already in use on {address}"
            )));
        }
    }

    tracing::debug!("admitted unit {}", request.name);
    Ok(())
}

/// Rejects an image whose unpacked size would not fit in the pool.
pub fn check_disk(image_size: u64, usage: &PoolUsage) -> MonounitResult<()> {
    let needed = image_size.saturating_mul(DISK_GROWTH_FACTOR);
    if needed > usage.free() {
        return Err(MonounitError::ResourceExhaustion(format!(
            "not enough disk space: image needs {} but only {} is free",
            format_size(needed),
            format_size(usage.free())
        )));
    }
    Ok(())
}

/// Rejects a memory limit larger than what the host has available.
pub fn check_memory(ram: u64, resources: &HostResources) -> MonounitResult<()> {
    if ram > resources.memory_free() {
        return Err(MonounitError::ResourceExhaustion(format!(
            "not enough memory: {} requested but only {} is free",
            format_size(ram),
            format_size(resources.memory_free())
        )));
    }
    Ok(())
}

/// Whether something accepts TCP connections on `address:port`.
pub async fn port_in_use(address: &str, port: u16) -> bool {
    matches!(
        tokio::time::timeout(PORT_PROBE_TIMEOUT, TcpStream::connect((address, port))).await,
        Ok(Ok(_))
    )
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

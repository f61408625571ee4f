use std::future::Future;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{
    runtime::{PoolUsage, UnitServer},
    utils::format_size,
    MonounitResult,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// State a backend reports when it can host units.
pub const STATE_RUNNING: &str = "Running";

//--------------------------------------------------------------------------------------------------
// Traits
//--------------------------------------------------------------------------------------------------

/// The runtime hosting units, as seen by the host-level commands.
///
/// Pipelines never see this trait; they talk to the runtime through a
/// [`UnitServer`](crate::runtime::UnitServer) handle.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Performs the one-time initialisation of the runtime and marks the host active.
    ///
    /// Initialising an active host fails with `Conflict`.
    async fn init(&self) -> MonounitResult<()>;

    /// Reports identity and capacity.
    async fn info(&self) -> MonounitResult<BackendInfo>;
}

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// What a backend reports about itself. Sizes are formatted for display.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendInfo {
    /// Host or VM name.
    pub name: String,

    /// Backend state, e.g. `Running`.
    pub state: String,

    /// Address of the backend.
    pub ipv4: String,

    /// Disk `[used, total]`. Empty when the backend is not running.
    pub disk: Vec<String>,

    /// Memory `[used, total]`. Empty when the backend is not running.
    pub memory: Vec<String>,

    /// Number of CPUs. Empty when the backend is not running.
    pub cpu: String,
}

/// Raw capacity figures of a backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capacity {
    /// Storage pool usage.
    pub disk: PoolUsage,

    /// Memory in use, in bytes.
    pub memory_used: u64,

    /// Total memory, in bytes.
    pub memory_total: u64,

    /// Number of CPUs.
    pub cpu: u32,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl BackendInfo {
    /// Whether the backend is running.
    pub fn is_running(&self) -> bool {
        self.state == STATE_RUNNING
    }

    /// Fills the capacity fields from `capacity`.
    pub fn with_capacity(mut self, capacity: &Capacity) -> Self {
        self.disk = vec![
            format_size(capacity.disk.used),
            format_size(capacity.disk.total),
        ];
        self.memory = vec![
            format_size(capacity.memory_used),
            format_size(capacity.memory_total),
        ];
        self.cpu = capacity.cpu.to_string();
        self
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Runs the disk, memory and CPU queries concurrently.
///
/// The first query to fail aborts the others and its error is returned.
pub async fn probe_capacity<D, M, C>(disk: D, memory: M, cpu: C) -> MonounitResult<Capacity>
where
    D: Future<Output = MonounitResult<PoolUsage>>,
    M: Future<Output = MonounitResult<(u64, u64)>>,
    C: Future<Output = MonounitResult<u32>>,
{
    let (disk, (memory_used, memory_total), cpu) = tokio::try_join!(disk, memory, cpu)?;
    Ok(Capacity {
        disk,
        memory_used,
        memory_total,
        cpu,
    })
}

/// Probes capacity through a runtime handle.
pub async fn probe_handle_capacity(
    server: &dyn UnitServer,
    pool: &str,
) -> MonounitResult<Capacity> {
    probe_capacity(
        server.pool_usage(pool),
        async {
            let resources = server.host_resources().await?;
            Ok((resources.memory_used, resources.memory_total))
        },
        async { Ok(server.host_resources().await?.cpu) },
    )
    .await
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

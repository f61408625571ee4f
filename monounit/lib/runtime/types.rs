use std::{collections::BTreeMap, fmt};

use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Configuration of a device attached to a unit, e.g. `{"type": "disk", "path": "/data"}`.
pub type Device = BTreeMap<String, String>;

/// What a runtime reports about itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    /// Whether the caller's client certificate is trusted.
    pub trusted: bool,

    /// Architecture of the runtime host, e.g. `x86_64`.
    pub architecture: String,

    /// Runtime server version.
    pub version: String,
}

/// Lifecycle status of a unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnitStatus {
    /// The unit is running.
    Running,

    /// The unit is stopped.
    Stopped,

    /// Any other status the runtime reports.
    Other(String),
}

/// A unit as the runtime sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitInfo {
    /// Unit name.
    pub name: String,

    /// Lifecycle status.
    pub status: UnitStatus,

    /// First IPv4 address of the unit's `eth0`, if any.
    pub ipv4: Option<String>,

    /// Profiles the unit was launched with.
    pub profiles: Vec<String>,

    /// Devices attached directly to the unit (profile devices excluded).
    pub devices: BTreeMap<String, Device>,

    /// Unit configuration keys.
    pub config: BTreeMap<String, String>,
}

/// Where a unit's root filesystem comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageSource {
    /// An image on a public simplestreams index.
    Public {
        /// Index URL.
        server: String,

        /// Image alias on the index.
        alias: String,
    },

    /// An image already present on the runtime, by alias.
    Alias(String),

    /// An image already present on the runtime, by fingerprint.
    Fingerprint(String),
}

/// Parameters for creating and starting a unit.
#[derive(Debug, Clone, PartialEq, Eq, TypedBuilder)]
pub struct LaunchRequest {
    /// Unit name.
    #[builder(setter(into))]
    pub name: String,

    /// Root filesystem source.
    pub source: ImageSource,

    /// Profile to apply.
    #[builder(setter(into))]
    pub profile: String,

    /// Storage pool for the root disk.
    #[builder(setter(into))]
    pub pool: String,
}

/// A lifecycle transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateAction {
    /// Start a stopped unit.
    Start,

    /// Stop a running unit.
    Stop,

    /// Stop then start a unit.
    Restart,
}

/// The result of running a command inside a unit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    /// Exit status.
    pub status: i32,

    /// Captured standard output.
    pub stdout: String,

    /// Captured standard error.
    pub stderr: String,
}

/// Memory and CPU capacity of a runtime host, in bytes and cores.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HostResources {
    /// Memory in use.
    pub memory_used: u64,

    /// Total memory.
    pub memory_total: u64,

    /// Number of CPUs.
    pub cpu: u32,
}

/// Space usage of a storage pool, in bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolUsage {
    /// Space in use.
    pub used: u64,

    /// Total space.
    pub total: u64,
}

/// An image held by a runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageInfo {
    /// Image fingerprint.
    pub fingerprint: String,

    /// Archive size in bytes.
    pub size: u64,
}

/// A custom storage volume.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VolumeInfo {
    /// Volume name.
    pub name: String,

    /// Units the volume is attached to.
    pub used_by: Vec<String>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl UnitInfo {
    /// Returns true if the unit is running.
    pub fn is_running(&self) -> bool {
        self.status == UnitStatus::Running
    }

    /// Names of the disk devices mounted into the unit. The root filesystem is not one of them.
    pub fn disk_devices(&self) -> Vec<&str> {
        self.devices
            .iter()
            .filter(|(_, device)| {
                device.get("type").map(String::as_str) == Some("disk")
                    && device.get("path").map(String::as_str) != Some("/")
            })
            .map(|(name, _)| name.as_str())
            .collect()
    }

    /// Names of the proxy devices attached to the unit.
    pub fn proxy_devices(&self) -> Vec<&str> {
        self.devices
            .iter()
            .filter(|(_, device)| device.get("type").map(String::as_str) == Some("proxy"))
            .map(|(name, _)| name.as_str())
            .collect()
    }
}

impl ExecOutput {
    /// Returns true if the command exited with status zero.
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

impl PoolUsage {
    /// Space left in the pool.
    pub fn free(&self) -> u64 {
        self.total.saturating_sub(self.used)
    }
}

impl HostResources {
    /// Memory left on the host.
    pub fn memory_free(&self) -> u64 {
        self.memory_total.saturating_sub(self.memory_used)
    }
}

impl UnitStatus {
    /// Maps a runtime status string onto a [`UnitStatus`].
    pub fn from_runtime(status: &str) -> Self {
        match status {
            "Running" => UnitStatus::Running,
            "Stopped" => UnitStatus::Stopped,
            other => UnitStatus::Other(other.to_string()),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Builds a device from key/value pairs.
pub fn device<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Device {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnitStatus::Running => write!(f, "Running"),
            UnitStatus::Stopped => write!(f, "Stopped"),
            UnitStatus::Other(status) => write!(f, "{status}"),
        }
    }
}

impl fmt::Display for StateAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateAction::Start => write!(f, "start"),
            StateAction::Stop => write!(f, "stop"),
            StateAction::Restart => write!(f, "restart"),
        }
    }
}

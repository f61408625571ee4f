use std::{fmt, net::Ipv4Addr, path::Path, str::FromStr};

use chrono::Utc;
use rand::{distr::Alphanumeric, Rng};
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::{utils, MonounitError, MonounitResult};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The default runtime profile units are launched with.
pub const DEFAULT_PROFILE: &str = "monounit";

/// The default storage driver.
pub const DEFAULT_STORAGE_DRIVER: &str = "zfs";

/// The default storage pool size.
pub const DEFAULT_STORAGE_SIZE: &str = "50GB";

/// The default bridge address units are attached to.
pub const DEFAULT_BRIDGE: &str = "10.0.0.1";

/// The default bridge network name.
pub const DEFAULT_NETWORK_NAME: &str = "monounitbr0";

/// The default public image index.
pub const DEFAULT_PUBLIC_INDEX: &str = "https://images.linuxcontainers.org";

const TRUST_SECRET_LEN: usize = 24;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The single host-of-record: identity, trust secret and the runtime descriptors a backend is
/// built from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostSettings {
    /// Host identity. Also the name of the managed VM for VM-hosted backends.
    pub name: String,

    /// One-time trust secret used to register client certificates.
    pub trust: String,

    /// Runtime profile units are launched with.
    pub profile: String,

    /// Storage pool units live in.
    pub storage: StorageSettings,

    /// Bridge network units attach to.
    pub network: NetworkSettings,

    /// Which backend variant hosts the runtime.
    pub backend: BackendSettings,

    /// Whether the backend has been initialised.
    #[serde(default)]
    pub status: HostStatus,

    /// Public image index used to resolve base images.
    #[serde(default = "default_public_index")]
    pub public_index: String,
}

/// Storage pool descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageSettings {
    /// Storage driver, e.g. `zfs` or `dir`.
    #[serde(rename = "type")]
    pub driver: String,

    /// Pool name.
    pub name: String,

    /// Pool size, e.g. `50GB`.
    pub size: String,
}

/// Bridge network descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkSettings {
    /// Network name.
    #[serde(default = "default_network_name")]
    pub name: String,

    /// Bridge IPv4 address. Units get addresses in its /24.
    pub bridge: String,
}

/// Backend variant descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendSettings {
    /// The variant.
    #[serde(rename = "type")]
    pub kind: BackendKind,

    /// VM sizing, only meaningful for VM-hosted backends.
    #[serde(default)]
    pub resources: VmResources,

    /// Name of the remote record to use, only meaningful for remote-endpoint backends.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote: Option<String>,
}

/// The backend variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// A daemon reachable on this machine.
    Lxd,

    /// A daemon nested inside a managed VM.
    Multipass,

    /// A pre-provisioned remote endpoint.
    Remote,
}

/// Sizing of a managed VM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmResources {
    /// VM name.
    pub name: String,

    /// OS image the VM is launched from.
    pub os: String,

    /// Number of vCPUs.
    pub cpu: u32,

    /// Memory, e.g. `4GB`.
    pub ram: String,

    /// Disk size, e.g. `50GB`.
    pub hd: String,

    /// IPv4 address, filled in once the VM is running.
    #[serde(default)]
    pub ip: String,
}

/// Activation status of the host.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostStatus {
    /// The backend has not been initialised.
    #[default]
    Inactive,

    /// The backend has been initialised.
    Active,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl HostSettings {
    /// Creates settings with defaults for `kind`, named after `user`.
    pub fn default_for(kind: BackendKind, user: &str) -> Self {
        let trust = rand::rng()
            .sample_iter(&Alphanumeric)
            .take(TRUST_SECRET_LEN)
            .map(char::from)
            .collect();

        Self {
            name: user.to_string(),
            trust,
            profile: DEFAULT_PROFILE.to_string(),
            storage: StorageSettings {
                driver: DEFAULT_STORAGE_DRIVER.to_string(),
                name: storage_pool_name(DEFAULT_PROFILE),
                size: DEFAULT_STORAGE_SIZE.to_string(),
            },
            network: NetworkSettings {
                name: DEFAULT_NETWORK_NAME.to_string(),
                bridge: DEFAULT_BRIDGE.to_string(),
            },
            backend: BackendSettings {
                kind,
                resources: VmResources {
                    name: user.to_string(),
                    ..Default::default()
                },
                remote: None,
            },
            status: HostStatus::Inactive,
            public_index: default_public_index(),
        }
    }

    /// Loads settings from a YAML file.
    pub async fn load(path: impl AsRef<Path>) -> MonounitResult<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => MonounitError::NotFound(format!(
                "host settings {} (run `monounit init` first)",
                path.display()
            )),
            _ => e.into(),
        })?;

        let settings: HostSettings = serde_yaml::from_str(&content)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Persists settings as YAML.
    pub async fn save(&self, path: impl AsRef<Path>) -> MonounitResult<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        fs::write(path, serde_yaml::to_string(self)?).await?;
        Ok(())
    }

    /// Checks that every size, address and name is well formed.
    pub fn validate(&self) -> MonounitResult<()> {
        let mut errors = Vec::new();

        if self.name.trim().is_empty() {
            errors.push("host name is empty".to_string());
        }

        if self.profile.trim().is_empty() {
            errors.push("profile name is empty".to_string());
        }

        if let Err(e) = utils::parse_size(&self.storage.size) {
            errors.push(format!("storage size: {e}"));
        }

        if Ipv4Addr::from_str(&self.network.bridge).is_err() {
            errors.push(format!(
                "bridge {:?} is not an IPv4 address",
                self.network.bridge
            ));
        }

        match self.backend.kind {
            BackendKind::Multipass => {
                for (field, value) in [
                    ("ram", &self.backend.resources.ram),
                    ("hd", &self.backend.resources.hd),
                ] {
                    if let Err(e) = utils::parse_size(value) {
                        errors.push(format!("vm {field}: {e}"));
                    }
                }
            }
            BackendKind::Remote if self.backend.remote.is_none() => {
                errors.push("remote backend requires a remote name".to_string());
            }
            _ => {}
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(MonounitError::SpecValidationErrors(errors))
        }
    }

    /// Returns true once the backend has been initialised.
    pub fn is_active(&self) -> bool {
        self.status == HostStatus::Active
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Derives a fresh, timestamped storage pool name for `profile`.
pub fn storage_pool_name(profile: &str) -> String {
    format!("{}-{}", profile, Utc::now().format("%Y%m%d%H%M%S"))
}

fn default_public_index() -> String {
    DEFAULT_PUBLIC_INDEX.to_string()
}

fn default_network_name() -> String {
    DEFAULT_NETWORK_NAME.to_string()
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Default for VmResources {
    fn default() -> Self {
        Self {
            name: String::new(),
            os: "jammy".to_string(),
            cpu: 2,
            ram: "4GB".to_string(),
            hd: DEFAULT_STORAGE_SIZE.to_string(),
            ip: String::new(),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Lxd => write!(f, "lxd"),
            BackendKind::Multipass => write!(f, "multipass"),
            BackendKind::Remote => write!(f, "remote"),
        }
    }
}

impl FromStr for BackendKind {
    type Err = MonounitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "lxd" => Ok(BackendKind::Lxd),
            "multipass" => Ok(BackendKind::Multipass),
            "remote" => Ok(BackendKind::Remote),
            other => Err(MonounitError::Validation(format!(
                "unknown backend {other:?}, expected one of lxd, multipass, remote"
            ))),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

use std::fmt;

use getset::Getters;
use serde::{Deserialize, Serialize};
use tokio::fs;
use typed_builder::TypedBuilder;

use crate::{
    config::{BackendKind, HostSettings},
    utils::HomeLayout,
    MonounitError, MonounitResult,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The remote every unit and image reference falls back to.
pub const DEFAULT_REMOTE: &str = "local";

/// The port the daemon's HTTPS listener binds.
pub const DAEMON_HTTPS_PORT: u16 = 8443;

const SNAP_SOCKET: &str = "/var/snap/lxd/common/lxd/unix.socket";
const SYSTEM_SOCKET: &str = "/var/lib/lxd/unix.socket";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A named endpoint of a daemon's control API.
///
/// The record itself holds no secrets. Client and server certificates live in the home
/// directory's trust store and are read when a handle is opened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Getters, TypedBuilder)]
#[getset(get = "pub with_prefix")]
pub struct Remote {
    /// Record name.
    #[builder(setter(into))]
    name: String,

    /// Socket path or `https://host:port` URL.
    #[builder(setter(into))]
    url: String,

    /// How the endpoint is reached.
    protocol: RemoteProtocol,

    /// Public endpoints need no client registration.
    #[serde(default)]
    #[builder(default)]
    #[getset(skip)]
    public: bool,

    /// Runtime profile units are launched with.
    #[serde(default)]
    #[builder(default, setter(into))]
    profile: String,

    /// Bridge network name.
    #[serde(default)]
    #[builder(default, setter(into))]
    network: String,

    /// Storage pool name.
    #[serde(default)]
    #[builder(default, setter(into))]
    storage: String,
}

/// How a remote is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteProtocol {
    /// The local daemon's control socket.
    Unix,

    /// The daemon's HTTPS listener with mutual TLS.
    #[serde(alias = "lxd")]
    Https,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Remote {
    /// Derives the default remote for the host's own backend.
    ///
    /// Local daemons are reached over their socket, VM-hosted ones over HTTPS at the VM address.
    pub fn default_for(settings: &HostSettings) -> Self {
        let (protocol, url) = match settings.backend.kind {
            BackendKind::Lxd => {
                let socket = if std::path::Path::new(SNAP_SOCKET).exists() {
                    SNAP_SOCKET
                } else {
                    SYSTEM_SOCKET
                };
                (RemoteProtocol::Unix, socket.to_string())
            }
            BackendKind::Multipass | BackendKind::Remote => (
                RemoteProtocol::Https,
                format!(
                    "https://{}:{}",
                    settings.backend.resources.ip, DAEMON_HTTPS_PORT
                ),
            ),
        };

        Remote::builder()
            .name(DEFAULT_REMOTE)
            .url(url)
            .protocol(protocol)
            .profile(settings.profile.clone())
            .network(settings.network.name.clone())
            .storage(settings.storage.name.clone())
            .build()
    }

    /// Whether the endpoint is public.
    pub fn is_public(&self) -> bool {
        self.public
    }

    /// Whether certificate registration applies to this endpoint.
    pub fn needs_registration(&self) -> bool {
        !self.public && self.protocol == RemoteProtocol::Https
    }

    /// Host part of the URL, e.g. `10.1.2.3` for `https://10.1.2.3:8443`.
    pub fn host(&self) -> &str {
        let rest = self
            .url
            .split_once("://")
            .map(|(_, rest)| rest)
            .unwrap_or(&self.url);
        let authority = rest.split('/').next().unwrap_or(rest);
        match authority.rsplit_once(':') {
            Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => {
                host.trim_start_matches('[').trim_end_matches(']')
            }
            _ => authority,
        }
    }

    /// Saves the record. Fails with `Conflict` when a remote with this name exists.
    pub async fn save(&self, layout: &HomeLayout) -> MonounitResult<()> {
        let path = layout.remotes_dir().join(format!("{}.json", self.name));
        if fs::try_exists(&path).await? {
            return Err(MonounitError::Conflict(format!(
                "remote {} already exists",
                self.name
            )));
        }

        fs::create_dir_all(layout.remotes_dir()).await?;
        fs::write(&path, serde_json::to_string_pretty(self)?).await?;
        tracing::debug!("saved remote {} to {}", self.name, path.display());
        Ok(())
    }

    /// Loads a saved record.
    pub async fn load(layout: &HomeLayout, name: &str) -> MonounitResult<Self> {
        let path = layout.remotes_dir().join(format!("{name}.json"));
        let content = fs::read_to_string(&path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                MonounitError::NotFound(format!("unrecognised remote {name}"))
            }
            _ => e.into(),
        })?;

        Ok(serde_json::from_str(&content)?)
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Splits `remote:rest` into its parts. Without a prefix the default remote is returned.
pub fn parse_remote_name(reference: &str) -> (&str, &str) {
    match reference.split_once(':') {
        Some((remote, rest)) => (remote, rest),
        None => (DEFAULT_REMOTE, reference),
    }
}

/// Names of all saved remotes, sorted.
pub async fn list_remotes(layout: &HomeLayout) -> MonounitResult<Vec<String>> {
    let mut names = Vec::new();
    let mut entries = match fs::read_dir(layout.remotes_dir()).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(names),
        Err(e) => return Err(e.into()),
    };

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == "json") {
            if let Some(stem) = path.file_stem() {
                names.push(stem.to_string_lossy().to_string());
            }
        }
    }

    names.sort();
    Ok(names)
}

/// Deletes a remote record and its pinned server certificate.
///
/// The default remote cannot be removed.
pub async fn remove_remote(layout: &HomeLayout, name: &str) -> MonounitResult<()> {
    if name == DEFAULT_REMOTE {
        return Err(MonounitError::Validation(format!(
            "the {DEFAULT_REMOTE} remote cannot be removed"
        )));
    }

    discard_remote(layout, name).await
}

/// Deletes a remote record and its certificate without any protection.
pub(crate) async fn discard_remote(layout: &HomeLayout, name: &str) -> MonounitResult<()> {
    let path = layout.remotes_dir().join(format!("{name}.json"));
    fs::remove_file(&path).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => {
            MonounitError::NotFound(format!("unrecognised remote {name}"))
        }
        _ => e.into(),
    })?;

    match fs::remove_file(layout.server_cert(name)).await {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
        _ => Ok(()),
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl fmt::Display for RemoteProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteProtocol::Unix => write!(f, "unix"),
            RemoteProtocol::Https => write!(f, "https"),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

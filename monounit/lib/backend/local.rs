use std::net::Ipv4Addr;

use async_trait::async_trait;
use tokio::net::UdpSocket;

use crate::{
    config::{HostSettings, HostStatus},
    remote::{add_remote, Remote, RemoteConnector, DEFAULT_REMOTE},
    runtime::Connector,
    utils::HomeLayout,
    MonounitError, MonounitResult,
};

use super::{probe_handle_capacity, Backend, BackendInfo, LxcCli, STATE_RUNNING};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Address dialled to find the outbound interface. No packet is sent.
const OUTBOUND_PROBE: &str = "8.8.8.8:80";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A daemon running on this machine.
#[derive(Debug, Clone)]
pub struct LocalBackend {
    layout: HomeLayout,
    settings: HostSettings,
    user: String,
}

/// How far the local daemon has been set up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalStatus {
    /// `lxc` is not on the path.
    NotInstalled,

    /// `lxc` is installed but the host has not been initialised.
    NotInitialised,

    /// The host has been initialised.
    Installed,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl LocalBackend {
    /// Creates the backend.
    pub fn new(layout: HomeLayout, settings: HostSettings, user: impl Into<String>) -> Self {
        Self {
            layout,
            settings,
            user: user.into(),
        }
    }

    /// Checks installation and initialisation.
    pub fn status(&self) -> LocalStatus {
        local_status(which::which("lxc").is_ok(), &self.settings)
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

fn local_status(installed: bool, settings: &HostSettings) -> LocalStatus {
    match (installed, settings.is_active()) {
        (false, _) => LocalStatus::NotInstalled,
        (true, false) => LocalStatus::NotInitialised,
        (true, true) => LocalStatus::Installed,
    }
}

/// IPv4 address of the interface outbound traffic leaves through.
pub async fn outbound_ipv4() -> MonounitResult<Ipv4Addr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
    socket.connect(OUTBOUND_PROBE).await.map_err(|e| {
        MonounitError::Connectivity(format!("no outbound route: {e}"))
    })?;

    match socket.local_addr()?.ip() {
        std::net::IpAddr::V4(ip) => Ok(ip),
        std::net::IpAddr::V6(ip) => Err(MonounitError::Connectivity(format!(
            "outbound interface has no IPv4 address ({ip})"
        ))),
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl Backend for LocalBackend {
    async fn init(&self) -> MonounitResult<()> {
        match self.status() {
            LocalStatus::NotInstalled => {
                return Err(MonounitError::NotFound(
                    "lxc is not installed, install the lxd snap first".to_string(),
                ))
            }
            LocalStatus::Installed => {
                return Err(MonounitError::Conflict(format!(
                    "host {} is already initialised",
                    self.settings.name
                )))
            }
            LocalStatus::NotInitialised => {}
        }

        let cli = LxcCli::for_settings(&self.settings)?;
        cli.create_unit_environment(&self.settings).await?;
        cli.expose_api(&self.settings.trust).await?;

        let mut settings = self.settings.clone();
        settings.status = HostStatus::Active;
        settings.save(self.layout.settings_file()).await?;

        match Remote::load(&self.layout, DEFAULT_REMOTE).await {
            Ok(_) => tracing::debug!("remote {DEFAULT_REMOTE} already recorded"),
            Err(MonounitError::NotFound(_)) => {
                add_remote(&self.layout, &Remote::default_for(&settings), None, &self.user)
                    .await?;
            }
            Err(e) => return Err(e),
        }

        tracing::info!("initialised local daemon for host {}", settings.name);
        Ok(())
    }

    async fn info(&self) -> MonounitResult<BackendInfo> {
        let info = BackendInfo {
            name: sysinfo::System::host_name().unwrap_or_else(|| self.settings.name.clone()),
            state: STATE_RUNNING.to_string(),
            ipv4: outbound_ipv4().await?.to_string(),
            ..Default::default()
        };

        let remote = Remote::default_for(&self.settings);
        let server = RemoteConnector::new(self.layout.clone(), remote)
            .connect()
            .await?;
        let capacity = probe_handle_capacity(server.as_ref(), &self.settings.storage.name).await?;

        Ok(info.with_capacity(&capacity))
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendKind;

    #[test]
    fn test_local_status() {
        let mut settings = HostSettings::default_for(BackendKind::Lxd, "alice");
        assert_eq!(local_status(false, &settings), LocalStatus::NotInstalled);
        assert_eq!(local_status(true, &settings), LocalStatus::NotInitialised);

        settings.status = HostStatus::Active;
        assert_eq!(local_status(true, &settings), LocalStatus::Installed);
        assert_eq!(local_status(false, &settings), LocalStatus::NotInstalled);
    }

    #[tokio::test]
    async fn test_init_refuses_active_host() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut settings = HostSettings::default_for(BackendKind::Lxd, "alice");
        settings.status = HostStatus::Active;

        let backend = LocalBackend::new(HomeLayout::new(dir.path()), settings, "alice");
        let expected_conflict = backend.status() == LocalStatus::Installed;
        match backend.init().await {
            Err(MonounitError::Conflict(_)) => assert!(expected_conflict),
            Err(MonounitError::NotFound(_)) => assert!(!expected_conflict),
            other => panic!("unexpected init result: {other:?}"),
        }
        assert!(!dir.path().join("config.yml").exists());
        Ok(())
    }
}

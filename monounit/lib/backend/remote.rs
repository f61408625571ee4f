use async_trait::async_trait;

use crate::{
    config::{HostSettings, HostStatus},
    remote::{RemoteConnector, DEFAULT_REMOTE},
    runtime::Connector,
    utils::HomeLayout,
    MonounitError, MonounitResult,
};

use super::{probe_handle_capacity, Backend, BackendInfo, STATE_RUNNING};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// State reported when the endpoint cannot be reached.
pub const STATE_UNREACHABLE: &str = "Unreachable";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A pre-provisioned daemon reached through a saved remote record.
///
/// Nothing is installed locally. Initialisation only checks that the endpoint answers and
/// trusts this client, then marks the host active.
#[derive(Debug, Clone)]
pub struct RemoteBackend {
    layout: HomeLayout,
    settings: HostSettings,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl RemoteBackend {
    /// Creates the backend.
    pub fn new(layout: HomeLayout, settings: HostSettings) -> Self {
        Self { layout, settings }
    }

    fn remote_name(&self) -> &str {
        self.settings
            .backend
            .remote
            .as_deref()
            .unwrap_or(DEFAULT_REMOTE)
    }

    async fn connector(&self) -> MonounitResult<RemoteConnector> {
        RemoteConnector::load(self.layout.clone(), self.remote_name()).await
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl Backend for RemoteBackend {
    async fn init(&self) -> MonounitResult<()> {
        if self.settings.is_active() {
            return Err(MonounitError::Conflict(format!(
                "host {} is already initialised",
                self.settings.name
            )));
        }

        let server = self.connector().await?.connect().await?;
        let info = server.server_info().await?;
        if !info.trusted {
            return Err(MonounitError::Connectivity(format!(
                "remote {} does not trust this client, add it with its trust password first",
                self.remote_name()
            )));
        }

        let mut settings = self.settings.clone();
        settings.status = HostStatus::Active;
        settings.save(self.layout.settings_file()).await?;

        tracing::info!("using remote {} as backend", self.remote_name());
        Ok(())
    }

    async fn info(&self) -> MonounitResult<BackendInfo> {
        let connector = self.connector().await?;
        let mut info = BackendInfo {
            name: self.remote_name().to_string(),
            ipv4: connector.remote().host().to_string(),
            ..Default::default()
        };

        let server = match connector.connect().await {
            Ok(server) => server,
            Err(e) => {
                tracing::debug!("remote {} unreachable: {e}", self.remote_name());
                info.state = STATE_UNREACHABLE.to_string();
                return Ok(info);
            }
        };
        if let Err(e) = server.server_info().await {
            tracing::debug!("remote {} unreachable: {e}", self.remote_name());
            info.state = STATE_UNREACHABLE.to_string();
            return Ok(info);
        }

        info.state = STATE_RUNNING.to_string();
        let capacity = probe_handle_capacity(server.as_ref(), &self.settings.storage.name).await?;
        Ok(info.with_capacity(&capacity))
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

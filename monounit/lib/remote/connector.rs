use std::sync::Arc;

use async_trait::async_trait;
use tokio::fs;

use crate::{
    runtime::{
        lxd::{LxdClient, Transport},
        Connector, UnitServer,
    },
    utils::HomeLayout,
    MonounitError, MonounitResult,
};

use super::{Remote, RemoteProtocol};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The `lxc` command line's name for the daemon on this machine.
const LXC_LOCAL_REMOTE: &str = "local";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Opens handles on a saved remote, reading its credentials from the trust store every time.
#[derive(Debug, Clone)]
pub struct RemoteConnector {
    layout: HomeLayout,
    remote: Remote,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl RemoteConnector {
    /// Creates a connector for `remote`.
    pub fn new(layout: HomeLayout, remote: Remote) -> Self {
        Self { layout, remote }
    }

    /// Creates a connector for the saved remote called `name`.
    pub async fn load(layout: HomeLayout, name: &str) -> MonounitResult<Self> {
        let remote = Remote::load(&layout, name).await?;
        Ok(Self::new(layout, remote))
    }

    /// The remote handles are opened on.
    pub fn remote(&self) -> &Remote {
        &self.remote
    }

    async fn read_secret(&self, path: std::path::PathBuf, what: &str) -> MonounitResult<String> {
        fs::read_to_string(&path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => MonounitError::NotFound(format!(
                "{what} for remote {} at {}",
                self.remote.get_name(),
                path.display()
            )),
            _ => e.into(),
        })
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl Connector for RemoteConnector {
    async fn connect(&self) -> MonounitResult<Arc<dyn UnitServer>> {
        let transport = match self.remote.get_protocol() {
            RemoteProtocol::Unix => Transport::socket(LXC_LOCAL_REMOTE),
            RemoteProtocol::Https => {
                let cert = self
                    .read_secret(self.layout.client_cert(), "client certificate")
                    .await?;
                let key = self
                    .read_secret(self.layout.client_key(), "client key")
                    .await?;
                let server_cert = self
                    .read_secret(
                        self.layout.server_cert(self.remote.get_name()),
                        "server certificate",
                    )
                    .await?;
                Transport::https(self.remote.get_url(), &cert, &key, &server_cert)?
            }
        };

        tracing::debug!("opened handle on remote {}", self.remote.get_name());
        Ok(Arc::new(LxdClient::new(transport)))
    }
}

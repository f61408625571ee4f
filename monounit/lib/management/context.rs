use std::{collections::BTreeMap, future::Future, sync::Arc, time::Duration};

use getset::Getters;
use tokio_util::sync::CancellationToken;
use typed_builder::TypedBuilder;

use crate::{
    config::HostSettings,
    image::{HttpCatalog, ImageCatalog, ImageStore},
    remote::{RemoteConnector, RemoteProtocol, DEFAULT_REMOTE},
    runtime::{Connector, UnitServer},
    utils::HomeLayout,
    MonounitError, MonounitResult,
};

use super::Registry;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// How long the daemon is given to settle after an image import.
pub const DEFAULT_IMPORT_SETTLE: Duration = Duration::from_secs(1);

const LOOPBACK_ADDRESS: &str = "127.0.0.1";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Everything a pipeline needs, passed explicitly into every call.
#[derive(Clone, Getters, TypedBuilder)]
#[getset(get = "pub with_prefix")]
pub struct Context {
    /// The home directory layout.
    layout: HomeLayout,

    /// The host-of-record.
    settings: HostSettings,

    /// Opens handles on the backend.
    connector: Arc<dyn Connector>,

    /// Public index and spec repositories.
    catalog: Arc<dyn ImageCatalog>,

    /// Persisted unit records.
    registry: Registry,

    /// Connectors for saved remotes, by remote name. Remotes not listed are loaded from the
    /// home directory when first addressed.
    #[builder(default)]
    #[getset(skip)]
    remotes: BTreeMap<String, Arc<dyn Connector>>,

    /// Signals the running pipeline to stop between stages.
    #[builder(default)]
    cancel: CancellationToken,

    /// Pause after importing an image into the backend.
    #[builder(default = DEFAULT_IMPORT_SETTLE)]
    #[getset(skip)]
    import_settle: Duration,

    /// Name of the invoking user, used for the client certificate and id mapping.
    #[builder(default = current_user_name(), setter(into))]
    user: String,

    /// Address host-facing ports are probed on.
    #[builder(default = LOOPBACK_ADDRESS.to_string(), setter(into))]
    address: String,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Context {
    /// Opens the context for the home directory at `layout`.
    ///
    /// The host must have been initialised: its settings are loaded and the backend is reached
    /// through the configured remote (the `local` one unless a remote backend names another).
    pub async fn open(layout: HomeLayout) -> MonounitResult<Self> {
        layout.ensure().await?;
        let settings = HostSettings::load(layout.settings_file())
            .await
            .map_err(|e| match e {
                MonounitError::NotFound(_) => MonounitError::NotFound(
                    "host settings, run `monounit init` first".to_string(),
                ),
                e => e,
            })?;

        let remote_name = settings
            .backend
            .remote
            .clone()
            .unwrap_or_else(|| DEFAULT_REMOTE.to_string());
        let connector = RemoteConnector::load(layout.clone(), &remote_name).await?;
        let address = match connector.remote().get_protocol() {
            RemoteProtocol::Unix => LOOPBACK_ADDRESS.to_string(),
            RemoteProtocol::Https => connector.remote().host().to_string(),
        };
        let catalog = HttpCatalog::new(settings.public_index.clone());
        let registry = Registry::open(layout.registry_db()).await?;

        Ok(Context::builder()
            .layout(layout)
            .settings(settings)
            .connector(Arc::new(connector) as Arc<dyn Connector>)
            .catalog(Arc::new(catalog) as Arc<dyn ImageCatalog>)
            .registry(registry)
            .address(address)
            .build())
    }

    /// Opens a fresh handle on the backend.
    pub async fn connect(&self) -> MonounitResult<Arc<dyn UnitServer>> {
        self.connector.connect().await
    }

    /// Opens a handle on the remote called `remote`.
    ///
    /// The default remote is the context's own backend. Other names must be saved remotes,
    /// otherwise this fails with `NotFound`.
    pub async fn connect_remote(&self, remote: &str) -> MonounitResult<Arc<dyn UnitServer>> {
        if remote == DEFAULT_REMOTE {
            return self.connect().await;
        }
        if let Some(connector) = self.remotes.get(remote) {
            return connector.connect().await;
        }

        RemoteConnector::load(self.layout.clone(), remote)
            .await?
            .connect()
            .await
    }

    /// The local image store.
    pub fn store(&self) -> ImageStore {
        ImageStore::new(self.layout.images_dir())
    }

    /// Fails with `Cancelled` once cancellation has been requested.
    pub fn check_cancelled(&self) -> MonounitResult<()> {
        if self.cancel.is_cancelled() {
            return Err(MonounitError::Cancelled);
        }
        Ok(())
    }

    /// Runs one pipeline stage unless cancellation was requested.
    ///
    /// Cancellation is only observed at stage boundaries. A stage that has started runs to
    /// completion so every change it makes has its undo recorded; a cancellation that arrived
    /// meanwhile then fails the stage with `Cancelled`.
    pub async fn run_stage<T>(
        &self,
        stage: &str,
        work: impl Future<Output = MonounitResult<T>>,
    ) -> MonounitResult<T> {
        self.check_cancelled()?;
        tracing::info!("{stage}");

        let result = work.await?;
        if self.cancel.is_cancelled() {
            tracing::warn!("cancelled during: {stage}");
            return Err(MonounitError::Cancelled);
        }
        Ok(result)
    }

    /// Cancels this context on the first Ctrl-C or SIGTERM.
    ///
    /// The handlers are installed before this returns, so a signal that arrives afterwards is
    /// never lost to the default disposition.
    pub fn cancel_on_shutdown(&self) -> MonounitResult<()> {
        #[cfg(unix)]
        let mut terminate =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            #[cfg(unix)]
            let signal = tokio::select! {
                result = tokio::signal::ctrl_c() => result.map(|_| "interrupt"),
                _ = terminate.recv() => Ok("terminate"),
            };
            #[cfg(not(unix))]
            let signal = tokio::signal::ctrl_c().await.map(|_| "interrupt");

            match signal {
                Ok(signal) => {
                    tracing::warn!("received {signal} signal, rolling back");
                    cancel.cancel();
                }
                Err(e) => tracing::warn!("could not listen for shutdown signals: {e}"),
            }
        });

        Ok(())
    }

    /// Pause after importing an image into the backend.
    pub fn import_settle(&self) -> Duration {
        self.import_settle
    }

    /// Replaces the host settings, e.g. after a reconfiguration.
    pub fn set_settings(&mut self, settings: HostSettings) {
        self.settings = settings;
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Name of the user running this process.
pub fn current_user_name() -> String {
    uzers::get_current_username()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| "monounit".to_string())
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("layout", &self.layout)
            .field("settings", &self.settings.name)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

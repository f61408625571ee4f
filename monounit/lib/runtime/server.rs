use std::{collections::BTreeMap, path::Path, sync::Arc};

use async_trait::async_trait;

use crate::{MonounitError, MonounitResult};

use super::{
    Device, ExecOutput, HostResources, ImageInfo, LaunchRequest, PoolUsage, ServerInfo, StateAction,
    UnitInfo, VolumeInfo,
};

//--------------------------------------------------------------------------------------------------
// Traits
//--------------------------------------------------------------------------------------------------

/// An authenticated handle on a container runtime.
///
/// Every pipeline talks to the runtime exclusively through this trait. Calls block until the
/// runtime has finished the requested change.
#[async_trait]
pub trait UnitServer: Send + Sync {
    /// Reports the runtime's identity and whether the caller is trusted.
    async fn server_info(&self) -> MonounitResult<ServerInfo>;

    /// Lists every unit on the runtime.
    async fn list_units(&self) -> MonounitResult<Vec<UnitInfo>>;

    /// Fetches a single unit. Fails with `NotFound` when it does not exist.
    async fn get_unit(&self, name: &str) -> MonounitResult<UnitInfo>;

    /// Creates a unit from an image and starts it.
    async fn launch(&self, request: &LaunchRequest) -> MonounitResult<()>;

    /// Applies a lifecycle transition.
    async fn change_state(&self, name: &str, action: StateAction) -> MonounitResult<()>;

    /// Deletes a unit, stopping it first if needed.
    async fn delete_unit(&self, name: &str) -> MonounitResult<()>;

    /// Runs a command inside a unit and captures its output.
    async fn exec(
        &self,
        name: &str,
        command: &[String],
        env: &BTreeMap<String, String>,
    ) -> MonounitResult<ExecOutput>;

    /// Starts a command inside a unit without waiting for it to finish.
    ///
    /// Its exit status is never observed.
    async fn exec_detached(
        &self,
        name: &str,
        command: &[String],
        env: &BTreeMap<String, String>,
    ) -> MonounitResult<()>;

    /// Pushes a local file, symlink or directory into `target_dir` inside a unit.
    ///
    /// Files and symlinks land at `target_dir/<file name>`. Directories have their contents
    /// copied into `target_dir` recursively.
    async fn push(&self, name: &str, source: &Path, target_dir: &str) -> MonounitResult<()>;

    /// Adds a device. Fails with `Conflict` when the device name is taken.
    async fn add_device(&self, name: &str, device: &str, config: Device) -> MonounitResult<()>;

    /// Replaces an existing device's configuration.
    async fn update_device(&self, name: &str, device: &str, config: Device) -> MonounitResult<()>;

    /// Removes a device and returns its configuration.
    async fn remove_device(&self, name: &str, device: &str) -> MonounitResult<Device>;

    /// Sets configuration keys on a unit.
    async fn set_config(
        &self,
        name: &str,
        config: &BTreeMap<String, String>,
    ) -> MonounitResult<()>;

    /// Publishes a unit as an image under `alias` and returns the image fingerprint.
    async fn publish(&self, name: &str, alias: &str) -> MonounitResult<String>;

    /// Writes an image's archive to `dest`.
    async fn export_image(&self, fingerprint: &str, dest: &Path) -> MonounitResult<()>;

    /// Imports an archive under `alias` and returns the image fingerprint.
    async fn import_image(&self, archive: &Path, alias: &str) -> MonounitResult<String>;

    /// Deletes an image.
    async fn delete_image(&self, fingerprint: &str) -> MonounitResult<()>;

    /// Looks an image up by alias. `None` means no image carries it.
    async fn find_image(&self, alias: &str) -> MonounitResult<Option<ImageInfo>>;

    /// Memory and CPU capacity of the runtime host.
    async fn host_resources(&self) -> MonounitResult<HostResources>;

    /// Space usage of a storage pool.
    async fn pool_usage(&self, pool: &str) -> MonounitResult<PoolUsage>;

    /// Creates a custom filesystem volume.
    async fn create_volume(&self, pool: &str, name: &str) -> MonounitResult<()>;

    /// Fetches a custom volume and the units using it.
    async fn get_volume(&self, pool: &str, name: &str) -> MonounitResult<VolumeInfo>;

    /// Deletes a custom volume.
    async fn delete_volume(&self, pool: &str, name: &str) -> MonounitResult<()>;

    /// Registers a client certificate using the runtime's trust secret.
    async fn add_certificate(&self, certificate_pem: &str, password: &str) -> MonounitResult<()>;

    /// Starts a unit.
    async fn start(&self, name: &str) -> MonounitResult<()> {
        self.change_state(name, StateAction::Start).await
    }

    /// Stops a unit.
    async fn stop(&self, name: &str) -> MonounitResult<()> {
        self.change_state(name, StateAction::Stop).await
    }

    /// Restarts a unit.
    async fn restart(&self, name: &str) -> MonounitResult<()> {
        self.change_state(name, StateAction::Restart).await
    }

    /// Returns true if a unit with this name exists.
    async fn unit_exists(&self, name: &str) -> MonounitResult<bool> {
        match self.get_unit(name).await {
            Ok(_) => Ok(true),
            Err(MonounitError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Runs a command and fails with `Operation` on a non-zero exit status.
    async fn exec_checked(
        &self,
        name: &str,
        command: &[String],
        env: &BTreeMap<String, String>,
    ) -> MonounitResult<ExecOutput> {
        let output = self.exec(name, command, env).await?;
        if !output.success() {
            return Err(MonounitError::Operation(format!(
                "command {:?} exited with status {} in unit {}: {}",
                command.join(" "),
                output.status,
                name,
                output.stderr.trim()
            )));
        }
        Ok(output)
    }
}

/// Opens authenticated handles.
///
/// A fresh handle is opened for every logical operation; nothing is kept open between
/// operations.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Opens a new handle.
    async fn connect(&self) -> MonounitResult<Arc<dyn UnitServer>>;
}

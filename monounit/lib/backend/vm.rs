use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::{
    config::{storage_pool_name, HostSettings, HostStatus},
    management::Rollback,
    remote::{add_remote, Remote},
    utils::{run_command, run_command_with_input, HomeLayout},
    MonounitError, MonounitResult,
};

use super::{probe_capacity, Backend, BackendInfo, LxcCli, STATE_RUNNING};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// How long a freshly launched VM is given to finish booting.
pub const DEFAULT_VM_SETTLE: Duration = Duration::from_secs(10);

const MULTIPASS: &str = "multipass";

/// The account of the VM image `lxc` runs as.
const VM_USER: &str = "ubuntu";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A daemon nested inside a VM this tool creates and manages.
#[derive(Debug, Clone)]
pub struct VmBackend {
    layout: HomeLayout,
    settings: HostSettings,
    user: String,
    settle: Duration,
}

/// What the hypervisor reports about the VM.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct VmState {
    /// e.g. `Running` or `Stopped`.
    pub state: String,

    /// Addresses, the first one being the VM's primary address.
    #[serde(default)]
    pub ipv4: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct MultipassInfo {
    info: std::collections::BTreeMap<String, VmState>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl VmBackend {
    /// Creates the backend.
    pub fn new(layout: HomeLayout, settings: HostSettings, user: impl Into<String>) -> Self {
        Self {
            layout,
            settings,
            user: user.into(),
            settle: DEFAULT_VM_SETTLE,
        }
    }

    /// Overrides how long a new VM is given to boot.
    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    fn vm_name(&self) -> &str {
        &self.settings.backend.resources.name
    }

    /// Queries the VM's state and addresses.
    pub async fn vm_state(&self) -> MonounitResult<VmState> {
        let out = run_command(MULTIPASS, ["info", self.vm_name(), "--format", "json"]).await?;
        parse_vm_state(&out, self.vm_name())
    }

    /// Starts the VM.
    pub async fn start(&self) -> MonounitResult<()> {
        run_command(MULTIPASS, ["start", self.vm_name()]).await?;
        Ok(())
    }

    /// Stops the VM.
    pub async fn stop(&self) -> MonounitResult<()> {
        run_command(MULTIPASS, ["stop", self.vm_name()]).await?;
        Ok(())
    }

    /// Deletes the VM and purges it from the hypervisor.
    pub async fn delete(&self) -> MonounitResult<()> {
        delete_vm(self.vm_name()).await
    }

    async fn launch_vm(&self) -> MonounitResult<()> {
        let resources = &self.settings.backend.resources;
        let cpus = resources.cpu.to_string();
        run_command(
            MULTIPASS,
            [
                "launch",
                "--cpus",
                cpus.as_str(),
                "--disk",
                resources.hd.as_str(),
                "--memory",
                resources.ram.as_str(),
                "--name",
                resources.name.as_str(),
                resources.os.as_str(),
            ],
        )
        .await?;
        tracing::info!("launched vm {}", resources.name);
        Ok(())
    }

    async fn vm_exec(&self, args: &[&str]) -> MonounitResult<String> {
        let mut argv = vec!["exec", self.vm_name(), "--"];
        argv.extend_from_slice(args);
        run_command(MULTIPASS, argv).await
    }

    async fn install_daemon(&self, settings: &HostSettings) -> MonounitResult<()> {
        self.vm_exec(&["sudo", "snap", "install", "--stable", "lxd"])
            .await?;
        self.vm_exec(&["sudo", "usermod", "-aG", "lxd", VM_USER])
            .await?;

        let preseed = preseed(settings)?;
        tracing::debug!("preseeding daemon:\n{preseed}");
        run_command_with_input(
            MULTIPASS,
            [
                "exec",
                self.vm_name(),
                "--",
                "sudo",
                "lxd",
                "init",
                "--preseed",
            ],
            Some(preseed.as_bytes()),
        )
        .await?;

        LxcCli::for_settings(settings)?
            .expose_api(&settings.trust)
            .await
    }

    async fn provision(&self, settings: &mut HostSettings) -> MonounitResult<Option<String>> {
        tokio::time::sleep(self.settle).await;

        settings.storage.name = storage_pool_name(&settings.profile);
        self.install_daemon(settings).await?;

        let state = self.vm_state().await?;
        settings.backend.resources.ip = state.ipv4.first().cloned().ok_or_else(|| {
            MonounitError::Connectivity(format!("vm {} has no IPv4 address", self.vm_name()))
        })?;

        add_remote(
            &self.layout,
            &Remote::default_for(settings),
            Some(&settings.trust),
            &self.user,
        )
        .await
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

async fn delete_vm(name: &str) -> MonounitResult<()> {
    run_command(MULTIPASS, ["delete", name]).await?;
    run_command(MULTIPASS, ["purge"]).await?;
    tracing::info!("deleted vm {name}");
    Ok(())
}

/// Extracts the state of `name` from `multipass info --format json`.
pub fn parse_vm_state(out: &str, name: &str) -> MonounitResult<VmState> {
    let info: MultipassInfo = serde_json::from_str(out)?;
    info.info
        .get(name)
        .cloned()
        .ok_or_else(|| MonounitError::NotFound(format!("vm {name}")))
}

/// Renders the daemon preseed creating the pool, bridge and profile described by `settings`.
pub fn preseed(settings: &HostSettings) -> MonounitResult<String> {
    let document = serde_json::json!({
        "config": {
            "core.https_address": super::HTTPS_LISTEN_ADDRESS,
        },
        "storage_pools": [{
            "name": settings.storage.name,
            "driver": settings.storage.driver,
            "config": { "size": settings.storage.size },
        }],
        "networks": [{
            "name": settings.network.name,
            "type": "bridge",
            "config": {
                "ipv4.address": format!("{}/24", settings.network.bridge),
                "ipv4.nat": "true",
                "ipv6.address": "none",
            },
        }],
        "profiles": [{
            "name": settings.profile,
            "devices": {
                "root": {
                    "path": "/",
                    "pool": settings.storage.name,
                    "type": "disk",
                },
                "eth0": {
                    "name": "eth0",
                    "nictype": "bridged",
                    "parent": settings.network.name,
                    "type": "nic",
                },
            },
        }],
    });

    Ok(serde_yaml::to_string(&document)?)
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl Backend for VmBackend {
    async fn init(&self) -> MonounitResult<()> {
        if self.settings.is_active() {
            return Err(MonounitError::Conflict(format!(
                "vm {} is already initialised",
                self.vm_name()
            )));
        }
        which::which(MULTIPASS)
            .map_err(|_| MonounitError::NotFound("multipass is not installed".to_string()))?;

        self.launch_vm().await?;

        let mut rollback = Rollback::new();
        {
            let name = self.vm_name().to_string();
            rollback.push(format!("delete vm {name}"), move || async move {
                delete_vm(&name).await
            });
        }

        let mut settings = self.settings.clone();
        let result = self.provision(&mut settings).await;
        let fingerprint = rollback.guard(result).await?;
        rollback.commit();

        settings.status = HostStatus::Active;
        settings.save(self.layout.settings_file()).await?;

        if let Some(fingerprint) = fingerprint {
            tracing::info!("vm daemon certificate fingerprint: {fingerprint}");
        }
        tracing::info!(
            "initialised vm {} at {}",
            self.vm_name(),
            settings.backend.resources.ip
        );
        Ok(())
    }

    async fn info(&self) -> MonounitResult<BackendInfo> {
        let state = self.vm_state().await?;
        let info = BackendInfo {
            name: self.vm_name().to_string(),
            ipv4: state.ipv4.first().cloned().unwrap_or_default(),
            state: state.state,
            ..Default::default()
        };

        if info.state != STATE_RUNNING {
            return Ok(info);
        }

        let cli = LxcCli::for_settings(&self.settings)?;
        let capacity = probe_capacity(
            cli.pool_usage(&self.settings.storage.name),
            cli.memory(),
            cli.cpus(),
        )
        .await?;

        Ok(info.with_capacity(&capacity))
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

//! An in-process runtime that keeps all state in memory.
//!
//! [`MemoryServer`] honours the full [`UnitServer`] contract (name conflicts, device bookkeeping,
//! volume usage, image archives) without a daemon, which makes it the runtime of choice for
//! exercising pipelines in tests and dry runs. Any operation can be made to fail on demand.

use std::{
    collections::{BTreeMap, BTreeSet},
    io::Read,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use async_trait::async_trait;
use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::{MonounitError, MonounitResult};

use super::{
    Connector, Device, ExecOutput, HostResources, ImageInfo, ImageSource, LaunchRequest, PoolUsage,
    ServerInfo, StateAction, UnitInfo, UnitServer, UnitStatus, VolumeInfo,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

const ROOTFS_PREFIX: &str = "rootfs";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// An in-memory [`UnitServer`]. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct MemoryServer {
    state: Arc<Mutex<MemoryState>>,
}

#[derive(Debug)]
struct MemoryState {
    architecture: String,
    trusted: bool,
    trust_password: Option<String>,
    certificates: Vec<String>,
    units: BTreeMap<String, MemoryUnit>,
    images: BTreeMap<String, MemoryImage>,
    volumes: BTreeSet<(String, String)>,
    pools: BTreeMap<String, PoolUsage>,
    resources: HostResources,
    failures: BTreeMap<String, String>,
    exec_failures: Vec<String>,
    exec_log: Vec<(String, Vec<String>)>,
    start_failure: Option<String>,
    launch_delay: Duration,
}

#[derive(Debug, Clone, Default)]
struct MemoryUnit {
    status: Option<UnitStatus>,
    profiles: Vec<String>,
    devices: BTreeMap<String, Device>,
    config: BTreeMap<String, String>,
    files: BTreeMap<String, Vec<u8>>,
}

#[derive(Debug, Clone)]
struct MemoryImage {
    aliases: Vec<String>,
    archive: Vec<u8>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl MemoryServer {
    /// Creates an empty, trusted runtime with a `default` pool of 100GB and 16GB of memory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the memory and CPU capacity reported by the runtime.
    pub fn set_resources(&self, resources: HostResources) {
        self.lock().resources = resources;
    }

    /// Creates or replaces a storage pool with the given usage.
    pub fn set_pool_usage(&self, pool: &str, used: u64, total: u64) {
        self.lock()
            .pools
            .insert(pool.to_string(), PoolUsage { used, total });
    }

    /// Marks the caller as trusted or not.
    pub fn set_trusted(&self, trusted: bool) {
        self.lock().trusted = trusted;
    }

    /// Sets the trust secret certificate registration is checked against.
    pub fn set_trust_password(&self, password: &str) {
        self.lock().trust_password = Some(password.to_string());
    }

    /// Makes every call to `operation` fail with an `Operation` error carrying `message`.
    ///
    /// `operation` is the [`UnitServer`] method name, e.g. `"publish"`.
    pub fn fail_on(&self, operation: &str, message: &str) {
        self.lock()
            .failures
            .insert(operation.to_string(), message.to_string());
    }

    /// Removes a failure set with [`fail_on`](Self::fail_on).
    pub fn clear_failure(&self, operation: &str) {
        self.lock().failures.remove(operation);
    }

    /// Makes any exec whose joined command line contains `pattern` exit with status 1.
    pub fn fail_exec_matching(&self, pattern: &str) {
        self.lock().exec_failures.push(pattern.to_string());
    }

    /// Makes launches create the unit and then fail to start it, leaving it stopped.
    pub fn fail_start(&self, message: &str) {
        self.lock().start_failure = Some(message.to_string());
    }

    /// Lets launches start their units again after [`fail_start`](Self::fail_start).
    pub fn clear_start_failure(&self) {
        self.lock().start_failure = None;
    }

    /// Makes launches take `delay` after the unit has been created.
    pub fn set_launch_delay(&self, delay: Duration) {
        self.lock().launch_delay = delay;
    }

    /// Names of all units.
    pub fn unit_names(&self) -> Vec<String> {
        self.lock().units.keys().cloned().collect()
    }

    /// Fingerprints of all images.
    pub fn image_fingerprints(&self) -> Vec<String> {
        self.lock().images.keys().cloned().collect()
    }

    /// Names of all custom volumes in `pool`.
    pub fn volume_names(&self, pool: &str) -> Vec<String> {
        self.lock()
            .volumes
            .iter()
            .filter(|(p, _)| p == pool)
            .map(|(_, name)| name.clone())
            .collect()
    }

    /// Every command run so far, with the unit it ran in.
    pub fn exec_log(&self) -> Vec<(String, Vec<String>)> {
        self.lock().exec_log.clone()
    }

    /// Content of a file inside a unit.
    pub fn unit_file(&self, unit: &str, path: &str) -> Option<Vec<u8>> {
        self.lock()
            .units
            .get(unit)
            .and_then(|u| u.files.get(path).cloned())
    }

    /// Registered client certificates.
    pub fn certificates(&self) -> Vec<String> {
        self.lock().certificates.clone()
    }

    /// Creates the unit a launch asks for. Returns the injected start failure and launch delay.
    fn create_unit(&self, request: &LaunchRequest) -> MonounitResult<(Option<String>, Duration)> {
        let mut state = self.check("launch")?;
        if state.units.contains_key(&request.name) {
            return Err(MonounitError::Conflict(format!(
                "unit {} already exists",
                request.name
            )));
        }
        if !state.pools.contains_key(&request.pool) {
            return Err(MonounitError::NotFound(format!(
                "storage pool {}",
                request.pool
            )));
        }

        let files = match &request.source {
            ImageSource::Public { .. } => BTreeMap::new(),
            source => {
                let image = state.find_image(source).ok_or_else(|| {
                    MonounitError::NotFound(format!("image {source:?}"))
                })?;
                MemoryUnit::from_archive(&image.archive)?
            }
        };

        let start_failure = state.start_failure.clone();
        state.units.insert(
            request.name.clone(),
            MemoryUnit {
                status: Some(match start_failure {
                    Some(_) => UnitStatus::Stopped,
                    None => UnitStatus::Running,
                }),
                profiles: vec![request.profile.clone()],
                files,
                ..Default::default()
            },
        );
        Ok((start_failure, state.launch_delay))
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        // A poisoned lock only means a test panicked mid-call; the state is still usable.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check(&self, operation: &str) -> MonounitResult<MutexGuard<'_, MemoryState>> {
        let state = self.lock();
        if let Some(message) = state.failures.get(operation) {
            return Err(MonounitError::Operation(format!("{operation}: {message}")));
        }
        Ok(state)
    }
}

impl MemoryState {
    fn unit(&self, name: &str) -> MonounitResult<&MemoryUnit> {
        self.units
            .get(name)
            .ok_or_else(|| MonounitError::NotFound(format!("unit {name}")))
    }

    fn unit_mut(&mut self, name: &str) -> MonounitResult<&mut MemoryUnit> {
        self.units
            .get_mut(name)
            .ok_or_else(|| MonounitError::NotFound(format!("unit {name}")))
    }

    fn find_image(&self, source: &ImageSource) -> Option<&MemoryImage> {
        match source {
            ImageSource::Fingerprint(fp) => self.images.get(fp),
            ImageSource::Alias(alias) => self.images.values().find(|i| i.aliases.contains(alias)),
            ImageSource::Public { .. } => None,
        }
    }

    fn used_by(&self, pool: &str, volume: &str) -> Vec<String> {
        self.units
            .iter()
            .filter(|(_, unit)| {
                unit.devices.values().any(|d| {
                    d.get("type").map(String::as_str) == Some("disk")
                        && d.get("pool").map(String::as_str) == Some(pool)
                        && d.get("source").map(String::as_str) == Some(volume)
                })
            })
            .map(|(name, _)| name.clone())
            .collect()
    }

    fn info(&self, name: &str, unit: &MemoryUnit) -> UnitInfo {
        let ipv4 = unit
            .devices
            .get("eth0")
            .and_then(|nic| nic.get("ipv4.address").cloned());

        UnitInfo {
            name: name.to_string(),
            status: unit.status.clone().unwrap_or(UnitStatus::Stopped),
            ipv4,
            profiles: unit.profiles.clone(),
            devices: unit.devices.clone(),
            config: unit.config.clone(),
        }
    }
}

impl MemoryUnit {
    fn to_archive(&self, name: &str) -> MonounitResult<Vec<u8>> {
        let encoder = GzEncoder::new(Vec::new(), Compression::default());
        let mut builder = tar::Builder::new(encoder);

        let metadata = format!("source: {name}\n");
        append_entry(&mut builder, "metadata.yaml", metadata.as_bytes())?;
        for (path, content) in &self.files {
            let entry = format!("{}/{}", ROOTFS_PREFIX, path.trim_start_matches('/'));
            append_entry(&mut builder, &entry, content)?;
        }

        Ok(builder.into_inner()?.finish()?)
    }

    fn from_archive(archive: &[u8]) -> MonounitResult<BTreeMap<String, Vec<u8>>> {
        let mut files = BTreeMap::new();
        let mut archive = tar::Archive::new(GzDecoder::new(archive));
        for entry in archive.entries()? {
            let mut entry = entry?;
            let path = entry.path()?.to_string_lossy().to_string();
            if let Some(rest) = path.strip_prefix(&format!("{ROOTFS_PREFIX}/")) {
                let mut content = Vec::new();
                entry.read_to_end(&mut content)?;
                files.insert(format!("/{rest}"), content);
            }
        }
        Ok(files)
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

fn append_entry<W: std::io::Write>(
    builder: &mut tar::Builder<W>,
    path: &str,
    content: &[u8],
) -> MonounitResult<()> {
    let mut header = tar::Header::new_gnu();
    header.set_size(content.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(0);
    header.set_cksum();
    builder.append_data(&mut header, path, content)?;
    Ok(())
}

fn fingerprint(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Reads `source` into `(path inside unit, content)` pairs rooted at `target_dir`.
async fn collect_push(source: &Path, target_dir: &str) -> MonounitResult<Vec<(String, Vec<u8>)>> {
    let target_dir = target_dir.trim_end_matches('/').to_string();
    let metadata = tokio::fs::symlink_metadata(source).await?;

    if metadata.is_dir() {
        let mut files = Vec::new();
        for entry in WalkDir::new(source).follow_links(false) {
            let entry = entry.map_err(|e| MonounitError::custom(anyhow::anyhow!(e)))?;
            if entry.file_type().is_dir() {
                continue;
            }
            let relative = entry
                .path()
                .strip_prefix(source)
                .map_err(|e| MonounitError::custom(anyhow::anyhow!(e)))?;
            let content = read_entry(entry.path()).await?;
            files.push((format!("{}/{}", target_dir, relative.display()), content));
        }
        return Ok(files);
    }

    let file_name = source
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .ok_or_else(|| {
            MonounitError::Validation(format!("cannot push {}", source.display()))
        })?;

    Ok(vec![(
        format!("{}/{}", target_dir, file_name),
        read_entry(source).await?,
    )])
}

async fn read_entry(path: &Path) -> MonounitResult<Vec<u8>> {
    let metadata = tokio::fs::symlink_metadata(path).await?;
    if metadata.file_type().is_symlink() {
        let target: PathBuf = tokio::fs::read_link(path).await?;
        return Ok(target.to_string_lossy().as_bytes().to_vec());
    }
    Ok(tokio::fs::read(path).await?)
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Default for MemoryState {
    fn default() -> Self {
        Self {
            architecture: "x86_64".to_string(),
            trusted: true,
            trust_password: None,
            certificates: Vec::new(),
            units: BTreeMap::new(),
            images: BTreeMap::new(),
            volumes: BTreeSet::new(),
            pools: BTreeMap::from([(
                "default".to_string(),
                PoolUsage {
                    used: 0,
                    total: 100_000_000_000,
                },
            )]),
            resources: HostResources {
                memory_used: 0,
                memory_total: 16_000_000_000,
                cpu: 8,
            },
            failures: BTreeMap::new(),
            exec_failures: Vec::new(),
            exec_log: Vec::new(),
            start_failure: None,
            launch_delay: Duration::ZERO,
        }
    }
}

#[async_trait]
impl UnitServer for MemoryServer {
    async fn server_info(&self) -> MonounitResult<ServerInfo> {
        let state = self.check("server_info")?;
        Ok(ServerInfo {
            trusted: state.trusted,
            architecture: state.architecture.clone(),
            version: "memory".to_string(),
        })
    }

    async fn list_units(&self) -> MonounitResult<Vec<UnitInfo>> {
        let state = self.check("list_units")?;
        Ok(state
            .units
            .iter()
            .map(|(name, unit)| state.info(name, unit))
            .collect())
    }

    async fn get_unit(&self, name: &str) -> MonounitResult<UnitInfo> {
        let state = self.check("get_unit")?;
        let unit = state.unit(name)?;
        Ok(state.info(name, unit))
    }

    async fn launch(&self, request: &LaunchRequest) -> MonounitResult<()> {
        let (start_failure, delay) = self.create_unit(request)?;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        match start_failure {
            Some(message) => Err(MonounitError::Operation(format!(
                "start {}: {message}",
                request.name
            ))),
            None => Ok(()),
        }
    }

    async fn change_state(&self, name: &str, action: StateAction) -> MonounitResult<()> {
        let mut state = self.check("change_state")?;
        let unit = state.unit_mut(name)?;
        unit.status = Some(match action {
            StateAction::Start | StateAction::Restart => UnitStatus::Running,
            StateAction::Stop => UnitStatus::Stopped,
        });
        Ok(())
    }

    async fn delete_unit(&self, name: &str) -> MonounitResult<()> {
        let mut state = self.check("delete_unit")?;
        state
            .units
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| MonounitError::NotFound(format!("unit {name}")))
    }

    async fn exec(
        &self,
        name: &str,
        command: &[String],
        _env: &BTreeMap<String, String>,
    ) -> MonounitResult<ExecOutput> {
        let mut state = self.check("exec")?;
        let unit = state.unit(name)?;
        if !unit.status.as_ref().is_some_and(|s| *s == UnitStatus::Running) {
            return Err(MonounitError::Operation(format!("unit {name} is not running")));
        }

        state.exec_log.push((name.to_string(), command.to_vec()));
        let line = command.join(" ");
        if state.exec_failures.iter().any(|p| line.contains(p.as_str())) {
            return Ok(ExecOutput {
                status: 1,
                stdout: String::new(),
                stderr: format!("{line}: injected failure"),
            });
        }

        Ok(ExecOutput::default())
    }

    async fn exec_detached(
        &self,
        name: &str,
        command: &[String],
        _env: &BTreeMap<String, String>,
    ) -> MonounitResult<()> {
        let mut state = self.check("exec")?;
        let unit = state.unit(name)?;
        if !unit.status.as_ref().is_some_and(|s| *s == UnitStatus::Running) {
            return Err(MonounitError::Operation(format!("unit {name} is not running")));
        }

        state.exec_log.push((name.to_string(), command.to_vec()));
        Ok(())
    }

    async fn push(&self, name: &str, source: &Path, target_dir: &str) -> MonounitResult<()> {
        {
            let state = self.check("push")?;
            state.unit(name)?;
        }
        let files = collect_push(source, target_dir).await?;

        let mut state = self.lock();
        let unit = state.unit_mut(name)?;
        unit.files.extend(files);
        Ok(())
    }

    async fn add_device(&self, name: &str, device: &str, config: Device) -> MonounitResult<()> {
        let mut state = self.check("add_device")?;
        let unit = state.unit_mut(name)?;
        if unit.devices.contains_key(device) {
            return Err(MonounitError::Conflict(format!(
                "device {device} already exists on unit {name}"
            )));
        }
        unit.devices.insert(device.to_string(), config);
        Ok(())
    }

    async fn update_device(&self, name: &str, device: &str, config: Device) -> MonounitResult<()> {
        let mut state = self.check("update_device")?;
        let unit = state.unit_mut(name)?;
        match unit.devices.get_mut(device) {
            Some(existing) => {
                *existing = config;
                Ok(())
            }
            None => Err(MonounitError::NotFound(format!(
                "device {device} on unit {name}"
            ))),
        }
    }

    async fn remove_device(&self, name: &str, device: &str) -> MonounitResult<Device> {
        let mut state = self.check("remove_device")?;
        let unit = state.unit_mut(name)?;
        unit.devices
            .remove(device)
            .ok_or_else(|| MonounitError::NotFound(format!("device {device} on unit {name}")))
    }

    async fn set_config(
        &self,
        name: &str,
        config: &BTreeMap<String, String>,
    ) -> MonounitResult<()> {
        let mut state = self.check("set_config")?;
        let unit = state.unit_mut(name)?;
        unit.config
            .extend(config.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(())
    }

    async fn publish(&self, name: &str, alias: &str) -> MonounitResult<String> {
        let mut state = self.check("publish")?;
        let archive = state.unit(name)?.to_archive(name)?;
        let fp = fingerprint(&archive);
        if state.images.values().any(|i| i.aliases.iter().any(|a| a == alias)) {
            return Err(MonounitError::Conflict(format!("image alias {alias} exists")));
        }
        state.images.insert(
            fp.clone(),
            MemoryImage {
                aliases: vec![alias.to_string()],
                archive,
            },
        );
        Ok(fp)
    }

    async fn export_image(&self, fingerprint: &str, dest: &Path) -> MonounitResult<()> {
        let archive = {
            let state = self.check("export_image")?;
            state
                .images
                .get(fingerprint)
                .map(|i| i.archive.clone())
                .ok_or_else(|| MonounitError::NotFound(format!("image {fingerprint}")))?
        };
        tokio::fs::write(dest, archive).await?;
        Ok(())
    }

    async fn import_image(&self, archive: &Path, alias: &str) -> MonounitResult<String> {
        self.check("import_image")?;
        let bytes = tokio::fs::read(archive).await?;
        let fp = fingerprint(&bytes);

        let mut state = self.lock();
        match state.images.get_mut(&fp) {
            Some(image) => {
                if !image.aliases.iter().any(|a| a == alias) {
                    image.aliases.push(alias.to_string());
                }
            }
            None => {
                state.images.insert(
                    fp.clone(),
                    MemoryImage {
                        aliases: vec![alias.to_string()],
                        archive: bytes,
                    },
                );
            }
        }
        Ok(fp)
    }

    async fn delete_image(&self, fingerprint: &str) -> MonounitResult<()> {
        let mut state = self.check("delete_image")?;
        state
            .images
            .remove(fingerprint)
            .map(|_| ())
            .ok_or_else(|| MonounitError::NotFound(format!("image {fingerprint}")))
    }

    async fn find_image(&self, alias: &str) -> MonounitResult<Option<ImageInfo>> {
        let state = self.check("find_image")?;
        Ok(state
            .images
            .iter()
            .find(|(_, image)| image.aliases.iter().any(|a| a == alias))
            .map(|(fingerprint, image)| ImageInfo {
                fingerprint: fingerprint.clone(),
                size: image.archive.len() as u64,
            }))
    }

    async fn host_resources(&self) -> MonounitResult<HostResources> {
        Ok(self.check("host_resources")?.resources)
    }

    async fn pool_usage(&self, pool: &str) -> MonounitResult<PoolUsage> {
        let state = self.check("pool_usage")?;
        state
            .pools
            .get(pool)
            .copied()
            .ok_or_else(|| MonounitError::NotFound(format!("storage pool {pool}")))
    }

    async fn create_volume(&self, pool: &str, name: &str) -> MonounitResult<()> {
        let mut state = self.check("create_volume")?;
        if !state.pools.contains_key(pool) {
            return Err(MonounitError::NotFound(format!("storage pool {pool}")));
        }
        if !state.volumes.insert((pool.to_string(), name.to_string())) {
            return Err(MonounitError::Conflict(format!(
                "volume {name} already exists in pool {pool}"
            )));
        }
        Ok(())
    }

    async fn get_volume(&self, pool: &str, name: &str) -> MonounitResult<VolumeInfo> {
        let state = self.check("get_volume")?;
        if !state.volumes.contains(&(pool.to_string(), name.to_string())) {
            return Err(MonounitError::NotFound(format!("volume {name} in pool {pool}")));
        }
        Ok(VolumeInfo {
            name: name.to_string(),
            used_by: state.used_by(pool, name),
        })
    }

    async fn delete_volume(&self, pool: &str, name: &str) -> MonounitResult<()> {
        let mut state = self.check("delete_volume")?;
        let used_by = state.used_by(pool, name);
        if !used_by.is_empty() {
            return Err(MonounitError::Conflict(format!(
                "volume {name} is still used by {}",
                used_by.join(", ")
            )));
        }
        if !state.volumes.remove(&(pool.to_string(), name.to_string())) {
            return Err(MonounitError::NotFound(format!("volume {name} in pool {pool}")));
        }
        Ok(())
    }

    async fn add_certificate(&self, certificate_pem: &str, password: &str) -> MonounitResult<()> {
        let mut state = self.check("add_certificate")?;
        if state.trust_password.as_deref() != Some(password) {
            return Err(MonounitError::Operation(
                "not authorized: wrong trust password".to_string(),
            ));
        }
        state.certificates.push(certificate_pem.to_string());
        state.trusted = true;
        Ok(())
    }
}

#[async_trait]
impl Connector for MemoryServer {
    async fn connect(&self) -> MonounitResult<Arc<dyn UnitServer>> {
        self.check("connect")?;
        Ok(Arc::new(self.clone()))
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

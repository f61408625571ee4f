//! A [`UnitServer`] backed by an LXD daemon.

mod transport;

use std::{collections::BTreeMap, path::Path};

use async_trait::async_trait;
use reqwest::Method;
use serde_json::{json, Value};
use walkdir::WalkDir;

use crate::{MonounitError, MonounitResult};

use super::{
    Device, ExecOutput, HostResources, ImageInfo, ImageSource, LaunchRequest, PoolUsage, ServerInfo,
    StateAction, UnitInfo, UnitServer, UnitStatus, VolumeInfo,
};

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use transport::*;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Seconds a stop may take before it is forced.
const STOP_TIMEOUT: i64 = 30;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A handle on one LXD daemon.
#[derive(Debug, Clone)]
pub struct LxdClient {
    transport: Transport,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl LxdClient {
    /// Creates a client over the given transport.
    pub fn new(transport: Transport) -> Self {
        Self { transport }
    }

    /// The transport requests go through.
    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    async fn get(&self, path: &str) -> MonounitResult<Value> {
        self.transport.query(Method::GET, path, None).await
    }

    async fn send(&self, method: Method, path: &str, body: Value) -> MonounitResult<Value> {
        self.transport.query(method, path, Some(&body)).await
    }

    /// Reads an instance, lets `edit` change it and writes it back whole.
    async fn edit_instance<T>(
        &self,
        name: &str,
        edit: impl FnOnce(&mut Value) -> MonounitResult<T> + Send,
    ) -> MonounitResult<T> {
        let path = format!("/1.0/instances/{name}");
        let mut instance = self.get(&path).await?;
        let result = edit(&mut instance)?;
        self.send(Method::PUT, &path, instance).await?;
        Ok(result)
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

fn string_map(value: &Value) -> BTreeMap<String, String> {
    value
        .as_object()
        .map(|map| {
            map.iter()
                .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

fn parse_instance(value: &Value) -> UnitInfo {
    let devices = value["devices"]
        .as_object()
        .map(|map| map.iter().map(|(k, v)| (k.clone(), string_map(v))).collect())
        .unwrap_or_default();

    let ipv4 = value["state"]["network"]["eth0"]["addresses"]
        .as_array()
        .and_then(|addresses| {
            addresses
                .iter()
                .find(|a| a["family"] == "inet")
                .and_then(|a| a["address"].as_str())
                .map(str::to_string)
        });

    UnitInfo {
        name: value["name"].as_str().unwrap_or_default().to_string(),
        status: UnitStatus::from_runtime(value["status"].as_str().unwrap_or_default()),
        ipv4,
        profiles: value["profiles"]
            .as_array()
            .map(|p| p.iter().filter_map(|p| p.as_str().map(str::to_string)).collect())
            .unwrap_or_default(),
        devices,
        config: string_map(&value["config"]),
    }
}

fn image_source(source: &ImageSource) -> Value {
    match source {
        ImageSource::Public { server, alias } => json!({
            "type": "image",
            "mode": "pull",
            "protocol": "simplestreams",
            "server": server,
            "alias": alias,
        }),
        ImageSource::Alias(alias) => json!({ "type": "image", "alias": alias }),
        ImageSource::Fingerprint(fp) => json!({ "type": "image", "fingerprint": fp }),
    }
}

fn devices_of(instance: &mut Value) -> MonounitResult<&mut serde_json::Map<String, Value>> {
    if instance["devices"].is_null() {
        instance["devices"] = json!({});
    }
    instance["devices"]
        .as_object_mut()
        .ok_or_else(|| MonounitError::Operation("instance has malformed devices".into()))
}

/// Last path segment of an API URL, without any query string.
fn url_name(url: &str) -> String {
    let path = url.split('?').next().unwrap_or(url);
    path.rsplit('/').next().unwrap_or(path).to_string()
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl UnitServer for LxdClient {
    async fn server_info(&self) -> MonounitResult<ServerInfo> {
        let info = self.get("/1.0").await?;
        let environment = &info["environment"];
        Ok(ServerInfo {
            trusted: info["auth"] == "trusted",
            architecture: environment["kernel_architecture"]
                .as_str()
                .unwrap_or_default()
                .to_string(),
            version: environment["server_version"]
                .as_str()
                .unwrap_or_default()
                .to_string(),
        })
    }

    async fn list_units(&self) -> MonounitResult<Vec<UnitInfo>> {
        let instances = self.get("/1.0/instances?recursion=2").await?;
        Ok(instances
            .as_array()
            .map(|list| list.iter().map(parse_instance).collect())
            .unwrap_or_default())
    }

    async fn get_unit(&self, name: &str) -> MonounitResult<UnitInfo> {
        let instance = self
            .get(&format!("/1.0/instances/{name}?recursion=1"))
            .await?;
        Ok(parse_instance(&instance))
    }

    async fn launch(&self, request: &LaunchRequest) -> MonounitResult<()> {
        tracing::info!("launching unit {}", request.name);
        let body = json!({
            "name": request.name,
            "type": "container",
            "source": image_source(&request.source),
            "profiles": [request.profile],
            "devices": {
                "root": { "type": "disk", "path": "/", "pool": request.pool },
            },
        });
        self.send(Method::POST, "/1.0/instances", body).await?;

        if let Err(e) = self.change_state(&request.name, StateAction::Start).await {
            tracing::warn!("unit {} did not start, deleting it", request.name);
            if let Err(cleanup) = self.delete_unit(&request.name).await {
                tracing::warn!("could not delete unit {}: {cleanup}", request.name);
            }
            return Err(e);
        }
        Ok(())
    }

    async fn change_state(&self, name: &str, action: StateAction) -> MonounitResult<()> {
        tracing::debug!("{action} unit {name}");
        let body = json!({ "action": action.to_string(), "timeout": STOP_TIMEOUT, "force": false });
        self.send(Method::PUT, &format!("/1.0/instances/{name}/state"), body)
            .await?;
        Ok(())
    }

    async fn delete_unit(&self, name: &str) -> MonounitResult<()> {
        let unit = self.get_unit(name).await?;
        if unit.is_running() {
            let body = json!({ "action": "stop", "timeout": STOP_TIMEOUT, "force": true });
            self.send(Method::PUT, &format!("/1.0/instances/{name}/state"), body)
                .await?;
        }
        self.transport
            .query(Method::DELETE, &format!("/1.0/instances/{name}"), None)
            .await?;
        Ok(())
    }

    async fn exec(
        &self,
        name: &str,
        command: &[String],
        env: &BTreeMap<String, String>,
    ) -> MonounitResult<ExecOutput> {
        tracing::debug!("exec in {name}: {}", command.join(" "));
        self.transport.exec(name, command, env).await
    }

    async fn exec_detached(
        &self,
        name: &str,
        command: &[String],
        env: &BTreeMap<String, String>,
    ) -> MonounitResult<()> {
        tracing::debug!("detached exec in {name}: {}", command.join(" "));
        self.transport.spawn(name, command, env).await
    }

    async fn push(&self, name: &str, source: &Path, target_dir: &str) -> MonounitResult<()> {
        let target_dir = target_dir.trim_end_matches('/');
        let metadata = tokio::fs::symlink_metadata(source).await?;

        if !metadata.is_dir() {
            let file_name = source
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .ok_or_else(|| {
                    MonounitError::Validation(format!("cannot push {}", source.display()))
                })?;
            let kind = if metadata.file_type().is_symlink() {
                EntryKind::Symlink
            } else {
                EntryKind::File
            };
            return self
                .transport
                .write_entry(name, source, &format!("{target_dir}/{file_name}"), kind)
                .await;
        }

        // Parents are visited before their children.
        let entries = WalkDir::new(source)
            .follow_links(false)
            .min_depth(1)
            .into_iter()
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| MonounitError::custom(anyhow::anyhow!(e)))?;

        for entry in entries {
            let relative = entry
                .path()
                .strip_prefix(source)
                .map_err(|e| MonounitError::custom(anyhow::anyhow!(e)))?;
            let target = format!("{}/{}", target_dir, relative.display());
            let file_type = entry.file_type();
            let kind = if file_type.is_dir() {
                EntryKind::Directory
            } else if file_type.is_symlink() {
                EntryKind::Symlink
            } else {
                EntryKind::File
            };
            self.transport
                .write_entry(name, entry.path(), &target, kind)
                .await?;
        }

        Ok(())
    }

    async fn add_device(&self, name: &str, device: &str, config: Device) -> MonounitResult<()> {
        self.edit_instance(name, |instance| {
            let devices = devices_of(instance)?;
            if devices.contains_key(device) {
                return Err(MonounitError::Conflict(format!(
                    "device {device} already exists on unit {name}"
                )));
            }
            devices.insert(device.to_string(), json!(config));
            Ok(())
        })
        .await
    }

    async fn update_device(&self, name: &str, device: &str, config: Device) -> MonounitResult<()> {
        self.edit_instance(name, |instance| {
            let devices = devices_of(instance)?;
            match devices.get_mut(device) {
                Some(existing) => {
                    *existing = json!(config);
                    Ok(())
                }
                None => Err(MonounitError::NotFound(format!(
                    "device {device} on unit {name}"
                ))),
            }
        })
        .await
    }

    async fn remove_device(&self, name: &str, device: &str) -> MonounitResult<Device> {
        self.edit_instance(name, |instance| {
            devices_of(instance)?
                .remove(device)
                .map(|removed| string_map(&removed))
                .ok_or_else(|| MonounitError::NotFound(format!("device {device} on unit {name}")))
        })
        .await
    }

    async fn set_config(
        &self,
        name: &str,
        config: &BTreeMap<String, String>,
    ) -> MonounitResult<()> {
        self.edit_instance(name, |instance| {
            if instance["config"].is_null() {
                instance["config"] = json!({});
            }
            let existing = instance["config"]
                .as_object_mut()
                .ok_or_else(|| MonounitError::Operation("instance has malformed config".into()))?;
            for (key, value) in config {
                existing.insert(key.clone(), json!(value));
            }
            Ok(())
        })
        .await
    }

    async fn publish(&self, name: &str, alias: &str) -> MonounitResult<String> {
        tracing::info!("publishing unit {name} as {alias}");
        let body = json!({
            "source": { "type": "instance", "name": name },
            "aliases": [{ "name": alias }],
            "public": false,
        });
        let op = self.send(Method::POST, "/1.0/images", body).await?;
        op["metadata"]["fingerprint"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| MonounitError::Operation(format!("publish of {name} returned no fingerprint")))
    }

    async fn export_image(&self, fingerprint: &str, dest: &Path) -> MonounitResult<()> {
        self.transport.export_image(fingerprint, dest).await
    }

    async fn import_image(&self, archive: &Path, alias: &str) -> MonounitResult<String> {
        let fingerprint = self.transport.import_image(archive).await?;
        let body = json!({ "name": alias, "target": fingerprint });
        match self.send(Method::POST, "/1.0/images/aliases", body).await {
            Ok(_) => Ok(fingerprint),
            Err(MonounitError::Conflict(_)) => {
                // Point the existing alias at the freshly imported image.
                let body = json!({ "target": fingerprint });
                self.send(Method::PUT, &format!("/1.0/images/aliases/{alias}"), body)
                    .await?;
                Ok(fingerprint)
            }
            Err(e) => Err(e),
        }
    }

    async fn delete_image(&self, fingerprint: &str) -> MonounitResult<()> {
        self.transport
            .query(Method::DELETE, &format!("/1.0/images/{fingerprint}"), None)
            .await?;
        Ok(())
    }

    async fn find_image(&self, alias: &str) -> MonounitResult<Option<ImageInfo>> {
        let target = match self.get(&format!("/1.0/images/aliases/{alias}")).await {
            Ok(entry) => entry["target"].as_str().unwrap_or_default().to_string(),
            Err(MonounitError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        if target.is_empty() {
            return Ok(None);
        }

        let image = self.get(&format!("/1.0/images/{target}")).await?;
        Ok(Some(ImageInfo {
            size: image["size"].as_u64().unwrap_or_default(),
            fingerprint: target,
        }))
    }

    async fn host_resources(&self) -> MonounitResult<HostResources> {
        let resources = self.get("/1.0/resources").await?;
        Ok(HostResources {
            memory_used: resources["memory"]["used"].as_u64().unwrap_or_default(),
            memory_total: resources["memory"]["total"].as_u64().unwrap_or_default(),
            cpu: resources["cpu"]["total"].as_u64().unwrap_or_default() as u32,
        })
    }

    async fn pool_usage(&self, pool: &str) -> MonounitResult<PoolUsage> {
        let resources = self
            .get(&format!("/1.0/storage-pools/{pool}/resources"))
            .await?;
        Ok(PoolUsage {
            used: resources["space"]["used"].as_u64().unwrap_or_default(),
            total: resources["space"]["total"].as_u64().unwrap_or_default(),
        })
    }

    async fn create_volume(&self, pool: &str, name: &str) -> MonounitResult<()> {
        let body = json!({ "name": name, "type": "filesystem", "config": {} });
        self.send(
            Method::POST,
            &format!("/1.0/storage-pools/{pool}/volumes/custom"),
            body,
        )
        .await?;
        Ok(())
    }

    async fn get_volume(&self, pool: &str, name: &str) -> MonounitResult<VolumeInfo> {
        let volume = self
            .get(&format!("/1.0/storage-pools/{pool}/volumes/custom/{name}"))
            .await?;
        Ok(VolumeInfo {
            name: name.to_string(),
            used_by: volume["used_by"]
                .as_array()
                .map(|urls| {
                    urls.iter()
                        .filter_map(Value::as_str)
                        .map(url_name)
                        .collect()
                })
                .unwrap_or_default(),
        })
    }

    async fn delete_volume(&self, pool: &str, name: &str) -> MonounitResult<()> {
        self.transport
            .query(
                Method::DELETE,
                &format!("/1.0/storage-pools/{pool}/volumes/custom/{name}"),
                None,
            )
            .await?;
        Ok(())
    }

    async fn add_certificate(&self, certificate_pem: &str, password: &str) -> MonounitResult<()> {
        // The API wants the bare base64 DER body.
        let certificate: String = certificate_pem
            .lines()
            .filter(|line| !line.starts_with("-----"))
            .collect();
        let body = json!({
            "type": "client",
            "certificate": certificate,
            "password": password,
        });
        self.send(Method::POST, "/1.0/certificates", body).await?;
        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_instance() {
        let value = json!({
            "name": "web",
            "status": "Running",
            "profiles": ["monounit"],
            "config": { "limits.cpu": "2" },
            "devices": {
                "data": { "type": "disk", "pool": "default", "source": "vol_x", "path": "/data" }
            },
            "state": {
                "network": {
                    "eth0": {
                        "addresses": [
                            { "family": "inet6", "address": "fd42::1" },
                            { "family": "inet", "address": "10.0.0.5" }
                        ]
                    }
                }
            }
        });

        let unit = parse_instance(&value);
        assert_eq!(unit.name, "web");
        assert!(unit.is_running());
        assert_eq!(unit.ipv4.as_deref(), Some("10.0.0.5"));
        assert_eq!(unit.disk_devices(), vec!["data"]);
        assert_eq!(unit.config["limits.cpu"], "2");
    }

    #[test]
    fn test_url_name_strips_project() {
        assert_eq!(url_name("/1.0/instances/web?project=default"), "web");
        assert_eq!(url_name("/1.0/instances/api"), "api");
    }

    #[test]
    fn test_public_source_pulls_from_simplestreams() {
        let source = image_source(&ImageSource::Public {
            server: "https://images.example".into(),
            alias: "alpine/3.19".into(),
        });
        assert_eq!(source["protocol"], "simplestreams");
        assert_eq!(source["alias"], "alpine/3.19");
    }
}

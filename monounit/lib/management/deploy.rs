//! The deploy pipeline: an image in, a running, networked and registered unit out.

use std::{
    collections::BTreeMap,
    net::Ipv4Addr,
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
};

use ipnetwork::Ipv4Network;

use crate::{
    config::{BackendKind, ServiceSpec, UnitSpec},
    image::{resolve_image, ImageIdentity, PublicImage, ResolvedImage},
    remote::{parse_remote_name, DEFAULT_REMOTE},
    runtime::{device, ImageInfo, ImageSource, LaunchRequest, UnitServer},
    utils::parse_size,
    MonounitError, MonounitResult,
};

use super::{
    admit,
    build::{
        copy_step, find_private_image, import_stored_image, push_delete_unit, run_step,
        transfer_image,
    },
    AdmissionRequest, Context, Rollback, UnitMetadata, UnitRecord,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Name of the network device every unit gets.
pub const NIC_DEVICE: &str = "eth0";

/// Name of the device passing GPUs through.
pub const GPU_DEVICE: &str = "gpu";

const BRIDGE_PREFIX_LEN: u8 = 24;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Where a deployed unit's image comes from, once resolved.
enum DeploySource {
    Local(ImageIdentity),
    Public(PublicImage),
    Private {
        source: Arc<dyn UnitServer>,
        image: ImageInfo,
        alias: String,
    },
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Deploys the service described by the unit spec at `spec_path`.
pub async fn deploy_image(ctx: &Context, spec_path: &Path) -> MonounitResult<UnitRecord> {
    let spec = UnitSpec::load(spec_path).await?;
    let source_dir = spec_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    deploy_service(ctx, &spec.service, &source_dir).await
}

/// Creates, configures and registers the unit `service` describes.
///
/// A `remote:name` unit name deploys onto that saved remote; an unknown remote fails with
/// `NotFound`. Validation and admission run before anything is changed on the backend. Once the
/// unit has been launched, any failure deletes it again along with the image imported for it.
pub async fn deploy_service(
    ctx: &Context,
    service: &ServiceSpec,
    source_dir: &Path,
) -> MonounitResult<UnitRecord> {
    service.validate_deploy()?;
    let (remote, name) = parse_remote_name(&service.name);
    let settings = ctx.get_settings();
    let ram = parse_size(&service.resources.ram())?;
    if let Some(ip) = &service.ip {
        check_bridge_subnet(ip, &settings.network.bridge)?;
    }

    let server = ctx.connect_remote(remote).await?;

    let store = ctx.store();
    let resolved = resolve_image(
        &service.image_reference(),
        None,
        &store,
        ctx.get_catalog().as_ref(),
    )
    .await?;
    let (resolved, image_size) = match resolved {
        ResolvedImage::Local(identity) => {
            let size = store.size_of(&identity).await?;
            (DeploySource::Local(identity), size)
        }
        ResolvedImage::Public(image) => {
            let size = image.size;
            (DeploySource::Public(image), size)
        }
        ResolvedImage::Private { remote, alias } => {
            let (source, image) = find_private_image(ctx, &remote, &alias).await?;
            let size = image.size;
            (
                DeploySource::Private {
                    source,
                    image,
                    alias,
                },
                size,
            )
        }
        ResolvedImage::Repository(reference) => {
            return Err(MonounitError::Validation(format!(
                "{reference} is a unit spec, build it before deploying it"
            )))
        }
    };

    let request = AdmissionRequest::builder()
        .name(name)
        .image_size(image_size)
        .ram(ram)
        .host_ports(service.ports.iter().map(|p| p.get_host()).collect())
        .build();
    ctx.run_stage(
        "checking admission",
        admit(
            server.as_ref(),
            &settings.storage.name,
            ctx.get_address(),
            &request,
        ),
    )
    .await?;

    // The backend is authoritative: records of units that vanished are dropped before a new
    // record is written. Only the default remote is reconciled here.
    if remote == DEFAULT_REMOTE {
        let live: Vec<String> = server
            .list_units()
            .await?
            .into_iter()
            .map(|unit| unit.name)
            .collect();
        ctx.get_registry().reconcile(&live).await?;
    }

    // Units on other remotes are recorded under their qualified name.
    let record_name = match remote {
        DEFAULT_REMOTE => name.to_string(),
        remote => format!("{remote}:{name}"),
    };

    let mut rollback = Rollback::new();
    let result = run_stages(
        ctx,
        &server,
        &mut rollback,
        service,
        (name, &record_name),
        resolved,
        source_dir,
    )
    .await;
    let (record, imported) = rollback.guard(result).await?;
    rollback.commit();

    if let Some(fingerprint) = imported {
        if let Err(e) = server.delete_image(&fingerprint).await {
            tracing::warn!("could not remove transferred image {fingerprint}: {e}");
        }
    }

    tracing::info!("deployed unit {name} on remote {remote}");
    Ok(record)
}

/// Fails with `Validation` when `ip` is outside the bridge's /24.
pub fn check_bridge_subnet(ip: &str, bridge: &str) -> MonounitResult<()> {
    let invalid = |what: &str, value: &str| {
        MonounitError::Validation(format!("{what} {value:?} is not an IPv4 address"))
    };
    let ip = Ipv4Addr::from_str(ip).map_err(|_| invalid("unit address", ip))?;
    let bridge = Ipv4Addr::from_str(bridge).map_err(|_| invalid("bridge address", bridge))?;

    let network = Ipv4Network::new(bridge, BRIDGE_PREFIX_LEN)
        .map_err(|e| MonounitError::Validation(e.to_string()))?;
    let network = Ipv4Network::new(network.network(), BRIDGE_PREFIX_LEN)
        .map_err(|e| MonounitError::Validation(e.to_string()))?;

    if !network.contains(ip) || ip == bridge || ip == network.broadcast() {
        return Err(MonounitError::Validation(format!(
            "unit address {ip} is not a usable address of the bridge network {network}"
        )));
    }
    Ok(())
}

/// Configuration keys applied to a unit for `service`.
pub fn unit_config(ctx: &Context, service: &ServiceSpec) -> BTreeMap<String, String> {
    let mut config = BTreeMap::from([
        ("limits.cpu".to_string(), service.resources.cpu().to_string()),
        ("limits.memory".to_string(), service.resources.ram()),
    ]);

    // Ids only map onto the invoking user when the daemon runs on this machine.
    if ctx.get_settings().backend.kind == BackendKind::Lxd {
        config.insert(
            "raw.idmap".to_string(),
            format!("both {} {}", uzers::get_current_uid(), uzers::get_current_gid()),
        );
    }

    if service.docker() {
        config.insert("security.nesting".to_string(), "true".to_string());
    }

    if service.resources.gpu() {
        config.insert("nvidia.runtime".to_string(), "true".to_string());
    }

    config
}

async fn run_stages(
    ctx: &Context,
    server: &Arc<dyn UnitServer>,
    rollback: &mut Rollback,
    service: &ServiceSpec,
    (name, record_name): (&str, &str),
    resolved: DeploySource,
    source_dir: &Path,
) -> MonounitResult<(UnitRecord, Option<String>)> {
    let settings = ctx.get_settings();

    let (source, imported, image) = ctx
        .run_stage("importing image", async {
            match resolved {
                DeploySource::Local(identity) => {
                    let fingerprint =
                        import_stored_image(ctx, server, rollback, &identity).await?;
                    Ok((
                        ImageSource::Fingerprint(fingerprint.clone()),
                        Some(fingerprint),
                        identity.to_string(),
                    ))
                }
                DeploySource::Public(image) => Ok((
                    ImageSource::Public {
                        server: image.server,
                        alias: image.alias.clone(),
                    },
                    None,
                    image.alias,
                )),
                DeploySource::Private {
                    source,
                    image,
                    alias,
                } => {
                    let fingerprint =
                        transfer_image(source.as_ref(), server, rollback, &image, &alias).await?;
                    Ok((
                        ImageSource::Fingerprint(fingerprint.clone()),
                        Some(fingerprint),
                        alias,
                    ))
                }
            }
        })
        .await?;

    ctx.run_stage("launching unit", async {
        let request = LaunchRequest::builder()
            .name(name)
            .source(source)
            .profile(settings.profile.clone())
            .pool(settings.storage.name.clone())
            .build();

        push_delete_unit(rollback, server, name, "unit");
        server.launch(&request).await
    })
    .await?;

    let mut nic = device([
        ("type", "nic"),
        ("nictype", "bridged"),
        ("parent", settings.network.name.as_str()),
        ("name", NIC_DEVICE),
    ]);
    ctx.run_stage(
        "attaching network",
        server.add_device(name, NIC_DEVICE, nic.clone()),
    )
    .await?;

    if let Some(ip) = &service.ip {
        ctx.run_stage("configuring static address", async {
            nic.insert("ipv4.address".to_string(), ip.clone());
            server.update_device(name, NIC_DEVICE, nic).await?;
            server.restart(name).await
        })
        .await?;
    }

    ctx.run_stage("applying resource limits", async {
        server.set_config(name, &unit_config(ctx, service)).await?;
        if service.resources.gpu() {
            server
                .add_device(name, GPU_DEVICE, device([("type", "gpu")]))
                .await?;
        }
        server.restart(name).await
    })
    .await?;

    ctx.run_stage("forwarding ports", async {
        for port in &service.ports {
            let listen = format!("tcp:0.0.0.0:{}", port.get_host());
            let connect = format!("tcp:127.0.0.1:{}", port.get_unit());
            server
                .add_device(
                    name,
                    &port.device_name(name),
                    device([
                        ("type", "proxy"),
                        ("listen", listen.as_str()),
                        ("connect", connect.as_str()),
                    ]),
                )
                .await?;
        }
        Ok(())
    })
    .await?;

    if !service.postdeploy.is_empty() {
        ctx.run_stage("running post-deploy steps", async {
            for step in &service.postdeploy.copy {
                copy_step(server.as_ref(), name, step, source_dir).await?;
            }
            for step in &service.postdeploy.run {
                run_step(server.as_ref(), name, step).await?;
            }
            Ok(())
        })
        .await?;
    }

    let metadata = UnitMetadata {
        ip: service.ip.clone().unwrap_or_default(),
        image,
        cpu: service.resources.cpu(),
        ram: service.resources.ram(),
    };

    // The record is the last change, so a cancellation is not observed after it is written.
    ctx.check_cancelled()?;
    tracing::info!("registering unit");
    let record = ctx.get_registry().insert(record_name, &metadata).await?;

    Ok((record, imported))
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

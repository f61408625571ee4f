//! Host-level operations outside the pipelines: storage reconfiguration, unit lifecycle,
//! publishing units as images and the local image store.

use std::path::Path;

use chrono::Utc;

use crate::{
    backend::LxcCli,
    config::storage_pool_name,
    image::{normalize_architecture, ImageIdentity, StoredImage},
    runtime::{UnitInfo, UnitServer},
    utils::parse_size,
    MonounitError, MonounitResult,
};

use super::{export_to_store, BuiltImage, Context, Rollback, UnitRecord};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

const PUBLISH_VERSION_FORMAT: &str = "%Y%m%d%H%M%S";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A runtime unit together with its registry record, when it has one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitSummary {
    /// The unit as the backend reports it.
    pub unit: UnitInfo,

    /// What the unit was deployed with. Units created outside monounit have none.
    pub record: Option<UnitRecord>,
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Replaces the storage pool with a fresh one of `size` and persists the new settings.
///
/// Refused while any unit exists since their root disks live in the old pool.
pub async fn configure(ctx: &Context, size: &str) -> MonounitResult<crate::config::HostSettings> {
    parse_size(size)?;
    let server = ctx.connect().await?;
    let units = server.list_units().await?;
    if !units.is_empty() {
        return Err(MonounitError::Conflict(format!(
            "{} unit(s) exist, remove them before reconfiguring storage",
            units.len()
        )));
    }

    let mut settings = ctx.get_settings().clone();
    let cli = LxcCli::for_settings(&settings)?;
    let old_pool = settings.storage.name.clone();
    let new_pool = storage_pool_name(&settings.profile);

    cli.create_pool(&new_pool, &settings.storage.driver, size)
        .await?;

    let mut rollback = Rollback::new();
    {
        let (cli, pool) = (cli.clone(), new_pool.clone());
        rollback.push(format!("delete pool {new_pool}"), move || async move {
            cli.lxc(&["storage", "delete", &pool]).await.map(|_| ())
        });
    }
    let result = cli.set_profile_root(&settings.profile, &new_pool).await;
    rollback.guard(result).await?;
    rollback.commit();

    if let Err(e) = cli.lxc(&["storage", "delete", &old_pool]).await {
        tracing::warn!("could not delete old pool {old_pool}: {e}");
    }

    settings.storage.name = new_pool;
    settings.storage.size = size.to_string();
    settings.save(ctx.get_layout().settings_file()).await?;

    tracing::info!(
        "storage reconfigured: pool {} of {size}",
        settings.storage.name
    );
    Ok(settings)
}

/// Starts a unit.
pub async fn start_unit(ctx: &Context, name: &str) -> MonounitResult<()> {
    ctx.connect().await?.start(name).await?;
    tracing::info!("started unit {name}");
    Ok(())
}

/// Stops a unit.
pub async fn stop_unit(ctx: &Context, name: &str) -> MonounitResult<()> {
    ctx.connect().await?.stop(name).await?;
    tracing::info!("stopped unit {name}");
    Ok(())
}

/// Deletes a unit and its registry record.
///
/// Refused with `Conflict` while shares are mounted in the unit.
pub async fn delete_unit(ctx: &Context, name: &str) -> MonounitResult<()> {
    let server = ctx.connect().await?;
    let unit = server.get_unit(name).await?;

    let disks = unit.disk_devices();
    if !disks.is_empty() {
        return Err(MonounitError::Conflict(format!(
            "unit {name} has mounted disks ({}), unmount them first",
            disks.join(", ")
        )));
    }

    server.delete_unit(name).await?;
    match ctx.get_registry().delete_by_name(name).await {
        Ok(()) | Err(MonounitError::NotFound(_)) => {}
        Err(e) => return Err(e),
    }

    tracing::info!("deleted unit {name}");
    Ok(())
}

/// Lists the backend's units joined with their registry records.
pub async fn list_units(ctx: &Context) -> MonounitResult<Vec<UnitSummary>> {
    let units = ctx.connect().await?.list_units().await?;
    let records = ctx.get_registry().list().await?;

    Ok(units
        .into_iter()
        .map(|unit| {
            let record = records
                .iter()
                .find(|r| r.name.eq_ignore_ascii_case(&unit.name))
                .cloned();
            UnitSummary { unit, record }
        })
        .collect())
}

/// Publishes a unit into the local store as `<unit>/<timestamp>/<arch>`.
///
/// A running unit is stopped for the snapshot and started again afterwards.
pub async fn publish_unit(ctx: &Context, name: &str) -> MonounitResult<BuiltImage> {
    let server = ctx.connect().await?;
    let unit = server.get_unit(name).await?;
    let architecture = server.server_info().await?.architecture;
    let identity = publish_identity(name, &architecture)?;

    let was_running = unit.is_running();
    if was_running {
        server.stop(name).await?;
    }

    let result = publish_and_export(ctx, server.as_ref(), name, &identity).await;

    if was_running {
        if let Err(e) = server.start(name).await {
            tracing::warn!("could not restart unit {name}: {e}");
        }
    }

    let built = result?;
    tracing::info!("published unit {name} as {identity}");
    Ok(built)
}

/// Identity a unit is published under.
pub fn publish_identity(unit: &str, architecture: &str) -> MonounitResult<ImageIdentity> {
    let version = Utc::now().format(PUBLISH_VERSION_FORMAT).to_string();
    let identity = ImageIdentity::new(unit, version, normalize_architecture(architecture));
    ImageIdentity::parse(&identity.to_string())
}

async fn publish_and_export(
    ctx: &Context,
    server: &dyn UnitServer,
    name: &str,
    identity: &ImageIdentity,
) -> MonounitResult<BuiltImage> {
    let fingerprint = server.publish(name, &identity.basename()).await?;
    let exported = export_to_store(server, &fingerprint, &ctx.store(), identity).await;

    if let Err(e) = server.delete_image(&fingerprint).await {
        tracing::warn!("could not remove published image {fingerprint}: {e}");
    }
    exported
}

/// Lists the local store.
pub async fn list_images(ctx: &Context) -> MonounitResult<Vec<StoredImage>> {
    ctx.store().list().await
}

/// Copies an external archive into the store, naming it after its file name.
pub async fn import_image(ctx: &Context, archive: &Path) -> MonounitResult<ImageIdentity> {
    ctx.store().import(archive, None).await
}

/// Removes an archive from the store.
pub async fn delete_image(ctx: &Context, reference: &str) -> MonounitResult<()> {
    let identity = ImageIdentity::parse(reference)?;
    ctx.store().delete(&identity).await?;
    tracing::info!("deleted image {identity}");
    Ok(())
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_identity() -> anyhow::Result<()> {
        let identity = publish_identity("web-1", "x86_64")?;
        assert_eq!(identity.name, "web-1");
        assert_eq!(identity.architecture, "amd64");
        assert_eq!(identity.version.len(), 14);
        assert!(identity.version.chars().all(|c| c.is_ascii_digit()));
        Ok(())
    }
}

//! Directories shared between units, or from the host into a unit.
//!
//! A unit-to-unit share is backed by a custom volume in the storage pool, attached as a disk
//! device to both units. The volume lives exactly as long as some unit still uses it.

use std::{fmt, path::PathBuf, str::FromStr, sync::Arc};

use crate::{
    runtime::{device, Device, UnitServer},
    utils::{clean_unit_path, short_digest},
    MonounitError, MonounitResult,
};

use super::{Context, Rollback};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Prefix of the names of volumes backing shares.
pub const VOLUME_PREFIX: &str = "vol_";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Where a mount's content comes from: `UNIT:path` or a host path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountSource {
    /// A directory of another unit, shared through a volume.
    Unit {
        /// The unit owning the directory.
        unit: String,

        /// Cleaned path inside that unit.
        path: String,
    },

    /// A directory on the machine running the daemon.
    Host(PathBuf),
}

/// The result of removing a mount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unmounted {
    /// The device that was removed.
    pub device: String,

    /// The backing volume, when it was deleted because nothing uses it anymore.
    pub deleted_volume: Option<String>,
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Name of the volume sharing `path` of `unit`.
pub fn volume_name(unit: &str, path: &str) -> String {
    format!(
        "{VOLUME_PREFIX}{}",
        short_digest(&format!("{unit}{}", clean_unit_path(path)))
    )
}

/// Name of the disk device mounting something at `path` in `unit`.
pub fn mount_device_name(unit: &str, path: &str) -> String {
    short_digest(&format!("{unit}{}", clean_unit_path(path)))
}

/// Mounts `source` at `dest_path` in `dest_unit`.
///
/// For a unit source the volume is created when needed and attached to the source unit first.
/// If attaching it to the destination then fails, the source attachment (and a volume created
/// for this call) is removed again before the error is returned.
pub async fn mount(
    ctx: &Context,
    source: &str,
    dest_unit: &str,
    dest_path: &str,
) -> MonounitResult<()> {
    let source: MountSource = source.parse()?;
    let dest_path = clean_unit_path(dest_path);
    let server = ctx.connect().await?;
    server.get_unit(dest_unit).await?;

    match source {
        MountSource::Host(host_path) => {
            let host_path = host_path.to_string_lossy().to_string();
            server
                .add_device(
                    dest_unit,
                    &mount_device_name(dest_unit, &dest_path),
                    device([
                        ("type", "disk"),
                        ("source", host_path.as_str()),
                        ("path", dest_path.as_str()),
                    ]),
                )
                .await?;
            tracing::info!("mounted {host_path} at {dest_unit}:{dest_path}");
            Ok(())
        }
        MountSource::Unit { unit, path } => {
            server.get_unit(&unit).await?;
            let pool = ctx.get_settings().storage.name.clone();
            let volume = volume_name(&unit, &path);

            let mut rollback = Rollback::new();
            let result = share_volume(
                &server,
                &mut rollback,
                &pool,
                &volume,
                (&unit, &path),
                (dest_unit, &dest_path),
            )
            .await;
            rollback.guard(result).await?;
            rollback.commit();

            tracing::info!("shared {unit}:{path} at {dest_unit}:{dest_path} through {volume}");
            Ok(())
        }
    }
}

/// Removes the mount at `target` in `unit`, deleting its volume once no unit uses it.
pub async fn umount(ctx: &Context, unit: &str, target: &str) -> MonounitResult<Unmounted> {
    let target = clean_unit_path(target);
    let device_name = mount_device_name(unit, &target);
    let server = ctx.connect().await?;

    let removed = server.remove_device(unit, &device_name).await?;
    let mut unmounted = Unmounted {
        device: device_name,
        deleted_volume: None,
    };

    let (Some(pool), Some(volume)) = (removed.get("pool"), removed.get("source")) else {
        tracing::info!("unmounted {unit}:{target}");
        return Ok(unmounted);
    };

    let info = server.get_volume(pool, volume).await?;
    if info.used_by.is_empty() {
        server.delete_volume(pool, volume).await?;
        tracing::info!("deleted volume {volume}, no unit uses it anymore");
        unmounted.deleted_volume = Some(volume.clone());
    } else {
        tracing::debug!("volume {volume} still used by {}", info.used_by.join(", "));
    }

    tracing::info!("unmounted {unit}:{target}");
    Ok(unmounted)
}

async fn share_volume(
    server: &Arc<dyn UnitServer>,
    rollback: &mut Rollback,
    pool: &str,
    volume: &str,
    (source_unit, source_path): (&str, &str),
    (dest_unit, dest_path): (&str, &str),
) -> MonounitResult<()> {
    match server.get_volume(pool, volume).await {
        Ok(_) => tracing::debug!("reusing volume {volume}"),
        Err(MonounitError::NotFound(_)) => {
            server.create_volume(pool, volume).await?;
            let (undo_server, undo_pool, undo_volume) =
                (server.clone(), pool.to_string(), volume.to_string());
            rollback.push(format!("delete volume {volume}"), move || async move {
                undo_server.delete_volume(&undo_pool, &undo_volume).await
            });
        }
        Err(e) => return Err(e),
    }

    let source_device = mount_device_name(source_unit, source_path);
    match server
        .add_device(
            source_unit,
            &source_device,
            volume_device(pool, volume, source_path),
        )
        .await
    {
        Ok(()) => {
            let (undo_server, undo_unit, undo_device) =
                (server.clone(), source_unit.to_string(), source_device.clone());
            rollback.push(
                format!("detach {volume} from {source_unit}"),
                move || async move {
                    undo_server
                        .remove_device(&undo_unit, &undo_device)
                        .await
                        .map(|_| ())
                },
            );
        }
        // Already shared from this unit before.
        Err(MonounitError::Conflict(_)) => {
            tracing::debug!("{source_unit}:{source_path} is already attached to {volume}")
        }
        Err(e) => return Err(e),
    }

    server
        .add_device(
            dest_unit,
            &mount_device_name(dest_unit, dest_path),
            volume_device(pool, volume, dest_path),
        )
        .await
}

fn volume_device(pool: &str, volume: &str, path: &str) -> Device {
    device([
        ("type", "disk"),
        ("pool", pool),
        ("source", volume),
        ("path", path),
    ])
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl FromStr for MountSource {
    type Err = MonounitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        match parts.as_slice() {
            [path] if !path.is_empty() => Ok(MountSource::Host(PathBuf::from(path))),
            [unit, path] if !unit.is_empty() && !path.is_empty() => Ok(MountSource::Unit {
                unit: unit.to_string(),
                path: clean_unit_path(path),
            }),
            _ => Err(MonounitError::Validation(format!(
                "invalid mount source {s:?}: expected [UNIT:]path"
            ))),
        }
    }
}

impl fmt::Display for MountSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MountSource::Unit { unit, path } => write!(f, "{unit}:{path}"),
            MountSource::Host(path) => write!(f, "{}", path.display()),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mount_source_parse() -> anyhow::Result<()> {
        assert_eq!(
            "db:/var/lib/data/".parse::<MountSource>()?,
            MountSource::Unit {
                unit: "db".into(),
                path: "/var/lib/data".into()
            }
        );
        assert_eq!(
            "/srv/share".parse::<MountSource>()?,
            MountSource::Host(PathBuf::from("/srv/share"))
        );

        for invalid in ["a:b:c", "", ":/data", "db:"] {
            assert!(
                matches!(
                    invalid.parse::<MountSource>(),
                    Err(MonounitError::Validation(_))
                ),
                "{invalid:?} should be rejected"
            );
        }
        Ok(())
    }

    #[test]
    fn test_names_ignore_trailing_slashes() {
        assert_eq!(volume_name("db", "/data/"), volume_name("db", "data"));
        assert!(volume_name("db", "/data").starts_with(VOLUME_PREFIX));
        assert_eq!(mount_device_name("db", "/data").len(), 56);
        assert_ne!(mount_device_name("db", "/data"), mount_device_name("api", "/data"));
    }
}

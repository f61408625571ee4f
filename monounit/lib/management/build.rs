//! The build pipeline: a unit spec in, a hashed image archive in the local store out.
//!
//! A build runs through fixed stages on an ephemeral unit: resolve the base image, launch,
//! install packages, copy files, run commands, publish, export and persist. Every mutation on
//! the backend records its undo on a [`Rollback`] stack, so a failed or cancelled build leaves
//! neither the ephemeral unit nor any intermediate image behind.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::Arc,
};

use async_recursion::async_recursion;
use tokio::fs;

use crate::{
    config::{validate_unit_name, CopyStep, RunStep, UnitSpec},
    image::{resolve_image, ImageIdentity, ImageStore, ResolvedImage},
    runtime::{ImageInfo, ImageSource, LaunchRequest, UnitServer},
    utils::clean_unit_path,
    MonounitError, MonounitResult,
};

use super::{check_disk, Context, Rollback};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Prefix of the ephemeral units builds run in.
pub const BUILD_UNIT_PREFIX: &str = "build-";

const PARTIAL_EXTENSION: &str = ".partial";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// An archive written to the local store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltImage {
    /// Identity the archive is stored under.
    pub identity: ImageIdentity,

    /// Archive path.
    pub path: PathBuf,

    /// Hex SHA-256 of the archive, computed when it was exported.
    pub hash: String,

    /// Archive size in bytes.
    pub size: u64,
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Builds the unit spec at `spec_path`. Copy sources are relative to the spec's directory.
pub async fn build_image(ctx: &Context, spec_path: &Path) -> MonounitResult<BuiltImage> {
    let spec = UnitSpec::load(spec_path).await?;
    let source_dir = spec_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    build_spec(ctx, &spec, &source_dir).await
}

/// Builds `spec` into the local store.
///
/// Fails with `Conflict` when the target image is already stored or the ephemeral unit name is
/// taken. A base image kept in a spec repository is built first when it is not stored yet.
#[async_recursion]
pub async fn build_spec(
    ctx: &Context,
    spec: &UnitSpec,
    source_dir: &Path,
) -> MonounitResult<BuiltImage> {
    // ValidateSpec
    spec.validate_build()?;
    let identity = ImageIdentity::parse(&spec.service.image_reference())?;
    let unit = ephemeral_unit_name(&identity);
    validate_unit_name(&unit)?;

    let store = ctx.store();
    if store.contains(&identity).await? {
        return Err(MonounitError::Conflict(format!(
            "image {identity} already exists"
        )));
    }

    let server = ctx.connect().await?;
    if server.unit_exists(&unit).await? {
        return Err(MonounitError::Conflict(format!(
            "build unit {unit} already exists, remove it before building {identity}"
        )));
    }

    tracing::info!("building {identity} in {unit}");
    let mut rollback = Rollback::new();
    let result = run_stages(
        ctx,
        &server,
        &mut rollback,
        spec,
        &identity,
        &unit,
        source_dir,
    )
    .await;
    let built = rollback.guard(result).await?;

    // CleanupEphemeral
    tracing::info!("removing build artifacts of {identity}");
    rollback.unwind().await;

    tracing::info!("built {identity} ({} bytes, sha256 {})", built.size, built.hash);
    Ok(built)
}

/// Name of the ephemeral unit `identity` is built in.
pub fn ephemeral_unit_name(identity: &ImageIdentity) -> String {
    format!(
        "{BUILD_UNIT_PREFIX}{}",
        identity.basename().replace(['_', '.'], "-")
    )
}

/// Exports the backend image `fingerprint` into the store as `identity` and hashes it.
///
/// The archive is written beside its final path and only moved into place once complete. Any
/// failure removes it again, so a stored archive always has its hash.
pub async fn export_to_store(
    server: &dyn UnitServer,
    fingerprint: &str,
    store: &ImageStore,
    identity: &ImageIdentity,
) -> MonounitResult<BuiltImage> {
    if store.contains(identity).await? {
        return Err(MonounitError::Conflict(format!(
            "image {identity} already exists"
        )));
    }

    fs::create_dir_all(store.dir()).await?;
    let path = store.path_of(identity);
    let mut partial = path.as_os_str().to_owned();
    partial.push(PARTIAL_EXTENSION);
    let partial = PathBuf::from(partial);

    let result = async {
        server.export_image(fingerprint, &partial).await?;
        fs::rename(&partial, &path).await?;
        store.write_hash(identity).await
    }
    .await;

    let hash = match result {
        Ok(hash) => hash,
        Err(e) => {
            // The archive must not outlive the failure under either name.
            if let Err(cleanup) = fs::remove_file(&partial).await {
                tracing::debug!("no partial archive to remove: {cleanup}");
            }
            if let Err(cleanup) = store.delete(identity).await {
                tracing::debug!("no archive of {identity} to remove: {cleanup}");
            }
            return Err(e);
        }
    };

    Ok(BuiltImage {
        identity: identity.clone(),
        size: store.size_of(identity).await?,
        path,
        hash,
    })
}

/// Schedules deletion of `unit` on `rollback`. A unit that does not exist by then is fine.
///
/// Pushed before the launch that creates the unit, so a launch that fails half way is undone
/// too.
pub(crate) fn push_delete_unit(
    rollback: &mut Rollback,
    server: &Arc<dyn UnitServer>,
    unit: &str,
    what: &str,
) {
    let undo_server = server.clone();
    let undo_unit = unit.to_string();
    rollback.push(format!("delete {what} {unit}"), move || async move {
        match undo_server.delete_unit(&undo_unit).await {
            Err(MonounitError::NotFound(_)) => Ok(()),
            result => result,
        }
    });
}

/// Imports a stored archive into the backend and returns its fingerprint. The imported image is
/// scheduled for deletion on `rollback`.
pub(crate) async fn import_stored_image(
    ctx: &Context,
    server: &Arc<dyn UnitServer>,
    rollback: &mut Rollback,
    identity: &ImageIdentity,
) -> MonounitResult<String> {
    let archive = ctx.store().path_of(identity);
    let fingerprint = server.import_image(&archive, &identity.basename()).await?;

    let undo_server = server.clone();
    let undo_fingerprint = fingerprint.clone();
    rollback.push(format!("delete imported image {identity}"), move || async move {
        undo_server.delete_image(&undo_fingerprint).await
    });

    tokio::time::sleep(ctx.import_settle()).await;
    Ok(fingerprint)
}

/// Looks `alias` up on the saved remote `remote`. Fails with `NotFound` when either is unknown.
pub(crate) async fn find_private_image(
    ctx: &Context,
    remote: &str,
    alias: &str,
) -> MonounitResult<(Arc<dyn UnitServer>, ImageInfo)> {
    let source = ctx.connect_remote(remote).await?;
    let image = source
        .find_image(alias)
        .await?
        .ok_or_else(|| MonounitError::NotFound(format!("image {alias} on remote {remote}")))?;
    Ok((source, image))
}

/// Copies `image` from `source` into `server` under `alias` and returns its fingerprint there.
/// The copy is scheduled for deletion on `rollback`.
pub(crate) async fn transfer_image(
    source: &dyn UnitServer,
    server: &Arc<dyn UnitServer>,
    rollback: &mut Rollback,
    image: &ImageInfo,
    alias: &str,
) -> MonounitResult<String> {
    let staging = tempfile::tempdir()?;
    let archive = staging.path().join(format!("{}.tar.gz", image.fingerprint));
    tracing::info!("transferring image {alias} ({} bytes)", image.size);
    source.export_image(&image.fingerprint, &archive).await?;

    let fingerprint = server.import_image(&archive, alias).await?;
    let undo_server = server.clone();
    let undo_fingerprint = fingerprint.clone();
    rollback.push(format!("delete transferred image {alias}"), move || async move {
        undo_server.delete_image(&undo_fingerprint).await
    });
    Ok(fingerprint)
}

async fn run_stages(
    ctx: &Context,
    server: &Arc<dyn UnitServer>,
    rollback: &mut Rollback,
    spec: &UnitSpec,
    identity: &ImageIdentity,
    unit: &str,
    source_dir: &Path,
) -> MonounitResult<BuiltImage> {
    let pool = ctx.get_settings().storage.name.clone();

    let source = ctx
        .run_stage(
            "resolving base image",
            resolve_base(ctx, server, rollback, spec, source_dir, &pool),
        )
        .await?;

    ctx.run_stage("launching build unit", async {
        let request = LaunchRequest::builder()
            .name(unit)
            .source(source)
            .profile(ctx.get_settings().profile.clone())
            .pool(pool.clone())
            .build();

        // A launch can create the unit and still fail to start it.
        push_delete_unit(rollback, server, unit, "build unit");
        server.launch(&request).await
    })
    .await?;

    ctx.run_stage("installing packages", install_packages(server, spec, unit))
        .await?;

    ctx.run_stage("copying files", async {
        for step in &spec.copy {
            copy_step(server.as_ref(), unit, step, source_dir).await?;
        }
        Ok(())
    })
    .await?;

    ctx.run_stage("running commands", async {
        for step in &spec.run {
            run_step(server.as_ref(), unit, step).await?;
        }
        Ok(())
    })
    .await?;

    let fingerprint = ctx
        .run_stage("publishing image", async {
            server.stop(unit).await?;
            let fingerprint = server.publish(unit, &identity.basename()).await?;

            let undo_server = server.clone();
            let undo_fingerprint = fingerprint.clone();
            rollback.push(
                format!("delete published image {identity}"),
                move || async move { undo_server.delete_image(&undo_fingerprint).await },
            );
            Ok(fingerprint)
        })
        .await?;

    // The stored archive is the product, so a cancellation is not observed after the export.
    ctx.check_cancelled()?;
    tracing::info!("exporting archive");
    export_to_store(server.as_ref(), &fingerprint, &ctx.store(), identity).await
}

async fn resolve_base(
    ctx: &Context,
    server: &Arc<dyn UnitServer>,
    rollback: &mut Rollback,
    spec: &UnitSpec,
    source_dir: &Path,
    pool: &str,
) -> MonounitResult<ImageSource> {
    let store = ctx.store();
    let resolved = resolve_image(
        &spec.base.image,
        spec.base.location,
        &store,
        ctx.get_catalog().as_ref(),
    )
    .await?;
    tracing::debug!("base {} resolved as {}", spec.base.image, resolved.location());

    let base = match resolved {
        ResolvedImage::Public(image) => {
            check_disk(image.size, &server.pool_usage(pool).await?)?;
            return Ok(ImageSource::Public {
                server: image.server,
                alias: image.alias,
            });
        }
        ResolvedImage::Private { remote, alias } => {
            let (source, image) = find_private_image(ctx, &remote, &alias).await?;
            check_disk(image.size, &server.pool_usage(pool).await?)?;
            let fingerprint =
                transfer_image(source.as_ref(), server, rollback, &image, &alias).await?;
            return Ok(ImageSource::Fingerprint(fingerprint));
        }
        ResolvedImage::Local(identity) => identity,
        ResolvedImage::Repository(reference) => {
            let base_spec = ctx.get_catalog().fetch_spec(&reference).await?;
            let identity = ImageIdentity::parse(&base_spec.service.image_reference())?;
            if !store.contains(&identity).await? {
                tracing::info!("building base {identity} from {reference}");
                build_spec(ctx, &base_spec, source_dir).await?;
            }
            identity
        }
    };

    check_disk(store.size_of(&base).await?, &server.pool_usage(pool).await?)?;
    let fingerprint = import_stored_image(ctx, server, rollback, &base).await?;
    Ok(ImageSource::Fingerprint(fingerprint))
}

async fn install_packages(
    server: &Arc<dyn UnitServer>,
    spec: &UnitSpec,
    unit: &str,
) -> MonounitResult<()> {
    let Some(manager) = spec.packages.manager()? else {
        return Ok(());
    };
    if spec.packages.system.is_empty() {
        return Ok(());
    }

    for command in manager.install_commands(&spec.packages.system) {
        server
            .exec_checked(unit, &command, &BTreeMap::new())
            .await?;
    }
    Ok(())
}

/// Creates the target directory, pushes the source into it, then runs the optional action.
pub(crate) async fn copy_step(
    server: &dyn UnitServer,
    unit: &str,
    step: &CopyStep,
    source_dir: &Path,
) -> MonounitResult<()> {
    let target = clean_unit_path(&step.target);
    let source = source_dir.join(&step.source);
    if !fs::try_exists(&source).await? {
        return Err(MonounitError::NotFound(format!(
            "copy source {}",
            source.display()
        )));
    }

    server
        .exec_checked(
            unit,
            &["mkdir".to_string(), "-p".to_string(), target.clone()],
            &BTreeMap::new(),
        )
        .await?;
    server.push(unit, &source, &target).await?;

    if let Some(action) = step.action.as_deref().filter(|a| !a.trim().is_empty()) {
        server
            .exec_checked(
                unit,
                &["sh".to_string(), "-c".to_string(), action.to_string()],
                &BTreeMap::new(),
            )
            .await?;
    }
    Ok(())
}

/// Runs one command. Detached commands are started and left running.
pub(crate) async fn run_step(
    server: &dyn UnitServer,
    unit: &str,
    step: &RunStep,
) -> MonounitResult<()> {
    if step.detach {
        return server.exec_detached(unit, &step.argv(), &step.env).await;
    }
    server.exec_checked(unit, &step.argv(), &step.env).await?;
    Ok(())
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

use std::path::{Path, PathBuf};

use crate::{
    config::{ComposeService, ComposeSpec, ServiceSpec, UnitSpec},
    image::ImageIdentity,
    remote::parse_remote_name,
    MonounitError, MonounitResult,
};

use super::{build_spec, deploy_service, BuiltImage, Context, UnitRecord};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// What a compose run produced, in the order it happened.
#[derive(Debug, Default)]
pub struct ComposeReport {
    /// Images that were built.
    pub built: Vec<BuiltImage>,

    /// Images that were already stored, so their build was skipped.
    pub skipped: Vec<ImageIdentity>,

    /// Units that were deployed.
    pub deployed: Vec<UnitRecord>,

    /// Base images that were built for other services and removed once the run finished.
    pub discarded: Vec<ImageIdentity>,
}

/// A service after its spec was loaded, merged and checked.
#[derive(Debug)]
struct PlannedService {
    name: String,
    service: ServiceSpec,
    unit_spec: Option<UnitSpec>,
    build_dir: PathBuf,
    deploy_dir: PathBuf,
    build: bool,
    deploy: bool,
    discard: bool,
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Brings up every service of the compose spec at `compose_path`.
///
/// Spec references are relative to the compose file's directory.
pub async fn compose_up(ctx: &Context, compose_path: &Path) -> MonounitResult<ComposeReport> {
    let spec = ComposeSpec::load(compose_path).await?;
    let base_dir = compose_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    run_compose(ctx, &spec, &base_dir).await
}

/// Builds and deploys the services of `spec` in dependency order.
///
/// Every service is loaded and validated before anything is built. A service's pipelines only
/// start once every service it depends on has been built and deployed. The first failure stops
/// the run and removes the units deployed and the images built by it.
pub async fn run_compose(
    ctx: &Context,
    spec: &ComposeSpec,
    base_dir: &Path,
) -> MonounitResult<ComposeReport> {
    let ordering = spec.topological_order()?;
    tracing::info!("compose order: {}", ordering.join(" -> "));

    let mut plan = Vec::with_capacity(ordering.len());
    for name in &ordering {
        if let Some(entry) = spec.services.get(name) {
            plan.push(plan_service(name, entry, base_dir).await?);
        }
    }
    drop_unneeded_bases(ctx, spec, &mut plan).await?;

    let mut report = ComposeReport::default();
    if let Err(e) = run_plan(ctx, &plan, &mut report).await {
        tracing::warn!("compose failed, removing what this run created: {e}");
        undo_compose(ctx, &report).await;
        return Err(e);
    }

    for planned in plan.iter().filter(|p| p.discard) {
        let Some(identity) = built_identity(planned) else {
            continue;
        };
        if !report.built.iter().any(|b| b.identity == identity) {
            continue;
        }

        tracing::info!("{}: discarding base image {identity}", planned.name);
        ctx.store().delete(&identity).await?;
        report.discarded.push(identity);
    }

    Ok(report)
}

async fn plan_service(
    name: &str,
    entry: &ComposeService,
    base_dir: &Path,
) -> MonounitResult<PlannedService> {
    let mut service = entry.service.clone();
    let build = entry.build || entry.base;
    let deploy = !entry.base;

    let (unit_spec, spec_dir) = match &entry.spec {
        Some(reference) => {
            let spec_path = base_dir.join(reference);
            let unit_spec = UnitSpec::load(&spec_path).await?;
            let spec_dir = spec_path
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| base_dir.to_path_buf());
            service.merge(&unit_spec.service);
            (Some(unit_spec), spec_dir)
        }
        None if build => {
            return Err(MonounitError::Validation(format!(
                "service '{name}' asks for a build but references no spec"
            )));
        }
        None => (None, base_dir.to_path_buf()),
    };

    let context = entry.context.as_ref().map(|c| base_dir.join(c));
    let build_dir = context.clone().unwrap_or_else(|| spec_dir.clone());
    let deploy_dir = context.unwrap_or(spec_dir);

    if build {
        if let Some(unit_spec) = &unit_spec {
            unit_spec.validate_build().map_err(|e| in_service(name, e))?;
            ImageIdentity::parse(&unit_spec.service.image_reference())
                .map_err(|e| in_service(name, e))?;
        }
    }
    if deploy {
        service.validate_deploy().map_err(|e| in_service(name, e))?;
    }

    Ok(PlannedService {
        name: name.to_string(),
        service,
        unit_spec,
        build_dir,
        deploy_dir,
        build,
        deploy,
        discard: entry.base && !entry.build,
    })
}

/// Removes base-only services that no pending build depends on.
///
/// A base-only service is needed while some service that depends on it still has to have its
/// own image built.
async fn drop_unneeded_bases(
    ctx: &Context,
    spec: &ComposeSpec,
    plan: &mut Vec<PlannedService>,
) -> MonounitResult<()> {
    let store = ctx.store();
    let mut unneeded = Vec::new();
    for planned in plan.iter().filter(|p| p.discard) {
        let mut needed = false;
        for dependent in plan.iter().filter(|p| p.build && !p.discard) {
            let depends = spec
                .services
                .get(&dependent.name)
                .is_some_and(|e| e.depends_on.contains(&planned.name));
            if !depends {
                continue;
            }

            match built_identity(dependent) {
                Some(identity) if store.contains(&identity).await? => {}
                _ => {
                    needed = true;
                    break;
                }
            }
        }

        if !needed {
            tracing::info!("{}: no pending build needs this base, skipping", planned.name);
            unneeded.push(planned.name.clone());
        }
    }

    plan.retain(|p| !unneeded.contains(&p.name));
    Ok(())
}

async fn run_plan(
    ctx: &Context,
    plan: &[PlannedService],
    report: &mut ComposeReport,
) -> MonounitResult<()> {
    for planned in plan {
        ctx.check_cancelled()?;
        let name = &planned.name;

        if planned.build {
            if let (Some(unit_spec), Some(identity)) = (&planned.unit_spec, built_identity(planned))
            {
                if ctx.store().contains(&identity).await? {
                    tracing::info!("{name}: image {identity} already exists, skipping build");
                    report.skipped.push(identity);
                } else {
                    tracing::info!("{name}: building {identity}");
                    report
                        .built
                        .push(build_spec(ctx, unit_spec, &planned.build_dir).await?);
                }
            }
        }

        if planned.deploy {
            tracing::info!("{name}: deploying unit {}", planned.service.name);
            report
                .deployed
                .push(deploy_service(ctx, &planned.service, &planned.deploy_dir).await?);
        }
    }

    Ok(())
}

/// Removes the units and images a failed run created, newest first.
async fn undo_compose(ctx: &Context, report: &ComposeReport) {
    for record in report.deployed.iter().rev() {
        let (remote, unit) = parse_remote_name(&record.name);
        match ctx.connect_remote(remote).await {
            Ok(server) => match server.delete_unit(unit).await {
                Ok(()) | Err(MonounitError::NotFound(_)) => {}
                Err(e) => tracing::warn!("could not delete unit {}: {e}", record.name),
            },
            Err(e) => tracing::warn!("could not reach remote {remote}: {e}"),
        }

        match ctx.get_registry().delete_by_name(&record.name).await {
            Ok(()) | Err(MonounitError::NotFound(_)) => {}
            Err(e) => tracing::warn!("could not delete record {}: {e}", record.name),
        }
    }

    let store = ctx.store();
    for built in report.built.iter().rev() {
        if let Err(e) = store.delete(&built.identity).await {
            tracing::warn!("could not delete image {}: {e}", built.identity);
        }
    }
}

fn built_identity(planned: &PlannedService) -> Option<ImageIdentity> {
    let unit_spec = planned.unit_spec.as_ref()?;
    ImageIdentity::parse(&unit_spec.service.image_reference()).ok()
}

fn in_service(name: &str, error: MonounitError) -> MonounitError {
    match error {
        MonounitError::Validation(message) => {
            MonounitError::Validation(format!("service '{name}': {message}"))
        }
        other => other,
    }
}

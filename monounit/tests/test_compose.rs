mod common;

use common::{test_context, write_file};
use monounit::{
    config::ComposeSpec,
    image::ImageIdentity,
    management::{build_image, build_spec, compose_up, run_compose},
    runtime::{MemoryServer, UnitServer},
    ErrorKind,
};
use tempfile::tempdir;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

const API_SPEC: &str = r#"
base:
  image: alpine/3.19
copy:
  - source: bin
    target: /opt/api
service:
  name: api
  image: api/1.0
  resources:
    cpu: 3
"#;

const COMPOSE: &str = r#"
services:
  api:
    spec: api/Unitfile
    build: true
    depends_on: [db]
  db:
    name: db
    image: alpine/3.19
    ip: 10.0.0.30
  web:
    name: web
    image: alpine/3.19
    depends_on: [api, db]
"#;

const RUNTIME_SPEC: &str = r#"
base:
  image: alpine/3.19
run:
  - command: apk
    args: [add, libc6-compat]
service:
  name: runtime
  image: runtime/1.0
"#;

const BASE_COMPOSE: &str = r#"
services:
  runtime:
    spec: runtime/Unitfile
    base: true
  api:
    spec: api/Unitfile
    context: api/src
    build: true
    depends_on: [runtime]
"#;

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[test_log::test(tokio::test)]
async fn test_compose_brings_services_up_in_order() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let server = MemoryServer::new();
    let ctx = test_context(&server, dir.path()).await?;

    write_file(dir.path(), "api/bin/server", "binary").await?;
    write_file(dir.path(), "api/Unitfile", API_SPEC).await?;
    let compose = write_file(dir.path(), "compose.yml", COMPOSE).await?;

    let report = compose_up(&ctx, &compose).await?;

    let deployed: Vec<&str> = report.deployed.iter().map(|r| r.name.as_str()).collect();
    assert_eq!(deployed, vec!["db", "api", "web"]);
    assert_eq!(report.built.len(), 1);
    assert_eq!(report.built[0].identity, ImageIdentity::parse("api/1.0")?);
    assert!(report.skipped.is_empty());

    // Spec values fill in what the compose entry leaves out.
    let api = server.get_unit("api").await?;
    assert_eq!(api.config.get("limits.cpu").map(String::as_str), Some("3"));
    assert_eq!(
        server.unit_file("api", "/opt/api/server").as_deref(),
        Some(b"binary".as_slice())
    );

    let db = server.get_unit("db").await?;
    assert_eq!(db.ipv4.as_deref(), Some("10.0.0.30"));
    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_compose_skips_stored_images() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let server = MemoryServer::new();
    let ctx = test_context(&server, dir.path()).await?;

    write_file(dir.path(), "api/bin/server", "binary").await?;
    let spec = write_file(dir.path(), "api/Unitfile", API_SPEC).await?;
    let compose = write_file(dir.path(), "compose.yml", COMPOSE).await?;
    let built = build_image(&ctx, &spec).await?;

    let report = compose_up(&ctx, &compose).await?;
    assert!(report.built.is_empty());
    assert_eq!(report.skipped, vec![built.identity]);
    assert_eq!(report.deployed.len(), 3);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_compose_cycle_deploys_nothing() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let server = MemoryServer::new();
    let ctx = test_context(&server, dir.path()).await?;

    let spec: ComposeSpec = r#"
services:
  api:
    name: api
    image: alpine/3.19
    depends_on: [auth]
  auth:
    name: auth
    image: alpine/3.19
    depends_on: [api]
  db:
    name: db
    image: alpine/3.19
"#
    .parse()?;

    let err = run_compose(&ctx, &spec, dir.path()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert!(server.unit_names().is_empty());
    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_compose_stops_at_first_failure() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let server = MemoryServer::new();
    let ctx = test_context(&server, dir.path()).await?;

    write_file(dir.path(), "api/bin/server", "binary").await?;
    write_file(dir.path(), "api/Unitfile", API_SPEC).await?;
    let compose = write_file(dir.path(), "compose.yml", COMPOSE).await?;
    server.fail_exec_matching("mkdir -p /opt/api");

    let err = compose_up(&ctx, &compose).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Operation);

    // The dependency that came up before the failure is taken down again.
    assert!(server.unit_names().is_empty());
    assert!(ctx.get_registry().list().await?.is_empty());
    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_compose_failed_deploy_removes_built_images() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let server = MemoryServer::new();
    let ctx = test_context(&server, dir.path()).await?;

    write_file(dir.path(), "api/bin/server", "binary").await?;
    write_file(dir.path(), "api/Unitfile", API_SPEC).await?;
    let compose = write_file(
        dir.path(),
        "compose.yml",
        &COMPOSE.replace("    name: web\n    image: alpine/3.19", "    name: web\n    image: missing/9.9"),
    )
    .await?;

    let err = compose_up(&ctx, &compose).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    assert!(server.unit_names().is_empty());
    assert!(ctx.get_registry().list().await?.is_empty());
    assert!(!ctx.store().contains(&ImageIdentity::parse("api/1.0")?).await?);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_compose_validates_every_service_first() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let server = MemoryServer::new();
    let ctx = test_context(&server, dir.path()).await?;

    let spec: ComposeSpec = r#"
services:
  db:
    name: db
    image: alpine/3.19
  web:
    name: Bad_Name!
    image: alpine/3.19
    depends_on: [db]
"#
    .parse()?;

    let err = run_compose(&ctx, &spec, dir.path()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert!(server.unit_names().is_empty());
    assert!(ctx.get_registry().list().await?.is_empty());
    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_compose_keeps_explicit_default_resources() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let server = MemoryServer::new();
    let ctx = test_context(&server, dir.path()).await?;

    write_file(dir.path(), "api/bin/server", "binary").await?;
    write_file(dir.path(), "api/Unitfile", API_SPEC).await?;
    let compose = write_file(
        dir.path(),
        "compose.yml",
        "services:\n  api:\n    spec: api/Unitfile\n    build: true\n    resources:\n      cpu: 2\n",
    )
    .await?;

    compose_up(&ctx, &compose).await?;

    // The spec asks for 3 CPUs, the compose entry explicitly for the default of 2.
    let api = server.get_unit("api").await?;
    assert_eq!(api.config.get("limits.cpu").map(String::as_str), Some("2"));
    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_compose_base_is_built_for_dependents_then_discarded() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let server = MemoryServer::new();
    let ctx = test_context(&server, dir.path()).await?;

    write_file(dir.path(), "runtime/Unitfile", RUNTIME_SPEC).await?;
    write_file(dir.path(), "api/src/bin/server", "binary").await?;
    write_file(dir.path(), "api/Unitfile", &API_SPEC.replace("alpine/3.19", "runtime/1.0")).await?;
    let compose = write_file(dir.path(), "compose.yml", BASE_COMPOSE).await?;

    let report = compose_up(&ctx, &compose).await?;

    let runtime = ImageIdentity::parse("runtime/1.0")?;
    let built: Vec<&ImageIdentity> = report.built.iter().map(|b| &b.identity).collect();
    assert_eq!(built, vec![&runtime, &ImageIdentity::parse("api/1.0")?]);
    assert_eq!(report.discarded, vec![runtime.clone()]);

    // The base is never deployed and its archive is gone once the run ends.
    let deployed: Vec<&str> = report.deployed.iter().map(|r| r.name.as_str()).collect();
    assert_eq!(deployed, vec!["api"]);
    assert!(!ctx.store().contains(&runtime).await?);

    // The build ran from the context directory rather than the spec's.
    assert_eq!(
        server.unit_file("api", "/opt/api/server").as_deref(),
        Some(b"binary".as_slice())
    );
    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_compose_skips_base_when_dependents_are_stored() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let server = MemoryServer::new();
    let ctx = test_context(&server, dir.path()).await?;

    write_file(dir.path(), "runtime/Unitfile", RUNTIME_SPEC).await?;
    write_file(dir.path(), "api/src/bin/server", "binary").await?;
    write_file(dir.path(), "api/Unitfile", API_SPEC).await?;
    let compose = write_file(dir.path(), "compose.yml", BASE_COMPOSE).await?;

    let api_dir = dir.path().join("api");
    let unit_spec = monounit::config::UnitSpec::load(api_dir.join("Unitfile")).await?;
    build_spec(&ctx, &unit_spec, &api_dir.join("src")).await?;

    let report = compose_up(&ctx, &compose).await?;
    assert!(report.built.is_empty());
    assert!(report.discarded.is_empty());
    assert_eq!(report.skipped, vec![ImageIdentity::parse("api/1.0")?]);
    assert!(!ctx
        .store()
        .contains(&ImageIdentity::parse("runtime/1.0")?)
        .await?);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_compose_build_needs_spec() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let server = MemoryServer::new();
    let ctx = test_context(&server, dir.path()).await?;

    let spec: ComposeSpec = "services:\n  api:\n    name: api\n    image: api/1.0\n    build: true\n"
        .parse()?;
    let err = run_compose(&ctx, &spec, dir.path()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    Ok(())
}

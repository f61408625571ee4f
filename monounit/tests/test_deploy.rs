mod common;

use std::collections::BTreeMap;

use common::{
    free_port, seed_image, test_context, test_context_with, write_file, StaticCatalog, POOL,
    PUBLIC_ALIAS,
};
use monounit::{
    config::{PortForward, ServiceSpec},
    management::{self, build_image, deploy_image, deploy_service, UnitMetadata},
    runtime::{MemoryServer, UnitServer},
    ErrorKind,
};
use tempfile::tempdir;

//--------------------------------------------------------------------------------------------------
// Functions: Helpers
//--------------------------------------------------------------------------------------------------

fn service(name: &str, image: &str) -> anyhow::Result<ServiceSpec> {
    let yaml = format!("name: {name}\nimage: {image}\n");
    Ok(serde_yaml::from_str(&yaml)?)
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[test_log::test(tokio::test)]
async fn test_deploy_public_image() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let server = MemoryServer::new();
    let ctx = test_context(&server, dir.path()).await?;

    let port = free_port()?;
    let mut web = service("web", PUBLIC_ALIAS)?;
    web.ports = vec![format!("80:{port}").parse::<PortForward>()?];
    web.resources.cpu = Some(4);
    web.resources.ram = Some("1GB".to_string());

    let record = deploy_service(&ctx, &web, dir.path()).await?;
    assert_eq!(record.name, "web");
    assert_eq!(record.data.image, PUBLIC_ALIAS);
    assert_eq!(record.data.cpu, 4);

    let unit = server.get_unit("web").await?;
    assert!(unit.is_running());
    assert_eq!(unit.config.get("limits.cpu").map(String::as_str), Some("4"));
    assert_eq!(unit.config.get("limits.memory").map(String::as_str), Some("1GB"));
    assert!(unit.devices.contains_key("eth0"));

    let proxy = unit
        .devices
        .get(&format!("web-proxy-{port}-80"))
        .expect("proxy device");
    assert_eq!(proxy.get("type").map(String::as_str), Some("proxy"));
    assert_eq!(
        proxy.get("listen").map(String::as_str),
        Some(format!("tcp:0.0.0.0:{port}").as_str())
    );
    assert_eq!(
        proxy.get("connect").map(String::as_str),
        Some("tcp:127.0.0.1:80")
    );

    let stored = ctx.get_registry().get_by_name("web").await?;
    assert_eq!(stored.uid, record.uid);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_deploy_static_address() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let server = MemoryServer::new();
    let ctx = test_context(&server, dir.path()).await?;

    let mut db = service("db", PUBLIC_ALIAS)?;
    db.ip = Some("10.0.0.20".to_string());
    deploy_service(&ctx, &db, dir.path()).await?;

    let unit = server.get_unit("db").await?;
    assert_eq!(unit.ipv4.as_deref(), Some("10.0.0.20"));

    let mut outside = service("cache", PUBLIC_ALIAS)?;
    outside.ip = Some("192.168.1.20".to_string());
    let err = deploy_service(&ctx, &outside, dir.path()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert!(!server.unit_names().contains(&"cache".to_string()));
    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_admission_rejects_full_pool() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let server = MemoryServer::new();
    server.set_pool_usage(POOL, 90_000_000_000, 100_000_000_000);
    let ctx = test_context(&server, dir.path()).await?;

    let err = deploy_service(&ctx, &service("web", PUBLIC_ALIAS)?, dir.path())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ResourceExhaustion);
    assert!(server.unit_names().is_empty());
    assert!(ctx.get_registry().list().await?.is_empty());
    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_admission_rejects_bound_port() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let server = MemoryServer::new();
    let ctx = test_context(&server, dir.path()).await?;

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();

    let mut web = service("web", PUBLIC_ALIAS)?;
    web.ports = vec![format!("80:{port}").parse()?];
    let err = deploy_service(&ctx, &web, dir.path()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ResourceExhaustion);
    assert!(server.unit_names().is_empty());
    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_duplicate_unit_is_a_conflict() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let server = MemoryServer::new();
    let ctx = test_context(&server, dir.path()).await?;

    deploy_service(&ctx, &service("web", PUBLIC_ALIAS)?, dir.path()).await?;
    let err = deploy_service(&ctx, &service("web", PUBLIC_ALIAS)?, dir.path())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert_eq!(ctx.get_registry().list().await?.len(), 1);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_unknown_image_is_not_found() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let server = MemoryServer::new();
    let ctx = test_context(&server, dir.path()).await?;

    let err = deploy_service(&ctx, &service("web", "nothing/9.9")?, dir.path())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_failed_deploy_removes_unit_and_image() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let server = MemoryServer::new();
    let ctx = test_context(&server, dir.path()).await?;

    write_file(dir.path(), "app/run.sh", "#!/bin/sh\n").await?;
    let spec = write_file(
        dir.path(),
        "Unitfile",
        "base:\n  image: alpine/3.19\ncopy:\n  - source: app\n    target: /srv\nservice:\n  name: web\n  image: web/1.0\n",
    )
    .await?;
    build_image(&ctx, &spec).await?;

    server.fail_on("add_device", "bridge is gone");
    let err = deploy_image(&ctx, &spec).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Operation);

    assert!(server.unit_names().is_empty());
    assert!(server.image_fingerprints().is_empty());
    assert!(ctx.get_registry().list().await?.is_empty());
    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_deploy_local_image_runs_postdeploy() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let server = MemoryServer::new();
    let ctx = test_context(&server, dir.path()).await?;

    write_file(dir.path(), "app/run.sh", "#!/bin/sh\n").await?;
    write_file(dir.path(), "conf/app.env", "MODE=prod\n").await?;
    let spec = write_file(
        dir.path(),
        "Unitfile",
        r#"
base:
  image: alpine/3.19
copy:
  - source: app
    target: /srv
service:
  name: api
  image: api/1.0
  postdeploy:
    copy:
      - source: conf
        target: /etc/api
    run:
      - command: /srv/run.sh
"#,
    )
    .await?;
    let built = build_image(&ctx, &spec).await?;

    let record = deploy_image(&ctx, &spec).await?;
    assert_eq!(record.data.image, built.identity.to_string());

    // The imported copy is dropped once the unit runs on it.
    assert!(server.image_fingerprints().is_empty());
    assert_eq!(
        server.unit_file("api", "/srv/run.sh").as_deref(),
        Some(b"#!/bin/sh\n".as_slice())
    );
    assert_eq!(
        server.unit_file("api", "/etc/api/app.env").as_deref(),
        Some(b"MODE=prod\n".as_slice())
    );
    assert!(server
        .exec_log()
        .iter()
        .any(|(unit, command)| unit == "api" && command == &["/srv/run.sh"]));
    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_deploy_drops_records_of_vanished_units() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let server = MemoryServer::new();
    let ctx = test_context(&server, dir.path()).await?;

    let stale = UnitMetadata {
        ip: String::new(),
        image: PUBLIC_ALIAS.to_string(),
        cpu: 2,
        ram: "2GB".to_string(),
    };
    ctx.get_registry().insert("ghost", &stale).await?;

    deploy_service(&ctx, &service("web", PUBLIC_ALIAS)?, dir.path()).await?;

    let names: Vec<String> = management::list_units(&ctx)
        .await?
        .into_iter()
        .filter_map(|summary| summary.record.map(|r| r.name))
        .collect();
    assert_eq!(names, vec!["web".to_string()]);
    assert!(ctx.get_registry().get_by_name("ghost").await.is_err());
    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_unit_that_fails_to_start_is_not_recorded() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let server = MemoryServer::new();
    server.fail_start("cgroup limits rejected");
    let ctx = test_context(&server, dir.path()).await?;

    let err = deploy_service(&ctx, &service("web", PUBLIC_ALIAS)?, dir.path())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Operation);
    assert!(server.unit_names().is_empty());
    assert!(ctx.get_registry().list().await?.is_empty());
    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_deploy_to_named_remote() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let server = MemoryServer::new();
    let lab = MemoryServer::new();
    let ctx = test_context_with(
        &server,
        dir.path(),
        StaticCatalog::default(),
        BTreeMap::from([("lab", &lab)]),
    )
    .await?;

    let record = deploy_service(&ctx, &service("lab:web", PUBLIC_ALIAS)?, dir.path()).await?;
    assert_eq!(record.name, "lab:web");

    assert!(server.unit_names().is_empty());
    assert_eq!(lab.unit_names(), vec!["web".to_string()]);
    assert!(lab.get_unit("web").await?.is_running());

    // A later deploy on the default remote keeps the other remote's record.
    deploy_service(&ctx, &service("api", PUBLIC_ALIAS)?, dir.path()).await?;
    let mut names: Vec<String> = ctx
        .get_registry()
        .list()
        .await?
        .into_iter()
        .map(|r| r.name)
        .collect();
    names.sort();
    assert_eq!(names, vec!["api".to_string(), "lab:web".to_string()]);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_deploy_to_unknown_remote_is_not_found() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let server = MemoryServer::new();
    let ctx = test_context(&server, dir.path()).await?;

    let err = deploy_service(&ctx, &service("nosuchremote:web", PUBLIC_ALIAS)?, dir.path())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert!(server.unit_names().is_empty());
    assert!(ctx.get_registry().list().await?.is_empty());
    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_deploy_private_image_from_remote() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let server = MemoryServer::new();
    let lab = MemoryServer::new();
    let fingerprint = seed_image(&lab, "web/1.0").await?;
    let ctx = test_context_with(
        &server,
        dir.path(),
        StaticCatalog::default(),
        BTreeMap::from([("lab", &lab)]),
    )
    .await?;

    let record = deploy_service(&ctx, &service("web", "lab:web/1.0")?, dir.path()).await?;
    assert_eq!(record.name, "web");
    assert!(server.get_unit("web").await?.is_running());

    // The remote's image is copied, not moved.
    assert_eq!(lab.image_fingerprints(), vec![fingerprint]);
    assert!(lab.unit_names().is_empty());
    Ok(())
}

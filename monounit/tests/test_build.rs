mod common;

use std::{collections::BTreeMap, io::Read, time::Duration};

use common::{seed_image, test_context, test_context_with, write_file, StaticCatalog, POOL};
use flate2::read::GzDecoder;
use monounit::{
    config::UnitSpec,
    image::ImageIdentity,
    management::{self, build_image},
    runtime::MemoryServer,
    ErrorKind, MonounitError,
};
use tempfile::tempdir;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

const WEB_SPEC: &str = r#"
base:
  image: alpine/3.19
copy:
  - source: app
    target: /srv/app
run:
  - command: make
    args: [install]
service:
  name: web
  image: web/1.0
"#;

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[test_log::test(tokio::test)]
async fn test_build_stores_hashed_archive() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let server = MemoryServer::new();
    let ctx = test_context(&server, dir.path()).await?;

    write_file(dir.path(), "app/index.html", "<h1>hello</h1>").await?;
    let spec = write_file(dir.path(), "Unitfile", WEB_SPEC).await?;

    let built = build_image(&ctx, &spec).await?;
    assert_eq!(built.identity, ImageIdentity::parse("web/1.0")?);
    assert!(built.path.exists());

    // The stored hash is the one computed at export time.
    let images = management::list_images(&ctx).await?;
    assert_eq!(images.len(), 1);
    assert_eq!(images[0].hash, built.hash);
    assert_eq!(images[0].size, built.size);

    // Nothing is left behind on the backend.
    assert!(server.unit_names().is_empty());
    assert!(server.image_fingerprints().is_empty());

    // The copied file made it into the archive and the run step ran in the build unit.
    let archive = tokio::fs::read(&built.path).await?;
    let mut tar = tar::Archive::new(GzDecoder::new(archive.as_slice()));
    let mut found = None;
    for entry in tar.entries()? {
        let mut entry = entry?;
        if entry.path()?.to_string_lossy() == "rootfs/srv/app/index.html" {
            let mut content = String::new();
            entry.read_to_string(&mut content)?;
            found = Some(content);
        }
    }
    assert_eq!(found.as_deref(), Some("<h1>hello</h1>"));
    assert!(server
        .exec_log()
        .iter()
        .any(|(unit, command)| unit.starts_with("build-") && command == &["make", "install"]));

    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_build_refuses_existing_image() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let server = MemoryServer::new();
    let ctx = test_context(&server, dir.path()).await?;

    write_file(dir.path(), "app/index.html", "hi").await?;
    let spec = write_file(dir.path(), "Unitfile", WEB_SPEC).await?;
    build_image(&ctx, &spec).await?;

    let err = build_image(&ctx, &spec).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert_eq!(management::list_images(&ctx).await?.len(), 1);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_failed_build_leaves_nothing_behind() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let server = MemoryServer::new();
    server.fail_exec_matching("make install");
    let ctx = test_context(&server, dir.path()).await?;

    write_file(dir.path(), "app/index.html", "hi").await?;
    let spec = write_file(dir.path(), "Unitfile", WEB_SPEC).await?;

    let err = build_image(&ctx, &spec).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Operation);

    assert!(server.unit_names().is_empty());
    assert!(server.image_fingerprints().is_empty());
    assert!(management::list_images(&ctx).await?.is_empty());

    let mut leftovers = tokio::fs::read_dir(ctx.store().dir()).await?;
    assert!(leftovers.next_entry().await?.is_none());
    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_failed_export_removes_published_image() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let server = MemoryServer::new();
    server.fail_on("export_image", "disk full");
    let ctx = test_context(&server, dir.path()).await?;

    write_file(dir.path(), "app/index.html", "hi").await?;
    let spec = write_file(dir.path(), "Unitfile", WEB_SPEC).await?;

    let err = build_image(&ctx, &spec).await.unwrap_err();
    assert!(matches!(err, MonounitError::Operation(ref m) if m.contains("disk full")));
    assert!(server.unit_names().is_empty());
    assert!(server.image_fingerprints().is_empty());
    assert!(management::list_images(&ctx).await?.is_empty());
    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_cancelled_build_stops_before_launch() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let server = MemoryServer::new();
    let ctx = test_context(&server, dir.path()).await?;

    write_file(dir.path(), "app/index.html", "hi").await?;
    let spec = write_file(dir.path(), "Unitfile", WEB_SPEC).await?;

    ctx.get_cancel().cancel();
    let err = build_image(&ctx, &spec).await.unwrap_err();
    assert!(err.is_cancelled());
    assert!(server.unit_names().is_empty());
    assert!(server.exec_log().is_empty());
    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_build_checks_disk_before_launch() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let server = MemoryServer::new();
    server.set_pool_usage(POOL, 95_000_000_000, 100_000_000_000);
    let ctx = test_context(&server, dir.path()).await?;

    write_file(dir.path(), "app/index.html", "hi").await?;
    let spec = write_file(dir.path(), "Unitfile", WEB_SPEC).await?;

    let err = build_image(&ctx, &spec).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ResourceExhaustion);
    assert!(server.unit_names().is_empty());
    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_stored_image_reimports_with_same_hash() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let server = MemoryServer::new();
    let ctx = test_context(&server, dir.path()).await?;

    write_file(dir.path(), "app/index.html", "hi").await?;
    let spec = write_file(dir.path(), "Unitfile", WEB_SPEC).await?;
    let built = build_image(&ctx, &spec).await?;

    let copy = dir.path().join(format!("web_2.0_{}.tar.gz", built.identity.architecture));
    tokio::fs::copy(&built.path, &copy).await?;
    let imported = management::import_image(&ctx, &copy).await?;
    assert_eq!(imported.version, "2.0");

    let hash = ctx.store().hash_of(&imported).await?;
    assert_eq!(hash, built.hash);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_unit_that_fails_to_start_is_removed() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let server = MemoryServer::new();
    server.fail_start("no space for rootfs");
    let ctx = test_context(&server, dir.path()).await?;

    write_file(dir.path(), "app/index.html", "hi").await?;
    let spec = write_file(dir.path(), "Unitfile", WEB_SPEC).await?;

    let err = build_image(&ctx, &spec).await.unwrap_err();
    assert!(matches!(err, MonounitError::Operation(ref m) if m.contains("no space for rootfs")));
    assert!(server.unit_names().is_empty());
    assert!(server.exec_log().is_empty());

    // Nothing stands in the way of the next attempt.
    server.clear_start_failure();
    let built = build_image(&ctx, &spec).await?;
    assert_eq!(built.identity, ImageIdentity::parse("web/1.0")?);
    assert!(server.unit_names().is_empty());
    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_cancel_during_launch_removes_unit() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let server = MemoryServer::new();
    server.set_launch_delay(Duration::from_millis(300));
    let ctx = test_context(&server, dir.path()).await?;

    write_file(dir.path(), "app/index.html", "hi").await?;
    let spec = write_file(dir.path(), "Unitfile", WEB_SPEC).await?;

    let (result, _) = tokio::join!(build_image(&ctx, &spec), async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        ctx.get_cancel().cancel();
    });

    let err = result.unwrap_err();
    assert!(err.is_cancelled());
    assert!(server.unit_names().is_empty());
    assert!(server.image_fingerprints().is_empty());
    assert!(server.exec_log().is_empty());
    assert!(management::list_images(&ctx).await?.is_empty());
    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_cancel_during_nested_base_build() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let server = MemoryServer::new();
    server.set_launch_delay(Duration::from_millis(300));

    let base: UnitSpec = "base:\n  image: alpine/3.19\nservice:\n  name: runtime\n  image: runtime/1.0\n"
        .parse()?;
    let catalog = StaticCatalog {
        specs: BTreeMap::from([("github.com/acme/units/runtime".to_string(), base)]),
    };
    let ctx = test_context_with(&server, dir.path(), catalog, BTreeMap::new()).await?;

    write_file(dir.path(), "app/index.html", "hi").await?;
    let spec = write_file(
        dir.path(),
        "Unitfile",
        &WEB_SPEC.replace("alpine/3.19", "github.com/acme/units/runtime"),
    )
    .await?;

    let (result, _) = tokio::join!(build_image(&ctx, &spec), async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        ctx.get_cancel().cancel();
    });

    assert!(result.unwrap_err().is_cancelled());
    assert!(server.unit_names().is_empty());
    assert!(server.image_fingerprints().is_empty());
    assert!(management::list_images(&ctx).await?.is_empty());
    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_unwritable_hash_leaves_no_archive() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let server = MemoryServer::new();
    let ctx = test_context(&server, dir.path()).await?;

    write_file(dir.path(), "app/index.html", "hi").await?;
    let spec = write_file(dir.path(), "Unitfile", WEB_SPEC).await?;

    // A directory where the hash file belongs makes writing the hash fail.
    let identity = ImageIdentity::parse("web/1.0")?;
    let mut sidecar = ctx.store().path_of(&identity).into_os_string();
    sidecar.push(".sha256");
    tokio::fs::create_dir_all(&sidecar).await?;

    assert!(build_image(&ctx, &spec).await.is_err());
    assert!(!ctx.store().contains(&identity).await?);
    assert!(server.unit_names().is_empty());
    assert!(server.image_fingerprints().is_empty());
    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_build_on_private_base_from_remote() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let server = MemoryServer::new();
    let lab = MemoryServer::new();
    let fingerprint = seed_image(&lab, "runtime/1.0").await?;
    let ctx = test_context_with(
        &server,
        dir.path(),
        StaticCatalog::default(),
        BTreeMap::from([("lab", &lab)]),
    )
    .await?;

    write_file(dir.path(), "app/index.html", "hi").await?;
    let spec = write_file(
        dir.path(),
        "Unitfile",
        &WEB_SPEC.replace("alpine/3.19", "lab:runtime/1.0"),
    )
    .await?;

    let built = build_image(&ctx, &spec).await?;
    assert_eq!(built.identity, ImageIdentity::parse("web/1.0")?);

    // The transferred base is gone again and the remote keeps its copy.
    assert!(server.unit_names().is_empty());
    assert!(server.image_fingerprints().is_empty());
    assert_eq!(lab.image_fingerprints(), vec![fingerprint]);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_missing_private_base_fails_before_launch() -> anyhow::Result<()> {
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

    write_file(dir.path(), "app/index.html", "hi").await?;
    let spec = write_file(
        dir.path(),
        "Unitfile",
        &WEB_SPEC.replace("alpine/3.19", "lab:runtime/1.0"),
    )
    .await?;

    let err = build_image(&ctx, &spec).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert!(server.unit_names().is_empty());
    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_detached_step_does_not_fail_build() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let server = MemoryServer::new();
    server.fail_exec_matching("serve --port 80");
    let ctx = test_context(&server, dir.path()).await?;

    write_file(dir.path(), "app/index.html", "hi").await?;
    let spec = write_file(
        dir.path(),
        "Unitfile",
        &WEB_SPEC.replace(
            "    args: [install]\n",
            "    args: [install]\n  - command: serve\n    args: [--port, \"80\"]\n    detach: true\n",
        ),
    )
    .await?;

    build_image(&ctx, &spec).await?;
    let log = server.exec_log();
    assert!(log
        .iter()
        .any(|(_, command)| command == &["serve", "--port", "80"]));
    Ok(())
}

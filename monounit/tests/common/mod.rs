#![allow(dead_code)]

use std::{collections::BTreeMap, path::Path, sync::Arc, time::Duration};

use async_trait::async_trait;
use monounit::{
    config::{BackendKind, HostSettings, UnitSpec},
    image::{ImageCatalog, PublicImage, RepositoryReference},
    management::{Context, Registry},
    runtime::{Connector, ImageSource, LaunchRequest, MemoryServer, UnitServer},
    utils::HomeLayout,
    MonounitError, MonounitResult,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Alias the test catalog knows about.
pub const PUBLIC_ALIAS: &str = "alpine/3.19";

/// Size the test catalog reports for [`PUBLIC_ALIAS`].
pub const PUBLIC_SIZE: u64 = 3_000_000_000;

/// Pool the memory runtime starts with.
pub const POOL: &str = "default";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A catalog with one public image and whatever specs it is given, keyed by reference.
#[derive(Default)]
pub struct StaticCatalog {
    pub specs: BTreeMap<String, UnitSpec>,
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// A context rooted at `dir` that talks to `server`.
pub async fn test_context(server: &MemoryServer, dir: &Path) -> anyhow::Result<Context> {
    test_context_with(server, dir, StaticCatalog::default(), BTreeMap::new()).await
}

/// Like [`test_context`], with a custom catalog and named remotes.
pub async fn test_context_with(
    server: &MemoryServer,
    dir: &Path,
    catalog: StaticCatalog,
    remotes: BTreeMap<&str, &MemoryServer>,
) -> anyhow::Result<Context> {
    let layout = HomeLayout::new(dir.join("home"));
    layout.ensure().await?;

    let mut settings = HostSettings::default_for(BackendKind::Lxd, "tester");
    settings.storage.name = POOL.to_string();

    let registry = Registry::open(layout.registry_db()).await?;

    Ok(Context::builder()
        .layout(layout)
        .settings(settings)
        .connector(Arc::new(server.clone()) as Arc<dyn Connector>)
        .catalog(Arc::new(catalog) as Arc<dyn ImageCatalog>)
        .registry(registry)
        .remotes(
            remotes
                .into_iter()
                .map(|(name, remote)| {
                    (name.to_string(), Arc::new(remote.clone()) as Arc<dyn Connector>)
                })
                .collect(),
        )
        .import_settle(Duration::ZERO)
        .user("tester")
        .address("127.0.0.1")
        .build())
}

/// Writes `content` to `dir/name` and returns the path.
pub async fn write_file(dir: &Path, name: &str, content: &str) -> anyhow::Result<std::path::PathBuf> {
    let path = dir.join(name);
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(&path, content).await?;
    Ok(path)
}

/// Seeds `server` with an image carrying `alias` and returns its fingerprint.
pub async fn seed_image(server: &MemoryServer, alias: &str) -> anyhow::Result<String> {
    let seed = format!("seed-{}", alias.replace('/', "-").replace('.', "-"));
    let request = LaunchRequest::builder()
        .name(seed.clone())
        .source(ImageSource::Public {
            server: "https://images.example".to_string(),
            alias: PUBLIC_ALIAS.to_string(),
        })
        .profile("default")
        .pool(POOL)
        .build();
    server.launch(&request).await?;
    let fingerprint = server.publish(&seed, alias).await?;
    server.delete_unit(&seed).await?;
    Ok(fingerprint)
}

/// A TCP port nothing listens on right now.
pub fn free_port() -> anyhow::Result<u16> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl ImageCatalog for StaticCatalog {
    async fn lookup_public(
        &self,
        alias: &str,
        _architecture: &str,
    ) -> MonounitResult<Option<PublicImage>> {
        Ok((alias == PUBLIC_ALIAS).then(|| PublicImage {
            server: "https://images.example".to_string(),
            alias: alias.to_string(),
            fingerprint: "f".repeat(64),
            size: PUBLIC_SIZE,
        }))
    }

    async fn fetch_spec(&self, reference: &RepositoryReference) -> MonounitResult<UnitSpec> {
        self.specs
            .get(&reference.to_string())
            .cloned()
            .ok_or_else(|| MonounitError::NotFound(format!("unit spec {reference}")))
    }
}

use std::fmt;

use async_trait::async_trait;
use serde_json::Value;

use crate::{
    config::{ImageLocation, UnitSpec, UNIT_SPEC_FILENAME},
    remote::{parse_remote_name, DEFAULT_REMOTE},
    MonounitError, MonounitResult,
};

use super::{host_architecture, ImageIdentity, ImageStore};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Prefix marking a reference to a spec kept in a source repository.
pub const REPOSITORY_PREFIX: &str = "github.com";

const RAW_CONTENT_URL: &str = "https://raw.githubusercontent.com";
const REPOSITORY_BRANCH: &str = "master";
const SIMPLESTREAMS_IMAGES: &str = "streams/v1/images.json";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// An image found on the public index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicImage {
    /// Index URL the image is pulled from.
    pub server: String,

    /// Alias it was found under.
    pub alias: String,

    /// Fingerprint of the newest version.
    pub fingerprint: String,

    /// Download size in bytes.
    pub size: u64,
}

/// A unit spec kept in a source repository: `github.com/<owner>/<repo>[/<path>]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryReference {
    /// Repository owner.
    pub owner: String,

    /// Repository name.
    pub repo: String,

    /// Directory holding the spec, empty for the repository root.
    pub path: String,
}

/// Where an image reference resolved to, with what is needed to fetch it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedImage {
    /// A spec in a source repository that must be built.
    Repository(RepositoryReference),

    /// An archive in the local store.
    Local(ImageIdentity),

    /// An image on the public index.
    Public(PublicImage),

    /// An image held by a saved remote.
    Private {
        /// Remote name.
        remote: String,

        /// Image alias on the remote.
        alias: String,
    },
}

/// The public image index plus the source repositories specs are fetched from.
#[async_trait]
pub trait ImageCatalog: Send + Sync {
    /// Looks `alias` up on the public index for `architecture`. `None` means no match.
    async fn lookup_public(
        &self,
        alias: &str,
        architecture: &str,
    ) -> MonounitResult<Option<PublicImage>>;

    /// Fetches and parses the unit spec a repository reference points at.
    async fn fetch_spec(&self, reference: &RepositoryReference) -> MonounitResult<UnitSpec>;
}

/// An [`ImageCatalog`] that talks to a simplestreams index and raw repository content over
/// HTTPS.
#[derive(Debug, Clone)]
pub struct HttpCatalog {
    client: reqwest::Client,
    index: String,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl HttpCatalog {
    /// Creates a catalog over the public index at `index`.
    pub fn new(index: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            index: index.into().trim_end_matches('/').to_string(),
        }
    }

    async fn get_text(&self, url: &str) -> MonounitResult<Option<String>> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| MonounitError::Connectivity(format!("cannot reach {url}: {e}")))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(MonounitError::Connectivity(format!(
                "{url} answered {}",
                response.status()
            )));
        }

        Ok(Some(response.text().await?))
    }
}

impl RepositoryReference {
    /// Parses `github.com/<owner>/<repo>[/<path>]`. `github.com:` is accepted as a prefix too.
    pub fn parse(reference: &str) -> MonounitResult<Self> {
        let rest = reference
            .strip_prefix(REPOSITORY_PREFIX)
            .and_then(|rest| rest.strip_prefix('/').or_else(|| rest.strip_prefix(':')))
            .ok_or_else(|| {
                MonounitError::Validation(format!(
                    "{reference:?} is not a {REPOSITORY_PREFIX} reference"
                ))
            })?;

        let mut parts = rest.trim_end_matches('/').splitn(3, '/');
        let owner = parts.next().unwrap_or_default();
        let repo = parts.next().unwrap_or_default();
        if owner.is_empty() || repo.is_empty() {
            return Err(MonounitError::Validation(format!(
                "{reference:?} must name an owner and a repository"
            )));
        }

        Ok(Self {
            owner: owner.to_string(),
            repo: repo.to_string(),
            path: parts.next().unwrap_or_default().to_string(),
        })
    }

    /// Whether `reference` points into a source repository.
    pub fn matches(reference: &str) -> bool {
        reference.starts_with(&format!("{REPOSITORY_PREFIX}/"))
            || reference.starts_with(&format!("{REPOSITORY_PREFIX}:"))
    }

    /// URL of the raw spec file.
    pub fn spec_url(&self) -> String {
        let mut url = format!(
            "{RAW_CONTENT_URL}/{}/{}/{REPOSITORY_BRANCH}",
            self.owner, self.repo
        );
        if !self.path.is_empty() {
            url.push('/');
            url.push_str(&self.path);
        }
        url.push('/');
        url.push_str(UNIT_SPEC_FILENAME);
        url
    }
}

impl ResolvedImage {
    /// The location class.
    pub fn location(&self) -> ImageLocation {
        match self {
            ResolvedImage::Repository(_) => ImageLocation::Repository,
            ResolvedImage::Local(_) => ImageLocation::Local,
            ResolvedImage::Public(_) => ImageLocation::Public,
            ResolvedImage::Private { .. } => ImageLocation::Private,
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Resolves where `reference` lives.
///
/// The first match wins: a repository prefix, a saved remote prefix (`remote:alias`), then the
/// local store, then the public index. When `declared` is given only that class is tried.
pub async fn resolve_image(
    reference: &str,
    declared: Option<ImageLocation>,
    store: &ImageStore,
    catalog: &dyn ImageCatalog,
) -> MonounitResult<ResolvedImage> {
    let allowed = |location: ImageLocation| declared.is_none_or(|d| d == location);
    let (remote, alias) = parse_remote_name(reference);

    if RepositoryReference::matches(reference) {
        if allowed(ImageLocation::Repository) {
            return Ok(ResolvedImage::Repository(RepositoryReference::parse(
                reference,
            )?));
        }
    } else if remote != DEFAULT_REMOTE {
        if allowed(ImageLocation::Private) {
            return Ok(ResolvedImage::Private {
                remote: remote.to_string(),
                alias: alias.to_string(),
            });
        }
    } else {
        if allowed(ImageLocation::Local) {
            if let Ok(identity) = ImageIdentity::parse(reference) {
                if store.contains(&identity).await? {
                    return Ok(ResolvedImage::Local(identity));
                }
            }
        }

        if allowed(ImageLocation::Public) {
            if let Some(image) = catalog
                .lookup_public(alias, &host_architecture())
                .await?
            {
                return Ok(ResolvedImage::Public(image));
            }
        }
    }

    Err(MonounitError::NotFound(match declared {
        Some(location) => format!("image {reference:?} could not be resolved as {location}"),
        None => format!("image {reference:?} location could not be resolved"),
    }))
}

/// Finds `alias` for `architecture` in a simplestreams `images.json` document.
///
/// The newest version of the matching product wins. Its size is the metadata tarball plus the
/// root filesystem it is combined with.
pub fn find_public_image(
    catalogue: &Value,
    server: &str,
    alias: &str,
    architecture: &str,
) -> Option<PublicImage> {
    let products = catalogue["products"].as_object()?;

    products.values().find_map(|product| {
        let aliases = product["aliases"].as_str().unwrap_or_default();
        if product["arch"] != architecture || !aliases.split(',').any(|a| a.trim() == alias) {
            return None;
        }

        let versions = product["versions"].as_object()?;
        let (_, newest) = versions.iter().max_by(|(a, _), (b, _)| a.cmp(b))?;
        let items = newest["items"].as_object()?;
        let meta = items.get("lxd.tar.xz")?;

        let (rootfs, fingerprint) = if let Some(squashfs) = items.get("root.squashfs") {
            (squashfs, meta["combined_squashfs_sha256"].as_str())
        } else {
            (items.get("root.tar.xz")?, meta["combined_rootxz_sha256"].as_str())
        };

        Some(PublicImage {
            server: server.to_string(),
            alias: alias.to_string(),
            fingerprint: fingerprint.unwrap_or_default().to_string(),
            size: meta["size"].as_u64().unwrap_or_default()
                + rootfs["size"].as_u64().unwrap_or_default(),
        })
    })
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl ImageCatalog for HttpCatalog {
    async fn lookup_public(
        &self,
        alias: &str,
        architecture: &str,
    ) -> MonounitResult<Option<PublicImage>> {
        let url = format!("{}/{}", self.index, SIMPLESTREAMS_IMAGES);
        tracing::debug!("looking up {alias} ({architecture}) in {url}");

        let Some(body) = self.get_text(&url).await? else {
            return Ok(None);
        };
        let catalogue: Value = serde_json::from_str(&body)?;
        Ok(find_public_image(&catalogue, &self.index, alias, architecture))
    }

    async fn fetch_spec(&self, reference: &RepositoryReference) -> MonounitResult<UnitSpec> {
        let url = reference.spec_url();
        tracing::info!("fetching unit spec from {url}");

        let body = self
            .get_text(&url)
            .await?
            .ok_or_else(|| MonounitError::NotFound(format!("unit spec at {url}")))?;
        body.parse()
    }
}

impl fmt::Display for RepositoryReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{REPOSITORY_PREFIX}/{}/{}", self.owner, self.repo)?;
        if !self.path.is_empty() {
            write!(f, "/{}", self.path)?;
        }
        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tempfile::tempdir;

    use super::*;

    struct StaticCatalog;

    #[async_trait]
    impl ImageCatalog for StaticCatalog {
        async fn lookup_public(
            &self,
            alias: &str,
            _architecture: &str,
        ) -> MonounitResult<Option<PublicImage>> {
            Ok((alias == "alpine/3.19").then(|| PublicImage {
                server: "https://images.example".into(),
                alias: alias.into(),
                fingerprint: "abc".into(),
                size: 3,
            }))
        }

        async fn fetch_spec(&self, _reference: &RepositoryReference) -> MonounitResult<UnitSpec> {
            Ok(UnitSpec::default())
        }
    }

    #[test]
    fn test_repository_reference() -> anyhow::Result<()> {
        let reference = RepositoryReference::parse("github.com/acme/units/web")?;
        assert_eq!(reference.owner, "acme");
        assert_eq!(reference.path, "web");
        assert_eq!(
            reference.spec_url(),
            "https://raw.githubusercontent.com/acme/units/master/web/Unitfile"
        );
        assert_eq!(reference.to_string(), "github.com/acme/units/web");

        let root = RepositoryReference::parse("github.com:acme/units")?;
        assert_eq!(
            root.spec_url(),
            "https://raw.githubusercontent.com/acme/units/master/Unitfile"
        );
        assert!(RepositoryReference::parse("github.com/acme").is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_resolution_order() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let store = ImageStore::new(dir.path());
        let local = ImageIdentity::parse("alpine/3.19")?;

        // Not stored yet: falls through to the public index.
        let resolved = resolve_image("alpine/3.19", None, &store, &StaticCatalog).await?;
        assert_eq!(resolved.location(), ImageLocation::Public);

        // Stored: local wins over public.
        tokio::fs::write(store.path_of(&local), b"x").await?;
        let resolved = resolve_image("alpine/3.19", None, &store, &StaticCatalog).await?;
        assert_eq!(resolved, ResolvedImage::Local(local));

        // A repository prefix wins over everything.
        let resolved =
            resolve_image("github.com/acme/units/web", None, &store, &StaticCatalog).await?;
        assert_eq!(resolved.location(), ImageLocation::Repository);

        let err = resolve_image("nothing/1.0", None, &store, &StaticCatalog)
            .await
            .unwrap_err();
        assert!(matches!(err, MonounitError::NotFound(ref m) if m.contains("nothing/1.0")));
        Ok(())
    }

    #[tokio::test]
    async fn test_remote_prefix_resolves_private() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let store = ImageStore::new(dir.path());

        let resolved = resolve_image("lab:web/1.0", None, &store, &StaticCatalog).await?;
        assert_eq!(
            resolved,
            ResolvedImage::Private {
                remote: "lab".into(),
                alias: "web/1.0".into(),
            }
        );

        // The default remote prefix is the same as none.
        let resolved = resolve_image("local:alpine/3.19", None, &store, &StaticCatalog).await?;
        assert_eq!(resolved.location(), ImageLocation::Public);

        let err = resolve_image(
            "alpine/3.19",
            Some(ImageLocation::Private),
            &store,
            &StaticCatalog,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, MonounitError::NotFound(_)));
        Ok(())
    }

    #[tokio::test]
    async fn test_declared_location_restricts_resolution() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let store = ImageStore::new(dir.path());
        let local = ImageIdentity::parse("alpine/3.19")?;
        tokio::fs::write(store.path_of(&local), b"x").await?;

        let resolved = resolve_image(
            "alpine/3.19",
            Some(ImageLocation::Public),
            &store,
            &StaticCatalog,
        )
        .await?;
        assert_eq!(resolved.location(), ImageLocation::Public);
        Ok(())
    }

    #[test]
    fn test_find_public_image_picks_newest_version() {
        let catalogue = json!({
            "products": {
                "alpine:3.19:amd64:default": {
                    "aliases": "alpine/3.19/default,alpine/3.19",
                    "arch": "amd64",
                    "versions": {
                        "20240101_13:00": {
                            "items": {
                                "lxd.tar.xz": { "size": 1, "combined_squashfs_sha256": "old" },
                                "root.squashfs": { "size": 10 }
                            }
                        },
                        "20240201_13:00": {
                            "items": {
                                "lxd.tar.xz": { "size": 2, "combined_squashfs_sha256": "new" },
                                "root.squashfs": { "size": 20 }
                            }
                        }
                    }
                },
                "alpine:3.19:arm64:default": {
                    "aliases": "alpine/3.19",
                    "arch": "arm64",
                    "versions": {}
                }
            }
        });

        let image = find_public_image(&catalogue, "https://i", "alpine/3.19", "amd64").unwrap();
        assert_eq!(image.fingerprint, "new");
        assert_eq!(image.size, 22);
        assert!(find_public_image(&catalogue, "https://i", "alpine/3.20", "amd64").is_none());
    }
}

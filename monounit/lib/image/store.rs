use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tokio::fs;

use crate::{utils::get_file_hash, MonounitError, MonounitResult};

use super::{ImageIdentity, ARCHIVE_EXTENSION};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Extension appended to an archive's path for its content-hash sidecar.
pub const HASH_EXTENSION: &str = ".sha256";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A directory of image archives, one per canonical basename, each with a hash sidecar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageStore {
    dir: PathBuf,
}

/// An archive in the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredImage {
    /// The image's identity.
    pub identity: ImageIdentity,

    /// Archive path.
    pub path: PathBuf,

    /// Archive size in bytes.
    pub size: u64,

    /// When the archive was written.
    pub created: DateTime<Utc>,

    /// Hex SHA-256 of the archive.
    pub hash: String,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ImageStore {
    /// Creates a store over `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// The store directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Where the archive for `identity` lives, whether or not it exists.
    pub fn path_of(&self, identity: &ImageIdentity) -> PathBuf {
        self.dir.join(identity.archive_name())
    }

    /// Whether an archive for `identity` exists.
    pub async fn contains(&self, identity: &ImageIdentity) -> MonounitResult<bool> {
        Ok(fs::try_exists(self.path_of(identity)).await?)
    }

    /// Size of the archive for `identity`.
    pub async fn size_of(&self, identity: &ImageIdentity) -> MonounitResult<u64> {
        let metadata = fs::metadata(self.path_of(identity))
            .await
            .map_err(|e| not_found(e, identity))?;
        if metadata.is_dir() {
            return Err(MonounitError::Validation(format!(
                "expected image {identity} to be a file, found a directory"
            )));
        }
        Ok(metadata.len())
    }

    /// Content hash of the archive for `identity`.
    ///
    /// The hash is read from the sidecar, computing and caching it on first use.
    pub async fn hash_of(&self, identity: &ImageIdentity) -> MonounitResult<String> {
        let archive = self.path_of(identity);
        let sidecar = sidecar_path(&archive);

        match fs::read_to_string(&sidecar).await {
            Ok(hash) => Ok(hash.trim_end().to_string()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if !fs::try_exists(&archive).await? {
                    return Err(MonounitError::NotFound(format!("image {identity}")));
                }
                tracing::debug!("hashing {}", archive.display());
                let hash = get_file_hash(&archive).await?;
                fs::write(&sidecar, &hash).await?;
                Ok(hash)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Every archive in the store, sorted by identity.
    pub async fn list(&self) -> MonounitResult<Vec<StoredImage>> {
        let mut images = Vec::new();
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(images),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let filename = entry.file_name().to_string_lossy().to_string();
            if !filename.ends_with(ARCHIVE_EXTENSION) {
                continue;
            }

            let identity = match ImageIdentity::from_filename(&filename) {
                Ok(identity) => identity,
                Err(e) => {
                    tracing::warn!("skipping {filename} in image store: {e}");
                    continue;
                }
            };

            let metadata = entry.metadata().await?;
            let created = metadata
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now());

            images.push(StoredImage {
                hash: self.hash_of(&identity).await?,
                identity,
                path: entry.path(),
                size: metadata.len(),
                created,
            });
        }

        images.sort_by(|a, b| a.identity.cmp(&b.identity));
        Ok(images)
    }

    /// Copies an external archive into the store and writes its sidecar.
    ///
    /// Without an explicit identity it is recovered from the archive's file name.
    pub async fn import(
        &self,
        source: &Path,
        identity: Option<ImageIdentity>,
    ) -> MonounitResult<ImageIdentity> {
        let identity = match identity {
            Some(identity) => identity,
            None => {
                let filename = source
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .ok_or_else(|| {
                        MonounitError::Validation(format!(
                            "{} has no file name",
                            source.display()
                        ))
                    })?;
                ImageIdentity::from_filename(&filename)?
            }
        };

        if self.contains(&identity).await? {
            return Err(MonounitError::Conflict(format!(
                "image {identity} already exists"
            )));
        }

        fs::create_dir_all(&self.dir).await?;
        let dest = self.path_of(&identity);
        fs::copy(source, &dest).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                MonounitError::NotFound(format!("archive {}", source.display()))
            }
            _ => e.into(),
        })?;
        self.write_hash(&identity).await?;

        tracing::info!("imported {} as {identity}", source.display());
        Ok(identity)
    }

    /// Computes the hash of the archive for `identity` and (re)writes its sidecar.
    pub async fn write_hash(&self, identity: &ImageIdentity) -> MonounitResult<String> {
        let archive = self.path_of(identity);
        let hash = get_file_hash(&archive)
            .await
            .map_err(|e| match e {
                MonounitError::Io(io) => not_found(io, identity),
                other => other,
            })?;
        fs::write(sidecar_path(&archive), &hash).await?;
        Ok(hash)
    }

    /// Deletes the archive for `identity` and its sidecar.
    pub async fn delete(&self, identity: &ImageIdentity) -> MonounitResult<()> {
        let archive = self.path_of(identity);
        fs::remove_file(&archive)
            .await
            .map_err(|e| not_found(e, identity))?;

        match fs::remove_file(sidecar_path(&archive)).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

fn sidecar_path(archive: &Path) -> PathBuf {
    let mut path = archive.as_os_str().to_owned();
    path.push(HASH_EXTENSION);
    PathBuf::from(path)
}

fn not_found(error: std::io::Error, identity: &ImageIdentity) -> MonounitError {
    match error.kind() {
        std::io::ErrorKind::NotFound => MonounitError::NotFound(format!("image {identity}")),
        _ => error.into(),
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[tokio::test]
    async fn test_hash_is_computed_lazily_and_cached() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let store = ImageStore::new(dir.path());
        let identity = ImageIdentity::new("web", "1.0", "amd64");

        fs::write(store.path_of(&identity), b"archive").await?;
        let sidecar = sidecar_path(&store.path_of(&identity));
        assert!(!fs::try_exists(&sidecar).await?);

        let listed = store.list().await?;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].identity, identity);
        assert_eq!(listed[0].size, 7);
        assert_eq!(
            listed[0].hash,
            get_file_hash(&store.path_of(&identity)).await?
        );
        assert_eq!(fs::read_to_string(&sidecar).await?, listed[0].hash);
        Ok(())
    }

    #[tokio::test]
    async fn test_import_rejects_duplicates() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let store = ImageStore::new(dir.path().join("images"));

        let source = dir.path().join("web_2.0_amd64.tar.gz");
        fs::write(&source, b"bytes").await?;

        let identity = store.import(&source, None).await?;
        assert_eq!(identity, ImageIdentity::new("web", "2.0", "amd64"));
        assert!(store.contains(&identity).await?);
        assert_eq!(store.size_of(&identity).await?, 5);

        assert!(matches!(
            store.import(&source, None).await,
            Err(MonounitError::Conflict(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_delete_removes_archive_and_sidecar() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let store = ImageStore::new(dir.path());
        let identity = ImageIdentity::new("web", "1.0", "amd64");

        fs::write(store.path_of(&identity), b"archive").await?;
        store.write_hash(&identity).await?;
        store.delete(&identity).await?;

        assert!(store.list().await?.is_empty());
        assert!(!fs::try_exists(sidecar_path(&store.path_of(&identity))).await?);
        assert!(matches!(
            store.delete(&identity).await,
            Err(MonounitError::NotFound(_))
        ));
        Ok(())
    }
}

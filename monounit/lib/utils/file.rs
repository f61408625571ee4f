use std::path::Path;

use sha2::{Digest, Sha224, Sha256};
use tokio::{fs::File, io::AsyncReadExt};

use crate::MonounitResult;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

const READ_BUFFER_SIZE: usize = 64 * 1024;

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Gets the hex-encoded SHA-256 digest of a file, streaming its content.
pub async fn get_file_hash(path: &Path) -> MonounitResult<String> {
    let mut file = File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let read = file.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Hex-encoded SHA-224 digest of a string. Used to derive stable device and volume names.
pub fn short_digest(input: &str) -> String {
    hex::encode(Sha224::digest(input.as_bytes()))
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_get_file_hash() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("hello.txt");
        tokio::fs::write(&path, b"hello").await?;

        assert_eq!(
            get_file_hash(&path).await?,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );

        Ok(())
    }

    #[test]
    fn test_short_digest_is_stable() {
        assert_eq!(short_digest("web/data"), short_digest("web/data"));
        assert_ne!(short_digest("web/data"), short_digest("web/logs"));
        assert_eq!(short_digest("x").len(), 56);
    }
}

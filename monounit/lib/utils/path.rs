use std::{
    env,
    path::{Path, PathBuf},
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Environment variable that overrides the monounit home directory.
pub const MONOUNIT_HOME_ENV_VAR: &str = "MONOUNIT_HOME";

/// The sub directory of the user's home where monounit state is kept by default.
pub const MONOUNIT_SUBDIR: &str = ".monounit";

/// The host settings file.
pub const HOST_SETTINGS_FILENAME: &str = "config.yml";

/// The sub directory holding remote records.
pub const REMOTES_SUBDIR: &str = "remotes";

/// The sub directory holding the client key pair.
pub const CERTS_SUBDIR: &str = "certs";

/// The sub directory holding pinned server certificates.
pub const SERVER_CERTS_SUBDIR: &str = "servercerts";

/// The sub directory holding image archives.
pub const IMAGES_SUBDIR: &str = "images";

/// The unit registry database file.
pub const REGISTRY_DB_FILENAME: &str = "units.db";

/// The client private key file name.
pub const CLIENT_KEY_FILENAME: &str = "client.key";

/// The client certificate file name.
pub const CLIENT_CERT_FILENAME: &str = "client.crt";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The on-disk layout of a monounit home directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HomeLayout {
    root: PathBuf,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl HomeLayout {
    /// Creates a layout rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Creates the layout for the default home directory.
    ///
    /// `MONOUNIT_HOME` wins when set, otherwise `~/.monounit` is used.
    pub fn from_env() -> Self {
        Self::new(get_monounit_home_path())
    }

    /// The root of the layout.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the host settings file.
    pub fn settings_file(&self) -> PathBuf {
        self.root.join(HOST_SETTINGS_FILENAME)
    }

    /// Directory holding remote records.
    pub fn remotes_dir(&self) -> PathBuf {
        self.root.join(REMOTES_SUBDIR)
    }

    /// Directory holding the client key pair.
    pub fn certs_dir(&self) -> PathBuf {
        self.root.join(CERTS_SUBDIR)
    }

    /// Directory holding pinned server certificates.
    pub fn server_certs_dir(&self) -> PathBuf {
        self.root.join(SERVER_CERTS_SUBDIR)
    }

    /// Directory holding image archives.
    pub fn images_dir(&self) -> PathBuf {
        self.root.join(IMAGES_SUBDIR)
    }

    /// Path of the unit registry database.
    pub fn registry_db(&self) -> PathBuf {
        self.root.join(REGISTRY_DB_FILENAME)
    }

    /// Path of the client private key.
    pub fn client_key(&self) -> PathBuf {
        self.certs_dir().join(CLIENT_KEY_FILENAME)
    }

    /// Path of the client certificate.
    pub fn client_cert(&self) -> PathBuf {
        self.certs_dir().join(CLIENT_CERT_FILENAME)
    }

    /// Path of the pinned certificate for the named remote.
    pub fn server_cert(&self, remote: &str) -> PathBuf {
        self.server_certs_dir().join(format!("{remote}.crt"))
    }

    /// Creates every directory of the layout.
    pub async fn ensure(&self) -> std::io::Result<()> {
        for dir in [
            self.root.clone(),
            self.remotes_dir(),
            self.certs_dir(),
            self.server_certs_dir(),
            self.images_dir(),
        ] {
            tokio::fs::create_dir_all(dir).await?;
        }

        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Returns the monounit home directory.
pub fn get_monounit_home_path() -> PathBuf {
    if let Ok(home) = env::var(MONOUNIT_HOME_ENV_VAR) {
        return PathBuf::from(home);
    }

    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(MONOUNIT_SUBDIR)
}

/// Normalizes a path inside a unit: trailing slashes are dropped and the path is made absolute.
pub fn clean_unit_path(path: &str) -> String {
    let trimmed = path.trim().trim_end_matches('/');
    if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_home_layout_paths() {
        let layout = HomeLayout::new("/tmp/home");
        assert_eq!(layout.settings_file(), PathBuf::from("/tmp/home/config.yml"));
        assert_eq!(
            layout.server_cert("lab"),
            PathBuf::from("/tmp/home/servercerts/lab.crt")
        );
        assert_eq!(
            layout.client_key(),
            PathBuf::from("/tmp/home/certs/client.key")
        );
    }

    #[test]
    #[serial_test::serial]
    fn test_home_env_override() {
        let previous = env::var_os(MONOUNIT_HOME_ENV_VAR);

        env::set_var(MONOUNIT_HOME_ENV_VAR, "/opt/monounit");
        assert_eq!(get_monounit_home_path(), PathBuf::from("/opt/monounit"));
        assert_eq!(
            HomeLayout::from_env().images_dir(),
            PathBuf::from("/opt/monounit/images")
        );

        env::remove_var(MONOUNIT_HOME_ENV_VAR);
        assert!(get_monounit_home_path().ends_with(MONOUNIT_SUBDIR));

        if let Some(previous) = previous {
            env::set_var(MONOUNIT_HOME_ENV_VAR, previous);
        }
    }

    #[test]
    fn test_clean_unit_path() {
        assert_eq!(clean_unit_path("/data/"), "/data");
        assert_eq!(clean_unit_path("data//"), "/data");
        assert_eq!(clean_unit_path("/var/lib"), "/var/lib");
    }
}

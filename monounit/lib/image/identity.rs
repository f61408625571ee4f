use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{remote::parse_remote_name, MonounitError, MonounitResult};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Version assumed when an image reference names none.
pub const DEFAULT_IMAGE_VERSION: &str = "1.0";

/// Extension of stored image archives.
pub const ARCHIVE_EXTENSION: &str = ".tar.gz";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The identity of an image: `name/version/architecture`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ImageIdentity {
    /// Image name.
    pub name: String,

    /// Image version.
    pub version: String,

    /// Architecture the image was built for, e.g. `amd64`.
    pub architecture: String,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ImageIdentity {
    /// Creates an identity from its parts.
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        architecture: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            architecture: architecture.into(),
        }
    }

    /// Parses `[remote:]name[/version[/architecture]]`.
    ///
    /// Omitted parts default to version `1.0` and the host architecture.
    pub fn parse(reference: &str) -> MonounitResult<Self> {
        let (_, reference) = parse_remote_name(reference);
        let mut parts = reference.splitn(3, '/');

        let name = parts.next().unwrap_or_default();
        if name.is_empty() {
            return Err(MonounitError::Validation(format!(
                "image name not provided in {reference:?}, expected <name>[/version[/arch]]"
            )));
        }

        let version = parts.next().unwrap_or(DEFAULT_IMAGE_VERSION);
        let architecture = match parts.next() {
            Some(arch) => normalize_architecture(arch),
            None => host_architecture(),
        };

        let identity = Self::new(name, version, architecture);
        identity.validate(reference)?;
        Ok(identity)
    }

    /// Recovers an identity from a stored archive's file name.
    pub fn from_filename(filename: &str) -> MonounitResult<Self> {
        let stem = filename.strip_suffix(ARCHIVE_EXTENSION).ok_or_else(|| {
            MonounitError::Validation(format!("{filename:?} is not an image archive"))
        })?;

        let mut parts = stem.splitn(3, '_');
        let name = parts.next().unwrap_or_default();
        let version = parts.next().unwrap_or(DEFAULT_IMAGE_VERSION);
        let architecture = parts
            .next()
            .map(normalize_architecture)
            .unwrap_or_else(host_architecture);

        let identity = Self::new(name, version, architecture);
        identity.validate(filename)?;
        Ok(identity)
    }

    /// The canonical basename, `name_version_architecture`.
    pub fn basename(&self) -> String {
        format!("{}_{}_{}", self.name, self.version, self.architecture)
    }

    /// File name of the stored archive.
    pub fn archive_name(&self) -> String {
        format!("{}{}", self.basename(), ARCHIVE_EXTENSION)
    }

    fn validate(&self, original: &str) -> MonounitResult<()> {
        let field_ok = |field: &str, extra: &[char]| {
            !field.is_empty()
                && field
                    .chars()
                    .all(|c| c.is_alphanumeric() || c == '-' || c == '.' || extra.contains(&c))
        };

        if field_ok(&self.name, &[])
            && field_ok(&self.version, &[])
            && field_ok(&self.architecture, &['_'])
        {
            Ok(())
        } else {
            Err(MonounitError::Validation(format!(
                "image {original:?} is not valid, fields may only contain letters, digits, '-' and '.'"
            )))
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Maps kernel architecture names onto image architecture names.
pub fn normalize_architecture(arch: &str) -> String {
    match arch {
        "x86_64" => "amd64".to_string(),
        "aarch64" => "arm64".to_string(),
        other => other.to_string(),
    }
}

/// Architecture of this machine, as an image architecture name.
pub fn host_architecture() -> String {
    normalize_architecture(std::env::consts::ARCH)
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl fmt::Display for ImageIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.name, self.version, self.architecture)
    }
}

impl FromStr for ImageIdentity {
    type Err = MonounitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

use std::{collections::BTreeMap, fmt, net::Ipv4Addr, path::Path, str::FromStr, sync::LazyLock};

use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use tokio::fs;
use typed_builder::TypedBuilder;

use crate::{MonounitError, MonounitResult};

use super::PortForward;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The file name a unit spec is expected under inside a spec repository.
pub const UNIT_SPEC_FILENAME: &str = "Unitfile";

/// Default CPU limit for a service.
pub const DEFAULT_UNIT_CPU: u32 = 2;

/// Default memory limit for a service.
pub const DEFAULT_UNIT_RAM: &str = "2GB";

static UNIT_NAME_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    // Runtime instance names: a leading letter, then letters, digits and hyphens.
    Regex::new(r"^[A-Za-z][A-Za-z0-9-]{0,62}$").expect("unit name regex is valid")
});

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A declarative description of a unit: its base image, setup steps and service parameters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UnitSpec {
    /// The image the unit is built on.
    pub base: BaseImage,

    /// System packages to install.
    #[serde(default, skip_serializing_if = "Packages::is_empty")]
    pub packages: Packages,

    /// Files copied into the unit, in order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub copy: Vec<CopyStep>,

    /// Commands run inside the unit, in order, after the copy steps.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub run: Vec<RunStep>,

    /// How the resulting image is deployed.
    #[serde(default)]
    pub service: ServiceSpec,
}

/// Base image descriptor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BaseImage {
    /// Image reference, e.g. `alpine/3.19`, `web/1.0/amd64` or `github.com/org/repo/web`.
    pub image: String,

    /// Where the image lives. Resolved on demand when omitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<ImageLocation>,
}

/// The classes of location an image reference can resolve to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageLocation {
    /// The public image index.
    Public,

    /// The local image store.
    Local,

    /// A unit spec kept in a source-controlled repository, built on demand.
    #[serde(alias = "github")]
    Repository,

    /// An image held by a saved remote, referenced as `remote:alias`.
    Private,
}

/// Package section of a unit spec.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Packages {
    /// Package manager, e.g. `apk` or `apt`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manager: Option<String>,

    /// Packages to install.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub system: Vec<String>,
}

/// Package managers the build pipeline knows how to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageManager {
    /// Alpine's `apk`.
    Apk,

    /// Debian's `apt`.
    Apt,
}

/// A command run inside a unit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, TypedBuilder)]
pub struct RunStep {
    /// Program to run.
    #[builder(setter(into))]
    pub command: String,

    /// Arguments passed to the program.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[builder(default)]
    pub args: Vec<String>,

    /// Inline script content appended as the last argument.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[builder(default, setter(strip_option, into))]
    pub content: Option<String>,

    /// Environment variables.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    #[builder(default)]
    pub env: BTreeMap<String, String>,

    /// Start the command and move on without waiting for it to exit.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    #[builder(default)]
    pub detach: bool,
}

/// A file or directory copied into a unit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, TypedBuilder)]
pub struct CopyStep {
    /// Path on the local machine, relative to the spec's directory.
    #[builder(setter(into))]
    pub source: String,

    /// Directory inside the unit the source is copied into.
    #[builder(setter(into))]
    pub target: String,

    /// Shell command run after the copy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[builder(default, setter(strip_option, into))]
    pub action: Option<String>,
}

/// How a unit is deployed.
///
/// Optional fields stay `None` when the document leaves them out, so a merge can tell an
/// absent value from one that happens to equal the default.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceSpec {
    /// Unit name, optionally prefixed with a remote (`remote:name`).
    #[serde(default)]
    pub name: String,

    /// Image the unit is launched from.
    #[serde(default)]
    pub image: String,

    /// Image version, for documents that keep it apart from `image`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// Whether the unit may run nested containers.
    #[serde(
        default,
        deserialize_with = "yes_no_opt",
        skip_serializing_if = "Option::is_none"
    )]
    pub docker: Option<bool>,

    /// Static IPv4 address on the bridge.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,

    /// Ports forwarded from the backend host.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<PortForward>,

    /// Resource limits.
    #[serde(default)]
    pub resources: ResourceRequest,

    /// Steps run once the unit is deployed.
    #[serde(default, skip_serializing_if = "PostDeploy::is_empty")]
    pub postdeploy: PostDeploy,
}

/// Resource limits of a service. Unset limits fall back to [`DEFAULT_UNIT_CPU`] and
/// [`DEFAULT_UNIT_RAM`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceRequest {
    /// CPU limit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<u32>,

    /// Memory limit, e.g. `2GB`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ram: Option<String>,

    /// Whether a GPU is passed through.
    #[serde(
        default,
        deserialize_with = "yes_no_opt",
        skip_serializing_if = "Option::is_none"
    )]
    pub gpu: Option<bool>,
}

/// Steps run after deployment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PostDeploy {
    /// Files copied in after deployment.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub copy: Vec<CopyStep>,

    /// Commands run after deployment.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub run: Vec<RunStep>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl UnitSpec {
    /// Loads a unit spec from a YAML file.
    pub async fn load(path: impl AsRef<Path>) -> MonounitResult<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                MonounitError::NotFound(format!("unit spec {}", path.display()))
            }
            _ => e.into(),
        })?;

        content.parse()
    }

    /// Checks the fields a build needs.
    pub fn validate_build(&self) -> MonounitResult<()> {
        let mut errors = Vec::new();

        if self.base.image.trim().is_empty() {
            errors.push("base image is empty".to_string());
        }

        if self.service.image.trim().is_empty() {
            errors.push("service image is empty".to_string());
        }

        if let Err(e) = self.packages.manager() {
            errors.push(e.to_string());
        }

        for step in &self.copy {
            if step.source.is_empty() || step.target.is_empty() {
                errors.push(format!(
                    "copy step needs both source and target, got {:?} -> {:?}",
                    step.source, step.target
                ));
            }
        }

        for step in &self.run {
            if step.command.trim().is_empty() {
                errors.push("run step has an empty command".to_string());
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(MonounitError::SpecValidationErrors(errors))
        }
    }
}

impl Packages {
    /// Returns true if no manager and no packages are declared.
    pub fn is_empty(&self) -> bool {
        self.manager.is_none() && self.system.is_empty()
    }

    /// Resolves the declared package manager.
    ///
    /// Packages without a manager, and unknown managers, are rejected.
    pub fn manager(&self) -> MonounitResult<Option<PackageManager>> {
        match self.manager.as_deref().map(str::trim) {
            None | Some("") if self.system.is_empty() => Ok(None),
            None | Some("") => Err(MonounitError::Validation(
                "package manager not specified, cannot install packages".to_string(),
            )),
            Some(name) => name.parse().map(Some),
        }
    }
}

impl PackageManager {
    /// Commands that refresh the package index and install `packages`.
    pub fn install_commands(&self, packages: &[String]) -> Vec<Vec<String>> {
        let owned = |args: &[&str]| args.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        match self {
            PackageManager::Apk => {
                let mut install = owned(&["apk", "--no-cache", "add"]);
                install.extend(packages.iter().cloned());
                vec![owned(&["apk", "update", "--no-cache"]), install]
            }
            PackageManager::Apt => {
                let mut install = owned(&["apt", "install"]);
                install.extend(packages.iter().cloned());
                install.push("--yes".to_string());
                vec![owned(&["apt", "update"]), install]
            }
        }
    }
}

impl RunStep {
    /// The full argument vector: command, args, then inline content if any.
    pub fn argv(&self) -> Vec<String> {
        let mut argv = Vec::with_capacity(self.args.len() + 2);
        argv.push(self.command.clone());
        argv.extend(self.args.iter().cloned());
        if let Some(content) = &self.content {
            argv.push(content.clone());
        }
        argv
    }
}

impl ServiceSpec {
    /// The image reference to resolve, with a separately kept version folded in.
    pub fn image_reference(&self) -> String {
        match self.version.as_deref().map(str::trim).filter(|v| !v.is_empty()) {
            Some(version) if !self.image.contains('/') => format!("{}/{version}", self.image),
            _ => self.image.clone(),
        }
    }

    /// Whether the unit may run nested containers.
    pub fn docker(&self) -> bool {
        self.docker.unwrap_or_default()
    }

    /// Checks the fields a deployment needs.
    pub fn validate_deploy(&self) -> MonounitResult<()> {
        let mut errors = Vec::new();

        let (_, unit_name) = crate::remote::parse_remote_name(&self.name);
        if let Err(e) = validate_unit_name(unit_name) {
            errors.push(e.to_string());
        }

        if self.image.trim().is_empty() {
            errors.push("service image is empty".to_string());
        }

        if let Some(ip) = &self.ip {
            if Ipv4Addr::from_str(ip).is_err() {
                errors.push(format!("service ip {ip:?} is not an IPv4 address"));
            }
        }

        if self.resources.cpu() == 0 {
            errors.push("service cpu limit must be at least 1".to_string());
        }

        if let Err(e) = crate::utils::parse_size(&self.resources.ram()) {
            errors.push(format!("service ram: {e}"));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(MonounitError::SpecValidationErrors(errors))
        }
    }

    /// Fills fields that are unset here from `other`. Values present on `self` win, even when
    /// they equal the default.
    pub fn merge(&mut self, other: &ServiceSpec) {
        if self.name.is_empty() {
            self.name = other.name.clone();
        }
        if self.image.is_empty() {
            self.image = other.image.clone();
        }
        if self.version.is_none() {
            self.version = other.version.clone();
        }
        if self.docker.is_none() {
            self.docker = other.docker;
        }
        if self.ip.is_none() {
            self.ip = other.ip.clone();
        }
        if self.ports.is_empty() {
            self.ports = other.ports.clone();
        }
        if self.resources.cpu.is_none() {
            self.resources.cpu = other.resources.cpu;
        }
        if self.resources.ram.is_none() {
            self.resources.ram = other.resources.ram.clone();
        }
        if self.resources.gpu.is_none() {
            self.resources.gpu = other.resources.gpu;
        }
        if self.postdeploy.copy.is_empty() {
            self.postdeploy.copy = other.postdeploy.copy.clone();
        }
        if self.postdeploy.run.is_empty() {
            self.postdeploy.run = other.postdeploy.run.clone();
        }
    }
}

impl ResourceRequest {
    /// The CPU limit.
    pub fn cpu(&self) -> u32 {
        self.cpu.unwrap_or(DEFAULT_UNIT_CPU)
    }

    /// The memory limit.
    pub fn ram(&self) -> String {
        self.ram
            .clone()
            .unwrap_or_else(|| DEFAULT_UNIT_RAM.to_string())
    }

    /// Whether a GPU is passed through.
    pub fn gpu(&self) -> bool {
        self.gpu.unwrap_or_default()
    }
}

impl PostDeploy {
    /// Returns true when there is nothing to run after deployment.
    pub fn is_empty(&self) -> bool {
        self.copy.is_empty() && self.run.is_empty()
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Checks that `name` can be used as a unit name.
pub fn validate_unit_name(name: &str) -> MonounitResult<()> {
    if name.is_empty() {
        return Err(MonounitError::Validation("unit name is empty".to_string()));
    }

    if !UNIT_NAME_REGEX.is_match(name) {
        return Err(MonounitError::Validation(format!(
            "unit name {name:?} must start with a letter and contain only letters, digits and '-' (max 63 characters)"
        )));
    }

    Ok(())
}

/// Accepts YAML booleans as well as the strings "yes"/"no"/"true"/"false".
fn yes_no<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Bool(bool),
        Text(String),
    }

    match Flag::deserialize(deserializer)? {
        Flag::Bool(b) => Ok(b),
        Flag::Text(s) => match s.trim().to_ascii_lowercase().as_str() {
            "yes" | "true" | "on" => Ok(true),
            "no" | "false" | "off" | "" => Ok(false),
            other => Err(serde::de::Error::custom(format!(
                "expected yes or no, got {other:?}"
            ))),
        },
    }
}

fn yes_no_opt<'de, D>(deserializer: D) -> Result<Option<bool>, D::Error>
where
    D: Deserializer<'de>,
{
    yes_no(deserializer).map(Some)
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl FromStr for UnitSpec {
    type Err = MonounitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(serde_yaml::from_str(s)?)
    }
}

impl FromStr for PackageManager {
    type Err = MonounitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "apk" => Ok(PackageManager::Apk),
            "apt" => Ok(PackageManager::Apt),
            other => Err(MonounitError::Validation(format!(
                "package manager {other:?} not recognised"
            ))),
        }
    }
}

impl fmt::Display for ImageLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageLocation::Public => write!(f, "public"),
            ImageLocation::Local => write!(f, "local"),
            ImageLocation::Repository => write!(f, "repository"),
            ImageLocation::Private => write!(f, "private"),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const SPEC: &str = r#"
base:
  image: alpine/3.19
  location: public
packages:
  manager: apk
  system: [curl, bash]
copy:
  - source: app
    target: /opt/app
    action: chmod +x /opt/app/run.sh
run:
  - command: sh
    args: ["-c"]
    content: echo hello > /etc/motd
    env:
      MODE: build
service:
  name: web
  image: web/1.0
  docker: "yes"
  ip: 10.0.0.20
  ports: ["80:8080"]
  resources:
    cpu: 1
    ram: 512MB
    gpu: no
"#;

    #[test]
    fn test_unit_spec_parse() -> anyhow::Result<()> {
        let spec: UnitSpec = SPEC.parse()?;

        assert_eq!(spec.base.location, Some(ImageLocation::Public));
        assert_eq!(spec.packages.manager()?, Some(PackageManager::Apk));
        assert_eq!(spec.copy[0].action.as_deref(), Some("chmod +x /opt/app/run.sh"));
        assert_eq!(
            spec.run[0].argv(),
            vec!["sh", "-c", "echo hello > /etc/motd"]
        );
        assert!(spec.service.docker());
        assert_eq!(spec.service.resources.gpu, Some(false));
        assert_eq!(spec.service.ports, vec![PortForward::new(80, 8080)]);

        spec.validate_build()?;
        spec.service.validate_deploy()?;
        Ok(())
    }

    #[test]
    fn test_location_accepts_github_alias() -> anyhow::Result<()> {
        let base: BaseImage =
            serde_yaml::from_str("image: github.com/org/repo/web\nlocation: github\n")?;
        assert_eq!(base.location, Some(ImageLocation::Repository));
        Ok(())
    }

    #[test]
    fn test_package_manager_rules() {
        let missing = Packages {
            manager: None,
            system: vec!["curl".into()],
        };
        assert!(missing.manager().is_err());

        let unknown = Packages {
            manager: Some("yum".into()),
            system: vec![],
        };
        assert!(unknown.manager().is_err());

        assert_eq!(Packages::default().manager().unwrap(), None);
    }

    #[test]
    fn test_install_commands() {
        let apt = PackageManager::Apt.install_commands(&["vim".to_string()]);
        assert_eq!(apt[0], vec!["apt", "update"]);
        assert_eq!(apt[1], vec!["apt", "install", "vim", "--yes"]);

        let apk = PackageManager::Apk.install_commands(&["curl".to_string()]);
        assert_eq!(apk[1], vec!["apk", "--no-cache", "add", "curl"]);
    }

    #[test]
    fn test_validate_unit_name() {
        assert!(validate_unit_name("web-1").is_ok());
        for bad in ["", "1web", "web_1", "web.1", "we b", "web!"] {
            assert!(validate_unit_name(bad).is_err(), "{bad:?} should be rejected");
        }
    }

    #[test]
    fn test_service_merge_prefers_own_values() {
        let mut mine = ServiceSpec {
            name: "api".into(),
            ..Default::default()
        };
        let theirs = ServiceSpec {
            name: "other".into(),
            image: "api/2.0".into(),
            resources: ResourceRequest {
                cpu: Some(4),
                ram: Some("8GB".into()),
                gpu: Some(true),
            },
            ..Default::default()
        };

        mine.merge(&theirs);
        assert_eq!(mine.name, "api");
        assert_eq!(mine.image, "api/2.0");
        assert_eq!(mine.resources.cpu(), 4);
        assert!(mine.resources.gpu());
    }

    #[test]
    fn test_service_merge_keeps_explicit_defaults() -> anyhow::Result<()> {
        let mut mine: ServiceSpec =
            serde_yaml::from_str("name: api
docker: no
resources:
  cpu: 2
  ram: 2GB
  gpu: no
")?;
        let theirs: ServiceSpec = serde_yaml::from_str(
            "name: api
image: api/1.0
docker: yes
resources:
  cpu: 3
  ram: 4GB
  gpu: yes
",
        )?;

        mine.merge(&theirs);
        assert_eq!(mine.resources.cpu(), 2);
        assert_eq!(mine.resources.ram(), "2GB");
        assert!(!mine.resources.gpu());
        assert!(!mine.docker());
        assert_eq!(mine.image, "api/1.0");

        // Fields the document leaves out are still filled in.
        let mut sparse: ServiceSpec = serde_yaml::from_str("name: api
")?;
        sparse.merge(&theirs);
        assert_eq!(sparse.resources.cpu(), 3);
        assert_eq!(sparse.resources.ram(), "4GB");
        assert!(sparse.docker());
        Ok(())
    }

    #[test]
    fn test_unset_resources_use_defaults() -> anyhow::Result<()> {
        let service: ServiceSpec = serde_yaml::from_str("name: web
image: web/1.0
")?;
        assert_eq!(service.resources.cpu, None);
        assert_eq!(service.resources.cpu(), DEFAULT_UNIT_CPU);
        assert_eq!(service.resources.ram(), DEFAULT_UNIT_RAM);
        assert!(!service.resources.gpu());
        Ok(())
    }

    #[test]
    fn test_separate_version_is_folded_into_image() -> anyhow::Result<()> {
        let legacy: ServiceSpec = serde_yaml::from_str("name: web
image: web
version: \"2.1\"
")?;
        assert_eq!(legacy.image_reference(), "web/2.1");

        let current: ServiceSpec = serde_yaml::from_str("name: web
image: web/1.0
version: \"2.1\"
")?;
        assert_eq!(current.image_reference(), "web/1.0");

        let plain: ServiceSpec = serde_yaml::from_str("name: web
image: web/1.0
")?;
        assert_eq!(plain.image_reference(), "web/1.0");
        Ok(())
    }

    #[test]
    fn test_run_step_detach_flag() -> anyhow::Result<()> {
        let step: RunStep = serde_yaml::from_str("command: ./serve
detach: true
")?;
        assert!(step.detach);

        let step: RunStep = serde_yaml::from_str("command: make
")?;
        assert!(!step.detach);
        Ok(())
    }

    #[test]
    fn test_location_accepts_private() -> anyhow::Result<()> {
        let base: BaseImage = serde_yaml::from_str("image: lab:web/1.0
location: private
")?;
        assert_eq!(base.location, Some(ImageLocation::Private));
        Ok(())
    }
}

use std::{
    collections::{BTreeMap, HashMap},
    path::{Path, PathBuf},
    str::FromStr,
};

use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::{MonounitError, MonounitResult};

use super::ServiceSpec;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A multi-service document: service name to service entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComposeSpec {
    /// The declared services.
    #[serde(default)]
    pub services: BTreeMap<String, ComposeService>,
}

/// One named entry of a [`ComposeSpec`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComposeService {
    /// Inline service fields. They take precedence over the referenced unit spec's.
    #[serde(flatten)]
    pub service: ServiceSpec,

    /// Unit spec file the service is built from or takes defaults from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec: Option<PathBuf>,

    /// Whether the image is built from `spec` before deploying.
    #[serde(default)]
    pub build: bool,

    /// Marks a base image for other services' builds. A base service is built but never
    /// deployed, and unless `build` is also set its image is discarded once the run ends.
    #[serde(default)]
    pub base: bool,

    /// Directory the service is built and deployed from, relative to the compose file.
    /// Defaults to the directory of `spec`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<PathBuf>,

    /// Names of services that must be up before this one.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ComposeSpec {
    /// Loads a compose spec from a YAML file.
    pub async fn load(path: impl AsRef<Path>) -> MonounitResult<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                MonounitError::NotFound(format!("compose spec {}", path.display()))
            }
            _ => e.into(),
        })?;

        content.parse()
    }

    /// Checks that every dependency names a declared service.
    pub fn validate_dependencies(&self) -> MonounitResult<()> {
        for (name, service) in &self.services {
            for dependency in &service.depends_on {
                if !self.services.contains_key(dependency) {
                    return Err(MonounitError::Validation(format!(
                        "service '{}' depends on undeclared service '{}'",
                        name, dependency
                    )));
                }
            }
        }

        Ok(())
    }

    /// Orders services so that each one comes after all of its dependencies.
    ///
    /// Every pass takes all services whose dependencies are already ordered, appends them in
    /// name order, then releases their dependents for the next pass. If a pass takes nothing
    /// while services remain, the remainder forms a cycle and no ordering is returned.
    pub fn topological_order(&self) -> MonounitResult<Vec<String>> {
        self.validate_dependencies()?;

        let mut pending: BTreeMap<&str, usize> = self
            .services
            .iter()
            .map(|(name, service)| (name.as_str(), service.depends_on.len()))
            .collect();

        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
        for (name, service) in &self.services {
            for dependency in &service.depends_on {
                dependents
                    .entry(dependency.as_str())
                    .or_default()
                    .push(name.as_str());
            }
        }

        let mut ordering = Vec::with_capacity(self.services.len());
        loop {
            let ready: Vec<&str> = pending
                .iter()
                .filter(|(_, count)| **count == 0)
                .map(|(name, _)| *name)
                .collect();

            if ready.is_empty() {
                break;
            }

            for name in ready {
                pending.remove(name);
                ordering.push(name.to_string());
                for dependent in dependents.get(name).into_iter().flatten() {
                    if let Some(count) = pending.get_mut(dependent) {
                        *count = count.saturating_sub(1);
                    }
                }
            }
        }

        if ordering.len() < self.services.len() {
            let remaining: Vec<&str> = pending.keys().copied().collect();
            return Err(MonounitError::Conflict(format!(
                "dependency cycle between services: {}",
                remaining.join(", ")
            )));
        }

        Ok(ordering)
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl FromStr for ComposeSpec {
    type Err = MonounitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut spec: ComposeSpec = serde_yaml::from_str(s)?;
        for (name, entry) in spec.services.iter_mut() {
            if entry.service.name.is_empty() {
                entry.service.name = name.clone();
            }
        }
        Ok(spec)
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

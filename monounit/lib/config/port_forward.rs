use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::MonounitError;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A port forwarded from the backend host into a unit.
///
/// ## Format
/// Port forwards are written `unit:host`, the unit port first. Both halves are required.
///
/// ## Examples
///
/// ```
/// use monounit::config::PortForward;
///
/// let forward = "80:8080".parse::<PortForward>().unwrap();
/// assert_eq!(forward.get_unit(), 80);
/// assert_eq!(forward.get_host(), 8080);
/// assert_eq!(forward.to_string(), "80:8080");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortForward {
    unit: u16,
    host: u16,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl PortForward {
    /// Creates a new `PortForward`.
    pub fn new(unit: u16, host: u16) -> Self {
        Self { unit, host }
    }

    /// Returns the port listened on inside the unit.
    pub fn get_unit(&self) -> u16 {
        self.unit
    }

    /// Returns the port exposed on the backend host.
    pub fn get_host(&self) -> u16 {
        self.host
    }

    /// Name of the proxy device that carries this forward on `unit_name`.
    pub fn device_name(&self, unit_name: &str) -> String {
        format!("{}-proxy-{}-{}", unit_name, self.host, self.unit)
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl FromStr for PortForward {
    type Err = MonounitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || {
            MonounitError::Validation(format!(
                "invalid port forward {s:?}: expected UNIT_PORT:HOST_PORT"
            ))
        };

        let (unit, host) = s.split_once(':').ok_or_else(malformed)?;
        if unit.is_empty() || host.is_empty() {
            return Err(malformed());
        }

        Ok(Self {
            unit: unit.trim().parse().map_err(|_| malformed())?,
            host: host.trim().parse().map_err(|_| malformed())?,
        })
    }
}

impl fmt::Display for PortForward {
    /// Formats the forward as "unit:host".
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.unit, self.host)
    }
}

impl Serialize for PortForward {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for PortForward {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::from_str(&s).map_err(serde::de::Error::custom)
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_forward_from_str() {
        assert_eq!(
            "80:8080".parse::<PortForward>().unwrap(),
            PortForward::new(80, 8080)
        );
        assert_eq!(
            "22:22".parse::<PortForward>().unwrap(),
            PortForward::new(22, 22)
        );

        // A bare port is not enough, both halves are required
        for invalid in ["", "80", ":80", "80:", "a:80", "80:b", "80:8080:1", "70000:80"] {
            let err = invalid.parse::<PortForward>().unwrap_err();
            assert!(
                matches!(err, MonounitError::Validation(_)),
                "{invalid:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_port_forward_device_name() {
        let forward = PortForward::new(80, 8080);
        assert_eq!(forward.device_name("web"), "web-proxy-8080-80");
    }

    #[test]
    fn test_port_forward_serde() -> anyhow::Result<()> {
        let ports: Vec<PortForward> = serde_yaml::from_str("- \"80:8080\"\n- \"443:8443\"\n")?;
        assert_eq!(ports[1], PortForward::new(443, 8443));
        assert_eq!(serde_json::to_string(&ports[0])?, "\"80:8080\"");
        Ok(())
    }
}

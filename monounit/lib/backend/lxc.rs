use std::path::PathBuf;

use crate::{
    config::{BackendKind, HostSettings},
    runtime::PoolUsage,
    utils::{parse_size, run_command},
    MonounitError, MonounitResult,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Address the daemon serves its HTTPS API on.
pub const HTTPS_LISTEN_ADDRESS: &str = "[::]:8443";

/// The `lxc` binary inside a managed VM.
const VM_LXC_BINARY: &str = "/snap/bin/lxc";

const MULTIPASS_BINARY: &str = "multipass";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Runs the daemon's command line, either on this machine or inside the managed VM.
///
/// Used for the administrative operations the unit API does not cover: profiles, pools,
/// networks and daemon configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LxcCli {
    /// `lxc` on this machine.
    Local {
        /// Path of the binary.
        binary: PathBuf,
    },

    /// `lxc` inside a VM, reached through `multipass exec`.
    Vm {
        /// Name of the VM.
        vm: String,
    },
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl LxcCli {
    /// Picks the command line matching the host's backend.
    ///
    /// Remote endpoints are administered by whoever provisioned them, so they have none.
    pub fn for_settings(settings: &HostSettings) -> MonounitResult<Self> {
        match settings.backend.kind {
            BackendKind::Lxd => Ok(LxcCli::Local {
                binary: which::which("lxc")
                    .map_err(|_| MonounitError::NotFound("lxc is not installed".to_string()))?,
            }),
            BackendKind::Multipass => Ok(LxcCli::Vm {
                vm: settings.backend.resources.name.clone(),
            }),
            BackendKind::Remote => Err(MonounitError::Validation(
                "a remote backend is administered by its operator".to_string(),
            )),
        }
    }

    /// Runs `lxc` with `args` and returns its trimmed stdout.
    pub async fn lxc(&self, args: &[&str]) -> MonounitResult<String> {
        match self {
            LxcCli::Local { binary } => run_command(&binary.to_string_lossy(), args).await,
            LxcCli::Vm { vm } => {
                let mut argv = vec!["exec", vm.as_str(), "--", VM_LXC_BINARY];
                argv.extend_from_slice(args);
                run_command(MULTIPASS_BINARY, argv).await
            }
        }
    }

    /// Runs a shell script where the daemon runs.
    pub async fn shell(&self, script: &str) -> MonounitResult<String> {
        match self {
            LxcCli::Local { .. } => run_command("sh", ["-c", script]).await,
            LxcCli::Vm { vm } => {
                run_command(MULTIPASS_BINARY, ["exec", vm, "--", "bash", "-c", script]).await
            }
        }
    }

    /// Creates a storage pool of `size` with `driver`.
    pub async fn create_pool(&self, name: &str, driver: &str, size: &str) -> MonounitResult<()> {
        parse_size(size)?;
        self.lxc(&["storage", "create", name, driver, &format!("size={size}")])
            .await?;
        tracing::info!("created storage pool {name} ({driver}, {size})");
        Ok(())
    }

    /// Points the root disk of `profile` at `pool`, adding the device when missing.
    pub async fn set_profile_root(&self, profile: &str, pool: &str) -> MonounitResult<()> {
        let pool_arg = format!("pool={pool}");
        match self
            .lxc(&["profile", "device", "set", profile, "root", &pool_arg])
            .await
        {
            Ok(_) => Ok(()),
            Err(_) => {
                self.lxc(&[
                    "profile", "device", "add", profile, "root", "disk", "path=/", &pool_arg,
                ])
                .await?;
                Ok(())
            }
        }
    }

    /// Creates the profile, storage pool and bridge network units are launched with.
    pub async fn create_unit_environment(&self, settings: &HostSettings) -> MonounitResult<()> {
        self.lxc(&["profile", "create", &settings.profile]).await?;
        self.create_pool(
            &settings.storage.name,
            &settings.storage.driver,
            &settings.storage.size,
        )
        .await?;

        self.lxc(&[
            "network",
            "create",
            &settings.network.name,
            "ipv6.address=none",
            &format!("ipv4.address={}/24", settings.network.bridge),
            "ipv4.nat=true",
        ])
        .await?;
        self.lxc(&[
            "network",
            "attach-profile",
            &settings.network.name,
            &settings.profile,
            "eth0",
        ])
        .await?;

        self.set_profile_root(&settings.profile, &settings.storage.name)
            .await
    }

    /// Exposes the daemon's API over HTTPS and sets the trust password clients register with.
    pub async fn expose_api(&self, trust: &str) -> MonounitResult<()> {
        self.lxc(&["config", "set", "core.https_address", HTTPS_LISTEN_ADDRESS])
            .await?;
        self.lxc(&["config", "set", "core.trust_password", trust])
            .await?;
        Ok(())
    }

    /// Disk usage of `pool`.
    pub async fn pool_usage(&self, pool: &str) -> MonounitResult<PoolUsage> {
        let out = self.lxc(&["storage", "info", pool, "--bytes"]).await?;
        parse_storage_info(&out)
    }

    /// Memory `(used, total)` in bytes.
    pub async fn memory(&self) -> MonounitResult<(u64, u64)> {
        parse_meminfo(&self.shell("cat /proc/meminfo").await?)
    }

    /// Number of CPUs.
    pub async fn cpus(&self) -> MonounitResult<u32> {
        let out = self.shell("nproc").await?;
        out.trim().parse().map_err(|_| {
            MonounitError::Operation(format!("unexpected cpu count {:?}", out.trim()))
        })
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Parses the output of `lxc storage info <pool> --bytes`.
pub fn parse_storage_info(out: &str) -> MonounitResult<PoolUsage> {
    let field = |name: &str| -> MonounitResult<u64> {
        out.lines()
            .filter_map(|line| line.trim().split_once(':'))
            .find(|(key, _)| key.trim() == name)
            .and_then(|(_, value)| value.trim().trim_matches('"').parse().ok())
            .ok_or_else(|| {
                MonounitError::Operation(format!("storage info has no usable {name:?} field"))
            })
    };

    Ok(PoolUsage {
        used: field("space used")?,
        total: field("total space")?,
    })
}

/// Parses `/proc/meminfo` into `(used, total)` bytes, where used excludes available memory.
pub fn parse_meminfo(out: &str) -> MonounitResult<(u64, u64)> {
    let field = |name: &str| -> MonounitResult<u64> {
        out.lines()
            .filter_map(|line| line.split_once(':'))
            .find(|(key, _)| key.trim() == name)
            .and_then(|(_, value)| value.split_whitespace().next()?.parse::<u64>().ok())
            .map(|kib| kib * 1024)
            .ok_or_else(|| MonounitError::Operation(format!("meminfo has no {name} field")))
    };

    let total = field("MemTotal")?;
    let available = field("MemAvailable")?;
    Ok((total.saturating_sub(available), total))
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_storage_info() -> anyhow::Result<()> {
        let out = r#"info:
  description: ""
  driver: zfs
  name: monounit-20240101120000
  space used: "1048576"
  total space: 53687091200
used by:
  profiles:
  - monounit
"#;
        let usage = parse_storage_info(out)?;
        assert_eq!(usage.used, 1_048_576);
        assert_eq!(usage.total, 53_687_091_200);

        assert!(matches!(
            parse_storage_info("info:\n  driver: dir\n"),
            Err(MonounitError::Operation(_))
        ));
        Ok(())
    }

    #[test]
    fn test_parse_meminfo() -> anyhow::Result<()> {
        let out = "MemTotal:        8000000 kB\nMemFree:         1000000 kB\nMemAvailable:    6000000 kB\n";
        let (used, total) = parse_meminfo(out)?;
        assert_eq!(total, 8_000_000 * 1024);
        assert_eq!(used, 2_000_000 * 1024);
        Ok(())
    }

    #[test]
    fn test_remote_backend_has_no_cli() {
        let mut settings = HostSettings::default_for(BackendKind::Remote, "alice");
        settings.backend.remote = Some("prod".into());
        assert!(matches!(
            LxcCli::for_settings(&settings),
            Err(MonounitError::Validation(_))
        ));

        let settings = HostSettings::default_for(BackendKind::Multipass, "alice");
        assert_eq!(
            LxcCli::for_settings(&settings).ok(),
            Some(LxcCli::Vm { vm: "alice".into() })
        );
    }
}

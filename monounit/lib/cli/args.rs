use std::path::PathBuf;

use clap::Parser;

use super::styles;

//-------------------------------------------------------------------------------------------------
// Types
//-------------------------------------------------------------------------------------------------

/// monounit - build, deploy and operate system containers on local, VM-hosted or remote runtimes
#[derive(Debug, Parser)]
#[command(name = "monounit", author, about, version, styles=styles::styles())]
pub struct MonounitArgs {
    /// The subcommand to run
    #[command(subcommand)]
    pub subcommand: Option<MonounitSubcommand>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

/// Available subcommands
#[derive(Debug, Parser)]
pub enum MonounitSubcommand {
    /// Initialise the backend that hosts units
    #[command(name = "init")]
    Init {
        /// Backend to initialise: lxd, multipass or remote
        #[arg(short, long, default_value = "lxd")]
        backend: String,

        /// Saved remote to use with the remote backend
        #[arg(long)]
        remote: Option<String>,

        /// Storage pool size
        #[arg(long)]
        size: Option<String>,

        /// Number of vCPUs of the managed VM
        #[arg(long)]
        cpu: Option<u32>,

        /// Memory of the managed VM
        #[arg(long)]
        ram: Option<String>,

        /// Disk size of the managed VM
        #[arg(long)]
        hd: Option<String>,

        /// OS image of the managed VM
        #[arg(long)]
        os: Option<String>,
    },

    /// Show backend identity and capacity
    #[command(name = "info")]
    Info,

    /// Replace the storage pool with one of a new size
    #[command(name = "configure")]
    Configure {
        /// New pool size, e.g. 80GB
        #[arg(value_name = "SIZE")]
        size: String,
    },

    /// Manage the VM hosting the runtime
    #[command(name = "vm")]
    Vm {
        /// The VM subcommand to run
        #[command(subcommand)]
        subcommand: VmSubcommand,
    },

    /// Build an image from a unit spec
    #[command(name = "build")]
    Build {
        /// Path of the unit spec
        #[arg(value_name = "SPEC")]
        spec: PathBuf,
    },

    /// Deploy the service of a unit spec
    #[command(name = "deploy")]
    Deploy {
        /// Path of the unit spec
        #[arg(value_name = "SPEC")]
        spec: PathBuf,
    },

    /// Build and deploy every service of a compose spec in dependency order
    #[command(name = "compose")]
    Compose {
        /// Path of the compose spec
        #[arg(value_name = "COMPOSE", default_value = "compose.yml")]
        path: PathBuf,
    },

    /// List units
    #[command(name = "units")]
    Units,

    /// Start a unit
    #[command(name = "start")]
    Start {
        /// Unit name
        name: String,
    },

    /// Stop a unit
    #[command(name = "stop")]
    Stop {
        /// Unit name
        name: String,
    },

    /// Delete a unit
    #[command(name = "remove", alias = "rm")]
    Remove {
        /// Unit name
        name: String,
    },

    /// Publish a unit as an image in the local store
    #[command(name = "publish")]
    Publish {
        /// Unit name
        name: String,
    },

    /// List images in the local store
    #[command(name = "images")]
    Images,

    /// Copy an image archive into the local store
    #[command(name = "import")]
    Import {
        /// Path of the archive, named `<name>_<version>_<arch>.tar.gz`
        #[arg(value_name = "ARCHIVE")]
        archive: PathBuf,
    },

    /// Delete an image from the local store
    #[command(name = "rmi")]
    Rmi {
        /// Image reference, `name[/version[/arch]]`
        image: String,
    },

    /// Mount a unit directory or a host directory into a unit
    #[command(name = "mount")]
    Mount {
        /// Source, `UNIT:path` or a host path
        #[arg(value_name = "SOURCE")]
        source: String,

        /// Destination unit
        #[arg(value_name = "UNIT")]
        unit: String,

        /// Mount point inside the destination unit
        #[arg(value_name = "PATH")]
        path: String,
    },

    /// Remove a mount from a unit
    #[command(name = "umount")]
    Umount {
        /// Unit name
        #[arg(value_name = "UNIT")]
        unit: String,

        /// Mount point inside the unit
        #[arg(value_name = "PATH")]
        path: String,
    },

    /// Manage remotes
    #[command(name = "remote")]
    Remote {
        /// The remote subcommand to run
        #[command(subcommand)]
        subcommand: RemoteSubcommand,
    },
}

/// Subcommands of `monounit vm`
#[derive(Debug, Parser)]
pub enum VmSubcommand {
    /// Start the VM
    #[command(name = "start")]
    Start,

    /// Stop the VM
    #[command(name = "stop")]
    Stop,

    /// Delete and purge the VM
    #[command(name = "delete")]
    Delete,
}

/// Subcommands of `monounit remote`
#[derive(Debug, Parser)]
pub enum RemoteSubcommand {
    /// Add a remote and establish trust with it
    #[command(name = "add")]
    Add {
        /// Remote name
        name: String,

        /// `https://host[:port]` URL of the daemon
        url: String,

        /// Trust password of the daemon
        #[arg(short, long)]
        password: Option<String>,

        /// The remote is a public image server
        #[arg(long)]
        public: bool,
    },

    /// Remove a remote
    #[command(name = "remove", alias = "rm")]
    Remove {
        /// Remote name
        name: String,
    },

    /// List remotes
    #[command(name = "list", alias = "ls")]
    List,
}

//-------------------------------------------------------------------------------------------------
// Tests
//-------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn test_args_are_consistent() {
        MonounitArgs::command().debug_assert();
    }

    #[test]
    fn test_parse_mount() -> anyhow::Result<()> {
        let args = MonounitArgs::try_parse_from(["monounit", "mount", "db:/data", "api", "/srv"])?;
        match args.subcommand {
            Some(MonounitSubcommand::Mount { source, unit, path }) => {
                assert_eq!(source, "db:/data");
                assert_eq!(unit, "api");
                assert_eq!(path, "/srv");
            }
            other => panic!("unexpected subcommand: {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn test_parse_remote_add() -> anyhow::Result<()> {
        let args = MonounitArgs::try_parse_from([
            "monounit",
            "--verbose",
            "remote",
            "add",
            "prod",
            "https://10.1.2.3:8443",
            "--password",
            "s3cret",
        ])?;
        assert!(args.verbose);
        assert!(matches!(
            args.subcommand,
            Some(MonounitSubcommand::Remote {
                subcommand: RemoteSubcommand::Add { ref password, public: false, .. }
            }) if password.as_deref() == Some("s3cret")
        ));
        Ok(())
    }
}

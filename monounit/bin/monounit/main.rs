mod handlers;

use std::process::ExitCode;

use clap::{CommandFactory, Parser};
use monounit::{
    cli::{AnsiStyles, MonounitArgs, MonounitSubcommand, RemoteSubcommand, VmSubcommand},
    MonounitResult,
};
use tracing_subscriber::EnvFilter;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

const DEFAULT_LOG_LEVEL: &str = "info";
const VERBOSE_LOG_LEVEL: &str = "debug";

//--------------------------------------------------------------------------------------------------
// Functions: main
//--------------------------------------------------------------------------------------------------

#[tokio::main]
async fn main() -> ExitCode {
    let args = MonounitArgs::parse();
    init_logging(args.verbose);

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e}");
            eprintln!("{} {e}", "error:".error());
            ExitCode::FAILURE
        }
    }
}

async fn run(args: MonounitArgs) -> MonounitResult<()> {
    match args.subcommand {
        Some(MonounitSubcommand::Init {
            backend,
            remote,
            size,
            cpu,
            ram,
            hd,
            os,
        }) => handlers::init_subcommand(backend, remote, size, cpu, ram, hd, os).await,
        Some(MonounitSubcommand::Info) => handlers::info_subcommand().await,
        Some(MonounitSubcommand::Configure { size }) => handlers::configure_subcommand(size).await,
        Some(MonounitSubcommand::Vm { subcommand }) => match subcommand {
            VmSubcommand::Start => handlers::vm_subcommand(handlers::VmAction::Start).await,
            VmSubcommand::Stop => handlers::vm_subcommand(handlers::VmAction::Stop).await,
            VmSubcommand::Delete => handlers::vm_subcommand(handlers::VmAction::Delete).await,
        },
        Some(MonounitSubcommand::Build { spec }) => handlers::build_subcommand(spec).await,
        Some(MonounitSubcommand::Deploy { spec }) => handlers::deploy_subcommand(spec).await,
        Some(MonounitSubcommand::Compose { path }) => handlers::compose_subcommand(path).await,
        Some(MonounitSubcommand::Units) => handlers::units_subcommand().await,
        Some(MonounitSubcommand::Start { name }) => handlers::start_subcommand(name).await,
        Some(MonounitSubcommand::Stop { name }) => handlers::stop_subcommand(name).await,
        Some(MonounitSubcommand::Remove { name }) => handlers::remove_subcommand(name).await,
        Some(MonounitSubcommand::Publish { name }) => handlers::publish_subcommand(name).await,
        Some(MonounitSubcommand::Images) => handlers::images_subcommand().await,
        Some(MonounitSubcommand::Import { archive }) => handlers::import_subcommand(archive).await,
        Some(MonounitSubcommand::Rmi { image }) => handlers::rmi_subcommand(image).await,
        Some(MonounitSubcommand::Mount { source, unit, path }) => {
            handlers::mount_subcommand(source, unit, path).await
        }
        Some(MonounitSubcommand::Umount { unit, path }) => {
            handlers::umount_subcommand(unit, path).await
        }
        Some(MonounitSubcommand::Remote { subcommand }) => match subcommand {
            RemoteSubcommand::Add {
                name,
                url,
                password,
                public,
            } => handlers::remote_add_subcommand(name, url, password, public).await,
            RemoteSubcommand::Remove { name } => handlers::remote_remove_subcommand(name).await,
            RemoteSubcommand::List => handlers::remote_list_subcommand().await,
        },
        None => {
            MonounitArgs::command().print_help()?;
            Ok(())
        }
    }
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new(VERBOSE_LOG_LEVEL)
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_LEVEL))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

use std::path::PathBuf;

use chrono::Utc;
use monounit::{
    backend::{self, VmBackend},
    cli::AnsiStyles,
    config::{BackendKind, HostSettings},
    management::{self, current_user_name, Context},
    remote::{self, Remote, RemoteProtocol, DAEMON_HTTPS_PORT},
    utils::{format_size, human_age, HomeLayout},
    MonounitError, MonounitResult,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// What to do with the managed VM.
#[derive(Debug, Clone, Copy)]
pub enum VmAction {
    Start,
    Stop,
    Delete,
}

//--------------------------------------------------------------------------------------------------
// Functions: Handlers
//--------------------------------------------------------------------------------------------------

#[allow(clippy::too_many_arguments)]
pub async fn init_subcommand(
    backend: String,
    remote: Option<String>,
    size: Option<String>,
    cpu: Option<u32>,
    ram: Option<String>,
    hd: Option<String>,
    os: Option<String>,
) -> MonounitResult<()> {
    let kind: BackendKind = backend.parse()?;
    let layout = HomeLayout::from_env();
    layout.ensure().await?;
    let user = current_user_name();

    let mut settings = match HostSettings::load(layout.settings_file()).await {
        Ok(settings) => settings,
        Err(MonounitError::NotFound(_)) => HostSettings::default_for(kind, &user),
        Err(e) => return Err(e),
    };

    if settings.backend.kind != kind {
        return Err(MonounitError::Conflict(format!(
            "host is set up for the {} backend, not {kind}",
            settings.backend.kind
        )));
    }

    if !settings.is_active() {
        if let Some(size) = size {
            settings.storage.size = size;
        }
        let resources = &mut settings.backend.resources;
        if let Some(cpu) = cpu {
            resources.cpu = cpu;
        }
        if let Some(ram) = ram {
            resources.ram = ram;
        }
        if let Some(hd) = hd {
            resources.hd = hd;
        }
        if let Some(os) = os {
            resources.os = os;
        }
        if remote.is_some() {
            settings.backend.remote = remote;
        }

        settings.validate()?;
        settings.save(layout.settings_file()).await?;
    }

    backend::from_settings(&layout, &settings, &user)
        .init()
        .await?;

    println!(
        "{} {} backend initialised for {}",
        "✓".valid(),
        kind.to_string().literal(),
        settings.name.literal()
    );
    Ok(())
}

pub async fn info_subcommand() -> MonounitResult<()> {
    let layout = HomeLayout::from_env();
    let settings = HostSettings::load(layout.settings_file()).await?;
    let info = backend::from_settings(&layout, &settings, &current_user_name())
        .info()
        .await?;

    let state = if info.is_running() {
        info.state.valid()
    } else {
        info.state.error()
    };

    println!("{:<8} {}", "name".header(), info.name.literal());
    println!("{:<8} {state}", "state".header());
    println!("{:<8} {}", "ipv4".header(), info.ipv4.placeholder());
    if let [used, total] = info.disk.as_slice() {
        println!("{:<8} {used} / {total}", "disk".header());
    }
    if let [used, total] = info.memory.as_slice() {
        println!("{:<8} {used} / {total}", "memory".header());
    }
    if !info.cpu.is_empty() {
        println!("{:<8} {}", "cpu".header(), info.cpu);
    }
    Ok(())
}

pub async fn configure_subcommand(size: String) -> MonounitResult<()> {
    let ctx = open_context().await?;
    let settings = management::configure(&ctx, &size).await?;
    println!(
        "{} storage pool {} of {}",
        "✓".valid(),
        settings.storage.name.literal(),
        settings.storage.size.placeholder()
    );
    Ok(())
}

pub async fn vm_subcommand(action: VmAction) -> MonounitResult<()> {
    let layout = HomeLayout::from_env();
    let settings = HostSettings::load(layout.settings_file()).await?;
    if settings.backend.kind != BackendKind::Multipass {
        return Err(MonounitError::Validation(format!(
            "the {} backend has no managed vm",
            settings.backend.kind
        )));
    }

    let vm = VmBackend::new(layout, settings, current_user_name());
    match action {
        VmAction::Start => vm.start().await,
        VmAction::Stop => vm.stop().await,
        VmAction::Delete => vm.delete().await,
    }
}

pub async fn build_subcommand(spec: PathBuf) -> MonounitResult<()> {
    let ctx = open_context().await?;
    let built = management::build_image(&ctx, &spec).await?;
    println!(
        "{} built {} ({}, sha256 {})",
        "✓".valid(),
        built.identity.to_string().literal(),
        format_size(built.size).placeholder(),
        built.hash
    );
    Ok(())
}

pub async fn deploy_subcommand(spec: PathBuf) -> MonounitResult<()> {
    let ctx = open_context().await?;
    let record = management::deploy_image(&ctx, &spec).await?;
    println!("{} deployed {}", "✓".valid(), record.name.literal());
    Ok(())
}

pub async fn compose_subcommand(path: PathBuf) -> MonounitResult<()> {
    let ctx = open_context().await?;
    let report = management::compose_up(&ctx, &path).await?;

    for image in &report.skipped {
        println!("- {} already built", image.to_string().literal());
    }
    for image in &report.built {
        println!("{} built {}", "✓".valid(), image.identity.to_string().literal());
    }
    for record in &report.deployed {
        println!("{} deployed {}", "✓".valid(), record.name.literal());
    }
    for image in &report.discarded {
        println!("- discarded base {}", image.to_string().literal());
    }
    Ok(())
}

pub async fn units_subcommand() -> MonounitResult<()> {
    let ctx = open_context().await?;
    let units = management::list_units(&ctx).await?;

    println!(
        "{:<24} {:<10} {:<16} {:<32} {}",
        "NAME".header(),
        "STATUS".header(),
        "IPV4".header(),
        "IMAGE".header(),
        "LIMITS".header()
    );
    for summary in units {
        let status = if summary.unit.is_running() {
            "running".valid()
        } else {
            "stopped".error()
        };
        let (image, limits) = match &summary.record {
            Some(record) => (
                record.data.image.clone(),
                format!("{} cpu, {}", record.data.cpu, record.data.ram),
            ),
            None => ("-".to_string(), "-".to_string()),
        };
        println!(
            "{:<24} {:<10} {:<16} {:<32} {}",
            summary.unit.name.literal(),
            status,
            summary.unit.ipv4.unwrap_or_else(|| "-".to_string()),
            image,
            limits
        );
    }
    Ok(())
}

pub async fn start_subcommand(name: String) -> MonounitResult<()> {
    management::start_unit(&open_context().await?, &name).await
}

pub async fn stop_subcommand(name: String) -> MonounitResult<()> {
    management::stop_unit(&open_context().await?, &name).await
}

pub async fn remove_subcommand(name: String) -> MonounitResult<()> {
    management::delete_unit(&open_context().await?, &name).await?;
    println!("{} removed {}", "✓".valid(), name.literal());
    Ok(())
}

pub async fn publish_subcommand(name: String) -> MonounitResult<()> {
    let ctx = open_context().await?;
    let built = management::publish_unit(&ctx, &name).await?;
    println!(
        "{} published {} as {}",
        "✓".valid(),
        name.literal(),
        built.identity.to_string().literal()
    );
    Ok(())
}

pub async fn images_subcommand() -> MonounitResult<()> {
    let ctx = open_context().await?;
    let images = management::list_images(&ctx).await?;
    let now = Utc::now();

    println!(
        "{:<32} {:<10} {:<14} {}",
        "IMAGE".header(),
        "SIZE".header(),
        "CREATED".header(),
        "SHA256".header()
    );
    for image in images {
        println!(
            "{:<32} {:<10} {:<14} {}",
            image.identity.to_string().literal(),
            format_size(image.size),
            human_age(image.created, now),
            image.hash
        );
    }
    Ok(())
}

pub async fn import_subcommand(archive: PathBuf) -> MonounitResult<()> {
    let ctx = open_context().await?;
    let identity = management::import_image(&ctx, &archive).await?;
    println!("{} imported {}", "✓".valid(), identity.to_string().literal());
    Ok(())
}

pub async fn rmi_subcommand(image: String) -> MonounitResult<()> {
    management::delete_image(&open_context().await?, &image).await?;
    println!("{} deleted {}", "✓".valid(), image.literal());
    Ok(())
}

pub async fn mount_subcommand(source: String, unit: String, path: String) -> MonounitResult<()> {
    let ctx = open_context().await?;
    management::mount(&ctx, &source, &unit, &path).await?;
    println!(
        "{} mounted {} at {}",
        "✓".valid(),
        source.literal(),
        format!("{unit}:{path}").literal()
    );
    Ok(())
}

pub async fn umount_subcommand(unit: String, path: String) -> MonounitResult<()> {
    let ctx = open_context().await?;
    let unmounted = management::umount(&ctx, &unit, &path).await?;
    println!("{} unmounted {}", "✓".valid(), format!("{unit}:{path}").literal());
    if let Some(volume) = unmounted.deleted_volume {
        println!("  deleted unused volume {}", volume.placeholder());
    }
    Ok(())
}

pub async fn remote_add_subcommand(
    name: String,
    url: String,
    password: Option<String>,
    public: bool,
) -> MonounitResult<()> {
    let layout = HomeLayout::from_env();
    layout.ensure().await?;

    let remote = Remote::builder()
        .name(name.clone())
        .url(https_url(&url))
        .protocol(RemoteProtocol::Https)
        .public(public)
        .build();
    let fingerprint =
        remote::add_remote(&layout, &remote, password.as_deref(), &current_user_name()).await?;

    println!("{} added remote {}", "✓".valid(), name.literal());
    if let Some(fingerprint) = fingerprint {
        println!("  certificate fingerprint {}", fingerprint.placeholder());
    }
    Ok(())
}

pub async fn remote_remove_subcommand(name: String) -> MonounitResult<()> {
    remote::remove_remote(&HomeLayout::from_env(), &name).await?;
    println!("{} removed remote {}", "✓".valid(), name.literal());
    Ok(())
}

pub async fn remote_list_subcommand() -> MonounitResult<()> {
    let layout = HomeLayout::from_env();
    for name in remote::list_remotes(&layout).await? {
        let remote = Remote::load(&layout, &name).await?;
        println!(
            "{:<16} {}",
            name.literal(),
            remote.get_url().placeholder()
        );
    }
    Ok(())
}

//--------------------------------------------------------------------------------------------------
// Functions: Helpers
//--------------------------------------------------------------------------------------------------

/// Opens the context and cancels it on the first Ctrl-C or SIGTERM.
async fn open_context() -> MonounitResult<Context> {
    let ctx = Context::open(HomeLayout::from_env()).await?;
    ctx.cancel_on_shutdown()?;
    Ok(ctx)
}

/// Completes `host`, `host:port` or a full URL into an HTTPS URL with a port.
fn https_url(url: &str) -> String {
    let rest = url.strip_prefix("https://").unwrap_or(url);
    if rest.rsplit_once(':').is_some_and(|(_, port)| port.parse::<u16>().is_ok()) {
        format!("https://{rest}")
    } else {
        format!("https://{rest}:{DAEMON_HTTPS_PORT}")
    }
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

mod config;

use std::sync::Arc;

use anyhow::{bail, Context};
use camino::{Utf8Path, Utf8PathBuf};
use clap::Parser;
use config::{
    CloneOptions, Command, InitInstanceOptions, ProcessArgs, ResizeOptions,
};
use qvault::cloud_init::make_cloud_init_files;
use qvault::image::QemuImg;
use qvault::paths;
use qvault::version::VersionProbe;
use qvault::{
    CloneRequest, CreateRequest, QemuVirtualMachineFactory, SshKeyProvider,
    UserModePlatform, VirtualMachineDescription, VmImage, VmSpecs, VmState,
    VmStatusMonitor,
};
use tracing::{debug, info};
use tracing_bunyan_formatter::{BunyanFormattingLayer, JsonStorageLayer};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Registry};

fn main() -> anyhow::Result<()> {
    let args = ProcessArgs::parse();
    set_tracing_subscriber(&args)?;
    debug!(?args);

    let cfg = match &args.config {
        Some(path) => qvault_config_toml::parse(path)
            .with_context(|| format!("reading configuration from {path}"))?,
        None => qvault_config_toml::Config::default(),
    };
    let data_dir = args.data_dir.clone().unwrap_or(cfg.vault.data_dir);

    let qemu_img = QemuImg::new(cfg.qemu.img.clone());
    let platform =
        UserModePlatform::new(cfg.qemu.system_binary(), qemu_img.clone());
    let factory = QemuVirtualMachineFactory::new(
        Arc::new(platform),
        data_dir,
        qemu_img,
        VersionProbe::for_host(&cfg.qemu.system_prefix, &cfg.qemu.host_arch),
    );

    match args.command {
        Command::Version => {
            println!("{}", factory.get_backend_version_string());
        }
        Command::HealthCheck => {
            factory.hypervisor_health_check()?;
            println!("ok");
        }
        Command::Networks => {
            for net in factory.networks()? {
                println!("{}\t{}\t{}", net.id, net.kind, net.description);
            }
        }
        Command::PrepareImage(opts) => {
            let prepared =
                factory.prepare_source_image(&VmImage::from_path(opts.image))?;
            println!("{}", prepared.image_path);
        }
        Command::Resize(opts) => resize(&factory, opts)?,
        Command::InitInstance(opts) => init_instance(&factory, opts)?,
        Command::Clone(opts) => clone_instance(&factory, opts)?,
        Command::Remove(opts) => {
            factory.remove_resources_for(&opts.name)?;
            info!(name = %opts.name, "Removed instance");
        }
    }

    Ok(())
}

fn set_tracing_subscriber(args: &ProcessArgs) -> anyhow::Result<()> {
    let filter = EnvFilter::builder()
        .with_default_directive(tracing::Level::INFO.into());
    let subscriber = Registry::default().with(filter.from_env_lossy());

    // Command output goes to stdout, so logs go to stderr.
    if args.emit_bunyan {
        let bunyan_layer =
            BunyanFormattingLayer::new("qvault".into(), std::io::stderr);
        let subscriber = subscriber.with(JsonStorageLayer).with(bunyan_layer);
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let stderr_log = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_line_number(true)
            .with_ansi(!args.disable_ansi);
        let subscriber = subscriber.with(stderr_log);
        tracing::subscriber::set_global_default(subscriber)?;
    }

    Ok(())
}

/// Reports instance state changes to the log. The CLI keeps no instance
/// database, so there is nowhere else to persist them.
struct LogMonitor;

impl VmStatusMonitor for LogMonitor {
    fn persist_state_for(&self, name: &str, state: VmState) {
        info!(name, ?state, "instance state");
    }
}

/// An OpenSSH public key (`<type> <base64> [comment]`) read from a file.
/// Only the public half is ever available to the CLI.
#[derive(Debug, Default)]
struct PublicKeyFile {
    line: Option<String>,
}

impl PublicKeyFile {
    fn load(path: Option<&Utf8Path>) -> anyhow::Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };

        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading SSH key {path}"))?;
        let line = contents.trim();
        if line.split_whitespace().nth(1).is_none() {
            bail!("{path} is not an OpenSSH public key");
        }

        Ok(Self { line: Some(line.to_owned()) })
    }

    fn authorized_key(&self) -> Option<&str> {
        self.line.as_deref()
    }
}

impl SshKeyProvider for PublicKeyFile {
    fn public_key_as_base64(&self) -> String {
        self.line
            .as_deref()
            .and_then(|line| line.split_whitespace().nth(1))
            .unwrap_or_default()
            .to_owned()
    }

    fn private_key_as_base64(&self) -> String {
        String::new()
    }
}

fn read_specs(path: &Utf8Path) -> anyhow::Result<VmSpecs> {
    let contents = std::fs::read(path)
        .with_context(|| format!("reading instance specs {path}"))?;
    serde_json::from_slice(&contents)
        .with_context(|| format!("parsing instance specs {path}"))
}

fn resize(
    factory: &QemuVirtualMachineFactory,
    opts: ResizeOptions,
) -> anyhow::Result<()> {
    let image = VmImage::from_path(opts.image);
    let desc = VirtualMachineDescription::from_specs(
        &VmSpecs {
            num_cores: 1,
            mem_size: Default::default(),
            disk_space: opts.disk_space,
            default_mac_address: String::new(),
            extra_interfaces: vec![],
            ssh_username: String::new(),
        },
        "",
        image.clone(),
        Utf8PathBuf::new(),
    );

    factory.prepare_instance_image(&image, &desc)?;
    Ok(())
}

fn init_instance(
    factory: &QemuVirtualMachineFactory,
    opts: InitInstanceOptions,
) -> anyhow::Result<()> {
    let mut specs = read_specs(&opts.specs)?;
    let key = PublicKeyFile::load(opts.ssh_key.as_deref())?;
    factory.prepare_networking(&mut specs.extra_interfaces)?;

    let instance_dir = factory.get_instance_directory(&opts.name)?;
    let cloud_init =
        make_cloud_init_files(&opts.name, &specs, key.authorized_key())?;

    let image = match &opts.image {
        Some(source) => {
            let file_name = source
                .file_name()
                .with_context(|| format!("{source} does not name a file"))?;
            VmImage::from_path(instance_dir.join(file_name))
        }
        None => VmImage::default(),
    };

    let desc = VirtualMachineDescription::from_specs(
        &specs,
        &opts.name,
        image,
        paths::cloud_init_container_path(&instance_dir),
    );

    let vm = factory.create_instance(
        CreateRequest { desc, cloud_init, base_image: opts.image },
        Arc::new(key),
        Arc::new(LogMonitor),
    )?;

    println!("{}", vm.instance_directory());
    Ok(())
}

/// Derives the clone's specs from the source's: only the MAC addresses
/// change.
fn destination_specs(
    source: &VmSpecs,
    mac: &str,
    extra_macs: &[String],
) -> anyhow::Result<VmSpecs> {
    if extra_macs.len() != source.extra_interfaces.len() {
        bail!(
            "the source has {} extra interface(s), but {} extra MAC \
            address(es) were given",
            source.extra_interfaces.len(),
            extra_macs.len()
        );
    }

    let mut dest = source.clone();
    dest.default_mac_address = mac.to_owned();
    for (iface, mac) in dest.extra_interfaces.iter_mut().zip(extra_macs) {
        iface.mac_address = mac.clone();
    }

    Ok(dest)
}

/// Picks the disk image in `instance_dir`: the file named `image_name` if
/// one was given, otherwise the only qcow2 or raw image file.
fn find_image_name(
    instance_dir: &Utf8Path,
    image_name: Option<&str>,
) -> anyhow::Result<String> {
    if let Some(name) = image_name {
        return Ok(name.to_owned());
    }

    let mut candidates = Vec::new();
    for entry in instance_dir
        .read_dir_utf8()
        .with_context(|| format!("reading {instance_dir}"))?
    {
        let entry = entry?;
        if matches!(entry.path().extension(), Some("qcow2" | "img")) {
            candidates.push(entry.file_name().to_owned());
        }
    }

    match candidates.as_slice() {
        [name] => Ok(name.clone()),
        [] => bail!("no disk image found in {instance_dir}"),
        _ => bail!(
            "several disk images found in {instance_dir}, pick one with \
            --image-name"
        ),
    }
}

fn clone_instance(
    factory: &QemuVirtualMachineFactory,
    opts: CloneOptions,
) -> anyhow::Result<()> {
    let source_specs = read_specs(&opts.specs)?;
    let destination_specs =
        destination_specs(&source_specs, &opts.mac, &opts.extra_macs)?;

    let source_dir = factory.get_instance_directory(&opts.source)?;
    let image_name = find_image_name(&source_dir, opts.image_name.as_deref())?;
    let destination_image = VmImage::from_path(
        factory.get_instance_directory(&opts.destination)?.join(image_name),
    );

    let key = PublicKeyFile::load(opts.ssh_key.as_deref())?;
    let vm = factory.clone_vm(
        CloneRequest {
            source_name: opts.source,
            destination_name: opts.destination,
            source_specs,
            destination_specs,
            destination_image,
        },
        Arc::new(key),
        Arc::new(LogMonitor),
    )?;

    println!("{}", vm.instance_directory());
    Ok(())
}

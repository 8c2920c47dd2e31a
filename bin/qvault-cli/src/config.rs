// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use qvault::MemorySize;

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Print the QEMU version in use.
    Version,

    /// Check that the host can run QEMU instances.
    HealthCheck,

    /// List the host networks instances can be attached to.
    Networks,

    /// Normalize a disk image to qcow2 v3 and print the prepared image's path.
    PrepareImage(PrepareImageOptions),

    /// Grow a disk image.
    Resize(ResizeOptions),

    /// Create a new instance directory with a fresh cloud-init container.
    InitInstance(InitInstanceOptions),

    /// Clone an existing instance under a new name.
    Clone(CloneOptions),

    /// Release an instance's host resources and delete its directory.
    Remove(RemoveOptions),
}

/// Provisions and clones QEMU instances.
#[derive(Debug, Parser)]
#[clap(name = "qvault", verbatim_doc_comment)]
pub struct ProcessArgs {
    #[clap(subcommand)]
    pub command: Command,

    /// A TOML configuration file. Defaults are used for anything it omits.
    #[clap(long, value_parser)]
    pub config: Option<Utf8PathBuf>,

    /// Overrides the data directory named by the configuration.
    #[clap(long, value_parser)]
    pub data_dir: Option<Utf8PathBuf>,

    /// Suppress emission of terminal control codes in log output.
    #[clap(long, conflicts_with = "emit_bunyan")]
    pub disable_ansi: bool,

    /// Emit Bunyan-formatted logs.
    #[clap(long)]
    pub emit_bunyan: bool,
}

#[derive(Args, Debug)]
pub struct PrepareImageOptions {
    /// The image to prepare. Raw images are converted to a new file next to
    /// this one.
    #[clap(value_parser)]
    pub image: Utf8PathBuf,
}

#[derive(Args, Debug)]
pub struct ResizeOptions {
    #[clap(value_parser)]
    pub image: Utf8PathBuf,

    /// The new size, e.g. `10G`. Must not be smaller than the current size.
    #[clap(long)]
    pub disk_space: MemorySize,
}

#[derive(Args, Debug)]
pub struct InitInstanceOptions {
    pub name: String,

    /// A JSON file containing the instance's specs.
    #[clap(long, value_parser)]
    pub specs: Utf8PathBuf,

    /// A disk image to copy into the instance directory and grow to the
    /// disk size in the specs.
    #[clap(long, value_parser)]
    pub image: Option<Utf8PathBuf>,

    /// An OpenSSH public key file to authorize for the default user.
    #[clap(long, value_parser)]
    pub ssh_key: Option<Utf8PathBuf>,
}

#[derive(Args, Debug)]
pub struct CloneOptions {
    pub source: String,
    pub destination: String,

    /// A JSON file containing the source instance's specs.
    #[clap(long, value_parser)]
    pub specs: Utf8PathBuf,

    /// The clone's default MAC address.
    #[clap(long)]
    pub mac: String,

    /// MAC addresses for the clone's extra interfaces, in the order the
    /// source's extra interfaces are listed.
    #[clap(long = "extra-mac")]
    pub extra_macs: Vec<String>,

    /// The file name of the disk image within the source instance directory.
    /// If omitted, the directory's only `.qcow2` or `.img` file is used.
    #[clap(long)]
    pub image_name: Option<String>,

    /// An OpenSSH public key file for the clone's key provider.
    #[clap(long, value_parser)]
    pub ssh_key: Option<Utf8PathBuf>,
}

#[derive(Args, Debug)]
pub struct RemoveOptions {
    pub name: String,
}

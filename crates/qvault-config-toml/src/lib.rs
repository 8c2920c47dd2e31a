// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::path::Path;

use camino::Utf8PathBuf;
use serde_derive::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_DATA_DIR: &str = "/var/lib/qvault";

/// Configuration for the qvault command-line tool. Every section and key is
/// optional.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Eq)]
pub struct Config {
    #[serde(default)]
    pub vault: Vault,

    #[serde(default)]
    pub qemu: Qemu,
}

/// Where instance data is stored.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct Vault {
    /// The root of the data directory. Each backend keeps its instances in a
    /// subdirectory of this path.
    #[serde(default = "default_data_dir")]
    pub data_dir: Utf8PathBuf,
}

impl Default for Vault {
    fn default() -> Self {
        Self { data_dir: default_data_dir() }
    }
}

fn default_data_dir() -> Utf8PathBuf {
    DEFAULT_DATA_DIR.into()
}

/// The QEMU binaries to use.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct Qemu {
    /// The prefix of the system emulator's name. The emulator for the host
    /// is `<system_prefix>-system-<host_arch>`.
    #[serde(default = "default_system_prefix")]
    pub system_prefix: String,

    /// The `qemu-img` binary.
    #[serde(default = "default_img")]
    pub img: Utf8PathBuf,

    #[serde(default = "default_host_arch")]
    pub host_arch: String,
}

impl Qemu {
    /// The name of the system emulator for the configured host architecture.
    pub fn system_binary(&self) -> String {
        format!("{}-system-{}", self.system_prefix, self.host_arch)
    }
}

impl Default for Qemu {
    fn default() -> Self {
        Self {
            system_prefix: default_system_prefix(),
            img: default_img(),
            host_arch: default_host_arch(),
        }
    }
}

fn default_system_prefix() -> String {
    "qemu".to_owned()
}

fn default_img() -> Utf8PathBuf {
    "qemu-img".into()
}

fn default_host_arch() -> String {
    std::env::consts::ARCH.to_owned()
}

/// Errors which may be returned when parsing the configuration.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("Cannot parse toml: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Parses a TOML file into a configuration object.
pub fn parse<P: AsRef<Path>>(path: P) -> Result<Config, ParseError> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    let cfg = toml::from_str::<Config>(&contents)?;
    Ok(cfg)
}

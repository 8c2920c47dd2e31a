// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Value types describing instances, their images, and their networks.

use std::fmt;
use std::str::FromStr;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A quantity of memory or disk space, in bytes.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
pub struct MemorySize(u64);

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid memory size '{0}': expected a number with an optional K, M or G suffix")]
pub struct MemorySizeParseError(String);

impl MemorySize {
    pub const fn from_bytes(bytes: u64) -> Self {
        Self(bytes)
    }

    pub const fn from_mib(mib: u64) -> Self {
        Self(mib << 20)
    }

    pub const fn from_gib(gib: u64) -> Self {
        Self(gib << 30)
    }

    pub const fn in_bytes(&self) -> u64 {
        self.0
    }

    pub const fn in_mib(&self) -> u64 {
        self.0 >> 20
    }
}

impl FromStr for MemorySize {
    type Err = MemorySizeParseError;

    /// Parses sizes like `1024`, `512K`, `2048M`, `10G` or `1.5G`. Suffixes
    /// are binary multiples and may be followed by an optional `B` or `iB`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || MemorySizeParseError(s.to_owned());
        let trimmed = s.trim();
        let upper = trimmed.to_ascii_uppercase();
        let upper = upper
            .strip_suffix("IB")
            .or_else(|| upper.strip_suffix('B'))
            .unwrap_or(&upper);

        let (number, shift) = match upper.chars().last() {
            Some('K') => (&upper[..upper.len() - 1], 10),
            Some('M') => (&upper[..upper.len() - 1], 20),
            Some('G') => (&upper[..upper.len() - 1], 30),
            Some(c) if c.is_ascii_digit() => (upper, 0),
            _ => return Err(err()),
        };

        if number.is_empty() {
            return Err(err());
        }

        if let Ok(whole) = number.parse::<u64>() {
            // `checked_shl` only guards the shift amount; reject values whose
            // high bits were shifted out.
            return whole
                .checked_shl(shift)
                .filter(|v| v >> shift == whole)
                .map(Self)
                .ok_or_else(err);
        }

        let fractional: f64 = number.parse().map_err(|_| err())?;
        if !fractional.is_finite() || fractional < 0.0 {
            return Err(err());
        }

        let bytes = fractional * (1u64 << shift) as f64;
        if bytes > u64::MAX as f64 {
            return Err(err());
        }

        Ok(Self(bytes as u64))
    }
}

impl fmt::Display for MemorySize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for MemorySize {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for MemorySize {
    fn deserialize<D: serde::Deserializer<'de>>(
        d: D,
    ) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Bytes(u64),
            Text(String),
        }

        match Raw::deserialize(d)? {
            Raw::Bytes(bytes) => Ok(Self(bytes)),
            Raw::Text(text) => text.parse().map_err(serde::de::Error::custom),
        }
    }
}

/// An additional network interface attached to an instance.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInterface {
    /// The host network this interface is attached to.
    pub id: String,
    pub mac_address: String,

    /// If true, the guest is configured to bring the interface up with DHCP.
    #[serde(default = "default_auto_mode")]
    pub auto_mode: bool,
}

fn default_auto_mode() -> bool {
    true
}

/// A host network an instance can be attached to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInterfaceInfo {
    pub id: String,
    pub kind: String,
    pub description: String,
}

/// The lifecycle state of an instance as reported to status monitors.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VmState {
    Off,
    Stopped,
    Starting,
    Running,
    Suspended,
}

/// The configuration of an existing instance.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmSpecs {
    pub num_cores: u16,
    pub mem_size: MemorySize,
    pub disk_space: MemorySize,
    pub default_mac_address: String,
    #[serde(default)]
    pub extra_interfaces: Vec<NetworkInterface>,
    pub ssh_username: String,
}

/// A reference to a disk image on the host.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmImage {
    pub image_path: Utf8PathBuf,
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub aliases: Vec<String>,
}

impl VmImage {
    pub fn from_path(image_path: impl Into<Utf8PathBuf>) -> Self {
        Self { image_path: image_path.into(), ..Default::default() }
    }
}

/// Everything needed to construct a VM handle.
///
/// The `*_config` fields carry cloud-init overrides supplied at launch time.
/// They are `Null` for cloned instances, which inherit their configuration
/// from the copied cloud-init container instead.
#[derive(Clone, Debug, PartialEq)]
pub struct VirtualMachineDescription {
    pub num_cores: u16,
    pub mem_size: MemorySize,
    pub disk_space: MemorySize,
    pub vm_name: String,
    pub default_mac_address: String,
    pub extra_interfaces: Vec<NetworkInterface>,
    pub ssh_username: String,
    pub image: VmImage,
    pub cloud_init_iso: Utf8PathBuf,
    pub meta_data_config: serde_yaml::Value,
    pub user_data_config: serde_yaml::Value,
    pub vendor_data_config: serde_yaml::Value,
    pub network_data_config: serde_yaml::Value,
}

impl VirtualMachineDescription {
    /// Builds a description for `vm_name` from `specs` with no launch-time
    /// cloud-init overrides.
    pub fn from_specs(
        specs: &VmSpecs,
        vm_name: &str,
        image: VmImage,
        cloud_init_iso: Utf8PathBuf,
    ) -> Self {
        Self {
            num_cores: specs.num_cores,
            mem_size: specs.mem_size,
            disk_space: specs.disk_space,
            vm_name: vm_name.to_owned(),
            default_mac_address: specs.default_mac_address.clone(),
            extra_interfaces: specs.extra_interfaces.clone(),
            ssh_username: specs.ssh_username.clone(),
            image,
            cloud_init_iso,
            meta_data_config: serde_yaml::Value::Null,
            user_data_config: serde_yaml::Value::Null,
            vendor_data_config: serde_yaml::Value::Null,
            network_data_config: serde_yaml::Value::Null,
        }
    }
}

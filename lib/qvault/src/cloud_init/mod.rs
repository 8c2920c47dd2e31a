// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Generation and rewriting of an instance's cloud-init documents.
//!
//! A cloned instance starts from a byte-for-byte copy of its source's
//! cloud-init container. Before it boots, the identity-bearing fields in that
//! container (instance ID, host name, interface MAC addresses) are regenerated
//! for the clone so the guest does not come up believing it is the source.
//! Fields this module doesn't know about are left exactly as they were.

use camino::{Utf8Path, Utf8PathBuf};
use serde_yaml::{Mapping, Value};
use thiserror::Error;
use tracing::info;

use crate::types::{NetworkInterface, VmSpecs};

pub mod iso;

pub use iso::CloudInitIso;

pub const META_DATA: &str = "meta-data";
pub const NETWORK_CONFIG: &str = "network-config";
pub const USER_DATA: &str = "user-data";
pub const VENDOR_DATA: &str = "vendor-data";

/// The `cloud-name` reported to guests whose meta-data doesn't name one.
pub const CLOUD_NAME: &str = "qvault";

const CLOUD_CONFIG_HEADER: &str = "#cloud-config\n";

/// The route metric for extra interfaces, chosen to keep the default
/// interface's gateway preferred.
const EXTRA_INTERFACE_ROUTE_METRIC: u64 = 200;

#[derive(Debug, Error)]
pub enum CloudInitError {
    #[error("malformed cloud-init configuration: {0}")]
    ConfigFormat(String),

    #[error("cloud-init container has no {0} entry")]
    MissingConfig(String),

    #[error("corrupt cloud-init configuration: {0}")]
    CorruptConfig(String),

    #[error(
        "cloud-init documents need {required} sectors, only {available} fit"
    )]
    TooLarge { required: usize, available: usize },

    #[error("I/O error on cloud-init container {path}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to build cloud-init volume")]
    Fat(#[source] std::io::Error),
}

/// Parses a cloud-init document into a mapping. Empty documents yield an
/// empty mapping.
fn parse_document(name: &str, contents: &str) -> Result<Mapping, CloudInitError> {
    let value: Value = serde_yaml::from_str(contents).map_err(|e| {
        CloudInitError::ConfigFormat(format!("{name} is not valid YAML: {e}"))
    })?;

    match value {
        Value::Null => Ok(Mapping::new()),
        Value::Mapping(mapping) => Ok(mapping),
        _ => Err(CloudInitError::ConfigFormat(format!(
            "{name} is not a YAML mapping"
        ))),
    }
}

/// Yields the mapping stored under `key` in `parent`, inserting an empty one if
/// the key is absent or null.
fn child_mapping<'a>(
    parent: &'a mut Mapping,
    key: &str,
    context: &str,
) -> Result<&'a mut Mapping, CloudInitError> {
    let missing = parent.get(key).map_or(true, Value::is_null);
    if missing {
        parent.insert(Value::from(key), Value::Mapping(Mapping::new()));
    }

    parent.get_mut(key).and_then(Value::as_mapping_mut).ok_or_else(|| {
        CloudInitError::CorruptConfig(format!("`{context}` is not a mapping"))
    })
}

/// Renders a document as cloud-config text.
pub fn emit_cloud_config(document: &Mapping) -> Result<String, CloudInitError> {
    let yaml = serde_yaml::to_string(document).map_err(|e| {
        CloudInitError::ConfigFormat(format!("failed to serialize: {e}"))
    })?;

    Ok(format!("{CLOUD_CONFIG_HEADER}{yaml}"))
}

/// Produces the meta-data document for `name`, starting from `contents` (the
/// source instance's meta-data, or an empty string for a new instance).
///
/// `local-hostname` becomes `name`. The instance ID keeps any suffix that
/// followed the old host name (so `vm-a_e2` becomes `vm-b_e2`); IDs that
/// don't start with the old host name are replaced outright.
pub fn make_cloud_init_meta_config(
    name: &str,
    contents: &str,
) -> Result<Mapping, CloudInitError> {
    let mut meta = parse_document(META_DATA, contents)?;

    let old_hostname = meta.get("local-hostname").and_then(Value::as_str);
    let old_instance_id = meta.get("instance-id").and_then(Value::as_str);
    let instance_id = match (old_instance_id, old_hostname) {
        (Some(id), Some(host)) if !host.is_empty() => match id.strip_prefix(host) {
            Some(suffix) => format!("{name}{suffix}"),
            None => name.to_owned(),
        },
        _ => name.to_owned(),
    };

    meta.insert(Value::from("instance-id"), Value::from(instance_id));
    meta.insert(Value::from("local-hostname"), Value::from(name));
    if meta.contains_key("hostname") {
        meta.insert(Value::from("hostname"), Value::from(name));
    }
    if !meta.contains_key("cloud-name") {
        meta.insert(Value::from("cloud-name"), Value::from(CLOUD_NAME));
    }

    Ok(meta)
}

/// Produces a netplan v2 network-config document that matches the default
/// interface and every auto-mode extra interface by MAC address, starting from
/// `contents`.
///
/// Interfaces are named `default` and `extra<N>`, where `N` is the interface's
/// position in `extra_interfaces`. `extra<N>` entries left over from the
/// source that don't correspond to an auto-mode interface are dropped.
pub fn make_cloud_init_network_config(
    default_mac_address: &str,
    extra_interfaces: &[NetworkInterface],
    contents: &str,
) -> Result<Mapping, CloudInitError> {
    let mut network = parse_document(NETWORK_CONFIG, contents)?;
    network.insert(Value::from("version"), Value::from(2));

    let ethernets = child_mapping(&mut network, "ethernets", "ethernets")?;
    let retained: Mapping = ethernets
        .iter()
        .filter(|(key, _)| !key.as_str().is_some_and(is_extra_interface_name))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();
    *ethernets = retained;

    configure_ethernet(ethernets, "default", default_mac_address)?;

    for (i, iface) in extra_interfaces.iter().enumerate() {
        if !iface.auto_mode {
            continue;
        }

        let name = format!("extra{i}");
        let ethernet = configure_ethernet(ethernets, &name, &iface.mac_address)?;
        let overrides = child_mapping(
            ethernet,
            "dhcp4-overrides",
            &format!("ethernets.{name}.dhcp4-overrides"),
        )?;
        overrides.insert(
            Value::from("route-metric"),
            Value::from(EXTRA_INTERFACE_ROUTE_METRIC),
        );

        // Don't make networkd wait for the interface to be configured.
        ethernet.insert(Value::from("optional"), Value::from(true));
    }

    Ok(network)
}

fn configure_ethernet<'a>(
    ethernets: &'a mut Mapping,
    name: &str,
    mac_address: &str,
) -> Result<&'a mut Mapping, CloudInitError> {
    let ethernet =
        child_mapping(ethernets, name, &format!("ethernets.{name}"))?;
    let matcher =
        child_mapping(ethernet, "match", &format!("ethernets.{name}.match"))?;
    matcher.insert(Value::from("macaddress"), Value::from(mac_address));
    ethernet.insert(Value::from("dhcp4"), Value::from(true));
    Ok(ethernet)
}

fn is_extra_interface_name(name: &str) -> bool {
    name.strip_prefix("extra").is_some_and(|index| {
        !index.is_empty() && index.bytes().all(|b| b.is_ascii_digit())
    })
}

/// Builds the cloud-init container for a brand new instance.
///
/// A `network-config` entry is only generated when the instance has extra
/// interfaces; with a single interface the guest's default DHCP behavior is
/// sufficient. The vendor-data names the SSH login user and, if supplied,
/// authorizes `ssh_public_key` for it.
pub fn make_cloud_init_files(
    name: &str,
    specs: &VmSpecs,
    ssh_public_key: Option<&str>,
) -> Result<CloudInitIso, CloudInitError> {
    let mut iso = CloudInitIso::new();
    iso.set(META_DATA, emit_cloud_config(&make_cloud_init_meta_config(name, "")?)?);

    let mut vendor = Mapping::new();
    let system_info = child_mapping(&mut vendor, "system_info", "system_info")?;
    let default_user = child_mapping(
        system_info,
        "default_user",
        "system_info.default_user",
    )?;
    default_user.insert(Value::from("name"), Value::from(specs.ssh_username.as_str()));
    if let Some(key) = ssh_public_key {
        vendor.insert(
            Value::from("ssh_authorized_keys"),
            Value::Sequence(vec![Value::from(key)]),
        );
    }
    iso.set(VENDOR_DATA, emit_cloud_config(&vendor)?);
    iso.set(USER_DATA, CLOUD_CONFIG_HEADER);

    if !specs.extra_interfaces.is_empty() {
        let network = make_cloud_init_network_config(
            &specs.default_mac_address,
            &specs.extra_interfaces,
            "",
        )?;
        iso.set(NETWORK_CONFIG, emit_cloud_config(&network)?);
    }

    Ok(iso)
}

/// Rewrites the identity of the cloud-init container at `path` in place so
/// that it describes instance `name` with specs `specs`.
///
/// The result depends only on `name`, `specs` and the container's current
/// contents, so repeating a rewrite with the same inputs produces the same
/// bytes.
pub fn rewrite_cloud_init_identity(
    path: &Utf8Path,
    name: &str,
    specs: &VmSpecs,
) -> Result<(), CloudInitError> {
    info!(%path, name, "Rewriting cloud-init identity");

    let mut iso = CloudInitIso::read_from(path)?;

    let meta = make_cloud_init_meta_config(name, iso.at(META_DATA)?)?;
    iso.set(META_DATA, emit_cloud_config(&meta)?);

    if let Some(contents) = iso.get(NETWORK_CONFIG) {
        let network = make_cloud_init_network_config(
            &specs.default_mac_address,
            &specs.extra_interfaces,
            contents,
        )?;
        iso.set(NETWORK_CONFIG, emit_cloud_config(&network)?);
    }

    iso.write_to(path)
}

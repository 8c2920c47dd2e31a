// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Snapshot records stored alongside an instance.
//!
//! Each snapshot is a JSON file named `<snapshot>.snapshot.json` in the
//! instance directory. Records carry copies of identity-bearing values
//! (interface MAC addresses, the cloud-init instance ID) taken when the
//! snapshot was made; a clone inherits the files, so those values have to be
//! remapped to the clone's identity.

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::types::{MemorySize, NetworkInterface, VmSpecs};

pub const SNAPSHOT_FILE_SUFFIX: &str = ".snapshot.json";

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("I/O error on snapshot data at {path}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed snapshot record {path}")]
    Format {
        path: Utf8PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error(
        "snapshot {snapshot} refers to interface {mac_address}, which has no \
        counterpart in the new instance"
    )]
    UnmappedInterface { snapshot: String, mac_address: String },
}

/// A point-in-time record of an instance's configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub name: String,
    #[serde(default)]
    pub comment: String,
    #[serde(default)]
    pub parent: Option<String>,
    pub index: u32,
    pub num_cores: u16,
    pub mem_size: MemorySize,
    pub disk_space: MemorySize,
    #[serde(default)]
    pub extra_interfaces: Vec<NetworkInterface>,
    pub cloud_init_instance_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,

    /// Fields this version doesn't interpret. They are written back verbatim.
    #[serde(flatten)]
    pub other: serde_json::Map<String, serde_json::Value>,
}

impl SnapshotRecord {
    /// Replaces the source instance's identifiers in this record with the
    /// destination's.
    ///
    /// Extra interfaces are matched to the source specs by MAC address and
    /// replaced with the destination interface at the same position. The
    /// cloud-init instance ID keeps any suffix following the source name.
    pub fn update_unique_identifiers(
        &mut self,
        src_specs: &VmSpecs,
        dest_specs: &VmSpecs,
        src_name: &str,
        dest_name: &str,
    ) -> Result<(), SnapshotError> {
        for iface in &mut self.extra_interfaces {
            let dest_iface = src_specs
                .extra_interfaces
                .iter()
                .position(|src| src.mac_address == iface.mac_address)
                .and_then(|i| dest_specs.extra_interfaces.get(i))
                .ok_or_else(|| SnapshotError::UnmappedInterface {
                    snapshot: self.name.clone(),
                    mac_address: iface.mac_address.clone(),
                })?;

            iface.mac_address = dest_iface.mac_address.clone();
        }

        if let Some(suffix) = self.cloud_init_instance_id.strip_prefix(src_name) {
            self.cloud_init_instance_id = format!("{dest_name}{suffix}");
        }

        Ok(())
    }
}

/// Yields the path of the record for snapshot `name` in `instance_dir`.
pub fn snapshot_path(instance_dir: &Utf8Path, name: &str) -> Utf8PathBuf {
    instance_dir.join(format!("{name}{SNAPSHOT_FILE_SUFFIX}"))
}

/// Reads every snapshot record in `instance_dir`, ordered by snapshot index.
pub fn load_snapshots(
    instance_dir: &Utf8Path,
) -> Result<Vec<(Utf8PathBuf, SnapshotRecord)>, SnapshotError> {
    let io_err = |path: &Utf8Path| {
        let path = path.to_owned();
        move |source| SnapshotError::Io { path, source }
    };

    let mut records = Vec::new();
    for entry in instance_dir.read_dir_utf8().map_err(io_err(instance_dir))? {
        let entry = entry.map_err(io_err(instance_dir))?;
        if !entry.file_name().ends_with(SNAPSHOT_FILE_SUFFIX) {
            continue;
        }

        let path = entry.into_path();
        let contents = std::fs::read(&path).map_err(io_err(&path))?;
        let record: SnapshotRecord =
            serde_json::from_slice(&contents).map_err(|source| {
                SnapshotError::Format { path: path.clone(), source }
            })?;

        debug!(%path, snapshot = %record.name, index = record.index, "loaded snapshot");
        records.push((path, record));
    }

    records.sort_by_key(|(_, record)| record.index);
    Ok(records)
}

/// Writes `record` to `path`, replacing any existing file.
pub fn write_snapshot(
    path: &Utf8Path,
    record: &SnapshotRecord,
) -> Result<(), SnapshotError> {
    let contents = serde_json::to_vec_pretty(record).map_err(|source| {
        SnapshotError::Format { path: path.to_owned(), source }
    })?;

    std::fs::write(path, contents)
        .map_err(|source| SnapshotError::Io { path: path.to_owned(), source })
}

/// Loads the snapshots in `instance_dir` (a freshly cloned copy of
/// `src_name`'s directory), remaps their identifiers to `dest_name`, and
/// writes them back.
pub fn remap_cloned_snapshots(
    instance_dir: &Utf8Path,
    src_specs: &VmSpecs,
    dest_specs: &VmSpecs,
    src_name: &str,
    dest_name: &str,
) -> Result<Vec<SnapshotRecord>, SnapshotError> {
    let mut remapped = Vec::new();
    for (path, mut record) in load_snapshots(instance_dir)? {
        record.update_unique_identifiers(
            src_specs, dest_specs, src_name, dest_name,
        )?;
        write_snapshot(&path, &record)?;
        remapped.push(record);
    }

    if !remapped.is_empty() {
        info!(
            %instance_dir,
            count = remapped.len(),
            "Remapped snapshot identifiers for cloned instance"
        );
    }

    Ok(remapped)
}

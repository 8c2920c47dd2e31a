// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Naming of backend data directories and per-instance directories.
//!
//! Every instance owns one directory under the backend's vault:
//!
//! ```text
//! <data_root>/<backend_subdir>/vault/instances/<instance_name>/
//!     cloud-init-config.iso
//!     <disk image>
//!     <snapshot>.snapshot.json ...
//! ```
//!
//! The functions here only compute paths. [`ensure_instance_directory`] is
//! the one exception: it creates the (empty) directory if it is missing.

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;

/// The subdirectory of a backend's data directory that holds instances.
pub const VAULT_INSTANCES_SUBDIR: &str = "vault/instances";

/// The name of the cloud-init container inside an instance directory.
pub const CLOUD_INIT_CONTAINER: &str = "cloud-init-config.iso";

#[derive(Debug, Error)]
pub enum PathError {
    #[error("invalid instance name '{0}'")]
    InvalidInstanceName(String),

    #[error("failed to create instance directory {path}")]
    CreateDirectory {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Yields the root of `backend_name`'s data under `root`. An empty backend
/// name means the backend stores its data directly in `root`.
pub fn backend_directory_path(root: &Utf8Path, backend_name: &str) -> Utf8PathBuf {
    if backend_name.is_empty() {
        root.to_path_buf()
    } else {
        root.join(backend_name)
    }
}

/// Yields `subdir` within `backend_name`'s data directory under `root`.
pub fn derive_instances_dir(
    root: &Utf8Path,
    backend_name: &str,
    subdir: &str,
) -> Utf8PathBuf {
    backend_directory_path(root, backend_name).join(subdir)
}

/// Yields the directory owned by `instance_name`.
pub fn derive_instance_directory(
    root: &Utf8Path,
    backend_name: &str,
    instance_name: &str,
) -> Result<Utf8PathBuf, PathError> {
    validate_instance_name(instance_name)?;
    Ok(derive_instances_dir(root, backend_name, VAULT_INSTANCES_SUBDIR)
        .join(instance_name))
}

/// Yields the path of the cloud-init container in `instance_dir`.
pub fn cloud_init_container_path(instance_dir: &Utf8Path) -> Utf8PathBuf {
    instance_dir.join(CLOUD_INIT_CONTAINER)
}

/// Like [`derive_instance_directory`], but also creates the directory (and
/// any missing parents) if it does not exist yet.
pub fn ensure_instance_directory(
    root: &Utf8Path,
    backend_name: &str,
    instance_name: &str,
) -> Result<Utf8PathBuf, PathError> {
    let dir = derive_instance_directory(root, backend_name, instance_name)?;
    std::fs::create_dir_all(&dir).map_err(|source| {
        PathError::CreateDirectory { path: dir.clone(), source }
    })?;

    Ok(dir)
}

/// Instance names become a single path component, so they must not be able
/// to escape the vault.
fn validate_instance_name(name: &str) -> Result<(), PathError> {
    let valid = !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\', '\0']);

    if valid {
        Ok(())
    } else {
        Err(PathError::InvalidInstanceName(name.to_owned()))
    }
}

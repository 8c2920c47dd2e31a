// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Disk image preparation using `qemu-img`.
//!
//! Source images are normalized to qcow2 (v3) once when they enter the image
//! cache; instance images are resized to the instance's disk size when the
//! instance is created.

use std::process::Output;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, error, info};

use crate::types::{MemorySize, VirtualMachineDescription, VmImage};

/// The native copy-on-write format for QEMU instances.
pub const NATIVE_FORMAT: &str = "qcow2";

#[derive(Debug, Error)]
pub enum ImageError {
    #[error("failed to convert {path} to {NATIVE_FORMAT}: {reason}")]
    Conversion { path: Utf8PathBuf, reason: String },

    #[error("failed to upgrade {path} to qcow2 v3: {reason}")]
    Amend { path: Utf8PathBuf, reason: String },

    #[error("failed to resize {path}: {reason}")]
    Resize { path: Utf8PathBuf, reason: String },

    #[error(
        "refusing to shrink {path} from {current} to {requested} bytes"
    )]
    ShrinkRejected {
        path: Utf8PathBuf,
        current: MemorySize,
        requested: MemorySize,
    },

    #[error("failed to read image information for {path}: {reason}")]
    Info { path: Utf8PathBuf, reason: String },

    #[error("unexpected `qemu-img info` output for {path}")]
    InfoFormat {
        path: Utf8PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// The subset of `qemu-img info --output=json` this module consumes.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct ImageInfo {
    pub format: String,
    #[serde(rename = "virtual-size")]
    pub virtual_size: u64,
}

/// A handle to the `qemu-img` tool.
#[derive(Clone, Debug)]
pub struct QemuImg {
    program: Utf8PathBuf,
}

impl Default for QemuImg {
    fn default() -> Self {
        Self::new("qemu-img")
    }
}

impl QemuImg {
    pub fn new(program: impl Into<Utf8PathBuf>) -> Self {
        Self { program: program.into() }
    }

    pub fn program(&self) -> &Utf8Path {
        &self.program
    }

    /// Returns true if the tool can be run at all.
    pub fn is_available(&self) -> bool {
        std::process::Command::new(&self.program)
            .arg("--version")
            .output()
            .is_ok_and(|o| o.status.success())
    }

    /// Reads the format and virtual size of the image at `path`.
    pub fn image_info(&self, path: &Utf8Path) -> Result<ImageInfo, ImageError> {
        let output = self
            .run(&["info", "--output=json", path.as_str()])
            .map_err(|reason| ImageError::Info {
                path: path.to_owned(),
                reason,
            })?;

        parse_image_info(&output.stdout).map_err(|source| {
            ImageError::InfoFormat { path: path.to_owned(), source }
        })
    }

    /// Converts the image at `path` to qcow2 if it is a raw image. Returns the
    /// path of the qcow2 image, which is `path` itself if no conversion was
    /// needed.
    pub fn convert_to_qcow_if_necessary(
        &self,
        path: &Utf8Path,
    ) -> Result<Utf8PathBuf, ImageError> {
        let info = self.image_info(path).map_err(|e| ImageError::Conversion {
            path: path.to_owned(),
            reason: e.to_string(),
        })?;

        if info.format != "raw" {
            debug!(%path, format = %info.format, "image needs no conversion");
            return Ok(path.to_owned());
        }

        let qcow2_path = Utf8PathBuf::from(format!("{path}.{NATIVE_FORMAT}"));
        info!(
            source = %path,
            destination = %qcow2_path,
            "Converting raw image to qcow2"
        );

        self.run(&[
            "convert",
            "-p",
            "-O",
            NATIVE_FORMAT,
            path.as_str(),
            qcow2_path.as_str(),
        ])
        .map_err(|reason| ImageError::Conversion {
            path: path.to_owned(),
            reason,
        })?;

        Ok(qcow2_path)
    }

    /// Upgrades a qcow2 image's container to version 3 in place. Images that
    /// are already v3 are left as they are.
    pub fn amend_to_qcow2_v3(&self, path: &Utf8Path) -> Result<(), ImageError> {
        self.run(&["amend", "-o", "compat=1.1", path.as_str()])
            .map(|_| ())
            .map_err(|reason| ImageError::Amend { path: path.to_owned(), reason })
    }

    /// Grows the image at `path` to `disk_space`.
    ///
    /// Shrinking would silently discard guest data, so requests smaller than
    /// the image's current virtual size fail with
    /// [`ImageError::ShrinkRejected`]. A request equal to the current size is
    /// a no-op.
    pub fn resize_instance_image(
        &self,
        disk_space: MemorySize,
        path: &Utf8Path,
    ) -> Result<(), ImageError> {
        let current = MemorySize::from_bytes(self.image_info(path)?.virtual_size);
        if !check_resize(path, current, disk_space)? {
            debug!(%path, size = %current, "image already at requested size");
            return Ok(());
        }

        info!(%path, from = %current, to = %disk_space, "Resizing instance image");
        let size = disk_space.in_bytes().to_string();
        self.run(&["resize", path.as_str(), &size])
            .map(|_| ())
            .map_err(|reason| ImageError::Resize { path: path.to_owned(), reason })
    }

    /// Executes `qemu-img` with `args`. Yields the full command output on
    /// success, or a description of the failure otherwise.
    fn run(&self, args: &[&str]) -> Result<Output, String> {
        debug!(program = %self.program, ?args, "executing qemu-img");

        let output = std::process::Command::new(&self.program)
            .args(args)
            .output()
            .map_err(|e| format!("could not run {}: {e}", self.program))?;

        if !output.status.success() {
            let stdout = String::from_utf8_lossy(&output.stdout);
            let stderr = String::from_utf8_lossy(&output.stderr);
            error!(
                ?args,
                error_code = output.status.code(),
                %stdout,
                %stderr,
                "qemu-img command failed"
            );
            return Err(format!(
                "`{} {}` exited with {:?}: {}",
                self.program,
                args.join(" "),
                output.status.code(),
                stderr.trim()
            ));
        }

        Ok(output)
    }
}

/// Normalizes a source image to the native format: raw images are converted
/// to qcow2, then the qcow2 container is upgraded to v3. Returns a copy of
/// `image` that refers to the prepared file.
pub fn prepare_source_image(
    qemu_img: &QemuImg,
    image: &VmImage,
) -> Result<VmImage, ImageError> {
    let image_path = qemu_img.convert_to_qcow_if_necessary(&image.image_path)?;
    qemu_img.amend_to_qcow2_v3(&image_path)?;
    Ok(VmImage { image_path, ..image.clone() })
}

/// Resizes an instance's own image copy to the disk size in `desc`.
pub fn prepare_instance_image(
    qemu_img: &QemuImg,
    image: &VmImage,
    desc: &VirtualMachineDescription,
) -> Result<(), ImageError> {
    qemu_img.resize_instance_image(desc.disk_space, &image.image_path)
}

/// Decides whether a resize from `current` to `requested` should go ahead.
/// Yields `Ok(false)` when no resize is needed.
fn check_resize(
    path: &Utf8Path,
    current: MemorySize,
    requested: MemorySize,
) -> Result<bool, ImageError> {
    match requested.cmp(&current) {
        std::cmp::Ordering::Less => Err(ImageError::ShrinkRejected {
            path: path.to_owned(),
            current,
            requested,
        }),
        std::cmp::Ordering::Equal => Ok(false),
        std::cmp::Ordering::Greater => Ok(true),
    }
}

fn parse_image_info(stdout: &[u8]) -> Result<ImageInfo, serde_json::Error> {
    serde_json::from_slice(stdout)
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The host-platform capabilities the QEMU backend depends on.
//!
//! Networking and host resource management differ between host operating
//! systems, so the factory reaches them through the [`QemuPlatform`] trait.
//! [`UserModePlatform`] is a minimal implementation for hosts where instances
//! only use QEMU's built-in user-mode networking.

use tracing::{debug, info};

use crate::image::QemuImg;
use crate::types::{NetworkInterface, NetworkInterfaceInfo, VirtualMachineDescription};

/// Host-specific operations needed to create and manage QEMU instances.
#[cfg_attr(test, mockall::automock)]
pub trait QemuPlatform: Send + Sync {
    /// The name of the backend's subdirectory in the data directory. An empty
    /// name stores backend data directly in the data directory.
    fn get_directory_name(&self) -> String;

    /// Releases any host resources (taps, leases, ...) held for instance
    /// `name`.
    fn remove_resources_for(&self, name: &str) -> anyhow::Result<()>;

    /// Fails if the host can't run QEMU instances.
    fn platform_health_check(&self) -> anyhow::Result<()>;

    /// Lists the host networks extra interfaces may be attached to.
    fn networks(&self) -> anyhow::Result<Vec<NetworkInterfaceInfo>>;

    /// Prepares the host side of `extra_interfaces` for an instance that is
    /// about to be created. Implementations may update the interfaces, e.g. to
    /// record the host device each one maps to.
    fn prepare_networking(
        &self,
        extra_interfaces: &mut Vec<NetworkInterface>,
    ) -> anyhow::Result<()>;

    /// Yields platform-specific QEMU arguments for the instance described by
    /// `desc`.
    fn vm_platform_args(&self, desc: &VirtualMachineDescription) -> Vec<String>;
}

/// A platform that only offers QEMU user-mode (SLIRP) networking.
#[derive(Clone, Debug)]
pub struct UserModePlatform {
    system_binary: String,
    qemu_img: QemuImg,
}

impl UserModePlatform {
    pub const DIRECTORY_NAME: &'static str = "qemu";

    pub fn new(system_binary: impl Into<String>, qemu_img: QemuImg) -> Self {
        Self { system_binary: system_binary.into(), qemu_img }
    }
}

impl QemuPlatform for UserModePlatform {
    fn get_directory_name(&self) -> String {
        Self::DIRECTORY_NAME.to_owned()
    }

    fn remove_resources_for(&self, name: &str) -> anyhow::Result<()> {
        debug!(name, "user-mode networking holds no host resources");
        Ok(())
    }

    fn platform_health_check(&self) -> anyhow::Result<()> {
        let system_ok = std::process::Command::new(&self.system_binary)
            .arg("--version")
            .output()
            .is_ok_and(|o| o.status.success());

        anyhow::ensure!(
            system_ok,
            "{} is not installed or does not run",
            self.system_binary
        );
        anyhow::ensure!(
            self.qemu_img.is_available(),
            "{} is not installed or does not run",
            self.qemu_img.program()
        );

        info!(system_binary = %self.system_binary, "QEMU platform is healthy");
        Ok(())
    }

    fn networks(&self) -> anyhow::Result<Vec<NetworkInterfaceInfo>> {
        Ok(Vec::new())
    }

    fn prepare_networking(
        &self,
        extra_interfaces: &mut Vec<NetworkInterface>,
    ) -> anyhow::Result<()> {
        if let Some(iface) = extra_interfaces.first() {
            anyhow::bail!(
                "user-mode networking can't attach interface {} to network {}",
                iface.mac_address,
                iface.id
            );
        }

        Ok(())
    }

    fn vm_platform_args(&self, desc: &VirtualMachineDescription) -> Vec<String> {
        vec![
            "-nic".to_owned(),
            format!("user,model=virtio-net-pci,mac={}", desc.default_mac_address),
        ]
    }
}

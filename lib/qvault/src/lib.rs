// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Provisioning and cloning of QEMU-backed VM instances.
//!
//! The [`factory::QemuVirtualMachineFactory`] is the entry point: it prepares
//! disk images, lays out per-instance directories under the vault, and clones
//! existing instances into new, independently-identified ones. Any clone that
//! fails part way through removes whatever it wrote to the destination.

pub mod cloud_init;
pub mod factory;
pub mod image;
pub mod paths;
pub mod platform;
pub mod snapshot;
pub mod types;
pub mod version;
pub mod vm;

pub use factory::{
    CloneRequest, CreateRequest, FactoryError, QemuVirtualMachineFactory,
};
pub use platform::{QemuPlatform, UserModePlatform};
pub use types::{
    MemorySize, NetworkInterface, NetworkInterfaceInfo,
    VirtualMachineDescription, VmImage, VmSpecs, VmState,
};
pub use vm::{
    QemuVirtualMachine, SshKeyProvider, VirtualMachine, VmStatusMonitor,
};

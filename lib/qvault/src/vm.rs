// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Handles to constructed QEMU instances.

use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use tracing::info;

use crate::image::NATIVE_FORMAT;
use crate::platform::QemuPlatform;
use crate::snapshot::{self, SnapshotError, SnapshotRecord};
use crate::types::{VirtualMachineDescription, VmSpecs, VmState};

/// Supplies the SSH key pair used to log in to instances.
pub trait SshKeyProvider: Send + Sync {
    fn public_key_as_base64(&self) -> String;
    fn private_key_as_base64(&self) -> String;
}

/// Receives instance state changes so they can be persisted.
pub trait VmStatusMonitor: Send + Sync {
    fn persist_state_for(&self, name: &str, state: VmState);
}

/// A constructed instance.
pub trait VirtualMachine: Send + Sync {
    fn vm_name(&self) -> &str;
    fn state(&self) -> VmState;
    fn instance_directory(&self) -> &Utf8Path;
    fn description(&self) -> &VirtualMachineDescription;
    fn snapshot_count(&self) -> usize;

    /// Loads the snapshots this instance inherited from `src_vm_name` and
    /// rewrites their identifiers to match this instance.
    fn load_snapshots_and_update_unique_identifiers(
        &mut self,
        src_specs: &VmSpecs,
        dest_specs: &VmSpecs,
        src_vm_name: &str,
    ) -> Result<(), SnapshotError>;
}

pub struct QemuVirtualMachine {
    desc: VirtualMachineDescription,
    instance_dir: Utf8PathBuf,
    state: VmState,
    snapshots: Vec<SnapshotRecord>,
    platform: Arc<dyn QemuPlatform>,
    monitor: Arc<dyn VmStatusMonitor>,
    key_provider: Arc<dyn SshKeyProvider>,
}

impl QemuVirtualMachine {
    /// Creates a handle for the instance described by `desc`, whose files live
    /// in `instance_dir`. New handles start out [`VmState::Off`].
    pub fn new(
        desc: VirtualMachineDescription,
        instance_dir: Utf8PathBuf,
        platform: Arc<dyn QemuPlatform>,
        monitor: Arc<dyn VmStatusMonitor>,
        key_provider: Arc<dyn SshKeyProvider>,
    ) -> Self {
        let mut vm = Self {
            desc,
            instance_dir,
            state: VmState::Off,
            snapshots: Vec::new(),
            platform,
            monitor,
            key_provider,
        };

        vm.update_state(VmState::Off);
        vm
    }

    /// Records a state change and reports it to the status monitor.
    pub fn update_state(&mut self, state: VmState) {
        info!(vm = %self.desc.vm_name, ?state, "instance state changed");
        self.state = state;
        self.monitor.persist_state_for(&self.desc.vm_name, state);
    }

    /// The public key guests should authorize for the default user.
    pub fn ssh_public_key(&self) -> String {
        self.key_provider.public_key_as_base64()
    }

    pub fn snapshots(&self) -> &[SnapshotRecord] {
        &self.snapshots
    }

    /// Reads this instance's snapshot records from its directory.
    pub fn load_snapshots(&mut self) -> Result<(), SnapshotError> {
        self.snapshots = snapshot::load_snapshots(&self.instance_dir)?
            .into_iter()
            .map(|(_, record)| record)
            .collect();
        Ok(())
    }

    /// The QEMU command line (without the program name) that boots this
    /// instance.
    pub fn qemu_args(&self) -> Vec<String> {
        let desc = &self.desc;
        let mut args = vec![
            "-name".to_owned(),
            desc.vm_name.clone(),
            "-smp".to_owned(),
            desc.num_cores.to_string(),
            "-m".to_owned(),
            format!("{}M", desc.mem_size.in_mib()),
            "-drive".to_owned(),
            format!(
                "file={},if=virtio,format={NATIVE_FORMAT},discard=unmap",
                desc.image.image_path
            ),
            "-cdrom".to_owned(),
            desc.cloud_init_iso.to_string(),
            "-nographic".to_owned(),
        ];

        args.extend(self.platform.vm_platform_args(desc));
        args
    }
}

impl VirtualMachine for QemuVirtualMachine {
    fn vm_name(&self) -> &str {
        &self.desc.vm_name
    }

    fn state(&self) -> VmState {
        self.state
    }

    fn instance_directory(&self) -> &Utf8Path {
        &self.instance_dir
    }

    fn description(&self) -> &VirtualMachineDescription {
        &self.desc
    }

    fn snapshot_count(&self) -> usize {
        self.snapshots.len()
    }

    fn load_snapshots_and_update_unique_identifiers(
        &mut self,
        src_specs: &VmSpecs,
        dest_specs: &VmSpecs,
        src_vm_name: &str,
    ) -> Result<(), SnapshotError> {
        self.snapshots = snapshot::remap_cloned_snapshots(
            &self.instance_dir,
            src_specs,
            dest_specs,
            src_vm_name,
            &self.desc.vm_name,
        )?;
        Ok(())
    }
}

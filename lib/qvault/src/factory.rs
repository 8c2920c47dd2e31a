// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Construction of QEMU instances, including transactional cloning.
//!
//! A clone copies the source instance's directory to the destination name,
//! re-identifies the copy and constructs a handle for it. If any step fails,
//! the destination directory is removed before the error is returned, so a
//! failed clone leaves nothing behind and the destination name can be reused.

use std::io;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::cloud_init::{self, CloudInitError, CloudInitIso};
use crate::image::{self, ImageError, QemuImg};
use crate::paths::{self, PathError};
use crate::platform::QemuPlatform;
use crate::snapshot::SnapshotError;
use crate::types::{
    NetworkInterface, NetworkInterfaceInfo, VirtualMachineDescription, VmImage,
    VmSpecs,
};
use crate::version::VersionProbe;
use crate::vm::{
    QemuVirtualMachine, SshKeyProvider, VirtualMachine, VmStatusMonitor,
};

#[derive(Debug, Error)]
pub enum FactoryError {
    #[error("failed to copy instance directory {from} to {to}")]
    DirectoryCopy {
        from: Utf8PathBuf,
        to: Utf8PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to create instance directory {path}")]
    CreateDirectory {
        path: Utf8PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to copy disk image {from} to {to}")]
    ImageCopy {
        from: Utf8PathBuf,
        to: Utf8PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to remove instance directory {path}")]
    RemoveDirectory {
        path: Utf8PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Path(#[from] PathError),

    #[error(transparent)]
    CloudInit(#[from] CloudInitError),

    #[error(transparent)]
    Image(#[from] ImageError),

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    #[error(transparent)]
    Platform(#[from] anyhow::Error),
}

/// The inputs to [`QemuVirtualMachineFactory::clone_vm`].
#[derive(Clone, Debug)]
pub struct CloneRequest {
    pub source_name: String,
    pub destination_name: String,
    pub source_specs: VmSpecs,
    pub destination_specs: VmSpecs,

    /// The destination's disk image. This must already refer to a file in
    /// the destination's instance directory.
    pub destination_image: VmImage,
}

/// The inputs to [`QemuVirtualMachineFactory::create_instance`].
#[derive(Clone, Debug)]
pub struct CreateRequest {
    pub desc: VirtualMachineDescription,

    /// Written to `desc.cloud_init_iso`.
    pub cloud_init: CloudInitIso,

    /// A disk image to copy to `desc.image` and grow to `desc.disk_space`.
    pub base_image: Option<Utf8PathBuf>,
}

/// Removes a partially-built instance directory when dropped, unless
/// dismissed first.
#[derive(Debug)]
struct RollbackGuard {
    path: Utf8PathBuf,
    armed: bool,
}

impl RollbackGuard {
    fn new(path: Utf8PathBuf) -> Self {
        Self { path, armed: true }
    }

    fn dismiss(&mut self) {
        self.armed = false;
    }
}

impl Drop for RollbackGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        match self.path.try_exists() {
            Ok(true) => {}
            Ok(false) => return,
            Err(e) => {
                warn!(path = %self.path, error = %e,
                      "failed to check for instance directory during rollback");
                return;
            }
        }

        info!(path = %self.path, "Rolling back partially created instance");
        if let Err(e) = std::fs::remove_dir_all(&self.path) {
            warn!(path = %self.path, error = %e,
                  "failed to remove instance directory during rollback");
        }
    }
}

/// Recursively copies the contents of directory `from` into the existing
/// directory `to`.
///
/// Symbolic links are followed: the copy holds the targets' contents, never
/// a link back into files another instance can write.
fn copy_dir_all(from: &Utf8Path, to: &Utf8Path) -> io::Result<()> {
    for entry in from.read_dir_utf8()? {
        let entry = entry?;
        let target = to.join(entry.file_name());

        if std::fs::metadata(entry.path())?.is_dir() {
            std::fs::create_dir(&target)?;
            copy_dir_all(entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }

    Ok(())
}

/// Creates, clones and removes QEMU instances stored under a data directory.
pub struct QemuVirtualMachineFactory {
    platform: Arc<dyn QemuPlatform>,
    data_dir: Utf8PathBuf,
    qemu_img: QemuImg,
    version_probe: VersionProbe,
}

impl QemuVirtualMachineFactory {
    pub fn new(
        platform: Arc<dyn QemuPlatform>,
        data_dir: Utf8PathBuf,
        qemu_img: QemuImg,
        version_probe: VersionProbe,
    ) -> Self {
        Self { platform, data_dir, qemu_img, version_probe }
    }

    pub fn data_dir(&self) -> &Utf8Path {
        &self.data_dir
    }

    pub fn get_backend_directory_name(&self) -> String {
        self.platform.get_directory_name()
    }

    /// Yields the directory owned by instance `name`. The directory may not
    /// exist.
    pub fn get_instance_directory(
        &self,
        name: &str,
    ) -> Result<Utf8PathBuf, FactoryError> {
        Ok(paths::derive_instance_directory(
            &self.data_dir,
            &self.get_backend_directory_name(),
            name,
        )?)
    }

    /// Constructs a handle for the instance in `desc`, creating its instance
    /// directory if necessary.
    pub fn create_virtual_machine(
        &self,
        desc: VirtualMachineDescription,
        key_provider: Arc<dyn SshKeyProvider>,
        monitor: Arc<dyn VmStatusMonitor>,
    ) -> Result<Box<dyn VirtualMachine>, FactoryError> {
        let instance_dir = paths::ensure_instance_directory(
            &self.data_dir,
            &self.get_backend_directory_name(),
            &desc.vm_name,
        )?;

        debug!(vm = %desc.vm_name, %instance_dir, "constructing instance");
        let mut vm = QemuVirtualMachine::new(
            desc,
            instance_dir,
            self.platform.clone(),
            monitor,
            key_provider,
        );
        vm.load_snapshots()?;
        Ok(Box::new(vm))
    }

    /// Builds a new instance directory holding `request.cloud_init` and, if
    /// given, a resized copy of `request.base_image`, then constructs a handle
    /// for it.
    ///
    /// The instance directory must not exist yet. On failure it is removed
    /// again before the error is returned.
    pub fn create_instance(
        &self,
        request: CreateRequest,
        key_provider: Arc<dyn SshKeyProvider>,
        monitor: Arc<dyn VmStatusMonitor>,
    ) -> Result<Box<dyn VirtualMachine>, FactoryError> {
        let CreateRequest { desc, cloud_init, base_image } = request;

        let instance_dir = self.get_instance_directory(&desc.vm_name)?;
        let mut rollback = RollbackGuard::new(instance_dir.clone());

        let create_error = |source| FactoryError::CreateDirectory {
            path: instance_dir.clone(),
            source,
        };
        let created = match instance_dir.parent() {
            Some(parent) => std::fs::create_dir_all(parent),
            None => Ok(()),
        }
        .and_then(|()| std::fs::create_dir(&instance_dir));
        if let Err(e) = created {
            rollback.dismiss();
            return Err(create_error(e));
        }

        info!(vm = %desc.vm_name, path = %instance_dir, "Creating instance");
        cloud_init.write_to(&desc.cloud_init_iso)?;

        if let Some(base_image) = base_image {
            let image_path = &desc.image.image_path;
            std::fs::copy(&base_image, image_path).map_err(|source| {
                FactoryError::ImageCopy {
                    from: base_image.clone(),
                    to: image_path.clone(),
                    source,
                }
            })?;
            self.prepare_instance_image(&desc.image, &desc)?;
        }

        let vm = self.create_virtual_machine(desc, key_provider, monitor)?;

        rollback.dismiss();
        Ok(vm)
    }

    /// Clones instance `request.source_name` to `request.destination_name`.
    ///
    /// On failure the destination directory is removed and the error from the
    /// failing step is returned. The source directory is only ever read.
    pub fn clone_vm(
        &self,
        request: CloneRequest,
        key_provider: Arc<dyn SshKeyProvider>,
        monitor: Arc<dyn VmStatusMonitor>,
    ) -> Result<Box<dyn VirtualMachine>, FactoryError> {
        let CloneRequest {
            source_name,
            destination_name,
            source_specs,
            destination_specs,
            destination_image,
        } = request;

        let source_dir = self.get_instance_directory(&source_name)?;
        let dest_dir = self.get_instance_directory(&destination_name)?;

        let mut rollback = RollbackGuard::new(dest_dir.clone());

        info!(
            source = %source_dir,
            destination = %dest_dir,
            "Cloning instance directory"
        );
        let copy_error = |source| FactoryError::DirectoryCopy {
            from: source_dir.clone(),
            to: dest_dir.clone(),
            source,
        };

        // Nothing was created if this fails, and a destination that was
        // already there belongs to someone else.
        if let Err(e) = std::fs::create_dir(&dest_dir) {
            rollback.dismiss();
            return Err(copy_error(e));
        }
        copy_dir_all(&source_dir, &dest_dir).map_err(copy_error)?;

        let cloud_init_iso = paths::cloud_init_container_path(&dest_dir);
        cloud_init::rewrite_cloud_init_identity(
            &cloud_init_iso,
            &destination_name,
            &destination_specs,
        )?;

        let desc = VirtualMachineDescription::from_specs(
            &destination_specs,
            &destination_name,
            destination_image,
            cloud_init_iso,
        );

        let mut vm = self.create_virtual_machine(desc, key_provider, monitor)?;
        vm.load_snapshots_and_update_unique_identifiers(
            &source_specs,
            &destination_specs,
            &source_name,
        )?;

        rollback.dismiss();
        info!(source = %source_name, destination = %destination_name, "Cloned instance");
        Ok(vm)
    }

    /// Normalizes a downloaded image for use as an instance base image.
    pub fn prepare_source_image(
        &self,
        image: &VmImage,
    ) -> Result<VmImage, FactoryError> {
        Ok(image::prepare_source_image(&self.qemu_img, image)?)
    }

    /// Resizes an instance's image to the disk size in `desc`.
    pub fn prepare_instance_image(
        &self,
        image: &VmImage,
        desc: &VirtualMachineDescription,
    ) -> Result<(), FactoryError> {
        Ok(image::prepare_instance_image(&self.qemu_img, image, desc)?)
    }

    pub fn hypervisor_health_check(&self) -> Result<(), FactoryError> {
        Ok(self.platform.platform_health_check()?)
    }

    pub fn get_backend_version_string(&self) -> String {
        self.version_probe.version_string()
    }

    pub fn networks(&self) -> Result<Vec<NetworkInterfaceInfo>, FactoryError> {
        Ok(self.platform.networks()?)
    }

    pub fn prepare_networking(
        &self,
        extra_interfaces: &mut Vec<NetworkInterface>,
    ) -> Result<(), FactoryError> {
        Ok(self.platform.prepare_networking(extra_interfaces)?)
    }

    /// Releases the platform resources held for instance `name`, then deletes
    /// its instance directory. Removing an instance with no directory is not
    /// an error.
    pub fn remove_resources_for(&self, name: &str) -> Result<(), FactoryError> {
        let instance_dir = self.get_instance_directory(name)?;
        self.platform.remove_resources_for(name)?;

        info!(name, path = %instance_dir, "Removing instance directory");
        match std::fs::remove_dir_all(&instance_dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => {
                Err(FactoryError::RemoveDirectory { path: instance_dir, source })
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cloud_init::{CloudInitIso, META_DATA, NETWORK_CONFIG};
    use crate::platform::MockQemuPlatform;
    use crate::snapshot::{self, SnapshotRecord};
    use crate::types::{MemorySize, VmState};
    use crate::vm::test::{FixedKeys, RecordingMonitor};

    struct Fixture {
        _tmp: tempfile::TempDir,
        factory: QemuVirtualMachineFactory,
        monitor: Arc<RecordingMonitor>,
    }

    impl Fixture {
        fn new() -> Self {
            let mut platform = MockQemuPlatform::new();
            platform
                .expect_get_directory_name()
                .returning(|| "qemu".to_owned());

            Self::with_platform(platform)
        }

        fn with_platform(platform: MockQemuPlatform) -> Self {
            let tmp = tempfile::tempdir().unwrap();
            let data_dir = Utf8Path::from_path(tmp.path()).unwrap().to_owned();
            let factory = QemuVirtualMachineFactory::new(
                Arc::new(platform),
                data_dir,
                QemuImg::new("/nonexistent/qemu-img"),
                VersionProbe::new("/nonexistent/qemu-system-x86_64"),
            );

            Self { _tmp: tmp, factory, monitor: Default::default() }
        }

        fn dir(&self, name: &str) -> Utf8PathBuf {
            self.factory.get_instance_directory(name).unwrap()
        }

        /// Creates a source instance with a disk, a cloud-init container and
        /// the given network-config entry.
        fn make_source(
            &self,
            name: &str,
            specs: &VmSpecs,
            network_config: Option<&str>,
        ) -> Utf8PathBuf {
            let dir = paths::ensure_instance_directory(
                self.factory.data_dir(),
                "qemu",
                name,
            )
            .unwrap();

            let mut iso =
                cloud_init::make_cloud_init_files(name, specs, None).unwrap();
            iso.remove(NETWORK_CONFIG);
            if let Some(contents) = network_config {
                iso.set(NETWORK_CONFIG, contents);
            }
            iso.write_to(&paths::cloud_init_container_path(&dir)).unwrap();
            std::fs::write(dir.join("disk.qcow2"), b"disk contents").unwrap();
            std::fs::create_dir(dir.join("state")).unwrap();
            std::fs::write(dir.join("state/notes"), b"nested").unwrap();
            dir
        }

        fn clone_request(&self, from: &str, to: &str) -> CloneRequest {
            CloneRequest {
                source_name: from.to_owned(),
                destination_name: to.to_owned(),
                source_specs: specs("AA:BB:CC:00:00:01"),
                destination_specs: specs("AA:BB:CC:00:00:02"),
                destination_image: VmImage::from_path(
                    self.dir(to).join("disk.qcow2"),
                ),
            }
        }

        fn clone_vm(
            &self,
            request: CloneRequest,
        ) -> Result<Box<dyn VirtualMachine>, FactoryError> {
            self.factory.clone_vm(
                request,
                Arc::new(FixedKeys),
                self.monitor.clone(),
            )
        }

        /// Clones, expecting failure.
        fn clone_err(&self, request: CloneRequest) -> FactoryError {
            match self.clone_vm(request) {
                Ok(vm) => panic!("clone to {} succeeded", vm.vm_name()),
                Err(e) => e,
            }
        }

        fn create_request(
            &self,
            name: &str,
            base_image: Option<Utf8PathBuf>,
        ) -> CreateRequest {
            let specs = specs("AA:BB:CC:00:00:01");
            let dir = self.dir(name);
            let image = match &base_image {
                Some(_) => VmImage::from_path(dir.join("disk.qcow2")),
                None => VmImage::default(),
            };
            CreateRequest {
                desc: VirtualMachineDescription::from_specs(
                    &specs,
                    name,
                    image,
                    paths::cloud_init_container_path(&dir),
                ),
                cloud_init: cloud_init::make_cloud_init_files(name, &specs, None)
                    .unwrap(),
                base_image,
            }
        }

        fn create_instance(
            &self,
            request: CreateRequest,
        ) -> Result<Box<dyn VirtualMachine>, FactoryError> {
            self.factory.create_instance(
                request,
                Arc::new(FixedKeys),
                self.monitor.clone(),
            )
        }
    }

    fn specs(mac: &str) -> VmSpecs {
        VmSpecs {
            num_cores: 2,
            mem_size: MemorySize::from_mib(2048),
            disk_space: MemorySize::from_mib(10240),
            default_mac_address: mac.to_owned(),
            extra_interfaces: vec![],
            ssh_username: "ubuntu".to_owned(),
        }
    }

    fn snapshot_record(name: &str, instance_id: &str) -> SnapshotRecord {
        SnapshotRecord {
            name: name.to_owned(),
            comment: "before upgrade".to_owned(),
            parent: None,
            index: 1,
            num_cores: 2,
            mem_size: MemorySize::from_mib(2048),
            disk_space: MemorySize::from_mib(10240),
            extra_interfaces: vec![],
            cloud_init_instance_id: instance_id.to_owned(),
            created: None,
            other: Default::default(),
        }
    }

    /// Reads every file under `dir`, keyed by path relative to `dir`.
    fn tree(dir: &Utf8Path) -> Vec<(Utf8PathBuf, Vec<u8>)> {
        let mut files = Vec::new();
        let mut pending = vec![dir.to_owned()];
        while let Some(current) = pending.pop() {
            for entry in current.read_dir_utf8().unwrap() {
                let entry = entry.unwrap();
                if entry.file_type().unwrap().is_dir() {
                    pending.push(entry.into_path());
                } else {
                    let rel = entry.path().strip_prefix(dir).unwrap().to_owned();
                    files.push((rel, std::fs::read(entry.path()).unwrap()));
                }
            }
        }

        files.sort();
        files
    }

    fn meta_data(dir: &Utf8Path) -> serde_yaml::Mapping {
        let iso =
            CloudInitIso::read_from(&paths::cloud_init_container_path(dir))
                .unwrap();
        serde_yaml::from_str(iso.at(META_DATA).unwrap()).unwrap()
    }

    #[test]
    fn clone_reidentifies_the_copy_and_leaves_the_source_alone() {
        let fx = Fixture::new();
        let source = fx.make_source("vm-a", &specs("AA:BB:CC:00:00:01"), None);
        let before = tree(&source);

        let vm = fx.clone_vm(fx.clone_request("vm-a", "vm-b")).unwrap();

        assert_eq!(vm.vm_name(), "vm-b");
        assert_eq!(vm.state(), VmState::Off);
        assert_eq!(vm.instance_directory(), fx.dir("vm-b").as_path());
        assert_eq!(vm.description().default_mac_address, "AA:BB:CC:00:00:02");
        assert_eq!(vm.description().meta_data_config, serde_yaml::Value::Null);
        assert_eq!(
            vm.description().cloud_init_iso,
            fx.dir("vm-b").join("cloud-init-config.iso")
        );

        let meta = meta_data(&fx.dir("vm-b"));
        assert_eq!(meta.get("local-hostname").and_then(|v| v.as_str()), Some("vm-b"));
        assert_eq!(meta.get("instance-id").and_then(|v| v.as_str()), Some("vm-b"));

        // Everything other than the container was copied verbatim.
        let dest = tree(&fx.dir("vm-b"));
        let without_container = |files: Vec<(Utf8PathBuf, Vec<u8>)>| {
            files
                .into_iter()
                .filter(|(p, _)| p.as_str() != paths::CLOUD_INIT_CONTAINER)
                .collect::<Vec<_>>()
        };
        assert_eq!(without_container(dest), without_container(before.clone()));

        assert_eq!(tree(&source), before);
        assert_eq!(
            *fx.monitor.states.lock().unwrap(),
            vec![("vm-b".to_owned(), VmState::Off)]
        );
    }

    #[test]
    fn network_config_is_rewritten_only_when_present() {
        let fx = Fixture::new();
        fx.make_source(
            "vm-a",
            &specs("AA:BB:CC:00:00:01"),
            Some(
                "version: 2\nethernets:\n  default:\n    match:\n      \
                 macaddress: AA:BB:CC:00:00:01\n    dhcp4: true\n",
            ),
        );
        fx.make_source("vm-c", &specs("AA:BB:CC:00:00:01"), None);

        fx.clone_vm(fx.clone_request("vm-a", "vm-b")).unwrap();
        fx.clone_vm(fx.clone_request("vm-c", "vm-d")).unwrap();

        let with_network = CloudInitIso::read_from(
            &paths::cloud_init_container_path(&fx.dir("vm-b")),
        )
        .unwrap();
        let network = with_network.at(NETWORK_CONFIG).unwrap();
        assert!(network.contains("AA:BB:CC:00:00:02"), "{network}");
        assert!(!network.contains("AA:BB:CC:00:00:01"), "{network}");

        let without_network = CloudInitIso::read_from(
            &paths::cloud_init_container_path(&fx.dir("vm-d")),
        )
        .unwrap();
        assert!(!without_network.contains(NETWORK_CONFIG));
    }

    #[test]
    fn corrupt_container_rolls_back_the_destination() {
        let fx = Fixture::new();
        let source = fx.make_source("vm-a", &specs("AA:BB:CC:00:00:01"), None);
        std::fs::write(paths::cloud_init_container_path(&source), b"junk")
            .unwrap();
        let before = tree(&source);

        let err = fx.clone_err(fx.clone_request("vm-a", "vm-b"));
        assert!(
            matches!(err, FactoryError::CloudInit(CloudInitError::ConfigFormat(_))),
            "{err:?}"
        );
        assert!(!fx.dir("vm-b").exists());
        assert_eq!(tree(&source), before);

        // The destination name is free for another attempt.
        cloud_init::make_cloud_init_files("vm-a", &specs("AA:BB:CC:00:00:01"), None)
            .unwrap()
            .write_to(&paths::cloud_init_container_path(&source))
            .unwrap();
        fx.clone_vm(fx.clone_request("vm-a", "vm-b")).unwrap();
    }

    #[test]
    fn missing_meta_data_rolls_back_the_destination() {
        let fx = Fixture::new();
        let source = fx.make_source("vm-a", &specs("AA:BB:CC:00:00:01"), None);
        let mut iso = CloudInitIso::read_from(&paths::cloud_init_container_path(&source))
            .unwrap();
        iso.remove(META_DATA);
        iso.write_to(&paths::cloud_init_container_path(&source)).unwrap();

        let err = fx.clone_err(fx.clone_request("vm-a", "vm-b"));
        assert!(
            matches!(err, FactoryError::CloudInit(CloudInitError::MissingConfig(_))),
            "{err:?}"
        );
        assert!(!fx.dir("vm-b").exists());
    }

    #[test]
    fn missing_source_is_a_copy_error() {
        let fx = Fixture::new();
        let err = fx.clone_err(fx.clone_request("vm-a", "vm-b"));
        assert!(matches!(err, FactoryError::DirectoryCopy { .. }), "{err:?}");
        assert!(!fx.dir("vm-b").exists());
    }

    #[test]
    fn existing_destination_is_refused_and_kept() {
        let fx = Fixture::new();
        fx.make_source("vm-a", &specs("AA:BB:CC:00:00:01"), None);
        let existing = fx.make_source("vm-b", &specs("AA:BB:CC:00:00:09"), None);
        let before = tree(&existing);

        let err = fx.clone_err(fx.clone_request("vm-a", "vm-b"));
        match err {
            FactoryError::DirectoryCopy { source, .. } => {
                assert_eq!(source.kind(), io::ErrorKind::AlreadyExists)
            }
            e => panic!("unexpected error {e:?}"),
        }
        assert_eq!(tree(&existing), before);
    }

    #[test]
    fn snapshots_are_remapped_in_the_copy_only() {
        let fx = Fixture::new();
        let source = fx.make_source("vm-a", &specs("AA:BB:CC:00:00:01"), None);
        let record = snapshot_record("snapshot1", "vm-a");
        let source_snapshot = snapshot::snapshot_path(&source, "snapshot1");
        snapshot::write_snapshot(&source_snapshot, &record).unwrap();
        let before = std::fs::read(&source_snapshot).unwrap();

        let vm = fx.clone_vm(fx.clone_request("vm-a", "vm-b")).unwrap();
        assert_eq!(vm.snapshot_count(), 1);

        let (_, cloned) = snapshot::load_snapshots(&fx.dir("vm-b"))
            .unwrap()
            .pop()
            .unwrap();
        assert_eq!(cloned.cloud_init_instance_id, "vm-b");
        assert_eq!(std::fs::read(&source_snapshot).unwrap(), before);
    }

    #[test]
    fn bad_snapshot_rolls_back_the_destination() {
        let fx = Fixture::new();
        let source = fx.make_source("vm-a", &specs("AA:BB:CC:00:00:01"), None);
        std::fs::write(snapshot::snapshot_path(&source, "broken"), b"{").unwrap();

        let err = fx.clone_err(fx.clone_request("vm-a", "vm-b"));
        assert!(
            matches!(err, FactoryError::Snapshot(SnapshotError::Format { .. })),
            "{err:?}"
        );
        assert!(!fx.dir("vm-b").exists());
    }

    #[test]
    fn invalid_destination_names_are_rejected_before_copying() {
        let fx = Fixture::new();
        fx.make_source("vm-a", &specs("AA:BB:CC:00:00:01"), None);

        let mut request = fx.clone_request("vm-a", "vm-b");
        request.destination_name = "../vm-a".to_owned();
        let err = fx.clone_err(request);
        assert!(
            matches!(err, FactoryError::Path(PathError::InvalidInstanceName(_))),
            "{err:?}"
        );
    }

    #[test]
    fn rollback_guard_removes_only_when_armed() {
        let tmp = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(tmp.path()).unwrap();

        let kept = root.join("kept");
        std::fs::create_dir(&kept).unwrap();
        RollbackGuard::new(kept.clone()).dismiss();
        assert!(kept.exists());

        let removed = root.join("removed");
        std::fs::create_dir_all(removed.join("nested")).unwrap();
        drop(RollbackGuard::new(removed.clone()));
        assert!(!removed.exists());

        // A guard over nothing is harmless.
        drop(RollbackGuard::new(root.join("never-created")));
    }

    #[test]
    fn removal_cleans_up_platform_resources_and_the_directory() {
        let mut platform = MockQemuPlatform::new();
        platform
            .expect_get_directory_name()
            .returning(|| "qemu".to_owned());
        platform
            .expect_remove_resources_for()
            .withf(|name| name == "vm-a")
            .times(2)
            .returning(|_| Ok(()));

        let fx = Fixture::with_platform(platform);
        let dir = fx.make_source("vm-a", &specs("AA:BB:CC:00:00:01"), None);

        fx.factory.remove_resources_for("vm-a").unwrap();
        assert!(!dir.exists());

        // Already gone.
        fx.factory.remove_resources_for("vm-a").unwrap();
    }

    #[test]
    fn platform_failures_propagate() {
        let mut platform = MockQemuPlatform::new();
        platform
            .expect_platform_health_check()
            .returning(|| Err(anyhow::anyhow!("no /dev/kvm")));
        platform.expect_networks().returning(|| Ok(vec![]));

        let fx = Fixture::with_platform(platform);
        let err = fx.factory.hypervisor_health_check().unwrap_err();
        assert!(matches!(err, FactoryError::Platform(_)));
        assert_eq!(err.to_string(), "no /dev/kvm");
        assert!(fx.factory.networks().unwrap().is_empty());
    }

    #[test]
    fn missing_hypervisor_reports_an_unknown_version() {
        let fx = Fixture::new();
        assert_eq!(fx.factory.get_backend_version_string(), "qemu-unknown");
        assert_eq!(fx.factory.get_backend_directory_name(), "qemu");
    }

    #[cfg(unix)]
    #[test]
    fn symlinked_files_are_copied_not_shared() {
        let fx = Fixture::new();
        let source = fx.make_source("vm-a", &specs("AA:BB:CC:00:00:01"), None);

        let base = fx.factory.data_dir().join("base.qcow2");
        std::fs::write(&base, b"base image").unwrap();
        std::fs::remove_file(source.join("disk.qcow2")).unwrap();
        std::os::unix::fs::symlink(&base, source.join("disk.qcow2")).unwrap();

        let shared = fx.factory.data_dir().join("shared-state");
        std::fs::create_dir(&shared).unwrap();
        std::fs::write(shared.join("nvram"), b"vars").unwrap();
        std::os::unix::fs::symlink(&shared, source.join("firmware")).unwrap();

        fx.clone_vm(fx.clone_request("vm-a", "vm-b")).unwrap();

        let dest = fx.dir("vm-b");
        let disk = dest.join("disk.qcow2");
        assert!(!disk.symlink_metadata().unwrap().file_type().is_symlink());
        assert_eq!(std::fs::read(&disk).unwrap(), b"base image");
        std::fs::write(&disk, b"written by the clone").unwrap();
        assert_eq!(std::fs::read(&base).unwrap(), b"base image");

        let firmware = dest.join("firmware");
        assert!(!firmware.symlink_metadata().unwrap().file_type().is_symlink());
        std::fs::write(firmware.join("nvram"), b"changed").unwrap();
        assert_eq!(std::fs::read(shared.join("nvram")).unwrap(), b"vars");
    }

    #[test]
    fn create_instance_writes_the_container() {
        let fx = Fixture::new();

        let vm = fx.create_instance(fx.create_request("vm-a", None)).unwrap();
        assert_eq!(vm.instance_directory(), fx.dir("vm-a").as_path());
        assert_eq!(
            meta_data(&fx.dir("vm-a"))
                .get("instance-id")
                .and_then(|v| v.as_str()),
            Some("vm-a")
        );

        // A second attempt must not touch the existing instance.
        let before = tree(&fx.dir("vm-a"));
        let Err(err) = fx.create_instance(fx.create_request("vm-a", None))
        else {
            panic!("created vm-a twice");
        };
        match err {
            FactoryError::CreateDirectory { source, .. } => {
                assert_eq!(source.kind(), io::ErrorKind::AlreadyExists)
            }
            e => panic!("unexpected error {e:?}"),
        }
        assert_eq!(tree(&fx.dir("vm-a")), before);
    }

    #[test]
    fn failed_image_preparation_rolls_back_a_new_instance() {
        let fx = Fixture::new();
        let base = fx.factory.data_dir().join("base.qcow2");
        std::fs::write(&base, b"base image").unwrap();

        // The fixture's qemu-img does not exist, so resizing fails after the
        // container and image have been written.
        let Err(err) =
            fx.create_instance(fx.create_request("vm-a", Some(base.clone())))
        else {
            panic!("created vm-a without qemu-img");
        };
        assert!(matches!(err, FactoryError::Image(_)), "{err:?}");
        assert!(!fx.dir("vm-a").exists());
        assert!(base.exists());

        let Err(err) = fx.create_instance(fx.create_request(
            "vm-a",
            Some(fx.factory.data_dir().join("missing.qcow2")),
        )) else {
            panic!("created vm-a from a missing image");
        };
        assert!(matches!(err, FactoryError::ImageCopy { .. }), "{err:?}");
        assert!(!fx.dir("vm-a").exists());
    }

    #[test]
    fn existing_snapshots_are_loaded_on_construction() {
        let fx = Fixture::new();
        let dir = fx.make_source("vm-a", &specs("AA:BB:CC:00:00:01"), None);
        snapshot::write_snapshot(
            &snapshot::snapshot_path(&dir, "snapshot1"),
            &snapshot_record("snapshot1", "vm-a"),
        )
        .unwrap();

        let vm = fx
            .factory
            .create_virtual_machine(
                fx.create_request("vm-a", None).desc,
                Arc::new(FixedKeys),
                fx.monitor.clone(),
            )
            .unwrap();
        assert_eq!(vm.snapshot_count(), 1);
    }
}

//! Per-instance disk assembly (§4.3): directory layout, kernel/ramdisk/root
//! disk materialization via `ImageCache`, and SSH-key/network injection.
//!
//! The `qemu-img` subprocess plumbing is grounded on
//! `examples/other_examples/dc198724_..._storage-local.rs.rs`'s
//! `create_qcow2`/`create_qcow2_with_backing`/`resize_volume`, ported from
//! synchronous `std::process::Command` to `tokio::process::Command` since
//! this driver runs every instance operation on the cooperative scheduler
//! (§5 "Scheduling model").

use crate::error::{Error, Result};
use crate::image_cache::{ExtendToMinimumSize, Fetcher, ImageCache, ImageServiceFetcher, SparseZeroFetcher};
use crate::model::{Instance, NetworkInfo};
use crate::store::ImageService;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::process::Command;
use tracing::{instrument, warn};

pub async fn run_qemu_img(args: &[&str]) -> Result<std::process::Output> {
    let output = Command::new("qemu-img")
        .args(args)
        .output()
        .await
        .map_err(|e| Error::External(format!("failed to spawn qemu-img: {e}")))?;
    if !output.status.success() {
        return Err(Error::External(format!(
            "qemu-img {:?} failed: {}",
            args,
            String::from_utf8_lossy(&output.stderr)
        )));
    }
    Ok(output)
}

pub async fn qemu_img_create_cow(backing: &Path, target: &Path, cluster_size: u64) -> Result<()> {
    run_qemu_img(&[
        "create",
        "-f",
        "qcow2",
        "-F",
        "raw",
        "-o",
        &format!("cluster_size={cluster_size}"),
        "-b",
        backing.to_str().ok_or_else(|| Error::Invalid("non-utf8 backing path".into()))?,
        target.to_str().ok_or_else(|| Error::Invalid("non-utf8 target path".into()))?,
    ])
    .await?;
    Ok(())
}

pub async fn qemu_img_resize(path: &Path, size_bytes: u64) -> Result<()> {
    run_qemu_img(&[
        "resize",
        "-f",
        "qcow2",
        path.to_str().ok_or_else(|| Error::Invalid("non-utf8 path".into()))?,
        &size_bytes.to_string(),
    ])
    .await?;
    Ok(())
}

/// Artifacts ready for `HypervisorGateway::define_and_start`.
pub struct PreparedDisks {
    pub directory: PathBuf,
    pub xml_path: PathBuf,
    pub console_log: PathBuf,
    pub kernel: Option<PathBuf>,
    pub ramdisk: Option<PathBuf>,
    pub disk: PathBuf,
    pub disk_local: Option<PathBuf>,
}

pub struct DiskProvisioner {
    cache: ImageCache,
    instances_path: PathBuf,
    use_cow_images: bool,
    minimum_root_size: u64,
    image_service: Arc<dyn ImageService>,
}

impl DiskProvisioner {
    pub fn new(
        instances_path: PathBuf,
        use_cow_images: bool,
        minimum_root_size: u64,
        image_service: Arc<dyn ImageService>,
    ) -> Self {
        Self {
            cache: ImageCache::new(instances_path.join("_base")),
            instances_path,
            use_cow_images,
            minimum_root_size,
            image_service,
        }
    }

    fn instance_dir(&self, instance: &Instance) -> PathBuf {
        self.instances_path.join(&instance.name)
    }

    /// Path to the instance's console transcript, read back by
    /// `InstanceDriver::console_output`.
    pub fn console_log_path(&self, instance: &Instance) -> PathBuf {
        self.instance_dir(instance).join("console.log")
    }

    async fn materialize_artifact(
        &self,
        key: &str,
        target: &Path,
        fetcher: &dyn Fetcher,
        cow: bool,
        extend_to: Option<u64>,
    ) -> Result<()> {
        let post = extend_to.map(|bytes| ExtendToMinimumSize { minimum_bytes: bytes });
        self.cache
            .materialize(
                key,
                target,
                fetcher,
                cow,
                post.as_ref().map(|p| p as &dyn crate::image_cache::Postprocess),
            )
            .await
    }

    /// §4.3: writes the domain XML, creates an empty console log, and
    /// materializes kernel/ramdisk/root/local disk artifacts. `suffix` is
    /// `".rescue"` for rescue mode, empty otherwise.
    #[instrument(skip(self, instance, libvirt_xml))]
    pub async fn prepare(
        &self,
        instance: &Instance,
        libvirt_xml: &str,
        suffix: &str,
        rescue_image_ids: Option<(u64, Option<u64>, Option<u64>)>,
    ) -> Result<PreparedDisks> {
        let directory = self.instance_dir(instance);
        tokio::fs::create_dir_all(&directory).await?;

        let xml_path = directory.join(format!("libvirt.xml{suffix}"));
        tokio::fs::write(&xml_path, libvirt_xml).await?;

        let console_log = directory.join("console.log");
        if !tokio::fs::try_exists(&console_log).await? {
            tokio::fs::File::create(&console_log).await?;
            tokio::fs::set_permissions(&console_log, std::fs::Permissions::from_mode(0o660))
                .await?;
        }

        let (root_image_id, kernel_id, ramdisk_id) = match rescue_image_ids {
            Some(ids) => ids,
            None => (instance.image_id, instance.kernel_id, instance.ramdisk_id),
        };

        let kernel = if let Some(kernel_id) = kernel_id {
            let target = directory.join(format!("kernel{suffix}"));
            let key = Instance::image_key(kernel_id);
            let fetcher = ImageServiceFetcher {
                service: self.image_service.clone(),
                image_id: kernel_id,
                user: instance.user_id.clone(),
                project: instance.project_id.clone(),
            };
            self.materialize_artifact(&key, &target, &fetcher, false, None)
                .await?;
            Some(target)
        } else {
            None
        };

        let ramdisk = if let Some(ramdisk_id) = ramdisk_id {
            let target = directory.join(format!("ramdisk{suffix}"));
            let key = Instance::image_key(ramdisk_id);
            let fetcher = ImageServiceFetcher {
                service: self.image_service.clone(),
                image_id: ramdisk_id,
                user: instance.user_id.clone(),
                project: instance.project_id.clone(),
            };
            self.materialize_artifact(&key, &target, &fetcher, false, None)
                .await?;
            Some(target)
        } else {
            None
        };

        // Root disk: `_sm` key suffix and no extend for tiny/rescue, per §4.3.
        let is_rescue = !suffix.is_empty();
        let skip_extend = instance.instance_type.is_tiny() || is_rescue;
        let disk_target = directory.join(format!("disk{suffix}"));
        let mut disk_key = Instance::image_key(root_image_id);
        if skip_extend {
            disk_key.push_str("_sm");
        }
        let fetcher = ImageServiceFetcher {
            service: self.image_service.clone(),
            image_id: root_image_id,
            user: instance.user_id.clone(),
            project: instance.project_id.clone(),
        };
        self.materialize_artifact(
            &disk_key,
            &disk_target,
            &fetcher,
            self.use_cow_images,
            if skip_extend { None } else { Some(self.minimum_root_size) },
        )
        .await?;

        let disk_local = if instance.instance_type.local_gb > 0 {
            let target = directory.join(format!("disk.local{suffix}"));
            let size_bytes = instance.instance_type.local_gb * 1024 * 1024 * 1024;
            let fetcher = SparseZeroFetcher { size_bytes };
            self.materialize_artifact(
                &format!("local-{size_bytes}"),
                &target,
                &fetcher,
                false,
                None,
            )
            .await?;
            Some(target)
        } else {
            None
        };

        Ok(PreparedDisks {
            directory,
            xml_path,
            console_log,
            kernel,
            ramdisk,
            disk: disk_target,
            disk_local,
        })
    }

    /// Removes the instance's storage directory (§3 "destroyed on teardown
    /// when cleanup is requested").
    pub async fn teardown(&self, instance: &Instance) -> Result<()> {
        let directory = self.instance_dir(instance);
        match tokio::fs::remove_dir_all(&directory).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// SSH key and network-config injection (§4.3 "Injection"). Mounts the
    /// target disk via a loop device, writes `/root/.ssh/authorized_keys`
    /// and the rendered interfaces file, then unmounts. Any failure here is
    /// logged and swallowed by the caller — the image may be Windows or
    /// unpartitioned.
    #[instrument(skip(self, disk_path, net, key_data))]
    pub async fn inject(
        &self,
        disk_path: &Path,
        has_kernel: bool,
        key_data: Option<&str>,
        net: Option<&NetworkInfo>,
    ) -> Result<()> {
        if key_data.is_none() && !net.map(|n| n.injected).unwrap_or(false) {
            return Ok(());
        }

        let loop_dev = losetup_attach(disk_path).await?;
        let partition = if has_kernel {
            loop_dev.clone()
        } else {
            format!("{loop_dev}p1")
        };

        let mount_point = tempfile::tempdir().map_err(Error::Io)?;
        let result = inject_inner(&partition, mount_point.path(), key_data, net).await;

        let _ = nix::mount::umount(mount_point.path());
        losetup_detach(&loop_dev).await?;
        result
    }
}

async fn inject_inner(
    partition: &str,
    mount_point: &Path,
    key_data: Option<&str>,
    net: Option<&NetworkInfo>,
) -> Result<()> {
    nix::mount::mount(
        Some(partition),
        mount_point,
        Some("ext4"),
        nix::mount::MsFlags::empty(),
        None::<&str>,
    )
    .map_err(|e| Error::External(format!("mount {partition} failed: {e}")))?;

    if let Some(key) = key_data {
        let ssh_dir = mount_point.join("root/.ssh");
        tokio::fs::create_dir_all(&ssh_dir).await?;
        let auth_keys = ssh_dir.join("authorized_keys");
        tokio::fs::write(&auth_keys, format!("{key}\n")).await?;
        tokio::fs::set_permissions(&auth_keys, std::fs::Permissions::from_mode(0o600)).await?;
    }

    if let Some(net) = net {
        if net.injected {
            let rendered = crate::templates::render_injected_network(net);
            let interfaces_path = mount_point.join("etc/network/interfaces");
            if let Some(parent) = interfaces_path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(interfaces_path, rendered).await?;
        }
    }

    Ok(())
}

async fn losetup_attach(path: &Path) -> Result<String> {
    let output = Command::new("losetup")
        .args(["-f", "--show", "-P"])
        .arg(path)
        .output()
        .await
        .map_err(|e| Error::External(format!("losetup failed: {e}")))?;
    if !output.status.success() {
        return Err(Error::External(format!(
            "losetup failed: {}",
            String::from_utf8_lossy(&output.stderr)
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

async fn losetup_detach(dev: &str) -> Result<()> {
    let output = Command::new("losetup")
        .args(["-d", dev])
        .output()
        .await
        .map_err(|e| Error::External(format!("losetup -d failed: {e}")))?;
    if !output.status.success() {
        warn!(dev, "losetup -d failed; loop device may be leaked");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn prepare_is_idempotent_when_disk_already_materialized() {
        use crate::store::fakes::FakeImageService;
        let dir = tempfile::tempdir().unwrap();
        let provisioner = DiskProvisioner::new(
            dir.path().to_path_buf(),
            false,
            0,
            Arc::new(FakeImageService),
        );
        let instance = Instance {
            id: 7,
            name: "i-0007".into(),
            project_id: "p".into(),
            user_id: "u".into(),
            host: "host-a".into(),
            instance_type: crate::model::Flavor {
                memory_mb: 2048,
                vcpus: 1,
                local_gb: 0,
                flavorid: "m1.small".into(),
                rxtx_cap: 0,
            },
            image_id: 42,
            kernel_id: None,
            ramdisk_id: None,
            mac_address: "02:16:3e:11:22:33".into(),
            key_data: None,
            state: crate::model::PowerState::NoState,
            state_description: String::new(),
        };

        let prepared = provisioner.prepare(&instance, "<domain/>", "", None).await.unwrap();
        assert!(tokio::fs::try_exists(&prepared.disk).await.unwrap());
        assert!(tokio::fs::try_exists(&prepared.console_log).await.unwrap());

        // Second call must not re-fetch; the short-circuit in ImageCache
        // handles this, exercised here end-to-end.
        let prepared_again = provisioner.prepare(&instance, "<domain/>", "", None).await.unwrap();
        assert_eq!(prepared.disk, prepared_again.disk);
    }
}

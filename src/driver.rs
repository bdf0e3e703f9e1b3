//! Per-instance lifecycle orchestration (§4.5): composes `HypervisorGateway`,
//! `DiskProvisioner`, `FilterEngine`, and `InstanceStore` behind one entry
//! point per operation, using `Ticker` for every "poll until state X"
//! sequence instead of a bespoke loop per call.
//!
//! Grounded on the state-machine-by-polling shape of the teacher's
//! `rt/hypervisor/mod.rs::shutdown()` (issue a command, then poll a status
//! accessor at a fixed interval until it settles), generalized to the five
//! lifecycle primitives and the live-migration flow this driver owns.

use crate::config::DriverConfig;
use crate::disk::DiskProvisioner;
use crate::error::{Error, Result};
use crate::filter::FilterEngine;
use crate::gateway::{resolve_migration_flags, HypervisorGateway};
use crate::model::{Instance, PowerState};
use crate::store::InstanceStore;
use crate::templates::{self, DomainTemplateVars};
use crate::ticker::Ticker;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Invoked on live-migration completion or failure, standing in for the
/// orchestrator's `post_method`/`recover_method` callbacks (§4.5).
#[async_trait]
pub trait MigrationObserver: Send + Sync {
    async fn on_migrated(&self, instance: &Instance, dest_host: &str);
    async fn on_migration_failed(&self, instance: &Instance);
}

pub struct InstanceDriver {
    gateway: Arc<HypervisorGateway>,
    disks: Arc<DiskProvisioner>,
    filter: Arc<dyn FilterEngine>,
    store: Arc<dyn InstanceStore>,
    config: DriverConfig,
}

impl InstanceDriver {
    pub fn new(
        gateway: Arc<HypervisorGateway>,
        disks: Arc<DiskProvisioner>,
        filter: Arc<dyn FilterEngine>,
        store: Arc<dyn InstanceStore>,
        config: DriverConfig,
    ) -> Self {
        Self {
            gateway,
            disks,
            filter,
            store,
            config,
        }
    }

    async fn domain_xml(&self, instance: &Instance, suffix: &str, filter_ref: Option<&str>) -> Result<String> {
        let net = self.store.network_get_by_instance(instance.id).await?;
        let address = self.store.instance_get_fixed_address(instance.id).await?;
        let bridge = templates::instance_bridge_name(instance);
        let basepath = self
            .config
            .instance_path(&instance.name)
            .to_str()
            .ok_or_else(|| Error::Invalid("non-utf8 instance path".into()))?
            .to_string();
        let ip_address = address.as_ref().map(ToString::to_string);
        let dhcp_server = net.dhcp_server.as_ref().map(ToString::to_string);
        let gateway_v6 = net.gateway_v6.as_ref().map(ToString::to_string);
        let kernel = instance
            .kernel_id
            .map(|_| format!("{basepath}/kernel{suffix}"));
        let ramdisk = instance
            .ramdisk_id
            .map(|_| format!("{basepath}/ramdisk{suffix}"));

        let vars = DomainTemplateVars {
            libvirt_type: libvirt_type_name(&self.config),
            name: &instance.name,
            basepath: &basepath,
            memory_kb: instance.instance_type.memory_mb * 1024,
            vcpus: instance.instance_type.vcpus,
            bridge_name: &bridge,
            mac_address: &instance.mac_address,
            ip_address: ip_address.as_deref(),
            dhcp_server: dhcp_server.as_deref(),
            extra_params: "",
            rescue: !suffix.is_empty(),
            local: instance.instance_type.local_gb > 0,
            driver_type: "qcow2",
            gateway_v6: gateway_v6.as_deref(),
            kernel: kernel.as_deref(),
            ramdisk: ramdisk.as_deref(),
            disk: "disk",
            filter_ref,
        };
        Ok(templates::render_domain_xml(&vars))
    }

    fn filter_ref_for(&self, instance: &Instance) -> Option<String> {
        match self.config.firewall_driver {
            crate::config::FirewallDriver::HypervisorFilter => {
                Some(format!("nova-instance-{}", instance.name))
            }
            crate::config::FirewallDriver::HostPacketFilter => None,
        }
    }

    async fn poll_until_state(&self, instance: &Instance, target: PowerState) -> Result<()> {
        let name = instance.name.clone();
        let id = instance.id;
        Ticker::new(POLL_INTERVAL)
            .poll_until(|| async {
                let info = self.gateway.info(&name).await?;
                match info {
                    Some(info) => {
                        self.store
                            .instance_set_state(id, info.state, None)
                            .await?;
                        Ok(if info.state == target { Some(()) } else { None })
                    }
                    None if target == PowerState::Shutdown => {
                        self.store
                            .instance_set_state(id, PowerState::Shutdown, None)
                            .await?;
                        Ok(Some(()))
                    }
                    None => Ok(None),
                }
            })
            .await
    }

    /// §4.5 spawn: launching → filters → XML → disks → define_and_start →
    /// apply filter → poll until RUNNING.
    #[instrument(skip(self, instance))]
    pub async fn spawn(&self, instance: &Instance) -> Result<()> {
        self.store
            .instance_set_state(instance.id, PowerState::NoState, Some("launching"))
            .await?;

        self.filter.setup_basic_filtering(instance).await?;
        self.filter.prepare_instance_filter(instance).await?;

        let filter_ref = self.filter_ref_for(instance);
        let xml = self.domain_xml(instance, "", filter_ref.as_deref()).await?;

        let prepared = self.disks.prepare(instance, &xml, "", None).await?;
        self.disks
            .inject(
                &prepared.disk,
                prepared.kernel.is_some(),
                instance.key_data.as_deref(),
                Some(&self.store.network_get_by_instance(instance.id).await?),
            )
            .await
            .unwrap_or_else(|e| warn!(error = %e, "injection skipped"));

        self.gateway.define_and_start(xml).await?;
        self.filter.apply_instance_filter(instance).await?;

        self.poll_until_state(instance, PowerState::Running).await
    }

    /// §4.5 reboot: destroy(cleanup=false) → rebuild → re-prepare filter →
    /// define_and_start → apply filter → poll until RUNNING.
    #[instrument(skip(self, instance))]
    pub async fn reboot(&self, instance: &Instance) -> Result<()> {
        self.destroy(instance, false).await?;
        self.filter.prepare_instance_filter(instance).await?;

        let filter_ref = self.filter_ref_for(instance);
        let xml = self.domain_xml(instance, "", filter_ref.as_deref()).await?;
        self.disks.prepare(instance, &xml, "", None).await?;

        self.gateway.define_and_start(xml).await?;
        self.filter.apply_instance_filter(instance).await?;
        self.poll_until_state(instance, PowerState::Running).await
    }

    /// §4.5 destroy(cleanup): tolerant hypervisor destroy → poll until
    /// SHUTDOWN/NotFound → unfilter → optional directory removal.
    #[instrument(skip(self, instance))]
    pub async fn destroy(&self, instance: &Instance, cleanup: bool) -> Result<()> {
        self.gateway.destroy(&instance.name).await?;
        self.poll_until_state(instance, PowerState::Shutdown).await?;
        self.filter.unfilter_instance(instance).await?;
        if cleanup {
            self.disks.teardown(instance).await?;
        }
        Ok(())
    }

    /// §4.5 rescue: destroy(cleanup=false) → prepare with `.rescue` using
    /// the configured rescue image/kernel/ramdisk → define_and_start → poll.
    #[instrument(skip(self, instance))]
    pub async fn rescue(&self, instance: &Instance) -> Result<()> {
        self.destroy(instance, false).await?;

        let rescue_image_id = self
            .config
            .rescue_image_id
            .ok_or_else(|| Error::Invalid("no rescue image configured".into()))?;
        let rescue_ids = (rescue_image_id, self.config.rescue_kernel_id, self.config.rescue_ramdisk_id);

        self.filter.prepare_instance_filter(instance).await?;
        let filter_ref = self.filter_ref_for(instance);
        let xml = self.domain_xml(instance, ".rescue", filter_ref.as_deref()).await?;
        self.disks.prepare(instance, &xml, ".rescue", Some(rescue_ids)).await?;

        self.gateway.define_and_start(xml).await?;
        self.filter.apply_instance_filter(instance).await?;
        self.poll_until_state(instance, PowerState::Running).await
    }

    /// §4.5 unrescue: equivalent to a plain reboot back onto the original
    /// image.
    #[instrument(skip(self, instance))]
    pub async fn unrescue(&self, instance: &Instance) -> Result<()> {
        self.reboot(instance).await
    }

    #[instrument(skip(self, instance))]
    pub async fn attach_volume(&self, instance: &Instance, device_path: &str, mountpoint: &str) -> Result<()> {
        let xml = volume_disk_xml(device_path, mount_device_name(mountpoint));
        self.gateway.attach_disk(&instance.name, xml).await
    }

    #[instrument(skip(self, instance))]
    pub async fn detach_volume(&self, instance: &Instance, device_path: &str, mountpoint: &str) -> Result<()> {
        let xml = volume_disk_xml(device_path, mount_device_name(mountpoint));
        self.gateway.detach_disk(&instance.name, xml).await
    }

    /// Supplemental to the distilled spec (original `get_console_output`):
    /// tails the last `CONSOLE_TAIL_BYTES` of the transcript the domain's
    /// `<console>` device has been writing to since boot, base64-encoded.
    #[instrument(skip(self, instance))]
    pub async fn console_output(&self, instance: &Instance) -> Result<String> {
        use base64::Engine;
        const CONSOLE_TAIL_BYTES: usize = 102_400;

        let path = self.disks.console_log_path(instance);
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|e| Error::External(format!("reading console log: {e}")))?;
        let tail = &bytes[bytes.len().saturating_sub(CONSOLE_TAIL_BYTES)..];
        Ok(base64::engine::general_purpose::STANDARD.encode(tail))
    }

    /// Reachable but deliberately unimplemented (§4 supplement: the
    /// original's `get_diagnostics` has no stable cross-hypervisor shape).
    pub async fn get_diagnostics(&self, _instance: &Instance) -> Result<()> {
        Err(Error::Unsupported("get_diagnostics"))
    }

    /// §4.5 Live migration. Runs the destination readiness wait, issues the
    /// migrate call on the source, and on success confirms the source domain
    /// is gone with a bounded 500 ms poll before notifying the observer; on
    /// failure the observer's `on_migration_failed` runs directly, without
    /// waiting on a poll that a still-present source domain would never
    /// satisfy.
    #[instrument(skip(self, instance, observer))]
    pub async fn migrate(
        &self,
        instance: &Instance,
        dest_host: &str,
        dest_filter: &dyn FilterEngine,
        observer: &dyn MigrationObserver,
    ) -> Result<()> {
        dest_filter.setup_basic_filtering(instance).await?;
        dest_filter.prepare_instance_filter(instance).await?;

        let ready = Ticker::new(Duration::from_secs(1))
            .with_timeout(Duration::from_secs(u64::from(self.config.live_migration_retry_count)))
            .poll_until(|| async {
                let exists = dest_filter.instance_filter_exists(instance).await?;
                Ok(exists.then_some(()))
            })
            .await;
        if ready.is_err() {
            return Err(Error::Fatal(format!(
                "destination filter never became ready for {}",
                instance.name
            )));
        }

        let flags = resolve_migration_flags(&self.config.live_migration_flag);
        let dest_uri = self.config.live_migration_uri.replace("%s", dest_host);
        let bandwidth = self.config.live_migration_bandwidth;

        // The NotFound poll only makes sense once the migrate call itself
        // has reported success — on failure the source domain stays put and
        // would never disappear, so it must never be raced against the call
        // that can fail (that previously hung `on_migration_failed` forever).
        match self.gateway.migrate(&instance.name, dest_uri, flags, bandwidth).await {
            Ok(()) => {
                let watch_name = instance.name.clone();
                let gateway = self.gateway.clone();
                let confirmed = Ticker::new(Duration::from_millis(500))
                    .with_timeout(Duration::from_secs(30))
                    .poll_until(move || {
                        let gateway = gateway.clone();
                        let watch_name = watch_name.clone();
                        async move { Ok(gateway.info(&watch_name).await?.is_none().then_some(())) }
                    })
                    .await;
                if let Err(e) = confirmed {
                    warn!(error = %e, "source domain still present after migration reported success");
                }
                info!(dest_host, "migration completed");
                observer.on_migrated(instance, dest_host).await;
                Ok(())
            }
            Err(e) => {
                observer.on_migration_failed(instance).await;
                Err(e)
            }
        }
    }
}

fn libvirt_type_name(config: &DriverConfig) -> &'static str {
    match config.libvirt_type {
        crate::config::LibvirtType::Kvm => "kvm",
        crate::config::LibvirtType::Qemu => "qemu",
        crate::config::LibvirtType::Uml => "uml",
        crate::config::LibvirtType::Xen => "xen",
    }
}

fn mount_device_name(mountpoint: &str) -> String {
    mountpoint
        .rsplit('/')
        .next()
        .filter(|s| !s.is_empty())
        .unwrap_or("vdb")
        .to_string()
}

fn volume_disk_xml(device_path: &str, target_dev: String) -> String {
    format!(
        "<disk type='block' device='disk'>\
           <driver name='qemu' type='raw'/>\
           <source dev='{device_path}'/>\
           <target dev='{target_dev}' bus='virtio'/>\
         </disk>"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mount_device_name_takes_final_path_segment() {
        assert_eq!(mount_device_name("/dev/vdc"), "vdc");
        assert_eq!(mount_device_name(""), "vdb");
    }

    #[test]
    fn volume_disk_xml_embeds_device_and_target() {
        let xml = volume_disk_xml("/dev/sdb1", "vdc".into());
        assert!(xml.contains("/dev/sdb1"));
        assert!(xml.contains("dev='vdc'"));
    }
}

//! Driver configuration, following the `clap::Parser` derive style of
//! `examples/tangle-network-blueprint/crates/manager/src/config.rs`:
//! plain `#[arg(...)]` fields, a companion `Default` impl for test
//! construction, and `clap::ValueEnum` for small closed choices.

use clap::Parser;
use std::net::Ipv4Addr;
use std::path::PathBuf;

#[derive(Debug, Parser, Clone)]
#[command(
    name = "compute-driverd",
    about = "Compute-node hypervisor driver: instance lifecycle, disk provisioning, and security-group enforcement against a local libvirt host"
)]
pub struct DriverConfig {
    /// Which hypervisor this node runs; selects the default connection URI.
    #[arg(long, value_enum, default_value_t = LibvirtType::Kvm)]
    pub libvirt_type: LibvirtType,

    /// Overrides the default connection URI for `libvirt_type`.
    #[arg(long)]
    pub libvirt_uri: Option<String>,

    /// Materialize root/local disks as qcow2 copy-on-write images atop the
    /// cached base image instead of plain copies.
    #[arg(long, default_value_t = true)]
    pub use_cow_images: bool,

    /// Allow intra-project traffic between instances of the same project.
    #[arg(long)]
    pub allow_project_net_traffic: bool,

    /// Enable IPv6 filters and address plumbing.
    #[arg(long)]
    pub use_ipv6: bool,

    /// Which `FilterEngine` back-end programs security groups.
    #[arg(long, value_enum, default_value_t = FirewallDriver::HostPacketFilter)]
    pub firewall_driver: FirewallDriver,

    /// Port range probed for the console proxy.
    #[arg(long, value_parser = parse_port_range, default_value = "8000-8999")]
    pub ajaxterm_portrange: (u16, u16),

    /// Image id booted for rescue mode.
    #[arg(long)]
    pub rescue_image_id: Option<u64>,
    #[arg(long)]
    pub rescue_kernel_id: Option<u64>,
    #[arg(long)]
    pub rescue_ramdisk_id: Option<u64>,

    /// `%s`-style template substituted with the destination host for live
    /// migration, e.g. `"qemu+tls://%s/system"`.
    #[arg(long, default_value = "qemu+tcp://%s/system")]
    pub live_migration_uri: String,
    /// Space-separated libvirt migration flag names, OR-reduced at call time.
    #[arg(long, default_value = "VIR_MIGRATE_LIVE VIR_MIGRATE_PEER2PEER")]
    pub live_migration_flag: String,
    /// Bandwidth cap in MiB/s, 0 = unlimited.
    #[arg(long, default_value_t = 0)]
    pub live_migration_bandwidth: u32,
    /// Number of 1s polls waiting for the destination filter to appear.
    #[arg(long, default_value_t = 30)]
    pub live_migration_retry_count: u32,

    /// Root of per-instance storage (`<instances_path>/_base`, `<instances_path>/<name>/...`).
    #[arg(long, default_value = "/var/lib/compute-driver/instances")]
    pub instances_path: PathBuf,

    /// Minimum root-disk size in bytes for non-tiny flavors.
    #[arg(long, default_value_t = 20 * 1024 * 1024 * 1024)]
    pub minimum_root_size: u64,

    /// Address pool for TAP interface assignment (§ network injection).
    #[arg(long, default_value = "10.200.0.0/24")]
    pub default_address_pool: ipnet::Ipv4Net,

    /// Host network interface instances are bridged onto.
    #[arg(long)]
    pub network_interface: Option<String>,

    /// Verbosity (`-v`, `-vv`, ...).
    #[arg(long, short = 'v', action = clap::ArgAction::Count)]
    pub verbose: u8,
    /// Pretty (multi-line, span-aware) log formatting instead of compact.
    #[arg(long)]
    pub pretty: bool,

    /// Observability HTTP listen port (`/metrics`, `/health`).
    #[arg(long, default_value_t = 9100)]
    pub observability_port: u16,

    /// Interval in seconds between `ResourceReporter` pushes.
    #[arg(long, default_value_t = 60)]
    pub resource_report_interval_secs: u64,
}

fn parse_port_range(s: &str) -> Result<(u16, u16), String> {
    let (lo, hi) = s
        .split_once('-')
        .ok_or_else(|| format!("expected START-END, got {s:?}"))?;
    let lo: u16 = lo.parse().map_err(|e| format!("{e}"))?;
    let hi: u16 = hi.parse().map_err(|e| format!("{e}"))?;
    if lo > hi {
        return Err(format!("range start {lo} exceeds end {hi}"));
    }
    Ok((lo, hi))
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            libvirt_type: LibvirtType::Kvm,
            libvirt_uri: None,
            use_cow_images: true,
            allow_project_net_traffic: false,
            use_ipv6: false,
            firewall_driver: FirewallDriver::HostPacketFilter,
            ajaxterm_portrange: (8000, 8999),
            rescue_image_id: None,
            rescue_kernel_id: None,
            rescue_ramdisk_id: None,
            live_migration_uri: "qemu+tcp://%s/system".into(),
            live_migration_flag: "VIR_MIGRATE_LIVE VIR_MIGRATE_PEER2PEER".into(),
            live_migration_bandwidth: 0,
            live_migration_retry_count: 30,
            instances_path: PathBuf::from("/var/lib/compute-driver/instances"),
            minimum_root_size: 20 * 1024 * 1024 * 1024,
            default_address_pool: "10.200.0.0/24".parse().unwrap(),
            network_interface: None,
            verbose: 0,
            pretty: false,
            observability_port: 9100,
            resource_report_interval_secs: 60,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, clap::ValueEnum)]
pub enum LibvirtType {
    Kvm,
    Qemu,
    Uml,
    Xen,
}

impl DriverConfig {
    /// URI selection per §4.1: configured override wins, otherwise derive
    /// from `libvirt_type`.
    pub fn connection_uri(&self) -> String {
        if let Some(uri) = &self.libvirt_uri {
            return uri.clone();
        }
        match self.libvirt_type {
            LibvirtType::Kvm | LibvirtType::Qemu => "qemu:///system".to_string(),
            LibvirtType::Uml => "uml:///system".to_string(),
            LibvirtType::Xen => "xen:///".to_string(),
        }
    }

    pub fn base_images_path(&self) -> PathBuf {
        self.instances_path.join("_base")
    }

    pub fn instance_path(&self, name: &str) -> PathBuf {
        self.instances_path.join(name)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, clap::ValueEnum)]
pub enum FirewallDriver {
    HypervisorFilter,
    HostPacketFilter,
}

/// Sequential bind-probe port allocator for the console-proxy range,
/// grounded on the original driver's `ajaxterm_portrange` probing loop.
pub struct PortFinder;

impl PortFinder {
    pub fn find_free(range: (u16, u16)) -> crate::error::Result<u16> {
        for port in range.0..=range.1 {
            if std::net::TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).is_ok() {
                return Ok(port);
            }
        }
        Err(crate::error::Error::Timeout(format!(
            "no free port in range {}-{}",
            range.0, range.1
        )))
    }
}

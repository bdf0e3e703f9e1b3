//! Host resource accounting (§4.6): reads CPU/memory/disk totals and used
//! amounts, normalizes them into a `ComputeNodeReport`, and extracts CPU
//! capability info from the hypervisor's capabilities XML for scheduling
//! compatibility checks.
//!
//! The `/proc/meminfo` parse and filesystem-stat approach are grounded on
//! `examples/other_examples/dc198724_..._storage-local.rs.rs`'s pattern of
//! shelling out to read host state rather than linking a heavyweight stats
//! library; `cpu_info` extraction is grounded on `HypervisorGateway`'s
//! `get_capabilities_xml`/`compare_cpu`, added in this crate.

use crate::error::{Error, Result};
use crate::gateway::HypervisorGateway;
use crate::model::{ComputeNodeReport, CpuInfo, CpuTopology};
use std::path::Path;
use tokio::process::Command;
use tracing::instrument;

pub struct ResourceReporter {
    gateway: std::sync::Arc<HypervisorGateway>,
    instances_path: std::path::PathBuf,
    hypervisor_type: String,
    hypervisor_version: u64,
}

impl ResourceReporter {
    pub fn new(
        gateway: std::sync::Arc<HypervisorGateway>,
        instances_path: std::path::PathBuf,
        hypervisor_type: String,
        hypervisor_version: u64,
    ) -> Self {
        Self {
            gateway,
            instances_path,
            hypervisor_type,
            hypervisor_version,
        }
    }

    #[instrument(skip(self))]
    pub async fn report(&self) -> Result<ComputeNodeReport> {
        let vcpus = num_cpus();
        let (memory_mb, memory_mb_used) = read_meminfo().await?;
        let (local_gb, local_gb_used) = disk_usage(&self.instances_path).await?;
        let vcpus_used = self.vcpus_used().await?;
        let cpu_info = self.cpu_info().await?;

        Ok(ComputeNodeReport {
            vcpus,
            memory_mb,
            local_gb,
            vcpus_used,
            memory_mb_used,
            local_gb_used,
            hypervisor_type: self.hypervisor_type.clone(),
            hypervisor_version: self.hypervisor_version,
            cpu_info,
        })
    }

    /// Sum of vCPUs pinned across every currently-running domain.
    async fn vcpus_used(&self) -> Result<u32> {
        let mut total = 0u32;
        for name in self.gateway.list_running().await? {
            if let Some(info) = self.gateway.info(&name).await? {
                total += info.vcpus;
            }
        }
        Ok(total)
    }

    /// Extracts `{arch, model, vendor, topology, features}` from the
    /// hypervisor's capabilities document (§4.6). Rejects documents whose
    /// topology does not carry exactly `cores`/`sockets`/`threads`.
    async fn cpu_info(&self) -> Result<CpuInfo> {
        let xml = self.gateway.get_capabilities_xml().await?;
        parse_cpu_info(&xml)
    }

    /// Reports a non-positive `compare_cpu` result as an incompatibility
    /// error carrying a reference link, per §4.6.
    #[instrument(skip(self, cpu_info))]
    pub async fn compare_cpu(&self, cpu_info: &CpuInfo) -> Result<()> {
        let xml = crate::templates::render_cpu_xml(cpu_info);
        let result = self.gateway.compare_cpu(xml).await?;
        if result <= 0 {
            return Err(Error::Invalid(format!(
                "host CPU is incompatible with the requested CPU model (libvirt compareCPU returned {result}); \
                 see https://libvirt.org/formatdomain.html#cpu-model-and-topology"
            )));
        }
        Ok(())
    }
}

fn num_cpus() -> u32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(1)
}

async fn read_meminfo() -> Result<(u64, u64)> {
    if !Path::new("/proc/meminfo").exists() {
        return Ok((0, 0));
    }
    let contents = tokio::fs::read_to_string("/proc/meminfo").await?;
    let mut total_kb = 0u64;
    let mut free_kb = 0u64;
    let mut buffers_kb = 0u64;
    let mut cached_kb = 0u64;
    for line in contents.lines() {
        let mut parts = line.split_whitespace();
        let Some(key) = parts.next() else { continue };
        let Some(value) = parts.next().and_then(|v| v.parse::<u64>().ok()) else {
            continue;
        };
        match key {
            "MemTotal:" => total_kb = value,
            "MemFree:" => free_kb = value,
            "Buffers:" => buffers_kb = value,
            "Cached:" => cached_kb = value,
            _ => {}
        }
    }
    let total_mb = total_kb / 1024;
    let used_mb = total_mb.saturating_sub((free_kb + buffers_kb + cached_kb) / 1024);
    Ok((total_mb, used_mb))
}

/// Total/used gigabytes on the filesystem hosting `instances_path`, via
/// `df -k --output=size,used` (portable across the filesystems an
/// instances directory is likely to sit on; avoids a raw `statvfs` binding).
async fn disk_usage(instances_path: &Path) -> Result<(u64, u64)> {
    tokio::fs::create_dir_all(instances_path).await.ok();
    let output = Command::new("df")
        .args(["-k", "--output=size,used"])
        .arg(instances_path)
        .output()
        .await
        .map_err(|e| Error::External(format!("df failed: {e}")))?;
    if !output.status.success() {
        return Err(Error::External(format!(
            "df failed: {}",
            String::from_utf8_lossy(&output.stderr)
        )));
    }
    let text = String::from_utf8_lossy(&output.stdout);
    let data_line = text.lines().nth(1).unwrap_or_default();
    let mut fields = data_line.split_whitespace();
    let size_kb: u64 = fields.next().and_then(|s| s.parse().ok()).unwrap_or(0);
    let used_kb: u64 = fields.next().and_then(|s| s.parse().ok()).unwrap_or(0);
    Ok((size_kb / (1024 * 1024), used_kb / (1024 * 1024)))
}

fn parse_cpu_info(xml: &str) -> Result<CpuInfo> {
    let arch = extract_tag(xml, "arch").unwrap_or_else(|| "x86_64".to_string());
    let model = extract_tag(xml, "model").unwrap_or_default();
    let vendor = extract_tag(xml, "vendor").unwrap_or_default();
    let features = extract_all_attr(xml, "feature", "name");

    let topology_tag = extract_self_closing(xml, "topology")
        .ok_or_else(|| Error::Invalid("capabilities xml has no <topology/> element".into()))?;
    let cores = extract_attr(&topology_tag, "cores")
        .ok_or_else(|| Error::Invalid("topology missing cores".into()))?;
    let sockets = extract_attr(&topology_tag, "sockets")
        .ok_or_else(|| Error::Invalid("topology missing sockets".into()))?;
    let threads = extract_attr(&topology_tag, "threads")
        .ok_or_else(|| Error::Invalid("topology missing threads".into()))?;

    let known_attrs = ["cores", "sockets", "threads"];
    let attr_count = topology_tag.matches('=').count();
    if attr_count != known_attrs.len() {
        return Err(Error::Invalid(
            "topology must contain exactly cores, sockets, and threads".into(),
        ));
    }

    Ok(CpuInfo {
        arch,
        model,
        vendor,
        topology: CpuTopology {
            cores,
            sockets,
            threads,
        },
        features,
    })
}

fn extract_tag(xml: &str, tag: &str) -> Option<String> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = xml.find(&open)? + open.len();
    let end = xml[start..].find(&close)? + start;
    Some(xml[start..end].to_string())
}

fn extract_self_closing(xml: &str, tag: &str) -> Option<String> {
    let open = format!("<{tag} ");
    let start = xml.find(&open)?;
    let end = xml[start..].find('>')? + start;
    Some(xml[start..end].to_string())
}

fn extract_attr(tag_fragment: &str, attr: &str) -> Option<u32> {
    let needle = format!("{attr}='");
    let start = tag_fragment.find(&needle)? + needle.len();
    let end = tag_fragment[start..].find('\'')? + start;
    tag_fragment[start..end].parse().ok()
}

fn extract_all_attr(xml: &str, tag: &str, attr: &str) -> Vec<String> {
    let mut out = Vec::new();
    let open = format!("<{tag} ");
    let mut rest = xml;
    while let Some(pos) = rest.find(&open) {
        let fragment_start = pos;
        let Some(end_rel) = rest[fragment_start..].find('>') else {
            break;
        };
        let fragment = &rest[fragment_start..fragment_start + end_rel];
        let needle = format!("{attr}='");
        if let Some(attr_start) = fragment.find(&needle) {
            let attr_start = attr_start + needle.len();
            if let Some(attr_end) = fragment[attr_start..].find('\'') {
                out.push(fragment[attr_start..attr_start + attr_end].to_string());
            }
        }
        rest = &rest[fragment_start + end_rel..];
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_CAPS: &str = "<capabilities><host><cpu><arch>x86_64</arch><model>Skylake</model><vendor>Intel</vendor>\
        <topology sockets='1' cores='4' threads='2'/>\
        <feature name='vmx'/><feature name='avx2'/>\
        </cpu></host></capabilities>";

    #[test]
    fn parses_cpu_info_from_capabilities_xml() {
        let info = parse_cpu_info(SAMPLE_CAPS).unwrap();
        assert_eq!(info.arch, "x86_64");
        assert_eq!(info.topology.cores, 4);
        assert_eq!(info.topology.sockets, 1);
        assert_eq!(info.topology.threads, 2);
        assert_eq!(info.features, vec!["vmx", "avx2"]);
    }

    #[test]
    fn rejects_topology_with_extra_attributes() {
        let xml = "<capabilities><host><cpu><arch>x86_64</arch><model>M</model><vendor>V</vendor>\
            <topology sockets='1' cores='4' threads='2' extra='1'/>\
            </cpu></host></capabilities>";
        assert!(parse_cpu_info(xml).is_err());
    }

    #[tokio::test]
    async fn meminfo_parses_known_linux_format() {
        // Exercised indirectly: if /proc/meminfo is absent (non-Linux CI),
        // the function degrades to (0, 0) rather than erroring.
        let (_total, _used) = read_meminfo().await.unwrap();
    }
}

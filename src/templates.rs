//! Domain XML, injected-interfaces, and CPU-compatibility templating
//! (§6 "Templates"). Plain string templating for these host-facing
//! documents, reserving the document-builder approach (`quick-xml`) for
//! the hypervisor-filter documents in `filter::hypervisor_filter`, per the
//! design note in §9: "keep the templating engine only for the host-facing
//! domain/interface/CPU templates."

use crate::model::{CpuInfo, Instance, NetworkInfo};

pub struct DomainTemplateVars<'a> {
    pub libvirt_type: &'a str,
    pub name: &'a str,
    pub basepath: &'a str,
    pub memory_kb: u64,
    pub vcpus: u32,
    pub bridge_name: &'a str,
    pub mac_address: &'a str,
    pub ip_address: Option<&'a str>,
    pub dhcp_server: Option<&'a str>,
    pub extra_params: &'a str,
    pub rescue: bool,
    pub local: bool,
    pub driver_type: &'a str,
    pub gateway_v6: Option<&'a str>,
    pub kernel: Option<&'a str>,
    pub ramdisk: Option<&'a str>,
    pub disk: &'a str,
    /// Name of the hypervisor-native filter to reference from the
    /// instance's network interface; `None` when the host-packet-filter
    /// back-end is in use, since that back-end matches on address instead.
    pub filter_ref: Option<&'a str>,
}

/// Renders the domain definition XML handed to
/// `HypervisorGateway::define_and_start`.
pub fn render_domain_xml(vars: &DomainTemplateVars<'_>) -> String {
    let kernel_block = vars
        .kernel
        .map(|k| format!("<kernel>{k}</kernel>"))
        .unwrap_or_default();
    let ramdisk_block = vars
        .ramdisk
        .map(|r| format!("<initrd>{r}</initrd>"))
        .unwrap_or_default();
    let local_disk_block = if vars.local {
        format!(
            "<disk type='file' device='disk'><driver name='qemu' type='{driver}'/><source file='{base}/disk.local{suffix}'/><target dev='vdb' bus='virtio'/></disk>",
            driver = vars.driver_type,
            base = vars.basepath,
            suffix = if vars.rescue { ".rescue" } else { "" },
        )
    } else {
        String::new()
    };
    let filter_ref_block = vars
        .filter_ref
        .map(|f| format!("<filterref filter='{f}'/>"))
        .unwrap_or_default();

    format!(
        "<domain type='{libvirt_type}'>\
           <name>{name}</name>\
           <memory unit='KiB'>{memory_kb}</memory>\
           <vcpu>{vcpus}</vcpu>\
           <os>{kernel_block}{ramdisk_block}<type>hvm</type></os>\
           <devices>\
             <disk type='file' device='disk'><driver name='qemu' type='{driver_type}'/><source file='{basepath}/disk{suffix}'/><target dev='vda' bus='virtio'/></disk>\
             {local_disk_block}\
             <interface type='bridge'>\
               <source bridge='{bridge_name}'/>\
               <mac address='{mac_address}'/>\
               {filter_ref_block}\
             </interface>\
             <console type='file'><source path='{basepath}/console.log'/><target port='0'/></console>\
           </devices>\
           {extra_params}\
         </domain>",
        libvirt_type = vars.libvirt_type,
        name = vars.name,
        memory_kb = vars.memory_kb,
        vcpus = vars.vcpus,
        kernel_block = kernel_block,
        ramdisk_block = ramdisk_block,
        driver_type = vars.driver_type,
        basepath = vars.basepath,
        suffix = if vars.rescue { ".rescue" } else { "" },
        local_disk_block = local_disk_block,
        bridge_name = vars.bridge_name,
        mac_address = vars.mac_address,
        extra_params = vars.extra_params,
    )
}

/// Renders the interfaces file injected into the root disk for instances
/// whose network config is marked `injected` (§4.3 Injection).
pub fn render_injected_network(net: &NetworkInfo) -> String {
    let mut out = String::from("auto lo\niface lo inet loopback\n\n");
    out.push_str("auto eth0\niface eth0 inet static\n");
    if let Some(addr) = net.address {
        out.push_str(&format!("    address {addr}\n"));
    }
    if let Some(mask) = net.netmask {
        out.push_str(&format!("    netmask {mask}\n"));
    }
    if let Some(gw) = net.gateway {
        out.push_str(&format!("    gateway {gw}\n"));
    }
    if let Some(bcast) = net.broadcast {
        out.push_str(&format!("    broadcast {bcast}\n"));
    }
    if !net.dns.is_empty() {
        let dns = net
            .dns
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(" ");
        out.push_str(&format!("    dns-nameservers {dns}\n"));
    }
    if let Some(addr_v6) = net.address_v6 {
        out.push_str("\niface eth0 inet6 static\n");
        out.push_str(&format!("    address {addr_v6}\n"));
        if let Some(gw6) = net.gateway_v6 {
            out.push_str(&format!("    gateway {gw6}\n"));
        }
    }
    out
}

/// Renders the CPU-compatibility XML handed to
/// `HypervisorGateway::compare_cpu` (§4.6).
pub fn render_cpu_xml(info: &CpuInfo) -> String {
    let features = info
        .features
        .iter()
        .map(|f| format!("<feature name='{f}'/>"))
        .collect::<String>();
    format!(
        "<cpu match='exact'>\
           <arch>{arch}</arch>\
           <model>{model}</model>\
           <vendor>{vendor}</vendor>\
           <topology sockets='{sockets}' cores='{cores}' threads='{threads}'/>\
           {features}\
         </cpu>",
        arch = info.arch,
        model = info.model,
        vendor = info.vendor,
        sockets = info.topology.sockets,
        cores = info.topology.cores,
        threads = info.topology.threads,
        features = features,
    )
}

pub fn instance_bridge_name(instance: &Instance) -> String {
    format!("br-{}", &instance.mac_address.replace(':', ""))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn injected_network_template_includes_address_and_gateway() {
        let net = NetworkInfo {
            address: Some(Ipv4Addr::new(10, 0, 0, 5)),
            netmask: Some(Ipv4Addr::new(255, 255, 255, 0)),
            gateway: Some(Ipv4Addr::new(10, 0, 0, 1)),
            injected: true,
            ..Default::default()
        };
        let rendered = render_injected_network(&net);
        assert!(rendered.contains("address 10.0.0.5"));
        assert!(rendered.contains("gateway 10.0.0.1"));
    }

    #[test]
    fn domain_xml_includes_rescue_suffix_when_requested() {
        let vars = DomainTemplateVars {
            libvirt_type: "kvm",
            name: "i-0007",
            basepath: "/var/lib/compute-driver/instances/i-0007",
            memory_kb: 2_097_152,
            vcpus: 1,
            bridge_name: "br0",
            mac_address: "02:16:3e:11:22:33",
            ip_address: None,
            dhcp_server: None,
            extra_params: "",
            rescue: true,
            local: false,
            driver_type: "qcow2",
            gateway_v6: None,
            kernel: None,
            ramdisk: None,
            disk: "disk.rescue",
            filter_ref: None,
        };
        let xml = render_domain_xml(&vars);
        assert!(xml.contains("disk.rescue"));
    }
}

//! Core data model shared by every component: the shape of an `Instance`,
//! its flavor, and the security-group rules that bound it.
//!
//! Ownership follows §3 of the specification: `InstanceStore` owns
//! `Instance`, `ImageCache` owns `BaseImage` bookkeeping internally,
//! `FilterEngine` owns `FilterState`. This module only carries the
//! read/write shapes those owners pass across the seam.

use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, Ipv6Addr};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PowerState {
    NoState,
    Running,
    Blocked,
    Paused,
    Shutdown,
    Shutoff,
    Crashed,
}

impl PowerState {
    pub fn is_terminal_running(self) -> bool {
        matches!(self, PowerState::Running)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Flavor {
    pub memory_mb: u64,
    pub vcpus: u32,
    pub local_gb: u64,
    pub flavorid: String,
    pub rxtx_cap: u32,
}

impl Flavor {
    pub fn is_tiny(&self) -> bool {
        self.flavorid == "tiny" || self.flavorid == "1"
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    pub id: u64,
    pub name: String,
    pub project_id: String,
    pub user_id: String,
    pub host: String,
    pub instance_type: Flavor,
    pub image_id: u64,
    pub kernel_id: Option<u64>,
    pub ramdisk_id: Option<u64>,
    pub mac_address: String,
    pub key_data: Option<String>,
    pub state: PowerState,
    pub state_description: String,
}

impl Instance {
    /// 8-hex-digit fingerprint used as the `ImageCache` key for a given
    /// image/kernel/ramdisk reference (§3 BaseImage).
    pub fn image_key(id: u64) -> String {
        format!("{:08x}", id & 0xFFFF_FFFF)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Protocol {
    Tcp,
    Udp,
    Icmp,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Icmp => "icmp",
        }
    }

    /// IPv6 protocol name per §8 boundary behavior: tcp -> tcp-ipv6 etc.
    pub fn as_ipv6_str(self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp-ipv6",
            Protocol::Udp => "udp-ipv6",
            Protocol::Icmp => "icmpv6",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Cidr {
    V4(ipnet::Ipv4Net),
    V6(ipnet::Ipv6Net),
}

impl Cidr {
    pub fn is_v6(&self) -> bool {
        matches!(self, Cidr::V6(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityGroupRule {
    pub cidr: Option<Cidr>,
    pub protocol: Protocol,
    /// For ICMP, `from_port` is the ICMP type (-1 = any).
    pub from_port: i32,
    /// For ICMP, `to_port` is the ICMP code (-1 = any).
    pub to_port: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityGroup {
    pub id: u64,
    pub rules: Vec<SecurityGroupRule>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkInfo {
    pub bridge: String,
    pub gateway: Option<Ipv4Addr>,
    pub gateway_v6: Option<Ipv6Addr>,
    pub broadcast: Option<Ipv4Addr>,
    pub dns: Vec<Ipv4Addr>,
    pub cidr: Option<ipnet::Ipv4Net>,
    pub cidr_v6: Option<ipnet::Ipv6Net>,
    pub netmask: Option<Ipv4Addr>,
    pub netmask_v6: Option<Ipv6Addr>,
    pub injected: bool,
    pub address: Option<Ipv4Addr>,
    pub address_v6: Option<Ipv6Addr>,
    pub dhcp_server: Option<Ipv4Addr>,
}

/// The record `ResourceReporter` emits (§4.6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComputeNodeReport {
    pub vcpus: u32,
    pub memory_mb: u64,
    pub local_gb: u64,
    pub vcpus_used: u32,
    pub memory_mb_used: u64,
    pub local_gb_used: u64,
    pub hypervisor_type: String,
    pub hypervisor_version: u64,
    pub cpu_info: CpuInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CpuTopology {
    pub cores: u32,
    pub sockets: u32,
    pub threads: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CpuInfo {
    pub arch: String,
    pub model: String,
    pub vendor: String,
    pub topology: CpuTopology,
    pub features: Vec<String>,
}

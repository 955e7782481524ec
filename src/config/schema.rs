//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the proxy.
//! All types derive Serde traits for deserialization from config files.

use std::collections::BTreeMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::net::Endpoint;
use crate::vnet::Protocol;

/// Root configuration for the proxy.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default)]
pub struct ProxyConfig {
    /// Host-facing endpoints and the guest packet channel.
    pub listener: ListenerConfig,

    /// Virtual network stack configuration.
    pub network: NetworkConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,

    /// Request and shutdown timeouts of the HTTP surfaces.
    pub timeouts: TimeoutConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ListenerConfig {
    /// Endpoints serving the root HTTP API (e.g. "unix:///run/vmnet/api.sock").
    pub endpoints: Vec<Endpoint>,

    /// Raw channel carrying the guest's ethernet frames.
    pub guest: Option<Endpoint>,

    /// Maximum concurrent connections per API endpoint (backpressure).
    pub max_connections: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            guest: None,
            max_connections: 128,
        }
    }
}

/// Virtual network configuration, handed to the stack once at startup.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    /// Maximum ethernet payload size.
    pub mtu: usize,

    /// Guest subnet in CIDR notation.
    pub subnet: Subnet,

    /// Gateway address inside the subnet.
    pub gateway_ip: Ipv4Addr,

    /// Gateway MAC address.
    pub gateway_mac: MacAddress,

    /// Extra addresses answered by the host side (host API on `host_api_port`).
    pub gateway_virtual_ips: Vec<Ipv4Addr>,

    /// Port of the host API inside the virtual network.
    pub host_api_port: u16,

    /// Fixed DHCP assignments: IP → MAC.
    pub dhcp_static_leases: BTreeMap<Ipv4Addr, MacAddress>,

    /// Host port forwards: host "ip:port" → guest "ip:port".
    pub forwards: BTreeMap<String, String>,

    /// NAT table: virtual IP → host IP.
    pub nat: BTreeMap<Ipv4Addr, Ipv4Addr>,

    /// DNS zones served to the guest.
    pub dns: Vec<DnsZone>,

    /// DNS search domains. Read from /etc/resolv.conf when unset.
    pub search_domains: Option<Vec<String>>,

    /// Write every frame to this pcap file.
    pub capture_file: Option<PathBuf>,

    /// Framing used on the guest channel.
    pub protocol: Protocol,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        let gateway_ip = Ipv4Addr::new(192, 168, 127, 1);
        let host_ip = Ipv4Addr::new(192, 168, 127, 254);
        let guest_ip = Ipv4Addr::new(192, 168, 127, 2);

        Self {
            mtu: 4000,
            subnet: Subnet::new(Ipv4Addr::new(192, 168, 127, 0), 24),
            gateway_ip,
            gateway_mac: MacAddress([0x5a, 0x94, 0xef, 0xe4, 0x0c, 0xdd]),
            gateway_virtual_ips: vec![host_ip],
            host_api_port: 7777,
            dhcp_static_leases: BTreeMap::from([(
                guest_ip,
                MacAddress([0x5a, 0x94, 0xef, 0xe4, 0x0c, 0xee]),
            )]),
            forwards: BTreeMap::from([(
                "127.0.0.1:2223".to_string(),
                format!("{}:22", guest_ip),
            )]),
            nat: BTreeMap::new(),
            dns: vec![DnsZone {
                name: "docker.internal.".to_string(),
                records: vec![
                    DnsRecord {
                        name: "gateway".to_string(),
                        ip: gateway_ip,
                    },
                    DnsRecord {
                        name: "host".to_string(),
                        ip: host_ip,
                    },
                ],
            }],
            search_domains: None,
            capture_file: None,
            protocol: Protocol::default(),
        }
    }
}

/// A DNS zone.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct DnsZone {
    /// Fully qualified zone name (e.g. "docker.internal.").
    pub name: String,

    #[serde(default)]
    pub records: Vec<DnsRecord>,
}

/// An A record inside a zone.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct DnsRecord {
    pub name: String,
    pub ip: Ipv4Addr,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Debug mode: verbose logs, profiling routes, byte counter loop.
    pub debug: bool,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Interval of the byte counter loop in seconds.
    pub stats_interval_secs: u64,

    /// Prometheus exporter bind address; exporter disabled when unset.
    pub metrics_address: Option<String>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            debug: false,
            log_level: "info".to_string(),
            stats_interval_secs: 5,
            metrics_address: None,
        }
    }
}

/// Timeout configuration for the HTTP surfaces.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Request timeout (total time for request/response) in seconds.
    pub request_secs: u64,

    /// Time open connections get to finish once shutdown starts, in seconds.
    pub drain_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            request_secs: 60,
            drain_secs: 5,
        }
    }
}

/// Error parsing a subnet or MAC address.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AddrParseError {
    #[error("invalid subnet `{0}`: expected a.b.c.d/len")]
    Subnet(String),
    #[error("invalid MAC address `{0}`")]
    Mac(String),
}

/// An IPv4 network in CIDR notation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subnet {
    network: Ipv4Addr,
    prefix_len: u8,
}

impl Subnet {
    /// Build a subnet; host bits of `addr` are masked off.
    pub fn new(addr: Ipv4Addr, prefix_len: u8) -> Self {
        let prefix_len = prefix_len.min(32);
        Self {
            network: Ipv4Addr::from(u32::from(addr) & mask(prefix_len)),
            prefix_len,
        }
    }

    pub fn network(&self) -> Ipv4Addr {
        self.network
    }

    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        u32::from(ip) & mask(self.prefix_len) == u32::from(self.network)
    }
}

fn mask(prefix_len: u8) -> u32 {
    u32::MAX.checked_shl(32 - u32::from(prefix_len)).unwrap_or(0)
}

impl FromStr for Subnet {
    type Err = AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || AddrParseError::Subnet(s.to_string());
        let (addr, len) = s.split_once('/').ok_or_else(err)?;
        let addr: Ipv4Addr = addr.parse().map_err(|_| err())?;
        let len: u8 = len.parse().map_err(|_| err())?;
        if len > 32 {
            return Err(err());
        }
        Ok(Self::new(addr, len))
    }
}

impl fmt::Display for Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix_len)
    }
}

/// A 48-bit ethernet address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddress(pub [u8; 6]);

impl FromStr for MacAddress {
    type Err = AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut octets = [0u8; 6];
        let mut parts = s.split(':');
        for octet in &mut octets {
            let part = parts.next().ok_or_else(|| AddrParseError::Mac(s.to_string()))?;
            if part.len() != 2 {
                return Err(AddrParseError::Mac(s.to_string()));
            }
            *octet = u8::from_str_radix(part, 16).map_err(|_| AddrParseError::Mac(s.to_string()))?;
        }
        if parts.next().is_some() {
            return Err(AddrParseError::Mac(s.to_string()));
        }
        Ok(Self(octets))
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

macro_rules! string_serde {
    ($ty:ty) => {
        impl Serialize for $ty {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.collect_str(self)
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let raw = String::deserialize(deserializer)?;
                raw.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

string_serde!(Subnet);
string_serde!(MacAddress);

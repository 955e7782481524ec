//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Check that every virtual address lives inside the subnet
//! - Validate value ranges (MTU, intervals, ports)
//! - Detect conflicting endpoints
//! - Match the guest endpoint kind with the framing protocol
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ProxyConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;

use crate::config::schema::{NetworkConfig, ProxyConfig};
use crate::net::Endpoint;
use crate::vnet::protocol::ETHERNET_HEADER_LEN;
use crate::vnet::Protocol;

/// Smallest and largest MTU the stack accepts.
pub const MTU_RANGE: std::ops::RangeInclusive<usize> = 68..=65535;

/// One semantic problem with a configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("API endpoint {0} must be a unix stream socket or an inherited descriptor")]
    DatagramApiEndpoint(Endpoint),
    #[error("endpoint {0} is configured more than once")]
    DuplicateEndpoint(Endpoint),
    #[error("max_connections must be greater than zero")]
    ZeroMaxConnections,
    #[error("mtu {0} is outside {min}..={max}", min = MTU_RANGE.start(), max = MTU_RANGE.end())]
    MtuOutOfRange(usize),
    #[error("mtu {mtu} does not fit {protocol} framing (at most {max})")]
    MtuTooLargeForProtocol {
        mtu: usize,
        protocol: Protocol,
        max: usize,
    },
    #[error("guest endpoint {endpoint} cannot carry {protocol} framing")]
    ProtocolMismatch {
        endpoint: Endpoint,
        protocol: Protocol,
    },
    #[error("{what} {ip} is outside subnet {subnet}")]
    OutsideSubnet {
        what: &'static str,
        ip: Ipv4Addr,
        subnet: String,
    },
    #[error("virtual IP {0} collides with the gateway address")]
    VirtualIpIsGateway(Ipv4Addr),
    #[error("forward {local} -> {remote}: {reason}")]
    InvalidForward {
        local: String,
        remote: String,
        reason: String,
    },
    #[error("capture file directory {} does not exist", .0.display())]
    CaptureDirMissing(PathBuf),
    #[error("stats_interval_secs must be greater than zero")]
    ZeroStatsInterval,
    #[error("invalid metrics address `{0}`")]
    InvalidMetricsAddress(String),
    #[error("timeouts.request_secs must be greater than zero")]
    ZeroRequestTimeout,
}

/// Validate a configuration, collecting every problem found.
pub fn validate_config(config: &ProxyConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    validate_listener(config, &mut errors);
    validate_network(&config.network, &mut errors);

    let obs = &config.observability;
    if obs.stats_interval_secs == 0 {
        errors.push(ValidationError::ZeroStatsInterval);
    }
    if let Some(addr) = &obs.metrics_address {
        if addr.parse::<SocketAddr>().is_err() {
            errors.push(ValidationError::InvalidMetricsAddress(addr.clone()));
        }
    }
    if config.timeouts.request_secs == 0 {
        errors.push(ValidationError::ZeroRequestTimeout);
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn validate_listener(config: &ProxyConfig, errors: &mut Vec<ValidationError>) {
    let listener = &config.listener;
    if listener.max_connections == 0 {
        errors.push(ValidationError::ZeroMaxConnections);
    }

    let mut seen = HashSet::new();
    for endpoint in listener.endpoints.iter().chain(listener.guest.iter()) {
        if !seen.insert(endpoint) {
            errors.push(ValidationError::DuplicateEndpoint(endpoint.clone()));
        }
    }

    for endpoint in &listener.endpoints {
        if matches!(endpoint, Endpoint::UnixDatagram(_)) {
            errors.push(ValidationError::DatagramApiEndpoint(endpoint.clone()));
        }
    }

    if let Some(endpoint) = &listener.guest {
        let protocol = config.network.protocol;
        let fits = match endpoint {
            Endpoint::UnixStream(_) => protocol.is_stream(),
            Endpoint::UnixDatagram(_) => protocol == Protocol::Vfkit,
            // The kind of an inherited descriptor (e.g. a SOCK_SEQPACKET
            // pair for bess) is up to the parent.
            Endpoint::Fd(_) => true,
        };
        if !fits {
            errors.push(ValidationError::ProtocolMismatch {
                endpoint: endpoint.clone(),
                protocol,
            });
        }
    }
}

fn validate_network(net: &NetworkConfig, errors: &mut Vec<ValidationError>) {
    if !MTU_RANGE.contains(&net.mtu) {
        errors.push(ValidationError::MtuOutOfRange(net.mtu));
    } else if let Some(limit) = net.protocol.max_frame_len() {
        if net.mtu + ETHERNET_HEADER_LEN > limit {
            errors.push(ValidationError::MtuTooLargeForProtocol {
                mtu: net.mtu,
                protocol: net.protocol,
                max: limit - ETHERNET_HEADER_LEN,
            });
        }
    }

    let mut check = |what: &'static str, ip: Ipv4Addr| {
        if !net.subnet.contains(ip) {
            errors.push(ValidationError::OutsideSubnet {
                what,
                ip,
                subnet: net.subnet.to_string(),
            });
        }
    };
    check("gateway", net.gateway_ip);
    for ip in &net.gateway_virtual_ips {
        check("virtual IP", *ip);
    }
    for ip in net.dhcp_static_leases.keys() {
        check("DHCP lease", *ip);
    }
    for ip in net.nat.keys() {
        check("NAT address", *ip);
    }
    for zone in &net.dns {
        for record in &zone.records {
            check("DNS record", record.ip);
        }
    }

    for ip in &net.gateway_virtual_ips {
        if *ip == net.gateway_ip {
            errors.push(ValidationError::VirtualIpIsGateway(*ip));
        }
    }

    for (local, remote) in &net.forwards {
        let invalid = |reason: &str| ValidationError::InvalidForward {
            local: local.clone(),
            remote: remote.clone(),
            reason: reason.to_string(),
        };
        if local.parse::<SocketAddr>().is_err() {
            errors.push(invalid("host side is not an ip:port"));
        }
        match remote.parse::<SocketAddr>() {
            Ok(SocketAddr::V4(addr)) if net.subnet.contains(*addr.ip()) => {}
            Ok(_) => errors.push(invalid("guest side is outside the subnet")),
            Err(_) => errors.push(invalid("guest side is not an ip:port")),
        }
    }

    if let Some(path) = &net.capture_file {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            if !dir.is_dir() {
                errors.push(ValidationError::CaptureDirMissing(dir.to_path_buf()));
            }
        }
    }
}

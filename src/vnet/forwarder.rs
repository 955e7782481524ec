//! Host-to-guest port forwarding.
//!
//! Each forward binds a TCP listener on the host and splices accepted
//! connections into a virtual connection towards the guest address.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use crate::config::Subnet;
use crate::vnet::ListenerTable;

/// Error type for forwarder operations.
#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error("invalid address `{0}`")]
    InvalidAddress(String),
    #[error("remote {remote} is outside the guest subnet {subnet}")]
    OutsideSubnet { remote: SocketAddr, subnet: Subnet },
    #[error("{0} is already forwarded")]
    AlreadyExposed(SocketAddr),
    #[error("{0} is not forwarded")]
    NotExposed(SocketAddr),
    #[error("cannot listen on {local}: {source}")]
    Bind {
        local: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

/// Transport of a forward. Only TCP is carried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForwardProtocol {
    #[default]
    Tcp,
}

/// Body of `POST /services/forwarder/expose`, also the listing entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExposeRequest {
    pub local: String,
    pub remote: String,
    #[serde(default)]
    pub protocol: ForwardProtocol,
}

/// Body of `POST /services/forwarder/unexpose`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnexposeRequest {
    pub local: String,
    #[serde(default)]
    pub protocol: ForwardProtocol,
}

#[derive(Debug)]
struct ActiveForward {
    remote: SocketAddr,
    task: JoinHandle<()>,
}

impl Drop for ActiveForward {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Table of active forwards.
#[derive(Debug)]
pub struct Forwarder {
    table: Arc<ListenerTable>,
    gateway_ip: Ipv4Addr,
    subnet: Subnet,
    active: DashMap<SocketAddr, ActiveForward>,
}

impl Forwarder {
    pub fn new(table: Arc<ListenerTable>, gateway_ip: Ipv4Addr, subnet: Subnet) -> Self {
        Self {
            table,
            gateway_ip,
            subnet,
            active: DashMap::new(),
        }
    }

    /// Start forwarding `req.local` on the host to `req.remote` in the guest.
    pub async fn expose(&self, req: &ExposeRequest) -> Result<SocketAddr, ForwardError> {
        let local = parse_addr(&req.local)?;
        let remote = parse_addr(&req.remote)?;
        match remote {
            SocketAddr::V4(v4) if self.subnet.contains(*v4.ip()) => {}
            _ => {
                return Err(ForwardError::OutsideSubnet {
                    remote,
                    subnet: self.subnet,
                })
            }
        }
        if self.active.contains_key(&local) {
            return Err(ForwardError::AlreadyExposed(local));
        }

        let listener = TcpListener::bind(local)
            .await
            .map_err(|source| ForwardError::Bind { local, source })?;
        let bound = listener.local_addr().unwrap_or(local);

        match self.active.entry(bound) {
            Entry::Occupied(_) => Err(ForwardError::AlreadyExposed(bound)),
            Entry::Vacant(slot) => {
                let from = SocketAddr::from((self.gateway_ip, 0));
                let task = tokio::spawn(run_forward(listener, self.table.clone(), from, remote));
                slot.insert(ActiveForward { remote, task });
                tracing::info!(local = %bound, remote = %remote, "Port forward exposed");
                Ok(bound)
            }
        }
    }

    /// Stop the forward listening on `local`.
    pub fn unexpose(&self, local: &str) -> Result<(), ForwardError> {
        let local = parse_addr(local)?;
        match self.active.remove(&local) {
            Some(_) => {
                tracing::info!(local = %local, "Port forward removed");
                Ok(())
            }
            None => Err(ForwardError::NotExposed(local)),
        }
    }

    /// Active forwards, ordered by local address.
    pub fn list(&self) -> Vec<ExposeRequest> {
        let mut entries: Vec<_> = self
            .active
            .iter()
            .map(|e| (*e.key(), e.value().remote))
            .collect();
        entries.sort();
        entries
            .into_iter()
            .map(|(local, remote)| ExposeRequest {
                local: local.to_string(),
                remote: remote.to_string(),
                protocol: ForwardProtocol::Tcp,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }
}

fn parse_addr(s: &str) -> Result<SocketAddr, ForwardError> {
    s.parse()
        .map_err(|_| ForwardError::InvalidAddress(s.to_string()))
}

async fn run_forward(
    listener: TcpListener,
    table: Arc<ListenerTable>,
    from: SocketAddr,
    remote: SocketAddr,
) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                tracing::warn!(error = %e, "Forward accept failed");
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                continue;
            }
        };
        tokio::spawn(splice(stream, peer, table.clone(), from, remote));
    }
}

async fn splice(
    mut stream: TcpStream,
    peer: SocketAddr,
    table: Arc<ListenerTable>,
    from: SocketAddr,
    remote: SocketAddr,
) {
    let mut virt = match table.dial(from, remote).await {
        Ok(virt) => virt,
        Err(e) => {
            tracing::debug!(peer = %peer, remote = %remote, error = %e, "Forward target unreachable");
            return;
        }
    };

    match tokio::io::copy_bidirectional(&mut stream, &mut virt).await {
        Ok((up, down)) => {
            tracing::debug!(peer = %peer, remote = %remote, up, down, "Forwarded connection closed")
        }
        Err(e) => tracing::debug!(peer = %peer, remote = %remote, error = %e, "Forwarded connection failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn forwarder() -> (Forwarder, Arc<ListenerTable>) {
        let table = ListenerTable::new();
        let subnet: Subnet = "192.168.127.0/24".parse().unwrap();
        let fwd = Forwarder::new(table.clone(), Ipv4Addr::new(192, 168, 127, 1), subnet);
        (fwd, table)
    }

    fn request(remote: &str) -> ExposeRequest {
        ExposeRequest {
            local: "127.0.0.1:0".to_string(),
            remote: remote.to_string(),
            protocol: ForwardProtocol::Tcp,
        }
    }

    #[tokio::test]
    async fn forwards_into_virtual_listener() {
        let (fwd, table) = forwarder();
        let mut guest = table.bind("192.168.127.2:22".parse().unwrap()).unwrap();
        let bound = fwd.expose(&request("192.168.127.2:22")).await.unwrap();

        let mut client = TcpStream::connect(bound).await.unwrap();
        client.write_all(b"SSH-2.0").await.unwrap();

        let (mut server, from) = guest.accept().await.unwrap();
        assert_eq!(from.ip(), Ipv4Addr::new(192, 168, 127, 1));
        let mut buf = [0u8; 7];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"SSH-2.0");

        assert_eq!(fwd.list().len(), 1);
        fwd.unexpose(&bound.to_string()).unwrap();
        assert!(fwd.is_empty());
    }

    #[tokio::test]
    async fn remote_outside_subnet_is_rejected() {
        let (fwd, _table) = forwarder();
        let err = fwd.expose(&request("10.0.0.2:22")).await.unwrap_err();
        assert!(matches!(err, ForwardError::OutsideSubnet { .. }));
    }

    #[tokio::test]
    async fn unexpose_unknown_fails() {
        let (fwd, _table) = forwarder();
        let err = fwd.unexpose("127.0.0.1:1").unwrap_err();
        assert!(matches!(err, ForwardError::NotExposed(_)));
        assert!(matches!(
            fwd.unexpose("nonsense"),
            Err(ForwardError::InvalidAddress(_))
        ));
    }
}

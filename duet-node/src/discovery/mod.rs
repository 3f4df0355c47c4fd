//! LAN discovery: UDP multicast beacons carrying advertisements, queries and goodbyes.

pub mod advertiser;
pub mod discoverer;

pub use advertiser::{Advertiser, AdvertiserEvent, AdvertiserStatus, Registration};
pub use discoverer::{Discoverer, DiscoveryEvent, DnsResolver, Resolver};

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use duet_core::wire::{decode_datagram, encode_datagram, MAX_DATAGRAM_LEN};
use duet_core::Beacon;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const BEACON_CAPACITY: usize = 256;

/// Shared multicast socket. Received beacons for our service type fan out to every subscriber.
pub struct BeaconSocket {
    socket: Arc<UdpSocket>,
    dest: SocketAddr,
    service_type: String,
    beacons: broadcast::Sender<(Beacon, SocketAddr)>,
    recv_task: JoinHandle<()>,
}

impl BeaconSocket {
    /// Bind the discovery port and join `group`. Fails when the port or interface is unavailable.
    pub async fn bind(group: Ipv4Addr, port: u16, service_type: &str) -> std::io::Result<Arc<Self>> {
        let socket = Arc::new(make_multicast_socket(group, port).await?);
        let (beacons, _) = broadcast::channel(BEACON_CAPACITY);
        let recv_task = tokio::spawn(recv_loop(
            socket.clone(),
            service_type.to_owned(),
            beacons.clone(),
        ));
        Ok(Arc::new(Self {
            socket,
            dest: SocketAddr::new(IpAddr::V4(group), port),
            service_type: service_type.to_owned(),
            beacons,
            recv_task,
        }))
    }

    pub fn service_type(&self) -> &str {
        &self.service_type
    }

    /// Multicast one beacon to the group.
    pub async fn send(&self, beacon: &Beacon) -> std::io::Result<()> {
        let datagram = encode_datagram(beacon)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        self.socket.send_to(&datagram, self.dest).await?;
        Ok(())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<(Beacon, SocketAddr)> {
        self.beacons.subscribe()
    }
}

impl Drop for BeaconSocket {
    fn drop(&mut self) {
        self.recv_task.abort();
    }
}

async fn make_multicast_socket(group: Ipv4Addr, port: u16) -> std::io::Result<UdpSocket> {
    let std_sock = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port))?;
    std_sock.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)?;
    std_sock.set_multicast_ttl_v4(1)?;
    std_sock.set_multicast_loop_v4(true)?;
    std_sock.set_nonblocking(true)?;
    UdpSocket::from_std(std_sock)
}

async fn recv_loop(
    socket: Arc<UdpSocket>,
    service_type: String,
    beacons: broadcast::Sender<(Beacon, SocketAddr)>,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM_LEN];
    loop {
        let (n, from) = match socket.recv_from(&mut buf).await {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "discovery socket receive failed");
                return;
            }
        };
        match decode_datagram(&buf[..n]) {
            Ok(beacon) if beacon.is_for(&service_type) => {
                let _ = beacons.send((beacon, from));
            }
            Ok(_) => {}
            Err(e) => debug!(%from, error = %e, "dropping undecodable beacon"),
        }
    }
}

/// Best-effort address of the interface that routes to `group`.
pub fn local_ip(group: Ipv4Addr, port: u16) -> Option<IpAddr> {
    let sock = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).ok()?;
    sock.connect((group, port)).ok()?;
    sock.local_addr()
        .ok()
        .map(|a| a.ip())
        .filter(|ip| !ip.is_unspecified())
}

/// True when `ip` is this node: loopback, unspecified, or our own interface address.
pub fn is_self(ip: IpAddr, local_ip: Option<IpAddr>) -> bool {
    ip.is_loopback() || ip.is_unspecified() || Some(ip) == local_ip
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn self_addresses() {
        let me: IpAddr = "192.168.1.20".parse().unwrap();
        assert!(is_self("127.0.0.1".parse().unwrap(), Some(me)));
        assert!(is_self("::1".parse().unwrap(), None));
        assert!(is_self(me, Some(me)));
        assert!(!is_self("192.168.1.21".parse().unwrap(), Some(me)));
        assert!(!is_self("192.168.1.21".parse().unwrap(), None));
    }
}

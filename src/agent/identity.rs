//! Agent identity: local network address plus a random suffix.

use std::net::{IpAddr, Ipv4Addr, UdpSocket};

use rand::Rng;
use rand::distributions::Alphanumeric;
use serde::Serialize;

const SUFFIX_LEN: usize = 8;

/// Generated once per process; never changes afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AgentIdentity {
    pub id: String,
    pub address: String,
}

impl AgentIdentity {
    /// Identity for this host.
    pub fn generate() -> Self {
        Self::for_address(local_address())
    }

    /// Identity for a known address.
    pub fn for_address(address: IpAddr) -> Self {
        let suffix: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(SUFFIX_LEN)
            .map(|c| char::from(c).to_ascii_lowercase())
            .collect();
        let address = address.to_string();
        Self {
            id: format!("{address}-{suffix}"),
            address,
        }
    }
}

/// Targets used to pick an interface: the public internet first, then the
/// private ranges so a host without a default route still finds its LAN.
const ROUTE_PROBES: [Ipv4Addr; 4] = [
    Ipv4Addr::new(8, 8, 8, 8),
    Ipv4Addr::new(10, 255, 255, 255),
    Ipv4Addr::new(172, 31, 255, 255),
    Ipv4Addr::new(192, 168, 255, 255),
];

/// Address of the first interface with a route to a probe target, or loopback.
fn local_address() -> IpAddr {
    ROUTE_PROBES
        .iter()
        .find_map(|target| routed_address(*target))
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}

fn routed_address(target: Ipv4Addr) -> Option<IpAddr> {
    // Connecting a UDP socket sends nothing; it only selects a route.
    UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
        .and_then(|socket| {
            socket.connect((target, 80))?;
            socket.local_addr()
        })
        .map(|addr| addr.ip())
        .ok()
        .filter(|ip| !ip.is_unspecified() && !ip.is_loopback())
}

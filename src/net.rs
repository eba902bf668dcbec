use std::io;
use std::net::{IpAddr, Ipv4Addr};

use tracing::{debug, info};

/// Enumerate network interfaces and pick the first non-loopback, non-VPN IP (preferring IPv4).
///
/// Peer sockets bind to this address when the config does not name one, so
/// the host candidate is reachable from the LAN.
pub fn detect_local_ip() -> io::Result<IpAddr> {
    let interfaces = if_addrs::get_if_addrs()?;

    debug!("Detected network interfaces:");
    for iface in &interfaces {
        let skipped = if is_vpn_interface(&iface.name, iface.ip()) {
            " [skipped: VPN]"
        } else {
            ""
        };
        debug!(
            "  {} -> {} (loopback: {}){skipped}",
            iface.name,
            iface.ip(),
            iface.is_loopback(),
        );
    }

    let candidates = interfaces
        .iter()
        .filter(|iface| !iface.is_loopback() && !is_vpn_interface(&iface.name, iface.ip()))
        .map(|iface| iface.ip());

    let ip = pick_preferred(candidates).ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::NotFound,
            "no suitable (non-loopback, non-VPN) IP address found",
        )
    })?;
    info!(%ip, "Using local address for peers");
    Ok(ip)
}

fn pick_preferred(addrs: impl Iterator<Item = IpAddr>) -> Option<IpAddr> {
    let mut first_v6 = None;
    for addr in addrs {
        match addr {
            IpAddr::V4(_) => return Some(addr),
            IpAddr::V6(_) if first_v6.is_none() => first_v6 = Some(addr),
            IpAddr::V6(_) => {}
        }
    }
    first_v6
}

/// Heuristic to detect VPN/tunnel interfaces.
fn is_vpn_interface(name: &str, ip: IpAddr) -> bool {
    let name = name.to_lowercase();

    // Common VPN/tunnel interface name patterns
    if name.contains("vpn")
        || name.contains("tun")
        || name.contains("tap")
        || name.contains("ppp")
        || name.contains("wg") // WireGuard
        || name.contains("tailscale")
    {
        return true;
    }

    // CGNAT range 100.64.0.0/10 is commonly used by VPNs (e.g., Tailscale)
    matches!(ip, IpAddr::V4(v4) if is_cgnat(v4))
}

/// Check if an IPv4 address is in the CGNAT range (100.64.0.0/10).
const fn is_cgnat(addr: Ipv4Addr) -> bool {
    let octets = addr.octets();
    octets[0] == 100 && (octets[1] & 0xC0) == 64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn cgnat_bounds() {
        assert!(is_cgnat(Ipv4Addr::new(100, 64, 0, 1)));
        assert!(is_cgnat(Ipv4Addr::new(100, 127, 255, 254)));
        assert!(!is_cgnat(Ipv4Addr::new(100, 128, 0, 1)));
        assert!(!is_cgnat(Ipv4Addr::new(100, 63, 255, 255)));
        assert!(!is_cgnat(Ipv4Addr::new(192, 168, 1, 1)));
    }

    #[test]
    fn tunnels_are_skipped() {
        assert!(is_vpn_interface("utun3", ip("10.0.0.2")));
        assert!(is_vpn_interface("wg0", ip("10.0.0.2")));
        assert!(is_vpn_interface("tailscale0", ip("fd7a::1")));
        assert!(is_vpn_interface("eth0", ip("100.100.1.1")));
        assert!(!is_vpn_interface("eth0", ip("192.168.1.20")));
        assert!(!is_vpn_interface("en0", ip("fe80::1")));
    }

    #[test]
    fn ipv4_is_preferred() {
        let addrs = [ip("fe80::1"), ip("2001:db8::1"), ip("192.168.1.20"), ip("10.0.0.1")];
        assert_eq!(pick_preferred(addrs.into_iter()), Some(ip("192.168.1.20")));
        assert_eq!(
            pick_preferred([ip("fe80::1"), ip("2001:db8::1")].into_iter()),
            Some(ip("fe80::1"))
        );
        assert_eq!(pick_preferred(std::iter::empty()), None);
    }
}

use std::collections::HashSet;
use std::net::Ipv4Addr;

use ipnet::Ipv4Net;

/// The cluster network has fewer free addresses than instances waiting
/// to launch.
#[derive(Debug, thiserror::Error)]
#[error("too few available addresses in {network}: wanted {wanted}, found {found}")]
pub struct InsufficientAddresses {
    pub network: Ipv4Net,
    pub wanted: usize,
    pub found: usize,
}

/// The next `count` free host addresses in `network`, in ascending
/// order.
///
/// The network and broadcast addresses are never handed out, and
/// anything in `occupied` is skipped. All-or-nothing: if the range runs
/// out first, no partial allocation is returned. Identical inputs yield
/// the identical ordered result.
pub fn allocate(
    count: usize,
    network: Ipv4Net,
    occupied: &HashSet<Ipv4Addr>,
) -> Result<Vec<Ipv4Addr>, InsufficientAddresses> {
    let mut ips = Vec::with_capacity(count);

    if count == 0 {
        return Ok(ips);
    }

    for ip in network.hosts() {
        if occupied.contains(&ip) {
            continue;
        }

        ips.push(ip);

        if ips.len() == count {
            return Ok(ips);
        }
    }

    Err(InsufficientAddresses {
        network,
        wanted: count,
        found: ips.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net(s: &str) -> Ipv4Net {
        s.parse().unwrap()
    }

    fn ip(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    #[test]
    fn allocates_in_ascending_order() {
        let occupied = HashSet::from([ip("192.168.1.1"), ip("192.168.1.2")]);

        let ips = allocate(3, net("192.168.1.0/29"), &occupied).unwrap();

        assert_eq!(
            ips,
            vec![ip("192.168.1.3"), ip("192.168.1.4"), ip("192.168.1.5")]
        );
    }

    #[test]
    fn fails_without_partial_result_when_exhausted() {
        let occupied = HashSet::from([
            ip("192.168.1.1"),
            ip("192.168.1.2"),
            ip("192.168.1.3"),
            ip("192.168.1.4"),
        ]);

        let err = allocate(5, net("192.168.1.0/29"), &occupied).unwrap_err();

        assert_eq!(err.wanted, 5);
        assert_eq!(err.found, 2);
    }

    #[test]
    fn skips_network_and_broadcast_addresses() {
        let ips = allocate(6, net("192.168.1.0/29"), &HashSet::new()).unwrap();

        assert_eq!(ips.first(), Some(&ip("192.168.1.1")));
        assert_eq!(ips.last(), Some(&ip("192.168.1.6")));
        assert!(allocate(7, net("192.168.1.0/29"), &HashSet::new()).is_err());
    }

    #[test]
    fn is_deterministic() {
        let occupied = HashSet::from([ip("10.96.17.4"), ip("10.96.17.1")]);

        let first = allocate(8, net("10.96.17.0/24"), &occupied).unwrap();
        let second = allocate(8, net("10.96.17.0/24"), &occupied).unwrap();

        assert_eq!(first, second);
        assert_eq!(first.len(), 8);
        for window in first.windows(2) {
            assert!(window[0] < window[1]);
        }
    }

    #[test]
    fn ignores_occupied_addresses_outside_the_network() {
        let occupied = HashSet::from([ip("10.0.0.1")]);

        let ips = allocate(1, net("192.168.1.0/29"), &occupied).unwrap();

        assert_eq!(ips, vec![ip("192.168.1.1")]);
    }

    #[test]
    fn zero_count_allocates_nothing() {
        let ips = allocate(0, net("192.168.1.0/29"), &HashSet::new()).unwrap();
        assert!(ips.is_empty());
    }
}

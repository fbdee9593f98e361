//! Inner-IP to peer map
//!
//! Longest-prefix match over the registered allowed-IP CIDRs, used by the
//! egress path to pick the peer a plaintext packet belongs to.

use std::net::IpAddr;

use ipnet::IpNet;

use crate::protocol::peer::PeerHandle;

#[derive(Debug, Default)]
pub struct IpToPeerMap {
    /// Kept sorted by descending prefix length so the first match wins
    entries: Vec<(IpNet, PeerHandle)>,
}

impl IpToPeerMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, net: IpNet, peer: PeerHandle) {
        // Replace an identical CIDR rather than shadowing it
        if let Some(entry) = self.entries.iter_mut().find(|(n, _)| *n == net) {
            entry.1 = peer;
            return;
        }
        let at = self
            .entries
            .partition_point(|(n, _)| n.prefix_len() >= net.prefix_len());
        self.entries.insert(at, (net, peer));
    }

    pub fn lookup(&self, ip: IpAddr) -> Option<PeerHandle> {
        self.entries
            .iter()
            .find(|(net, _)| net.contains(&ip))
            .map(|(_, peer)| *peer)
    }

    pub fn remove_peer(&mut self, peer: PeerHandle) {
        self.entries.retain(|(_, p)| *p != peer);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net(s: &str) -> IpNet {
        s.parse().unwrap()
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn longest_prefix_wins() {
        let mut map = IpToPeerMap::new();
        map.insert(net("10.0.0.0/8"), PeerHandle(0));
        map.insert(net("10.1.0.0/16"), PeerHandle(1));
        map.insert(net("10.1.2.0/24"), PeerHandle(2));

        assert_eq!(map.lookup(ip("10.1.2.3")), Some(PeerHandle(2)));
        assert_eq!(map.lookup(ip("10.1.9.9")), Some(PeerHandle(1)));
        assert_eq!(map.lookup(ip("10.9.9.9")), Some(PeerHandle(0)));
        assert_eq!(map.lookup(ip("192.168.0.1")), None);
    }

    #[test]
    fn default_route_catches_all() {
        let mut map = IpToPeerMap::new();
        map.insert(net("0.0.0.0/0"), PeerHandle(7));
        map.insert(net("172.16.0.0/12"), PeerHandle(8));

        assert_eq!(map.lookup(ip("8.8.8.8")), Some(PeerHandle(7)));
        assert_eq!(map.lookup(ip("172.16.5.5")), Some(PeerHandle(8)));
    }

    #[test]
    fn replace_same_cidr() {
        let mut map = IpToPeerMap::new();
        map.insert(net("10.0.0.0/24"), PeerHandle(1));
        map.insert(net("10.0.0.0/24"), PeerHandle(2));
        assert_eq!(map.lookup(ip("10.0.0.5")), Some(PeerHandle(2)));
    }

    #[test]
    fn remove_peer_drops_routes() {
        let mut map = IpToPeerMap::new();
        map.insert(net("10.0.0.0/24"), PeerHandle(1));
        map.insert(net("10.0.1.0/24"), PeerHandle(1));
        map.remove_peer(PeerHandle(1));
        assert!(map.is_empty());
    }

    #[test]
    fn ipv6_prefixes() {
        let mut map = IpToPeerMap::new();
        map.insert(net("fd00::/8"), PeerHandle(3));
        map.insert(net("fd00:1::/32"), PeerHandle(4));
        assert_eq!(map.lookup(ip("fd00:1::5")), Some(PeerHandle(4)));
        assert_eq!(map.lookup(ip("fdff::1")), Some(PeerHandle(3)));
    }
}

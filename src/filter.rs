use std::{
    collections::HashSet,
    net::{IpAddr, SocketAddr},
    sync::{PoisonError, RwLock},
};

/// AddressFilter holds the whitelist of client addresses allowed to open a
/// tunnel. An empty whitelist admits everyone.
///
/// Entries that parse as IP addresses are stored in canonical form, so
/// `::ffff:10.0.0.5` and `10.0.0.5` are the same entry. Anything else is
/// kept verbatim and only matches a peer with the identical textual address.
#[derive(Debug, Default)]
pub struct AddressFilter {
    hosts: RwLock<HashSet<String>>,
}

impl AddressFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// allow reports whether a peer may open a tunnel
    pub fn allow(&self, peer: &SocketAddr) -> bool {
        let hosts = self.hosts.read().unwrap_or_else(PoisonError::into_inner);
        if hosts.is_empty() {
            return true;
        }
        hosts.contains(&peer.ip().to_canonical().to_string())
    }

    /// add inserts each address once, duplicates and blank entries are ignored
    pub fn add<I, S>(&self, addresses: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut hosts = self.hosts.write().unwrap_or_else(PoisonError::into_inner);
        for address in addresses {
            if let Some(entry) = normalize(address.as_ref()) {
                hosts.insert(entry);
            }
        }
    }

    /// clear empties the whitelist, reverting to allow-all
    pub fn clear(&self) {
        self.hosts
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn contains(&self, address: &str) -> bool {
        normalize(address).is_some_and(|entry| {
            self.hosts
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .contains(&entry)
        })
    }

    pub fn len(&self) -> usize {
        self.hosts.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn normalize(address: &str) -> Option<String> {
    let address = address.trim();
    if address.is_empty() {
        return None;
    }
    match address.parse::<IpAddr>() {
        Ok(ip) => Some(ip.to_canonical().to_string()),
        Err(_) => Some(address.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn peer(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn empty_filter_allows_everyone() {
        let filter = AddressFilter::new();
        assert!(filter.is_empty());
        assert!(filter.allow(&peer("127.0.0.1:5555")));
        assert!(filter.allow(&peer("[::1]:5555")));
    }

    #[test]
    fn non_empty_filter_allows_exact_matches_only() {
        let filter = AddressFilter::new();
        filter.add(["10.0.0.5"]);

        assert!(filter.allow(&peer("10.0.0.5:40000")));
        assert!(!filter.allow(&peer("127.0.0.1:40000")));
        // No prefix or subnet matching
        assert!(!filter.allow(&peer("10.0.0.50:40000")));
    }

    #[test]
    fn add_is_idempotent() {
        let filter = AddressFilter::new();
        filter.add(["10.0.0.5", "10.0.0.5", " 10.0.0.5 ", ""]);
        assert_eq!(filter.len(), 1);

        filter.add(vec!["10.0.0.6".to_string()]);
        assert_eq!(filter.len(), 2);
        assert!(filter.contains("10.0.0.6"));
    }

    #[test]
    fn clear_restores_allow_all() {
        let filter = AddressFilter::new();
        filter.add(["10.0.0.5"]);
        assert!(!filter.allow(&peer("127.0.0.1:1")));

        filter.clear();
        assert!(filter.is_empty());
        assert!(filter.allow(&peer("127.0.0.1:1")));
    }

    #[test]
    fn ipv4_mapped_peers_match_ipv4_entries() {
        let filter = AddressFilter::new();
        filter.add(["127.0.0.1"]);
        assert!(filter.allow(&peer("[::ffff:127.0.0.1]:9000")));

        let filter = AddressFilter::new();
        filter.add(["::ffff:10.0.0.5"]);
        assert!(filter.contains("10.0.0.5"));
        assert!(filter.allow(&peer("10.0.0.5:1")));
    }

    #[test]
    fn ipv6_entries_are_canonicalized() {
        let filter = AddressFilter::new();
        filter.add(["0:0:0:0:0:0:0:1"]);
        assert!(filter.allow(&peer("[::1]:8080")));
    }

    #[test]
    fn hostnames_never_match_peer_ips() {
        let filter = AddressFilter::new();
        filter.add(["localhost"]);
        assert!(!filter.allow(&peer("127.0.0.1:8080")));
    }

    #[test]
    fn concurrent_reads_and_writes_do_not_corrupt() {
        let filter = Arc::new(AddressFilter::new());
        let handles: Vec<_> = (0..8u8)
            .map(|i| {
                let filter = Arc::clone(&filter);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        filter.add([format!("10.0.0.{i}")]);
                        filter.allow(&peer("10.0.0.1:1"));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(filter.len(), 8);
    }
}

// ipdb.rs - IP address database
//
// The address-option handler draws a (local, peer) pair from here on its
// first Configure-Request and hands the pair back on teardown. The backing
// store is pluggable; this module ships a contiguous-range pool and a
// per-session source that prefers a RADIUS-assigned address.

use std::collections::VecDeque;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};

#[cfg(test)]
use mockall::automock;
use uuid::Uuid;

/// Source of leased peer addresses
#[cfg_attr(test, automock)]
pub trait IpPool: Send + Sync {
    /// Lease a (local, peer) pair for the session, or None when exhausted
    fn get(&self, session: Uuid) -> Option<(Ipv4Addr, Ipv4Addr)>;

    /// Return a pair previously obtained from `get`
    fn put(&self, session: Uuid, local: Ipv4Addr, peer: Ipv4Addr);
}

/// A pool handing out peer addresses from an inclusive range, all paired
/// with one gateway address on our side.
pub struct RangePool {
    gateway: Ipv4Addr,
    free: Mutex<VecDeque<Ipv4Addr>>,
}

impl RangePool {
    pub fn new(gateway: Ipv4Addr, first: Ipv4Addr, last: Ipv4Addr) -> Self {
        let free = (u32::from(first)..=u32::from(last))
            .map(Ipv4Addr::from)
            .collect();
        Self {
            gateway,
            free: Mutex::new(free),
        }
    }

    /// Addresses currently available
    pub fn available(&self) -> usize {
        self.free.lock().unwrap().len()
    }
}

impl IpPool for RangePool {
    fn get(&self, session: Uuid) -> Option<(Ipv4Addr, Ipv4Addr)> {
        let peer = self.free.lock().unwrap().pop_front();
        match peer {
            Some(peer) => {
                tracing::debug!(%session, %peer, "ip lease");
                Some((self.gateway, peer))
            }
            None => None,
        }
    }

    fn put(&self, session: Uuid, _local: Ipv4Addr, peer: Ipv4Addr) {
        tracing::debug!(%session, %peer, "ip release");
        self.free.lock().unwrap().push_back(peer);
    }
}

/// Per-session source layering a RADIUS-assigned Framed-IP-Address over a
/// shared pool. When the authentication reply pinned an address, `get`
/// serves it without touching the pool; otherwise the pool is consulted and
/// the eventual `put` is forwarded there.
pub struct SessionIpSource {
    framed: Option<Ipv4Addr>,
    gateway: Ipv4Addr,
    pool: Arc<dyn IpPool>,
}

impl SessionIpSource {
    pub fn new(pool: Arc<dyn IpPool>, gateway: Ipv4Addr, framed: Option<Ipv4Addr>) -> Self {
        Self {
            framed,
            gateway,
            pool,
        }
    }
}

impl IpPool for SessionIpSource {
    fn get(&self, session: Uuid) -> Option<(Ipv4Addr, Ipv4Addr)> {
        match self.framed {
            Some(peer) => Some((self.gateway, peer)),
            None => self.pool.get(session),
        }
    }

    fn put(&self, session: Uuid, local: Ipv4Addr, peer: Ipv4Addr) {
        if self.framed.is_some() {
            // Pinned address was never the pool's to reclaim.
            return;
        }
        self.pool.put(session, local, peer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_pool_leases_in_order_and_recycles() {
        let pool = RangePool::new(
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(10, 0, 0, 2),
            Ipv4Addr::new(10, 0, 0, 4),
        );
        let session = Uuid::new_v4();
        assert_eq!(pool.available(), 3);

        let (local, peer) = pool.get(session).unwrap();
        assert_eq!(local, Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(peer, Ipv4Addr::new(10, 0, 0, 2));

        pool.get(session).unwrap();
        pool.get(session).unwrap();
        assert!(pool.get(session).is_none());

        pool.put(session, local, peer);
        assert_eq!(pool.get(session).unwrap().1, peer);
    }

    #[test]
    fn single_address_range_is_usable() {
        let pool = RangePool::new(
            Ipv4Addr::new(192, 168, 0, 1),
            Ipv4Addr::new(192, 168, 0, 9),
            Ipv4Addr::new(192, 168, 0, 9),
        );
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn framed_address_bypasses_pool() {
        let pool = Arc::new(RangePool::new(
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(10, 0, 0, 2),
            Ipv4Addr::new(10, 0, 0, 2),
        ));
        let source = SessionIpSource::new(
            pool.clone(),
            Ipv4Addr::new(10, 0, 0, 1),
            Some(Ipv4Addr::new(172, 16, 0, 5)),
        );
        let session = Uuid::new_v4();

        let (local, peer) = source.get(session).unwrap();
        assert_eq!(local, Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(peer, Ipv4Addr::new(172, 16, 0, 5));
        assert_eq!(pool.available(), 1);

        source.put(session, local, peer);
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn without_framed_address_the_pool_serves() {
        let pool = Arc::new(RangePool::new(
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(10, 0, 0, 2),
            Ipv4Addr::new(10, 0, 0, 2),
        ));
        let source = SessionIpSource::new(pool.clone(), Ipv4Addr::new(10, 0, 0, 1), None);
        let session = Uuid::new_v4();

        let (local, peer) = source.get(session).unwrap();
        assert_eq!(pool.available(), 0);
        source.put(session, local, peer);
        assert_eq!(pool.available(), 1);
    }
}

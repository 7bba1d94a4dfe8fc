//! NAT flow table mapping public-side endpoints back to tunneled sources.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Key identifying a NAT flow: the remote endpoint as seen from the public
/// side, i.e. the destination of the outbound packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub remote_addr: IpAddr,
    pub remote_port: u16,
}

/// Value recorded per flow: the tunneled peer's real source address,
/// restored into the destination field of returning packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowValue {
    pub original_src: IpAddr,
}

#[derive(Debug, Clone, Copy)]
struct FlowEntry {
    value: FlowValue,
    last_seen: Instant,
}

#[derive(Debug)]
struct Inner {
    map: HashMap<FlowKey, FlowEntry>,
    last_prune: Instant,
}

/// Lock-protected NAT table shared by the outbound write path and the
/// inbound receive callback.
///
/// Entries are inserted only on outbound traffic and looked up on inbound;
/// a miss means the packet is dropped. Two tunneled peers reaching the same
/// remote endpoint alias to a single entry and the later insert wins.
///
/// An optional idle TTL bounds table growth: expired entries are never
/// returned by [`FlowTable::lookup`] and are pruned opportunistically on
/// insert. Lookups refresh the entry's last-use time.
#[derive(Debug)]
pub struct FlowTable {
    inner: Mutex<Inner>,
    idle_ttl: Option<Duration>,
}

impl FlowTable {
    /// Table without eviction (entries live until [`FlowTable::clear`]).
    pub fn new() -> Self {
        Self::with_ttl(None)
    }

    /// Table whose entries expire after `idle_ttl` without traffic.
    pub fn with_idle_ttl(idle_ttl: Duration) -> Self {
        Self::with_ttl(Some(idle_ttl))
    }

    fn with_ttl(idle_ttl: Option<Duration>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                map: HashMap::new(),
                last_prune: Instant::now(),
            }),
            idle_ttl,
        }
    }

    /// Insert or overwrite the entry for `key`.
    pub fn insert(&self, key: FlowKey, value: FlowValue) {
        let now = Instant::now();
        let mut inner = self.inner.lock().expect("flow table lock poisoned");
        if let Some(ttl) = self.idle_ttl {
            if now.duration_since(inner.last_prune) >= ttl {
                inner.map.retain(|_, e| now.duration_since(e.last_seen) < ttl);
                inner.last_prune = now;
            }
        }
        inner.map.insert(
            key,
            FlowEntry {
                value,
                last_seen: now,
            },
        );
    }

    /// Look up the flow for `key`, refreshing its idle timer on hit.
    pub fn lookup(&self, key: &FlowKey) -> Option<FlowValue> {
        let now = Instant::now();
        let mut inner = self.inner.lock().expect("flow table lock poisoned");
        let expired = match inner.map.get(key) {
            None => return None,
            Some(entry) => self
                .idle_ttl
                .is_some_and(|ttl| now.duration_since(entry.last_seen) >= ttl),
        };
        if expired {
            inner.map.remove(key);
            return None;
        }
        let entry = inner.map.get_mut(key)?;
        entry.last_seen = now;
        Some(entry.value)
    }

    /// Drop every entry.
    pub fn clear(&self) {
        self.inner
            .lock()
            .expect("flow table lock poisoned")
            .map
            .clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("flow table lock poisoned").map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for FlowTable {
    fn default() -> Self {
        Self::new()
    }
}

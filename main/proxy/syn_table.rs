//! The SYN table: a capacity-bounded concurrent index of all live
//! descriptors, keyed by client address and port.
//!
//! An insertion-ordered map stands in for an intrusive connection list:
//! iteration during a sweep or status dump is cheap and stable without
//! per-entry link nodes.

use std::fmt;
use std::sync::{Arc, RwLock};

use indexmap::IndexMap;

use crate::proxy::{ConnKey, Proxy};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertError {
    /// An entry for this key already exists (a duplicate SYN).
    Duplicate,
    /// The table is at its configured connection limit.
    Full,
}

impl fmt::Display for InsertError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InsertError::Duplicate => write!(f, "connection already tracked"),
            InsertError::Full => write!(f, "connection table full"),
        }
    }
}

impl std::error::Error for InsertError {}

pub struct SynTable {
    conns: RwLock<IndexMap<ConnKey, Arc<Proxy>>>,
    capacity: usize,
}

impl SynTable {
    pub fn new(capacity: usize) -> SynTable {
        SynTable {
            conns: RwLock::new(IndexMap::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.conns.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Record a descriptor under its client key. Rejects duplicates (the
    /// existing entry always wins) and respects the connection limit.
    pub fn insert(&self, proxy: &Arc<Proxy>) -> Result<(), InsertError> {
        let mut conns = self.conns.write().unwrap();
        if conns.contains_key(&proxy.key()) {
            return Err(InsertError::Duplicate);
        }
        if conns.len() >= self.capacity {
            return Err(InsertError::Full);
        }
        conns.insert(proxy.key(), Arc::clone(proxy));
        Ok(())
    }

    /// Look up by client key. The returned clone is the caller's pin.
    pub fn find(&self, key: &ConnKey) -> Option<Arc<Proxy>> {
        self.conns.read().unwrap().get(key).cloned()
    }

    /// Remove a descriptor's entry. Idempotent, and a no-op if the key has
    /// since been taken over by a different descriptor: only the exact
    /// allocation passed in is ever evicted.
    pub fn remove(&self, proxy: &Arc<Proxy>) {
        let mut conns = self.conns.write().unwrap();
        if let Some(current) = conns.get(&proxy.key()) {
            if Arc::ptr_eq(current, proxy) {
                let _ = conns.swap_remove(&proxy.key());
            }
        }
    }

    /// Visit every live descriptor under the read lock. Order is stable
    /// for the duration of the visit.
    pub fn for_each<F: FnMut(&Arc<Proxy>)>(&self, mut f: F) {
        let conns = self.conns.read().unwrap();
        for proxy in conns.values() {
            f(proxy);
        }
    }

    /// Pinned copies of every live descriptor, for sweeps that must not
    /// hold the table lock while acting on entries.
    pub fn snapshot(&self) -> Vec<Arc<Proxy>> {
        self.conns.read().unwrap().values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::ProxyStatus;
    use std::net::Ipv4Addr;

    fn key(n: u8) -> ConnKey {
        ConnKey {
            addr: Ipv4Addr::new(10, 1, 1, n),
            port: 30000 + n as u16,
        }
    }

    fn origin() -> ConnKey {
        ConnKey {
            addr: Ipv4Addr::new(203, 0, 113, 9),
            port: 443,
        }
    }

    fn pending(n: u8) -> Arc<Proxy> {
        let proxy = Proxy::new(key(n), origin());
        proxy.set_status(ProxyStatus::Pending);
        proxy
    }

    #[test]
    fn insert_and_find() {
        let table = SynTable::new(4);
        let proxy = pending(1);
        table.insert(&proxy).unwrap();

        let found = table.find(&key(1)).unwrap();
        assert!(Arc::ptr_eq(&found, &proxy));
        assert!(table.find(&key(2)).is_none());
    }

    #[test]
    fn duplicate_syn_is_rejected() {
        let table = SynTable::new(4);
        let first = pending(1);
        let second = pending(1);

        table.insert(&first).unwrap();
        assert_eq!(table.insert(&second), Err(InsertError::Duplicate));

        // exactly one entry, and it is the first one
        assert_eq!(table.len(), 1);
        assert!(Arc::ptr_eq(&table.find(&key(1)).unwrap(), &first));
    }

    #[test]
    fn capacity_is_enforced() {
        let table = SynTable::new(2);
        table.insert(&pending(1)).unwrap();
        table.insert(&pending(2)).unwrap();
        assert_eq!(table.insert(&pending(3)), Err(InsertError::Full));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn remove_is_idempotent() {
        let table = SynTable::new(4);
        let proxy = pending(1);
        table.insert(&proxy).unwrap();

        table.remove(&proxy);
        assert_eq!(table.len(), 0);
        table.remove(&proxy);
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn remove_spares_a_newer_entry_under_the_same_key() {
        let table = SynTable::new(4);
        let stale = pending(1);
        let fresh = pending(1);

        table.insert(&stale).unwrap();
        table.remove(&stale);
        table.insert(&fresh).unwrap();

        // a late remove of the stale descriptor must not evict the fresh one
        table.remove(&stale);
        assert!(Arc::ptr_eq(&table.find(&key(1)).unwrap(), &fresh));
    }

    #[test]
    fn iteration_is_ordered_and_complete() {
        let table = SynTable::new(8);
        for n in 1..=5 {
            table.insert(&pending(n)).unwrap();
        }

        let mut seen = Vec::new();
        table.for_each(|p| seen.push(p.key()));
        assert_eq!(seen, (1..=5).map(key).collect::<Vec<_>>());

        let snap = table.snapshot();
        assert_eq!(snap.len(), 5);
    }
}

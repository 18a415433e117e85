//! Process wide bookkeeping of peer connections.
use hashbrown::HashSet;

use crate::peer::{ConnId, PeerId};

pub const DEFAULT_MAX_CONNECTIONS: usize = 250;

/// Caps the number of open connections across every torrent and owns the
/// local peer id.
#[derive(Debug, Clone)]
pub struct ConnectionManager {
    max_connections: usize,
    active: HashSet<ConnId>,
    peer_id: PeerId,
    next_id: ConnId,
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CONNECTIONS, PeerId::generate())
    }
}

impl ConnectionManager {
    pub fn new(max_connections: usize, peer_id: PeerId) -> Self {
        Self { max_connections, active: HashSet::new(), peer_id, next_id: 0 }
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    pub fn set_max_connections(&mut self, max: usize) {
        self.max_connections = max;
    }

    pub fn can_add_connection(&self) -> bool {
        self.active.len() < self.max_connections
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    /// A fresh connection id, never reused by this process.
    pub fn next_id(&mut self) -> ConnId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub fn add_connection(&mut self, id: ConnId) {
        self.active.insert(id);
    }

    pub fn remove_connection(&mut self, id: ConnId) {
        self.active.remove(&id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cap_is_enforced_by_callers() {
        let mut cm = ConnectionManager::new(2, PeerId([1; 20]));
        let a = cm.next_id();
        let b = cm.next_id();
        assert_ne!(a, b);

        cm.add_connection(a);
        assert!(cm.can_add_connection());

        cm.add_connection(b);
        assert!(!cm.can_add_connection());

        cm.remove_connection(a);
        cm.remove_connection(a);
        assert_eq!(cm.len(), 1);
        assert!(cm.can_add_connection());

        cm.set_max_connections(0);
        assert!(!cm.can_add_connection());
    }
}

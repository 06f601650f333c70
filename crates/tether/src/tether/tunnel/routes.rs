use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;

use crate::tether::tunnel::peer::PeerConn;

#[derive(Debug, Clone, Serialize)]
pub struct RouteSnapshot {
    pub identity: String,
    pub conn_id: u64,
    pub remote: String,
    pub opened_at_unix_ms: u64,
}

/// Identity -> live peer connection, shared by every task of one role.
///
/// Updates touch a single identity at a time. Any handle that leaves the table is closed in the
/// same step, so a connection is never orphaned: a replaced entry is closed by `insert`, a
/// removed one by `remove`, everything by `clear`.
#[derive(Debug, Default)]
pub struct RouteTable {
    conns: DashMap<String, Arc<PeerConn>>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self {
            conns: DashMap::new(),
        }
    }

    /// Insert or replace the entry for `conn.identity()`. The superseded handle, if any, is closed.
    pub fn insert(&self, conn: Arc<PeerConn>) {
        let prev = self.conns.insert(conn.identity().to_string(), conn.clone());
        if let Some(prev) = prev {
            if prev.id() != conn.id() {
                tracing::debug!(identity = %conn.identity(), "tunnel: route replaced");
                prev.close();
            }
        }
    }

    pub fn get(&self, identity: &str) -> Option<Arc<PeerConn>> {
        self.conns.get(identity).map(|e| e.value().clone())
    }

    /// Remove and close the entry for `identity`, but only if it still belongs to connection
    /// `conn_id`. Returns whether this call retired it.
    pub fn remove(&self, identity: &str, conn_id: u64) -> bool {
        match self.conns.remove_if(identity, |_, c| c.id() == conn_id) {
            Some((_, conn)) => {
                conn.close();
                true
            }
            None => false,
        }
    }

    /// Remove and close every entry.
    pub fn clear(&self) -> usize {
        let keys: Vec<String> = self.conns.iter().map(|e| e.key().clone()).collect();
        let mut n = 0;
        for k in keys {
            if let Some((_, conn)) = self.conns.remove(&k) {
                conn.close();
                n += 1;
            }
        }
        n
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    pub fn snapshot(&self) -> Vec<RouteSnapshot> {
        let mut out: Vec<RouteSnapshot> = self
            .conns
            .iter()
            .map(|e| RouteSnapshot {
                identity: e.key().clone(),
                conn_id: e.value().id(),
                remote: e
                    .value()
                    .remote()
                    .map(|a| a.to_string())
                    .unwrap_or_default(),
                opened_at_unix_ms: e.value().opened_at_unix_ms(),
            })
            .collect();
        out.sort_by(|a, b| a.opened_at_unix_ms.cmp(&b.opened_at_unix_ms));
        out
    }
}

pub type SharedRoutes = Arc<RouteTable>;

//! Node registry & routing (C11): the static `nodeId -> endpoint` table each
//! node loads at startup, plus the per-service round-robin cursor and the
//! advisory reachability tracking described in SPEC_FULL.md §4.11.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use protocol::{NodeId, ServiceId};

use crate::config::NodeEntry;
use crate::error::{NodeError, Result};

/// Consecutive send failures after which a node is marked unreachable.
const UNREACHABLE_AFTER_FAILURES: u32 = 3;

/// How to pick one node among the candidates registered for a service.
#[derive(Debug, Clone)]
pub enum SelectionPolicy {
    /// Rotate over reachable nodes of the service (default).
    RoundRobin,
    /// Address a specific node directly, bypassing selection.
    Fixed(NodeId),
}

#[derive(Debug)]
struct RegistryRecord {
    endpoint: String,
    reachable: std::sync::atomic::AtomicBool,
    consecutive_failures: AtomicU32,
}

impl RegistryRecord {
    fn new(endpoint: String) -> Self {
        Self {
            endpoint,
            reachable: std::sync::atomic::AtomicBool::new(true),
            consecutive_failures: AtomicU32::new(0),
        }
    }
}

/// Static node table loaded once at startup. Cheap to clone (all state is
/// behind `Arc`); every node process holds one instance describing its
/// peers (itself is not included).
#[derive(Clone)]
pub struct NodeRegistry {
    records: Arc<DashMap<NodeId, RegistryRecord>>,
    by_service: Arc<HashMap<ServiceId, Vec<NodeId>>>,
    cursors: Arc<DashMap<ServiceId, AtomicUsize>>,
}

impl NodeRegistry {
    /// Builds the registry from the configured static entries.
    #[must_use]
    pub fn from_entries(entries: &[NodeEntry]) -> Self {
        let records = Arc::new(DashMap::new());
        let mut by_service: HashMap<ServiceId, Vec<NodeId>> = HashMap::new();
        let cursors = Arc::new(DashMap::new());

        for entry in entries {
            let node_id = NodeId::new(entry.service_id.into(), entry.server_id.clone());
            records.insert(node_id.clone(), RegistryRecord::new(entry.endpoint.clone()));
            by_service
                .entry(node_id.service_id)
                .or_default()
                .push(node_id);
        }

        for service_id in by_service.keys() {
            cursors.insert(*service_id, AtomicUsize::new(0));
        }

        Self {
            records,
            by_service: Arc::new(by_service),
            cursors,
        }
    }

    /// Returns the transport endpoint registered for `node_id`, if any.
    #[must_use]
    pub fn endpoint_for(&self, node_id: &NodeId) -> Option<String> {
        self.records.get(node_id).map(|r| r.endpoint.clone())
    }

    #[must_use]
    pub fn is_reachable(&self, node_id: &NodeId) -> bool {
        self.records
            .get(node_id)
            .map(|r| r.reachable.load(Ordering::Relaxed))
            .unwrap_or(false)
    }

    /// Records the outcome of a send attempt to `node_id`, updating the
    /// advisory reachability state. `N` consecutive failures flips the node
    /// to unreachable; any success resets the counter and flips it back.
    pub fn record_send_result(&self, node_id: &NodeId, success: bool) {
        let Some(record) = self.records.get(node_id) else {
            return;
        };
        if success {
            record.consecutive_failures.store(0, Ordering::Relaxed);
            record.reachable.store(true, Ordering::Relaxed);
        } else {
            let failures = record.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
            if failures >= UNREACHABLE_AFTER_FAILURES {
                record.reachable.store(false, Ordering::Relaxed);
            }
        }
    }

    /// Selects one node for `service_id` according to `policy`.
    pub fn select(&self, service_id: ServiceId, policy: &SelectionPolicy) -> Result<NodeId> {
        match policy {
            SelectionPolicy::Fixed(node_id) => {
                if self.records.contains_key(node_id) {
                    Ok(node_id.clone())
                } else {
                    Err(NodeError::ServerNotFound(node_id.to_string()))
                }
            }
            SelectionPolicy::RoundRobin => self.round_robin(service_id),
        }
    }

    fn round_robin(&self, service_id: ServiceId) -> Result<NodeId> {
        let candidates = self
            .by_service
            .get(&service_id)
            .map(Vec::as_slice)
            .unwrap_or(&[]);
        if candidates.is_empty() {
            return Err(NodeError::ServerNotFound(format!("{service_id:?}")));
        }

        let cursor = self
            .cursors
            .entry(service_id)
            .or_insert_with(|| AtomicUsize::new(0));

        // Two passes: first prefer reachable nodes, falling back to every
        // node if none are currently marked reachable (advisory retry).
        for prefer_reachable in [true, false] {
            for _ in 0..candidates.len() {
                let idx = cursor.fetch_add(1, Ordering::Relaxed) % candidates.len();
                let candidate = &candidates[idx];
                if !prefer_reachable || self.is_reachable(candidate) {
                    return Ok(candidate.clone());
                }
            }
        }

        Err(NodeError::ServerNotFound(format!("{service_id:?}")))
    }

    #[must_use]
    pub fn nodes_for(&self, service_id: ServiceId) -> Vec<NodeId> {
        self.by_service.get(&service_id).cloned().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServiceKind;

    fn entries() -> Vec<NodeEntry> {
        vec![
            NodeEntry {
                service_id: ServiceKind::Api,
                server_id: "api-1".into(),
                endpoint: "127.0.0.1:9201".into(),
            },
            NodeEntry {
                service_id: ServiceKind::Api,
                server_id: "api-2".into(),
                endpoint: "127.0.0.1:9202".into(),
            },
        ]
    }

    #[test]
    fn round_robin_rotates_across_calls() {
        let registry = NodeRegistry::from_entries(&entries());
        let first = registry.select(ServiceId::Api, &SelectionPolicy::RoundRobin).unwrap();
        let second = registry.select(ServiceId::Api, &SelectionPolicy::RoundRobin).unwrap();
        assert_ne!(first, second);
        let third = registry.select(ServiceId::Api, &SelectionPolicy::RoundRobin).unwrap();
        assert_eq!(first, third);
    }

    #[test]
    fn unreachable_after_n_failures_is_skipped() {
        let registry = NodeRegistry::from_entries(&entries());
        let api1 = NodeId::new(ServiceId::Api, "api-1");

        for _ in 0..3 {
            registry.record_send_result(&api1, false);
        }
        assert!(!registry.is_reachable(&api1));

        for _ in 0..4 {
            let picked = registry.select(ServiceId::Api, &SelectionPolicy::RoundRobin).unwrap();
            assert_eq!(picked, NodeId::new(ServiceId::Api, "api-2"));
        }
    }

    #[test]
    fn recovers_to_reachable_on_success() {
        let registry = NodeRegistry::from_entries(&entries());
        let api1 = NodeId::new(ServiceId::Api, "api-1");
        registry.record_send_result(&api1, false);
        registry.record_send_result(&api1, false);
        registry.record_send_result(&api1, false);
        assert!(!registry.is_reachable(&api1));
        registry.record_send_result(&api1, true);
        assert!(registry.is_reachable(&api1));
    }

    #[test]
    fn fixed_policy_fails_for_unknown_node() {
        let registry = NodeRegistry::from_entries(&entries());
        let unknown = NodeId::new(ServiceId::Play, "play-9");
        assert!(registry.select(ServiceId::Play, &SelectionPolicy::Fixed(unknown)).is_err());
    }

    #[test]
    fn falls_back_to_unreachable_nodes_when_all_unreachable() {
        let registry = NodeRegistry::from_entries(&entries());
        for server_id in ["api-1", "api-2"] {
            let id = NodeId::new(ServiceId::Api, server_id);
            for _ in 0..3 {
                registry.record_send_result(&id, false);
            }
        }
        // All unreachable, but the registry still returns a candidate.
        assert!(registry.select(ServiceId::Api, &SelectionPolicy::RoundRobin).is_ok());
    }
}

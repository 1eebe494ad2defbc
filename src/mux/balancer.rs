use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::mux::endpoint::MuxEndpoint;

struct WeightedEndpoint {
    endpoint: Arc<MuxEndpoint>,
    weight: i32,
    current: i32,
}

/// Ordered weighted round-robin over live endpoints.
///
/// Uses the smooth interleaving scheme: every pick advances each endpoint by
/// its weight and selects the largest accumulator. With equal weights this
/// degenerates to strict round-robin in insertion order; ties always resolve
/// to the earlier-inserted endpoint. All mutations are atomic with respect
/// to `next_endpoint` and `endpoints` snapshots.
#[derive(Default)]
pub struct RoundRobin {
    entries: RwLock<Vec<WeightedEndpoint>>,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts the endpoint, or replaces it in place when the id is already
    /// a member (an URL change keeps the endpoint's rotation slot).
    pub fn upsert_endpoint(&self, endpoint: Arc<MuxEndpoint>) {
        self.upsert_endpoint_with_weight(endpoint, 1)
    }

    pub fn upsert_endpoint_with_weight(&self, endpoint: Arc<MuxEndpoint>, weight: i32) {
        let weight = weight.max(1);
        let mut entries = self.entries.write();
        if let Some(existing) = entries.iter_mut().find(|e| e.endpoint.id() == endpoint.id()) {
            existing.endpoint = endpoint;
            existing.weight = weight;
        } else {
            debug!(endpoint = %endpoint.id(), weight, "adding endpoint to rotation");
            entries.push(WeightedEndpoint {
                endpoint,
                weight,
                current: 0,
            });
        }
    }

    pub fn remove_endpoint(&self, id: &str) -> bool {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|e| e.endpoint.id() != id);
        entries.len() != before
    }

    /// Next endpoint in rotation, or None when the pool is empty. The empty
    /// case is distinct from transport failures: it maps to an immediate
    /// 502 with no attempt made.
    pub fn next_endpoint(&self) -> Option<Arc<MuxEndpoint>> {
        let mut entries = self.entries.write();
        if entries.is_empty() {
            return None;
        }
        let total: i32 = entries.iter().map(|e| e.weight).sum();
        let mut best = 0;
        for i in 0..entries.len() {
            entries[i].current += entries[i].weight;
            if entries[i].current > entries[best].current {
                best = i;
            }
        }
        entries[best].current -= total;
        Some(entries[best].endpoint.clone())
    }

    /// Consistent snapshot of the current membership, in insertion order.
    pub fn endpoints(&self) -> Vec<Arc<MuxEndpoint>> {
        self.entries
            .read()
            .iter()
            .map(|e| e.endpoint.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Endpoint;
    use crate::stats::PerfMonitor;

    fn endpoint(id: &str, url: &str) -> Arc<MuxEndpoint> {
        Arc::new(MuxEndpoint::new(&Endpoint::new(id, url), PerfMonitor::new()).unwrap())
    }

    fn pick_ids(rr: &RoundRobin, n: usize) -> Vec<String> {
        (0..n)
            .map(|_| rr.next_endpoint().unwrap().id().to_string())
            .collect()
    }

    #[test]
    fn empty_pool_reports_none() {
        let rr = RoundRobin::new();
        assert!(rr.next_endpoint().is_none());
    }

    #[test]
    fn equal_weights_rotate_in_insertion_order() {
        let rr = RoundRobin::new();
        rr.upsert_endpoint(endpoint("a", "http://localhost:5000"));
        rr.upsert_endpoint(endpoint("b", "http://localhost:5001"));
        rr.upsert_endpoint(endpoint("c", "http://localhost:5002"));

        assert_eq!(pick_ids(&rr, 6), vec!["a", "b", "c", "a", "b", "c"]);
    }

    #[test]
    fn weights_shape_the_rotation() {
        let rr = RoundRobin::new();
        rr.upsert_endpoint_with_weight(endpoint("heavy", "http://localhost:5000"), 3);
        rr.upsert_endpoint_with_weight(endpoint("light", "http://localhost:5001"), 1);

        let picks = pick_ids(&rr, 8);
        let heavy = picks.iter().filter(|id| *id == "heavy").count();
        assert_eq!(heavy, 6);
    }

    #[test]
    fn upsert_replaces_url_in_place() {
        let rr = RoundRobin::new();
        rr.upsert_endpoint(endpoint("a", "http://localhost:5000"));
        rr.upsert_endpoint(endpoint("b", "http://localhost:5001"));
        rr.upsert_endpoint(endpoint("a", "http://localhost:7000"));

        assert_eq!(rr.len(), 2);
        let urls: Vec<_> = rr
            .endpoints()
            .iter()
            .map(|e| e.url().as_str().to_string())
            .collect();
        assert!(urls.contains(&"http://localhost:7000/".to_string()));
    }

    #[test]
    fn remove_shrinks_rotation() {
        let rr = RoundRobin::new();
        rr.upsert_endpoint(endpoint("a", "http://localhost:5000"));
        rr.upsert_endpoint(endpoint("b", "http://localhost:5001"));

        assert!(rr.remove_endpoint("a"));
        assert!(!rr.remove_endpoint("a"));
        assert_eq!(pick_ids(&rr, 2), vec!["b", "b"]);
    }
}

//! Ordered buffer for connectivity candidates that arrive before their transport exists.

use std::collections::HashMap;

use crate::identity::PeerId;
use crate::signaling::IceCandidate;

#[derive(Default)]
pub struct CandidateQueue {
    pending: HashMap<PeerId, Vec<IceCandidate>>,
}

impl CandidateQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer a candidate behind any earlier ones for the same peer. Exact duplicates
    /// (signaling may redeliver) are kept once.
    pub fn push(&mut self, peer_id: &PeerId, candidate: IceCandidate) {
        let queue = self.pending.entry(peer_id.clone()).or_default();
        if !queue.contains(&candidate) {
            queue.push(candidate);
        }
    }

    /// Remove and return the peer's candidates in arrival order.
    pub fn take(&mut self, peer_id: &PeerId) -> Vec<IceCandidate> {
        self.pending.remove(peer_id).unwrap_or_default()
    }

    pub fn len(&self, peer_id: &PeerId) -> usize {
        self.pending.get(peer_id).map(Vec::len).unwrap_or(0)
    }

    pub fn clear(&mut self, peer_id: &PeerId) {
        self.pending.remove(peer_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_preserves_arrival_order() {
        let mut q = CandidateQueue::new();
        let p = PeerId::from("p");
        for i in 0..5 {
            q.push(&p, IceCandidate::new(format!("c{}", i)));
        }
        let out: Vec<String> = q.take(&p).into_iter().map(|c| c.candidate).collect();
        assert_eq!(out, vec!["c0", "c1", "c2", "c3", "c4"]);
        assert_eq!(q.len(&p), 0);
    }

    #[test]
    fn duplicates_collapse_per_peer() {
        let mut q = CandidateQueue::new();
        let a = PeerId::from("a");
        let b = PeerId::from("b");
        q.push(&a, IceCandidate::new("x"));
        q.push(&a, IceCandidate::new("x"));
        q.push(&b, IceCandidate::new("x"));
        assert_eq!(q.len(&a), 1);
        assert_eq!(q.len(&b), 1);
    }
}

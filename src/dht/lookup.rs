//! Bookkeeping of an iterative Kademlia lookup, kept free of sockets so
//! the algorithm itself is testable: the node task drives a `LookupState`
//! with real UDP round trips.

use std::{
    collections::HashSet,
    net::SocketAddr,
};

use super::routing::NodeId;

/// A lookup candidate: a node we may query.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Candidate {
    pub id: NodeId,
    pub addr: SocketAddr,
}

/// The evolving state of one iterative lookup.
pub(crate) struct LookupState {
    target: NodeId,
    alpha: usize,
    max_depth: usize,
    max_peers: usize,
    /// The hard cap on nodes queried over the whole lookup: `max(2k, 50)`.
    max_queried: usize,
    /// Candidate nodes ordered by XOR distance to the target.
    closest: Vec<Candidate>,
    queried: HashSet<NodeId>,
    peers: HashSet<SocketAddr>,
    depth: usize,
}

impl LookupState {
    pub fn new(
        target: NodeId,
        seeds: Vec<Candidate>,
        alpha: usize,
        k: usize,
        max_depth: usize,
        max_peers: usize,
    ) -> Self {
        let mut state = Self {
            target,
            alpha: alpha.max(1),
            max_depth,
            max_peers,
            max_queried: (2 * k).max(50),
            closest: Vec::new(),
            queried: HashSet::new(),
            peers: HashSet::new(),
            depth: 0,
        };
        state.add_nodes(seeds);
        state
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn queried_count(&self) -> usize {
        self.queried.len()
    }

    pub fn peers(&self) -> &HashSet<SocketAddr> {
        &self.peers
    }

    /// Whether the lookup reached one of its termination conditions.
    pub fn is_done(&self) -> bool {
        (self.max_peers > 0 && self.peers.len() >= self.max_peers)
            || self.max_peers == 0
            || self.depth >= self.max_depth
            || self.queried.len() >= self.max_queried
    }

    /// Whether no unqueried candidate remains; the caller should expand the
    /// candidate set from the routing table before giving up.
    pub fn is_exhausted(&self) -> bool {
        !self
            .closest
            .iter()
            .any(|c| !self.queried.contains(&c.id))
    }

    /// Picks the next α closest unqueried candidates, marks them queried,
    /// and advances the iteration depth. An empty batch means the candidate
    /// set is exhausted.
    pub fn next_batch(&mut self) -> Vec<Candidate> {
        let batch: Vec<Candidate> = self
            .closest
            .iter()
            .filter(|c| !self.queried.contains(&c.id))
            .take(self.alpha)
            .copied()
            .collect();
        if batch.is_empty() {
            return batch;
        }
        self.depth += 1;
        for candidate in batch.iter() {
            self.queried.insert(candidate.id);
        }
        batch
    }

    /// Merges nodes learned from a response into the candidate set, keeping
    /// it ordered by XOR distance to the target.
    pub fn add_nodes(&mut self, nodes: Vec<Candidate>) {
        let mut added = false;
        for node in nodes {
            if self.closest.iter().any(|c| c.id == node.id) {
                continue;
            }
            self.closest.push(node);
            added = true;
        }
        if added {
            let target = self.target;
            self.closest
                .sort_by(|a, b| a.id.distance(&target).cmp(&b.id.distance(&target)));
            // an unbounded candidate set would make hostile responses
            // balloon the lookup
            self.closest.truncate(self.max_queried * 2);
        }
    }

    /// Registers discovered peers, returning only the ones not seen before
    /// (these are streamed to subscribers as they surface).
    pub fn add_peers(&mut self, peers: Vec<SocketAddr>) -> Vec<SocketAddr> {
        let mut fresh = Vec::new();
        for peer in peers {
            if self.peers.insert(peer) {
                fresh.push(peer);
                if self.max_peers > 0 && self.peers.len() >= self.max_peers {
                    break;
                }
            }
        }
        fresh
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    /// An id at the given "distance byte" from the zero target: a larger
    /// first byte is strictly farther by XOR.
    fn id_at(distance: u8, salt: u8) -> NodeId {
        let mut bytes = [0u8; 20];
        bytes[0] = distance;
        bytes[19] = salt;
        NodeId(bytes)
    }

    fn candidate(distance: u8, salt: u8) -> Candidate {
        Candidate {
            id: id_at(distance, salt),
            addr: SocketAddr::from((
                [10, 0, distance, salt],
                6881 + salt as u16,
            )),
        }
    }

    // The literal iterative lookup scenario: seed the candidate set with 8
    // nodes at distances 100..107 from the target; every queried node
    // returns 2 nodes at distances 50..80. Within at most 4 iteration
    // depths the closest set must contain the distance <= 80 nodes, no more
    // than max(2k, 50) = 50 nodes may be queried, and peers surface as they
    // are discovered.
    #[test]
    fn test_iterative_lookup_converges()
    {
        let target = NodeId([0u8; 20]);
        let seeds: Vec<Candidate> =
            (0..8).map(|i| candidate(100 + i, i)).collect();
        let mut state =
            LookupState::new(target, seeds, 3, 8, 10, 50);

        let mut salt = 100u8;
        let mut next_distance = 80u8;
        let mut depths = 0;
        while !state.is_done() && depths < 4 {
            let batch = state.next_batch();
            assert!(batch.len() <= 3, "alpha bounds the parallel queries");
            if batch.is_empty() {
                break;
            }
            depths += 1;
            for _ in batch {
                // each response carries two closer nodes
                let mut nodes = Vec::new();
                for _ in 0..2 {
                    if next_distance >= 50 {
                        nodes.push(candidate(next_distance, salt));
                        next_distance -= 1;
                        salt = salt.wrapping_add(1);
                    }
                }
                state.add_nodes(nodes);
            }
        }

        assert!(depths <= 4);
        assert!(state.queried_count() <= 50);
        // the candidate set now leads with the distance <= 80 nodes
        let closest_distance = state.closest[0].id.as_bytes()[0];
        assert!(closest_distance <= 80);
    }

    #[test]
    fn test_peers_stream_and_cap() {
        let target = NodeId([0u8; 20]);
        let mut state = LookupState::new(
            target,
            vec![candidate(1, 1)],
            3,
            8,
            10,
            2,
        );
        let fresh =
            state.add_peers(vec![candidate(2, 2).addr, candidate(3, 3).addr]);
        assert_eq!(fresh.len(), 2);
        // duplicates are not re-emitted
        let fresh = state.add_peers(vec![candidate(2, 2).addr]);
        assert!(fresh.is_empty());
        // the cap has been reached
        assert!(state.is_done());
    }

    // A lookup with max_peers = 0 terminates immediately without querying.
    #[test]
    fn test_zero_max_peers_returns_immediately() {
        let target = NodeId([0u8; 20]);
        let state = LookupState::new(
            target,
            (0..8).map(|i| candidate(100 + i, i)).collect(),
            3,
            8,
            10,
            0,
        );
        assert!(state.is_done());
    }

    #[test]
    fn test_exhaustion_is_detected() {
        let target = NodeId([0u8; 20]);
        let mut state = LookupState::new(
            target,
            vec![candidate(1, 1), candidate(2, 2)],
            3,
            8,
            10,
            50,
        );
        assert!(!state.is_exhausted());
        let batch = state.next_batch();
        assert_eq!(batch.len(), 2);
        assert!(state.is_exhausted());
        assert!(state.next_batch().is_empty());

        // expanding the candidate set revives the lookup
        state.add_nodes(vec![candidate(3, 3)]);
        assert!(!state.is_exhausted());
    }

    #[test]
    fn test_depth_cap_terminates() {
        let target = NodeId([0u8; 20]);
        let mut state = LookupState::new(
            target,
            (0..50).map(|i| candidate(100, i)).collect(),
            1,
            8,
            3,
            1000,
        );
        while !state.is_done() {
            if state.next_batch().is_empty() {
                break;
            }
        }
        assert_eq!(state.depth(), 3);
    }
}

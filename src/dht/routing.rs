//! The Kademlia routing table: 160 k-buckets of known nodes with per-node
//! quality tracking.

use std::{
    collections::HashMap,
    net::SocketAddr,
    time::{Duration, Instant},
};

use rand::Rng;

/// A 160 bit DHT node identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct NodeId(pub [u8; 20]);

impl NodeId {
    /// Generates a random id that is neither all zeros nor all ones.
    pub fn random() -> Self {
        let mut rng = rand::thread_rng();
        loop {
            let mut id = [0u8; 20];
            rng.fill(&mut id[..]);
            if id != [0x00; 20] && id != [0xff; 20] {
                return Self(id);
            }
        }
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// The XOR distance to the other id, as a big-endian 160 bit value.
    pub fn distance(&self, other: &NodeId) -> [u8; 20] {
        let mut distance = [0u8; 20];
        for (i, byte) in distance.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        distance
    }

    /// The position of the most significant differing bit, i.e. the length
    /// of the common prefix. Identical ids yield 160.
    pub fn common_prefix_len(&self, other: &NodeId) -> usize {
        let mut prefix = 0;
        for i in 0..20 {
            let xor = self.0[i] ^ other.0[i];
            if xor == 0 {
                prefix += 8;
            } else {
                prefix += xor.leading_zeros() as usize;
                break;
            }
        }
        prefix
    }
}

impl std::fmt::Debug for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NodeId({})", hex::encode(self.0))
    }
}

/// How many recent response times feed a node's average.
const RESPONSE_TIME_WINDOW: usize = 10;

/// A known DHT node with its addresses and quality metrics.
#[derive(Clone, Debug)]
pub(crate) struct NodeInfo {
    pub id: NodeId,
    /// The primary address the node was learned under.
    pub addr: SocketAddr,
    /// A second address for dual-stack nodes (compact v6 node info).
    pub addr_v6: Option<SocketAddr>,
    /// Further addresses the node was observed under.
    pub additional_addrs: Vec<SocketAddr>,
    pub last_seen: Instant,
    pub is_good: bool,
    pub failed_queries: u32,
    successful_queries: u32,
    query_count: u32,
    /// Sliding window of recent response times, in seconds.
    response_times: Vec<f64>,
    pub avg_response_time: f64,
    pub success_rate: f64,
    /// `success_rate / (1 + avg_response_time)`.
    pub quality: f64,
}

impl NodeInfo {
    pub fn new(id: NodeId, addr: SocketAddr) -> Self {
        Self {
            id,
            addr,
            addr_v6: None,
            additional_addrs: Vec::new(),
            last_seen: Instant::now(),
            is_good: true,
            failed_queries: 0,
            successful_queries: 0,
            query_count: 0,
            response_times: Vec::new(),
            avg_response_time: 0.0,
            success_rate: 1.0,
            quality: 1.0,
        }
    }

    /// All known addresses, primary first.
    pub fn all_addrs(&self) -> Vec<SocketAddr> {
        let mut addrs = vec![self.addr];
        if let Some(v6) = self.addr_v6 {
            addrs.push(v6);
        }
        addrs.extend(self.additional_addrs.iter().copied());
        addrs
    }

    /// Records an additional address if it isn't known yet.
    pub fn add_addr(&mut self, addr: SocketAddr) {
        if addr != self.addr
            && self.addr_v6 != Some(addr)
            && !self.additional_addrs.contains(&addr)
        {
            if addr.is_ipv6() && self.addr_v6.is_none() {
                self.addr_v6 = Some(addr);
            } else {
                self.additional_addrs.push(addr);
            }
        }
    }

    /// Picks the address to query, preferring the requested family when the
    /// node carries both.
    pub fn select_addr(&self, prefer_v6: bool) -> SocketAddr {
        if prefer_v6 {
            self.addr_v6.unwrap_or(self.addr)
        } else if self.addr.is_ipv6() {
            self.addr_v6.unwrap_or(self.addr)
        } else {
            self.addr
        }
    }

    pub fn record_success(&mut self, response_time: Duration) {
        self.is_good = true;
        self.successful_queries += 1;
        self.query_count += 1;
        self.last_seen = Instant::now();
        self.push_response_time(response_time);
        self.update_quality();
    }

    pub fn record_failure(&mut self, response_time: Option<Duration>) {
        self.is_good = false;
        self.failed_queries += 1;
        self.query_count += 1;
        if let Some(response_time) = response_time {
            self.push_response_time(response_time);
        }
        self.update_quality();
    }

    fn push_response_time(&mut self, response_time: Duration) {
        self.response_times.push(response_time.as_secs_f64());
        if self.response_times.len() > RESPONSE_TIME_WINDOW {
            self.response_times.remove(0);
        }
        self.avg_response_time = self.response_times.iter().sum::<f64>()
            / self.response_times.len() as f64;
    }

    fn update_quality(&mut self) {
        if self.query_count > 0 {
            self.success_rate =
                self.successful_queries as f64 / self.query_count as f64;
        }
        self.quality = self.success_rate / (1.0 + self.avg_response_time);
    }

    /// A blended reachability score: recency of the last contact (last
    /// hour/day/week/older mapped to 1.0/0.7/0.4/0.1) weighted with the
    /// quality score.
    pub fn reachability(&self) -> f64 {
        let elapsed = self.last_seen.elapsed().as_secs();
        let recency = if elapsed < 3_600 {
            1.0
        } else if elapsed < 86_400 {
            0.7
        } else if elapsed < 604_800 {
            0.4
        } else {
            0.1
        };
        recency * 0.6 + self.quality * 0.4
    }
}

/// The routing table: 160 buckets of at most `k` nodes each, indexed by the
/// position of the most significant bit in which a node's id differs from
/// our own.
pub(crate) struct RoutingTable {
    own_id: NodeId,
    k: usize,
    buckets: Vec<Vec<NodeInfo>>,
    /// Which bucket each known node lives in.
    index: HashMap<NodeId, usize>,
}

impl RoutingTable {
    pub fn new(own_id: NodeId, k: usize) -> Self {
        Self {
            own_id,
            k: k.max(1),
            buckets: vec![Vec::new(); 160],
            index: HashMap::new(),
        }
    }

    pub fn own_id(&self) -> NodeId {
        self.own_id
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.index.contains_key(id)
    }

    fn bucket_index(&self, id: &NodeId) -> usize {
        self.own_id.common_prefix_len(id).min(159)
    }

    /// Inserts or refreshes a node.
    ///
    /// Our own id is never inserted. An existing node has its addresses and
    /// freshness updated. A full bucket accepts the node only by replacing
    /// a bad member; otherwise the node is dropped.
    pub fn insert(&mut self, node: NodeInfo) -> bool {
        if node.id == self.own_id {
            return false;
        }

        if let Some(bucket_index) = self.index.get(&node.id) {
            let bucket = &mut self.buckets[*bucket_index];
            if let Some(existing) =
                bucket.iter_mut().find(|n| n.id == node.id)
            {
                existing.last_seen = Instant::now();
                existing.add_addr(node.addr);
                if let Some(v6) = node.addr_v6 {
                    existing.add_addr(v6);
                }
                return true;
            }
        }

        let bucket_index = self.bucket_index(&node.id);
        let bucket = &mut self.buckets[bucket_index];
        if bucket.len() < self.k {
            self.index.insert(node.id, bucket_index);
            bucket.push(node);
            return true;
        }

        // replace a bad node, if the bucket holds one
        if let Some(pos) = bucket.iter().position(|n| !n.is_good) {
            let evicted = std::mem::replace(&mut bucket[pos], node);
            self.index.remove(&evicted.id);
            self.index.insert(bucket[pos].id, bucket_index);
            log::debug!(
                "Replaced bad node {:?} in bucket {}",
                evicted.id,
                bucket_index
            );
            return true;
        }

        // bucket is full of good nodes
        false
    }

    pub fn remove(&mut self, id: &NodeId) {
        if let Some(bucket_index) = self.index.remove(id) {
            self.buckets[bucket_index].retain(|n| n.id != *id);
        }
    }

    pub fn get_mut(&mut self, id: &NodeId) -> Option<&mut NodeInfo> {
        let bucket_index = *self.index.get(id)?;
        self.buckets[bucket_index].iter_mut().find(|n| n.id == *id)
    }

    /// Finds the node owning the given address, if any.
    pub fn find_by_addr(&self, addr: &SocketAddr) -> Option<&NodeInfo> {
        self.iter().find(|n| n.all_addrs().contains(addr))
    }

    /// The `count` nodes nearest to the target by XOR distance; ties are
    /// broken by reachability, then by quality.
    pub fn closest(&self, target: &NodeId, count: usize) -> Vec<NodeInfo> {
        let mut nodes: Vec<NodeInfo> = self.iter().cloned().collect();
        nodes.sort_by(|a, b| {
            a.id.distance(target)
                .cmp(&b.id.distance(target))
                .then_with(|| {
                    b.reachability()
                        .partial_cmp(&a.reachability())
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .then_with(|| {
                    b.quality
                        .partial_cmp(&a.quality)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
        });
        nodes.truncate(count);
        nodes
    }

    pub fn iter(&self) -> impl Iterator<Item = &NodeInfo> {
        self.buckets.iter().flatten()
    }

    /// The ids of nodes that failed at least `threshold` queries and are
    /// marked bad; used by the periodic cleanup.
    pub fn expired_nodes(&self, threshold: u32) -> Vec<NodeId> {
        self.iter()
            .filter(|n| !n.is_good && n.failed_queries >= threshold)
            .map(|n| n.id)
            .collect()
    }

    /// The share of good nodes, in `[0, 1]`.
    pub fn health(&self) -> f64 {
        let total = self.len();
        if total == 0 {
            return 0.0;
        }
        let good = self.iter().filter(|n| n.is_good).count();
        good as f64 / total as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn id(prefix: u8) -> NodeId {
        let mut bytes = [0u8; 20];
        bytes[0] = prefix;
        bytes[19] = 1;
        NodeId(bytes)
    }

    fn addr(n: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 10_000 + n))
    }

    #[test]
    fn test_common_prefix_len() {
        let a = NodeId([0u8; 20]);
        let mut b = [0u8; 20];
        b[0] = 0b1000_0000;
        assert_eq!(a.common_prefix_len(&NodeId(b)), 0);
        b[0] = 0b0000_0001;
        assert_eq!(a.common_prefix_len(&NodeId(b)), 7);
        let mut c = [0u8; 20];
        c[10] = 0b0100_0000;
        assert_eq!(a.common_prefix_len(&NodeId(c)), 81);
        assert_eq!(a.common_prefix_len(&a), 160);
    }

    #[test]
    fn test_own_id_is_never_inserted() {
        let own = NodeId::random();
        let mut table = RoutingTable::new(own, 8);
        assert!(!table.insert(NodeInfo::new(own, addr(0))));
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn test_node_lives_in_exactly_one_bucket() {
        let own = NodeId([0u8; 20]);
        let mut table = RoutingTable::new(own, 8);
        for i in 1..=32u8 {
            table.insert(NodeInfo::new(id(i), addr(i as u16)));
        }
        let mut seen = std::collections::HashSet::new();
        for bucket in table.buckets.iter() {
            for node in bucket {
                assert!(seen.insert(node.id), "node appears in two buckets");
            }
        }
        assert_eq!(seen.len(), table.len());
    }

    #[test]
    fn test_full_bucket_replaces_bad_node_only() {
        let own = NodeId([0u8; 20]);
        let mut table = RoutingTable::new(own, 2);
        // ids with the same first bit land in the same bucket
        let a = NodeId([0b1000_0001; 20]);
        let b = NodeId([0b1000_0010; 20]);
        let c = NodeId([0b1000_0011; 20]);
        assert!(table.insert(NodeInfo::new(a, addr(1))));
        assert!(table.insert(NodeInfo::new(b, addr(2))));
        // the bucket is full of good nodes: the newcomer is dropped
        assert!(!table.insert(NodeInfo::new(c, addr(3))));

        // once a member goes bad, the newcomer replaces it
        table.get_mut(&a).unwrap().record_failure(None);
        assert!(table.insert(NodeInfo::new(c, addr(3))));
        assert!(!table.contains(&a));
        assert!(table.contains(&c));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_closest_orders_by_xor_distance() {
        let own = NodeId([0xff; 20]);
        let mut table = RoutingTable::new(own, 8);
        let target = NodeId([0u8; 20]);
        for i in 1..=8u8 {
            table.insert(NodeInfo::new(id(i), addr(i as u16)));
        }
        let closest = table.closest(&target, 3);
        assert_eq!(closest.len(), 3);
        // id(1) has the smallest XOR distance to the zero target
        assert_eq!(closest[0].id, id(1));
        assert_eq!(closest[1].id, id(2));
        assert_eq!(closest[2].id, id(3));
    }

    #[test]
    fn test_quality_score() {
        let mut node = NodeInfo::new(NodeId::random(), addr(1));
        node.record_success(Duration::from_millis(500));
        node.record_success(Duration::from_millis(500));
        node.record_failure(Some(Duration::from_millis(500)));
        assert!((node.success_rate - 2.0 / 3.0).abs() < 1e-9);
        assert!((node.avg_response_time - 0.5).abs() < 1e-9);
        assert!((node.quality - (2.0 / 3.0) / 1.5).abs() < 1e-9);
    }

    #[test]
    fn test_expired_nodes() {
        let own = NodeId([0u8; 20]);
        let mut table = RoutingTable::new(own, 8);
        let stale = id(1);
        let healthy = id(2);
        table.insert(NodeInfo::new(stale, addr(1)));
        table.insert(NodeInfo::new(healthy, addr(2)));
        for _ in 0..3 {
            table.get_mut(&stale).unwrap().record_failure(None);
        }
        table.get_mut(&healthy).unwrap().record_failure(None);
        assert_eq!(table.expired_nodes(3), vec![stale]);
    }
}

//! Binary routing trie with per-node locking
//!
//! One node per address bit consumed from the high end, so a node's depth is
//! the prefix length it represents and the root is the default route. Every
//! node carries its own [`RwLock`]; traversals take locks parent before child
//! and hold each one only for the O(1) work done at that level, so updates to
//! unrelated prefixes do not serialize behind a structure-wide lock.
//!
//! # NIST 800-53 Rev 5 Control Mappings
//! - SI-4: System Monitoring - Live view of advertised routes
//! - AU-12: Audit Record Generation - Change detection on every update

use crate::address::{Ipv4Prefix, walk_depth};
use crate::error::QueryError;
use parking_lot::RwLock;
use std::fmt::{self, Write as _};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{trace, warn};

/// Metric advertised for an unreachable (poisoned) route.
pub const POISON: u32 = 16;

/// Population weight of a poisoned route. Non-zero so that a poisoned prefix
/// is distinguishable from an empty one without counting as a live route.
pub const POISON_WEIGHT: f64 = 1e-6;

/// Largest number of host bits a single classification buffer may span.
pub const MAX_CLASSIFY_BITS: u32 = 24;

/// Visual classification of an address or route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Classification {
    /// No route, or a poisoned route outside the staleness window
    Unknown = 0,
    /// Reachable and unchanged for at least the staleness window
    Stable = 1,
    /// Reachable, metric changed within the staleness window
    RecentlyLearned = 2,
    /// Poisoned within the staleness window
    RecentlyPoisoned = 3,
    /// Metric outside the protocol's valid range
    Error = 4,
}

impl Classification {
    /// Classify a route from its metric and modification time.
    pub fn of(metric: Option<u32>, last_modified: Instant, now: Instant, window: Duration) -> Self {
        let recent = now.saturating_duration_since(last_modified) < window;
        match metric {
            None => Self::Unknown,
            Some(POISON) if recent => Self::RecentlyPoisoned,
            Some(POISON) => Self::Unknown,
            Some(m) if m == 0 || m > POISON => Self::Error,
            Some(_) if recent => Self::RecentlyLearned,
            Some(_) => Self::Stable,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Stable => "stable",
            Self::RecentlyLearned => "recently-learned",
            Self::RecentlyPoisoned => "recently-poisoned",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Contribution of a node's own metric to its weighted population.
#[inline]
fn route_weight(metric: Option<u32>) -> f64 {
    match metric {
        Some(POISON) => POISON_WEIGHT,
        Some(m) if m > 0 && m < POISON => 1.0,
        _ => 0.0,
    }
}

/// Bit of `ip` consumed at trie level `level` (0 = most significant).
#[inline]
fn bit_at(ip: u32, level: u32) -> usize {
    ((ip >> (31 - level)) & 1) as usize
}

#[derive(Debug)]
struct NodeState {
    metric: Option<u32>,
    last_modified: Instant,
    last_seen: Instant,
    population: f64,
    children: [Option<Arc<TrieNode>>; 2],
    /// Set once the node has been unlinked by purge or clear.
    detached: bool,
}

impl NodeState {
    /// Own weight plus the cached populations of both children.
    ///
    /// Caller holds this node's lock; children are read-locked briefly.
    fn weigh(&self) -> f64 {
        let mut population = route_weight(self.metric);
        for child in self.children.iter().flatten() {
            population += child.state.read().population;
        }
        population
    }
}

/// Point-in-time copy of a node's fields.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NodeSnapshot {
    pub metric: Option<u32>,
    pub last_modified: Instant,
    pub last_seen: Instant,
    pub population: f64,
}

/// A single trie node.
#[derive(Debug)]
pub struct TrieNode {
    state: RwLock<NodeState>,
}

impl TrieNode {
    fn new(now: Instant) -> Self {
        Self {
            state: RwLock::new(NodeState {
                metric: None,
                last_modified: now,
                last_seen: now,
                population: 0.0,
                children: [None, None],
                detached: false,
            }),
        }
    }

    pub fn snapshot(&self) -> NodeSnapshot {
        let state = self.state.read();
        NodeSnapshot {
            metric: state.metric,
            last_modified: state.last_modified,
            last_seen: state.last_seen,
            population: state.population,
        }
    }

    /// Stored metric, `None` when the node carries no route.
    pub fn metric(&self) -> Option<u32> {
        self.state.read().metric
    }

    /// Memoized weighted population of this subtree.
    pub fn population(&self) -> f64 {
        self.state.read().population
    }

    /// Classification of this node's own route.
    pub fn classify(&self, now: Instant, window: Duration) -> Classification {
        let state = self.state.read();
        Classification::of(state.metric, state.last_modified, now, window)
    }

    fn children(&self) -> [Option<Arc<TrieNode>>; 2] {
        self.state.read().children.clone()
    }
}

/// Counters produced by one purge pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeStats {
    /// Routes reset to no-route because they were not seen within the timeout
    pub routes_expired: usize,
    /// Child links dropped because their subtree held nothing
    pub nodes_removed: usize,
}

/// A routed prefix and its metric, as listed by [`RoutingTrie::routes`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    pub prefix: Ipv4Prefix,
    pub metric: u32,
}

/// Binary prefix trie over the 32 IPv4 address bits.
///
/// Shared between the receive path and any number of readers through an
/// `Arc<RoutingTrie>`; all operations take `&self`.
#[derive(Debug)]
pub struct RoutingTrie {
    root: Arc<TrieNode>,
    /// Bumped by every mutation a reader could observe.
    generation: AtomicU64,
}

impl Default for RoutingTrie {
    fn default() -> Self {
        Self::new()
    }
}

impl RoutingTrie {
    pub fn new() -> Self {
        Self {
            root: Arc::new(TrieNode::new(Instant::now())),
            generation: AtomicU64::new(0),
        }
    }

    /// Mutation counter. Changes whenever a metric changes, a route expires,
    /// a node is unlinked or the trie is cleared; refreshes leave it alone.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    fn bump_generation(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    /// Root node (the default route).
    pub fn root(&self) -> &Arc<TrieNode> {
        &self.root
    }

    /// Insert or refresh a route. Returns true if the stored metric changed.
    pub fn set(&self, ip: u32, mask: u32, metric: u32) -> bool {
        self.set_at(ip, mask, metric, Instant::now())
    }

    /// [`set`](Self::set) with an explicit timestamp.
    pub fn set_at(&self, ip: u32, mask: u32, metric: u32, now: Instant) -> bool {
        loop {
            if let Some(changed) = self.try_set(ip, mask, metric, now) {
                if changed {
                    self.bump_generation();
                }
                return changed;
            }
            trace!(ip, mask, "route path unlinked by concurrent purge, retrying");
        }
    }

    /// One attempt at `set`. Returns `None` if a node on the path was
    /// detached while we were working on it.
    fn try_set(&self, ip: u32, mask: u32, metric: u32, now: Instant) -> Option<bool> {
        let depth = walk_depth(mask);
        let mut path: Vec<Arc<TrieNode>> = Vec::with_capacity(depth as usize);
        let mut node = Arc::clone(&self.root);

        for level in 0..depth {
            let child = {
                let mut state = node.state.write();
                if state.detached {
                    return None;
                }
                let slot = &mut state.children[bit_at(ip, level)];
                Arc::clone(slot.get_or_insert_with(|| Arc::new(TrieNode::new(now))))
            };
            path.push(std::mem::replace(&mut node, child));
        }

        let changed = {
            let mut state = node.state.write();
            if state.detached {
                return None;
            }
            state.last_seen = now;
            if state.metric == Some(metric) {
                false
            } else {
                state.metric = Some(metric);
                state.last_modified = now;
                let population = state.weigh();
                state.population = population;
                true
            }
        };

        // bottom-up, each ancestor from its children's cached values
        for ancestor in path.iter().rev() {
            if changed {
                let mut state = ancestor.state.write();
                if state.detached {
                    return None;
                }
                let population = state.weigh();
                state.population = population;
            } else if ancestor.state.read().detached {
                return None;
            }
        }

        Some(changed)
    }

    /// Node at exactly the prefix `ip`/`mask`, if it exists.
    pub fn subtree(&self, ip: u32, mask: u32) -> Option<Arc<TrieNode>> {
        let mut node = Arc::clone(&self.root);
        for level in 0..walk_depth(mask) {
            let child = node.state.read().children[bit_at(ip, level)].clone()?;
            node = child;
        }
        Some(node)
    }

    /// Longest-prefix match.
    ///
    /// Returns the deepest node on the path to `ip` that holds a route. When
    /// the walk ends below the last routed prefix (10.0.0.0/8 and
    /// 10.16.0.0/16 installed, lookup of 10.1.1.1) the covering route wins.
    /// Falls back to the root when nothing on the path is routed.
    pub fn find(&self, ip: u32) -> Arc<TrieNode> {
        let mut best = Arc::clone(&self.root);
        let mut node = Arc::clone(&self.root);
        let mut level = 0;
        loop {
            let next = {
                let state = node.state.read();
                if state.metric.is_some() {
                    best = Arc::clone(&node);
                }
                if level == 32 {
                    None
                } else {
                    state.children[bit_at(ip, level)].clone()
                }
            };
            match next {
                Some(child) => {
                    node = child;
                    level += 1;
                }
                None => return best,
            }
        }
    }

    /// Classification of the longest-prefix match for `ip`.
    pub fn lookup(&self, ip: u32, window: Duration) -> Classification {
        self.lookup_at(ip, window, Instant::now())
    }

    pub fn lookup_at(&self, ip: u32, window: Duration, now: Instant) -> Classification {
        self.find(ip).classify(now, window)
    }

    /// Classify every address of the prefix `ip`/`mask`.
    ///
    /// Index `i` of the result is the `i`-th address of the prefix. Each
    /// address takes the classification of the most specific routed node
    /// covering it within the prefix; unrouted space is
    /// [`Classification::Unknown`]. Cost is one walk of the subtree.
    pub fn classify(
        &self,
        ip: u32,
        mask: u32,
        window: Duration,
    ) -> Result<Vec<Classification>, QueryError> {
        self.classify_at(ip, mask, window, Instant::now())
    }

    pub fn classify_at(
        &self,
        ip: u32,
        mask: u32,
        window: Duration,
        now: Instant,
    ) -> Result<Vec<Classification>, QueryError> {
        let prefix_len = walk_depth(mask);
        let host_bits = 32 - prefix_len;
        if host_bits > MAX_CLASSIFY_BITS {
            return Err(QueryError::RegionTooLarge {
                prefix_len,
                max_bits: MAX_CLASSIFY_BITS,
            });
        }

        let mut cells = vec![Classification::Unknown; 1usize << host_bits];
        if let Some(node) = self.subtree(ip, mask) {
            let mut anomalies = 0usize;
            paint(&node, &mut cells, now, window, &mut anomalies);
            if anomalies > 0 {
                warn!(
                    ip,
                    prefix_len, anomalies, "Routes with out-of-range metrics in classified region"
                );
            }
        }
        Ok(cells)
    }

    /// Expire routes not seen within `timeout` and drop subtrees left with
    /// no route at all. A route with an out-of-range metric is still a route
    /// and ages by `last_seen` like any other.
    pub fn purge(&self, timeout: Duration) -> PurgeStats {
        self.purge_at(timeout, Instant::now())
    }

    pub fn purge_at(&self, timeout: Duration, now: Instant) -> PurgeStats {
        let mut stats = PurgeStats::default();
        purge_node(&self.root, timeout, now, &mut stats);
        if stats != PurgeStats::default() {
            self.bump_generation();
        }
        stats
    }

    /// Drop every route and node.
    pub fn clear(&self) {
        self.clear_at(Instant::now());
    }

    pub fn clear_at(&self, now: Instant) {
        {
            let mut state = self.root.state.write();
            for child in state.children.iter_mut().filter_map(Option::take) {
                child.state.write().detached = true;
            }
            state.metric = None;
            state.population = 0.0;
            state.last_modified = now;
            state.last_seen = now;
        }
        self.bump_generation();
    }

    /// Weighted population of the whole trie.
    pub fn population(&self) -> f64 {
        self.root.population()
    }

    /// Every routed prefix with its metric, in address order.
    pub fn routes(&self) -> Vec<Route> {
        let mut routes = Vec::new();
        collect_routes(&self.root, 0, 0, &mut routes);
        routes
    }

    /// Number of nodes currently linked into the trie, root included.
    pub fn node_count(&self) -> usize {
        fn count(node: &TrieNode) -> usize {
            1 + node
                .children()
                .iter()
                .flatten()
                .map(|child| count(child))
                .sum::<usize>()
        }
        count(&self.root)
    }

    /// Graphviz rendering of the trie, nodes labelled with their metric.
    pub fn to_dot(&self) -> String {
        let mut out = String::from("digraph {\n");
        let mut next_id = 0usize;
        dot_node(&self.root, &mut next_id, &mut out);
        out.push_str("}\n");
        out
    }
}

fn paint(
    node: &TrieNode,
    cells: &mut [Classification],
    now: Instant,
    window: Duration,
    anomalies: &mut usize,
) {
    let children = {
        let state = node.state.read();
        // routeless nodes inherit whatever their ancestors painted
        if state.metric.is_some() {
            let class = Classification::of(state.metric, state.last_modified, now, window);
            if class == Classification::Error {
                *anomalies += 1;
            }
            cells.fill(class);
        }
        state.children.clone()
    };

    if cells.len() < 2 {
        return;
    }
    let (low, high) = cells.split_at_mut(cells.len() / 2);
    if let Some(child) = &children[0] {
        paint(child, low, now, window, anomalies);
    }
    if let Some(child) = &children[1] {
        paint(child, high, now, window, anomalies);
    }
}

fn purge_node(node: &TrieNode, timeout: Duration, now: Instant, stats: &mut PurgeStats) {
    let children = {
        let mut state = node.state.write();
        // poisoned routes stay until the protocol withdraws them
        if let Some(metric) = state.metric {
            if metric != POISON && now.saturating_duration_since(state.last_seen) > timeout {
                state.metric = None;
                stats.routes_expired += 1;
            }
        }
        state.children.clone()
    };

    for child in children.iter().flatten() {
        purge_node(child, timeout, now, stats);
    }

    let mut state = node.state.write();
    for slot in state.children.iter_mut() {
        let empty = match slot {
            Some(child) => {
                let mut child_state = child.state.write();
                let population = child_state.weigh();
                child_state.population = population;
                // grandchildren were already pruned by the recursive pass
                if child_state.metric.is_none() && child_state.children.iter().all(Option::is_none)
                {
                    child_state.detached = true;
                }
                child_state.detached
            }
            None => false,
        };
        if empty {
            *slot = None;
            stats.nodes_removed += 1;
        }
    }
    let population = state.weigh();
    state.population = population;
}

fn collect_routes(node: &TrieNode, network: u32, depth: u8, out: &mut Vec<Route>) {
    let (metric, children) = {
        let state = node.state.read();
        (state.metric, state.children.clone())
    };
    if let Some(metric) = metric {
        out.push(Route {
            prefix: Ipv4Prefix::masked(network, depth),
            metric,
        });
    }
    for (bit, child) in children.iter().enumerate() {
        if let Some(child) = child {
            let child_network = network | ((bit as u32) << (31 - u32::from(depth)));
            collect_routes(child, child_network, depth + 1, out);
        }
    }
}

fn dot_node(node: &TrieNode, next_id: &mut usize, out: &mut String) -> usize {
    let id = *next_id;
    *next_id += 1;
    let (metric, children) = {
        let state = node.state.read();
        (state.metric, state.children.clone())
    };
    let label = metric.map_or_else(|| "-".to_string(), |m| m.to_string());
    let _ = writeln!(out, "  {} [label=\"{}\"];", id, label);
    for child in children.iter().flatten() {
        let child_id = dot_node(child, next_id, out);
        let _ = writeln!(out, "  {} -> {};", id, child_id);
    }
    id
}

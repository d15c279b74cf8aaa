//! Read path over the routing trie
//!
//! A [`DisplayQuery`] names a region of address space. [`RouteView`] turns
//! it into a [`ClassificationGrid`]: one cell per address, laid out row-major
//! in a near-square grid so an external renderer can blit it directly.
//! [`ChangeWatch`] tells a poller when the trie changed and a redraw is due.

use crate::address::{Ipv4Prefix, ParseError};
use crate::error::QueryError;
use crate::trie::{Classification, RoutingTrie};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Default staleness window: changes younger than this render as recent.
pub const DEFAULT_STALENESS_WINDOW: Duration = Duration::from_secs(60);

/// A labelled region to classify.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DisplayQuery {
    pub prefix: Ipv4Prefix,
    pub label: String,
}

impl DisplayQuery {
    pub fn new(prefix: Ipv4Prefix, label: impl Into<String>) -> Self {
        Self {
            prefix,
            label: label.into(),
        }
    }

    /// Build from the `ADDRESS MASK LABEL` form used on the command line.
    pub fn from_triple(address: &str, mask: &str, label: &str) -> Result<Self, ParseError> {
        Ok(Self::new(Ipv4Prefix::parse_pair(address, mask)?, label))
    }

    /// e.g. `192.168.0.0/16 (campus)`
    pub fn title(&self) -> String {
        format!("{} ({})", self.prefix, self.label)
    }

    pub fn shape(&self) -> GridShape {
        GridShape::for_prefix(&self.prefix)
    }
}

impl fmt::Display for DisplayQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.title())
    }
}

/// Grid dimensions as powers of two.
///
/// The host bits are split so the grid is square or one bit wider than tall.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GridShape {
    pub width_bits: u32,
    pub height_bits: u32,
}

impl GridShape {
    pub fn for_prefix(prefix: &Ipv4Prefix) -> Self {
        let bits = prefix.host_bits();
        let height_bits = bits / 2;
        Self {
            width_bits: bits - height_bits,
            height_bits,
        }
    }

    pub fn width(&self) -> usize {
        1usize << self.width_bits
    }

    pub fn height(&self) -> usize {
        1usize << self.height_bits
    }

    pub fn cells(&self) -> usize {
        self.width() * self.height()
    }
}

/// Per-classification cell counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClassificationSummary {
    pub unknown: usize,
    pub stable: usize,
    pub recently_learned: usize,
    pub recently_poisoned: usize,
    pub error: usize,
}

impl ClassificationSummary {
    pub fn tally(cells: &[Classification]) -> Self {
        let mut summary = Self::default();
        for cell in cells {
            match cell {
                Classification::Unknown => summary.unknown += 1,
                Classification::Stable => summary.stable += 1,
                Classification::RecentlyLearned => summary.recently_learned += 1,
                Classification::RecentlyPoisoned => summary.recently_poisoned += 1,
                Classification::Error => summary.error += 1,
            }
        }
        summary
    }

    /// Addresses with a usable route.
    pub fn reachable(&self) -> usize {
        self.stable + self.recently_learned
    }
}

impl fmt::Display for ClassificationSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "stable={} learned={} poisoned={} error={} unknown={}",
            self.stable, self.recently_learned, self.recently_poisoned, self.error, self.unknown
        )
    }
}

/// Classified region laid out row-major.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassificationGrid {
    pub shape: GridShape,
    pub cells: Vec<Classification>,
}

impl ClassificationGrid {
    /// Cell at column `x`, row `y`, i.e. address offset `y * width + x`.
    pub fn get(&self, x: usize, y: usize) -> Option<Classification> {
        if x >= self.shape.width() || y >= self.shape.height() {
            return None;
        }
        self.cells.get(y * self.shape.width() + x).copied()
    }

    pub fn rows(&self) -> std::slice::Chunks<'_, Classification> {
        self.cells.chunks(self.shape.width())
    }

    pub fn summary(&self) -> ClassificationSummary {
        ClassificationSummary::tally(&self.cells)
    }
}

/// Query handle over a shared trie.
#[derive(Debug, Clone)]
pub struct RouteView {
    trie: Arc<RoutingTrie>,
}

impl RouteView {
    pub fn new(trie: Arc<RoutingTrie>) -> Self {
        Self { trie }
    }

    pub fn trie(&self) -> &Arc<RoutingTrie> {
        &self.trie
    }

    /// Classification of a single address.
    pub fn lookup(&self, addr: u32, window: Duration) -> Classification {
        self.trie.lookup(addr, window)
    }

    pub fn render(
        &self,
        query: &DisplayQuery,
        window: Duration,
    ) -> Result<ClassificationGrid, QueryError> {
        self.render_at(query, window, Instant::now())
    }

    pub fn render_at(
        &self,
        query: &DisplayQuery,
        window: Duration,
        now: Instant,
    ) -> Result<ClassificationGrid, QueryError> {
        let cells =
            self.trie
                .classify_at(query.prefix.network(), query.prefix.mask(), window, now)?;
        Ok(ClassificationGrid {
            shape: query.shape(),
            cells,
        })
    }
}

/// Detects when a redraw is due.
///
/// A redraw is due when the trie's generation moved since the previous
/// poll, and once more when the staleness window has run out after the last
/// observed change, because entries that rendered as recent have aged into
/// their settled classification by then.
#[derive(Debug, Clone)]
pub struct ChangeWatch {
    window: Duration,
    generation: Option<u64>,
    aging_since: Option<Instant>,
}

impl ChangeWatch {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            generation: None,
            aging_since: None,
        }
    }

    /// Returns true on the first poll and whenever a redraw is due.
    pub fn poll(&mut self, trie: &RoutingTrie) -> bool {
        self.poll_at(trie, Instant::now())
    }

    pub fn poll_at(&mut self, trie: &RoutingTrie, now: Instant) -> bool {
        let generation = trie.generation();
        if self.generation != Some(generation) {
            self.generation = Some(generation);
            self.aging_since = Some(now);
            return true;
        }
        match self.aging_since {
            Some(since) if now.saturating_duration_since(since) >= self.window => {
                self.aging_since = None;
                true
            }
            _ => false,
        }
    }

    /// Generation seen at the last poll.
    pub fn generation(&self) -> Option<u64> {
        self.generation
    }
}

/// Poll the trie every `poll` and log a summary of each display whenever a
/// redraw is due. Runs until cancelled.
pub async fn watch_displays(
    view: RouteView,
    queries: Vec<DisplayQuery>,
    poll: Duration,
    window: Duration,
    cancel: CancellationToken,
) {
    let mut watch = ChangeWatch::new(window);
    let mut ticker = tokio::time::interval(poll);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => break,

            _ = ticker.tick() => {
                if !watch.poll(view.trie()) {
                    continue;
                }
                for query in &queries {
                    match view.render(query, window) {
                        Ok(grid) => info!(
                            display = %query.title(),
                            generation = view.trie().generation(),
                            population = view.trie().population(),
                            summary = %grid.summary(),
                            "Display updated"
                        ),
                        Err(e) => warn!(display = %query.title(), error = %e, "Display query rejected"),
                    }
                }
            }
        }
    }
}

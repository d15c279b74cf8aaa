//! RIP Route Monitor Daemon for SONiC
//!
//! This crate provides ripmond, a passive RIP listener that keeps a live,
//! time-aware view of which IPv4 prefixes are advertised, at what metric, and
//! how recently each one changed. It never sends routing traffic.
//!
//! # NIST 800-53 Rev 5 Control Mappings
//!
//! | Control | Description | Implementation |
//! |---------|-------------|----------------|
//! | AU-3 | Content of Audit Records | Structured logging of every route change |
//! | AU-12 | Audit Record Generation | Route changes published and logged |
//! | CM-6 | Configuration Settings | TOML configuration with validation |
//! | SC-7 | Boundary Protection | Listen-only multicast membership |
//! | SI-4 | System Monitoring | Staleness classification of address space |
//! | SI-10 | Input Validation | Datagrams validated before they touch state |
//! | SI-11 | Error Handling | Structured error types |
//!
//! # Architecture
//!
//! ```text
//! 224.0.0.9:520 ──▶ RipReceiver ──▶ rip::decode ──▶ RoutingTrie ◀── RouteView
//!                        │                              ▲              │
//!                        ▼                              │              ▼
//!               broadcast<RouteChange>           purge timer   ClassificationGrid
//! ```

pub mod address;
pub mod config_file;
pub mod error;
pub mod metrics;
pub mod metrics_server;
pub mod query;
pub mod receiver;
pub mod rip;
pub mod trie;

pub use address::{Ipv4Prefix, ParseError};
pub use config_file::{DEFAULT_CONFIG_PATH, ReceiverConfig, RipmonConfig};
pub use error::{QueryError, Result, RipmonError};
pub use metrics::MetricsCollector;
pub use metrics_server::start_metrics_server;
pub use query::{
    ChangeWatch, ClassificationGrid, ClassificationSummary, DEFAULT_STALENESS_WINDOW, DisplayQuery,
    GridShape, RouteView, watch_displays,
};
pub use receiver::{RipReceiver, run_purge_loop};
pub use rip::{RipError, RipPacket, RouteChange, RouteEntry};
pub use trie::{Classification, NodeSnapshot, POISON, PurgeStats, Route, RoutingTrie, TrieNode};

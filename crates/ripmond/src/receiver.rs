//! Multicast RIP receiver and purge timer
//!
//! The receiver owns the UDP socket, decodes every datagram against the
//! shared trie and publishes each route change on a broadcast channel. The
//! purge timer runs as its own task. Both stop when their
//! [`CancellationToken`] fires.
//!
//! # NIST 800-53 Rev 5 Control Mappings
//! - SC-7: Boundary Protection - Listen-only multicast membership
//! - SI-4: System Monitoring - Route change detection
//! - SI-10: Information Input Validation - Malformed datagrams dropped

use crate::config_file::ReceiverConfig;
use crate::error::{Result, RipmonError};
use crate::metrics::MetricsCollector;
use crate::rip::{self, RouteChange};
use crate::trie::RoutingTrie;
use socket2::{Domain, Protocol, Socket, Type};
use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Capacity of the route change channel; slow subscribers observe `Lagged`.
const CHANGE_CHANNEL_CAPACITY: usize = 1024;

/// Receives RIP responses and applies them to the trie
pub struct RipReceiver {
    trie: Arc<RoutingTrie>,
    config: ReceiverConfig,
    metrics: MetricsCollector,
    changes: broadcast::Sender<RouteChange>,
}

impl RipReceiver {
    pub fn new(trie: Arc<RoutingTrie>, config: ReceiverConfig, metrics: MetricsCollector) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            trie,
            config,
            metrics,
            changes,
        }
    }

    pub fn trie(&self) -> &Arc<RoutingTrie> {
        &self.trie
    }

    pub fn config(&self) -> &ReceiverConfig {
        &self.config
    }

    /// Subscribe to route changes applied from now on
    pub fn subscribe(&self) -> broadcast::Receiver<RouteChange> {
        self.changes.subscribe()
    }

    /// Create the multicast socket: wildcard bind on the RIP port, group
    /// membership on the configured interface address.
    pub fn bind(&self) -> Result<UdpSocket> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .map_err(RipmonError::Socket)?;
        socket
            .set_reuse_address(true)
            .map_err(RipmonError::Socket)?;

        if let Err(e) = socket.set_recv_buffer_size(self.config.recv_buffer_size) {
            warn!(
                error = %e,
                requested_size = self.config.recv_buffer_size,
                "Failed to set UDP SO_RCVBUF"
            );
        }

        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.config.port));
        socket.bind(&addr.into()).map_err(RipmonError::Socket)?;
        socket
            .join_multicast_v4(&self.config.group, &self.config.interface)
            .map_err(RipmonError::Socket)?;
        socket.set_nonblocking(true).map_err(RipmonError::Socket)?;

        let std_socket: std::net::UdpSocket = socket.into();
        UdpSocket::from_std(std_socket).map_err(RipmonError::Socket)
    }

    /// Bind and receive until cancelled
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let socket = self.bind()?;
        info!(
            group = %self.config.group,
            port = self.config.port,
            interface = %self.config.interface,
            "ripmond: Joined RIP multicast group"
        );
        self.receive_loop(socket, cancel).await
    }

    /// Receive datagrams from an already bound socket until cancelled.
    ///
    /// Cancellation is a clean shutdown. Any receive error other than an
    /// interruption ends the loop with [`RipmonError::Socket`]; the trie
    /// stays queryable.
    pub async fn receive_loop(&self, socket: UdpSocket, cancel: CancellationToken) -> Result<()> {
        let mut buf = vec![0u8; self.config.max_datagram_size];
        self.metrics.set_receiver_running(true);

        let result = loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => break Ok(()),

                recv = socket.recv_from(&mut buf) => match recv {
                    Ok((len, peer)) => {
                        self.handle_datagram(&buf[..len], peer);
                    }
                    Err(_) if cancel.is_cancelled() => break Ok(()),
                    Err(e) if matches!(e.kind(), ErrorKind::Interrupted | ErrorKind::WouldBlock) => {
                        continue;
                    }
                    Err(e) => {
                        error!(error = %e, "ripmond: RIP receive failed, receiver stopping");
                        break Err(RipmonError::Socket(e));
                    }
                },
            }
        };

        self.metrics.set_receiver_running(false);
        info!("ripmond: Receiver stopped");
        result
    }

    /// Decode one datagram and publish its changes. Returns the number of
    /// routes whose metric changed.
    pub fn handle_datagram(&self, datagram: &[u8], peer: SocketAddr) -> usize {
        let started = Instant::now();
        match rip::decode(&self.trie, datagram) {
            Ok(changes) => {
                self.metrics
                    .record_datagram(changes.len(), started.elapsed().as_secs_f64());
                if changes.is_empty() {
                    trace!(peer = %peer, bytes = datagram.len(), "RIP refresh");
                    return 0;
                }

                self.metrics.set_population(self.trie.population());
                let count = changes.len();
                for change in changes {
                    info!(
                        peer = %peer,
                        prefix = %format!("{}/{}", change.address, change.prefix_len),
                        metric = change.metric,
                        "Route changed"
                    );
                    // no subscribers is fine
                    let _ = self.changes.send(change);
                }
                count
            }
            Err(e) => {
                self.metrics.record_decode_error();
                debug!(peer = %peer, error = %e, "Dropping malformed RIP datagram");
                0
            }
        }
    }
}

/// Run `trie.purge(timeout)` every `period` until cancelled.
///
/// The first pass runs one period after start.
pub async fn run_purge_loop(
    trie: Arc<RoutingTrie>,
    period: Duration,
    timeout: Duration,
    metrics: MetricsCollector,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => break,

            _ = ticker.tick() => {
                let stats = trie.purge(timeout);
                metrics.record_purged(stats.routes_expired);
                metrics.set_population(trie.population());
                if stats.routes_expired > 0 || stats.nodes_removed > 0 {
                    info!(
                        routes_expired = stats.routes_expired,
                        nodes_removed = stats.nodes_removed,
                        population = trie.population(),
                        "Purged stale routes"
                    );
                } else {
                    trace!("Purge pass found nothing stale");
                }
            }
        }
    }

    debug!("Purge timer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::{mask_from_len, parse_dotted};
    use crate::rip::ResponseBuilder;

    fn peer() -> SocketAddr {
        SocketAddr::from((Ipv4Addr::new(192, 0, 2, 1), 520))
    }

    fn receiver() -> RipReceiver {
        RipReceiver::new(
            Arc::new(RoutingTrie::new()),
            ReceiverConfig::default(),
            MetricsCollector::new().unwrap(),
        )
    }

    #[test]
    fn test_handle_datagram_publishes_changes() {
        let receiver = receiver();
        let mut rx = receiver.subscribe();
        let datagram = ResponseBuilder::default()
            .route(parse_dotted("10.0.0.0").unwrap(), mask_from_len(8), 5)
            .build();

        assert_eq!(receiver.handle_datagram(&datagram, peer()), 1);
        let change = rx.try_recv().unwrap();
        assert_eq!(change.prefix_len, 8);
        assert_eq!(change.metric, 5);

        // refresh publishes nothing
        assert_eq!(receiver.handle_datagram(&datagram, peer()), 0);
        assert!(rx.try_recv().is_err());
        assert_eq!(receiver.metrics.datagrams_received_total.get(), 2.0);
        assert_eq!(receiver.metrics.route_changes_total.get(), 1.0);
        assert_eq!(receiver.metrics.trie_population.get(), 1.0);
    }

    #[test]
    fn test_handle_malformed_datagram() {
        let receiver = receiver();
        assert_eq!(receiver.handle_datagram(&[2, 2], peer()), 0);
        assert_eq!(receiver.metrics.decode_errors_total.get(), 1.0);
        assert_eq!(receiver.trie().population(), 0.0);
    }

    #[tokio::test]
    async fn test_receive_loop_stops_on_cancel() {
        let receiver = receiver();
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        assert!(receiver.receive_loop(socket, cancel).await.is_ok());
        assert_eq!(receiver.metrics.receiver_running.get(), 0.0);
    }

    #[tokio::test]
    async fn test_purge_loop_expires_routes() {
        let trie = Arc::new(RoutingTrie::new());
        trie.set(parse_dotted("10.0.0.0").unwrap(), mask_from_len(8), 5);
        let metrics = MetricsCollector::new().unwrap();
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(run_purge_loop(
            Arc::clone(&trie),
            Duration::from_millis(10),
            Duration::ZERO,
            metrics.clone(),
            cancel.clone(),
        ));
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(trie.population(), 0.0);
        assert_eq!(trie.node_count(), 1);
        assert_eq!(metrics.routes_purged_total.get(), 1.0);
    }
}

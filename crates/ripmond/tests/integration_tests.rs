//! Integration tests for ripmond
//!
//! Drives the full receive path: datagram bytes through the decoder into the
//! trie, out through the query surface, and a live receive loop on loopback.

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use sonic_ripmond::address::{mask_from_len, parse_dotted};
    use sonic_ripmond::rip::{self, ResponseBuilder};
    use sonic_ripmond::{
        ChangeWatch, Classification, DisplayQuery, MetricsCollector, POISON, ReceiverConfig,
        RipReceiver, RouteView, RoutingTrie,
    };
    use std::sync::Arc;
    use std::time::{Duration, Instant};
    use tokio::net::UdpSocket;
    use tokio_util::sync::CancellationToken;

    const WINDOW: Duration = Duration::from_secs(60);

    fn ip(s: &str) -> u32 {
        parse_dotted(s).expect("valid address")
    }

    fn campus_update(metric_lab: u32) -> Vec<u8> {
        ResponseBuilder::new(2)
            .route(ip("192.168.0.0"), mask_from_len(20), 1)
            .route(ip("192.168.16.0"), mask_from_len(24), metric_lab)
            .route(ip("192.168.32.0"), mask_from_len(19), 4)
            .build()
    }

    #[test]
    fn test_decode_then_render() {
        let trie = Arc::new(RoutingTrie::new());
        let t0 = Instant::now();

        let packet = rip::RipPacket::parse(&campus_update(2)).unwrap();
        let changes = rip::apply_at(&trie, &packet, t0);
        assert_eq!(changes.len(), 3);

        let view = RouteView::new(Arc::clone(&trie));
        let query = DisplayQuery::from_triple("192.168.0.0", "255.255.0.0", "campus").unwrap();

        // two minutes later the lab route is poisoned
        let t1 = t0 + Duration::from_secs(120);
        let packet = rip::RipPacket::parse(&campus_update(POISON)).unwrap();
        let changes = rip::apply_at(&trie, &packet, t1);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].metric, POISON);

        let grid = view
            .render_at(&query, WINDOW, t1 + Duration::from_secs(5))
            .unwrap();
        let summary = grid.summary();
        assert_eq!(summary.stable, 4096 + 8192);
        assert_eq!(summary.recently_poisoned, 256);
        assert_eq!(summary.recently_learned, 0);
        assert_eq!(summary.unknown, 65536 - 4096 - 8192 - 256);

        // poison fades to unknown once outside the window
        let grid = view
            .render_at(&query, WINDOW, t1 + Duration::from_secs(61))
            .unwrap();
        assert_eq!(grid.summary().recently_poisoned, 0);
        assert_eq!(
            trie.lookup_at(ip("192.168.16.9"), WINDOW, t1 + Duration::from_secs(61)),
            Classification::Unknown
        );
    }

    #[test]
    fn test_malformed_datagram_changes_nothing() {
        let trie = RoutingTrie::new();
        let mut watch = ChangeWatch::new(WINDOW);
        watch.poll(&trie);

        let mut datagram = campus_update(2);
        datagram.truncate(datagram.len() - 3);
        assert!(rip::decode(&trie, &datagram).is_err());

        assert!(!watch.poll(&trie));
        assert!(trie.routes().is_empty());

        rip::decode(&trie, &campus_update(2)).unwrap();
        assert!(watch.poll(&trie));
        assert_eq!(trie.routes().len(), 3);
    }

    #[test]
    fn test_purge_then_readvertise() {
        let trie = RoutingTrie::new();
        let t0 = Instant::now();
        let packet = rip::RipPacket::parse(&campus_update(2)).unwrap();
        rip::apply_at(&trie, &packet, t0);

        let stats = trie.purge_at(Duration::from_secs(180), t0 + Duration::from_secs(181));
        assert_eq!(stats.routes_expired, 3);
        assert_eq!(trie.node_count(), 1);

        // a fresh advertisement rebuilds and reports every route again
        let changes = rip::apply_at(&trie, &packet, t0 + Duration::from_secs(190));
        assert_eq!(changes.len(), 3);
    }

    #[test]
    fn test_route_change_serializes() {
        let trie = RoutingTrie::new();
        let changes = rip::decode(&trie, &campus_update(2)).unwrap();
        let json = serde_json::to_value(&changes[1]).unwrap();
        assert_eq!(json["address"], "192.168.16.0");
        assert_eq!(json["prefix_len"], 24);
        assert_eq!(json["metric"], 2);
        assert!(json["timestamp"].is_string());
    }

    #[tokio::test]
    async fn test_receive_loop_over_loopback() {
        let trie = Arc::new(RoutingTrie::new());
        let metrics = MetricsCollector::new().unwrap();
        let receiver = Arc::new(RipReceiver::new(
            Arc::clone(&trie),
            ReceiverConfig::default(),
            metrics.clone(),
        ));
        let mut changes = receiver.subscribe();

        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let cancel = CancellationToken::new();

        let task = {
            let receiver = Arc::clone(&receiver);
            let cancel = cancel.clone();
            tokio::spawn(async move { receiver.receive_loop(socket, cancel).await })
        };

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        // garbage first; the loop must survive it
        sender.send_to(&[2, 2, 0], addr).await.unwrap();
        sender.send_to(&campus_update(3), addr).await.unwrap();

        let mut received = Vec::new();
        for _ in 0..3 {
            let change = tokio::time::timeout(Duration::from_secs(5), changes.recv())
                .await
                .expect("route change before timeout")
                .unwrap();
            received.push(change);
        }
        let prefixes: Vec<String> = received
            .iter()
            .map(|c| format!("{}/{}", c.address, c.prefix_len))
            .collect();
        assert_eq!(
            prefixes,
            vec!["192.168.0.0/20", "192.168.16.0/24", "192.168.32.0/19"]
        );
        assert_eq!(trie.find(ip("192.168.16.200")).metric(), Some(3));
        assert_eq!(metrics.decode_errors_total.get(), 1.0);
        assert_eq!(metrics.receiver_running.get(), 1.0);

        cancel.cancel();
        let result = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("receiver stops after cancel")
            .unwrap();
        assert!(result.is_ok());
        assert_eq!(metrics.receiver_running.get(), 0.0);
        // trie stays queryable after the receiver is gone
        assert_eq!(trie.routes().len(), 3);
    }
}

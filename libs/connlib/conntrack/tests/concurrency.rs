#![allow(clippy::unwrap_used)]

use std::{
    net::{IpAddr, Ipv4Addr},
    sync::Arc,
    thread,
};

use conntrack::{Config, DEFAULT_TCP_IDLE_TIMEOUT, TcpFlags, Tracker};

const LOCAL_IP: IpAddr = IpAddr::V4(Ipv4Addr::new(100, 64, 0, 1));
const REMOTE_IP: IpAddr = IpAddr::V4(Ipv4Addr::new(100, 64, 0, 2));

fn handshake_and_close(tracker: &Tracker, port: u16) {
    tracker.track_outbound(LOCAL_IP, REMOTE_IP, port, 80, TcpFlags::SYN);
    assert!(tracker.is_valid_inbound(REMOTE_IP, LOCAL_IP, 80, port, TcpFlags::SYN | TcpFlags::ACK));
    tracker.track_outbound(LOCAL_IP, REMOTE_IP, port, 80, TcpFlags::ACK);

    for _ in 0..10 {
        tracker.track_outbound(LOCAL_IP, REMOTE_IP, port, 80, TcpFlags::ACK | TcpFlags::PSH);
        assert!(tracker.is_valid_inbound(
            REMOTE_IP,
            LOCAL_IP,
            80,
            port,
            TcpFlags::ACK | TcpFlags::PSH
        ));
    }

    tracker.track_outbound(LOCAL_IP, REMOTE_IP, port, 80, TcpFlags::FIN | TcpFlags::ACK);
    assert!(tracker.is_valid_inbound(REMOTE_IP, LOCAL_IP, 80, port, TcpFlags::ACK));
    assert!(tracker.is_valid_inbound(REMOTE_IP, LOCAL_IP, 80, port, TcpFlags::FIN | TcpFlags::ACK));
    tracker.track_outbound(LOCAL_IP, REMOTE_IP, port, 80, TcpFlags::ACK);
}

#[test]
fn many_threads_many_flows() {
    let _guard = logging::test("info");
    let tracker = Tracker::new(DEFAULT_TCP_IDLE_TIMEOUT).unwrap();

    thread::scope(|s| {
        for t in 0..8u16 {
            let tracker = &tracker;

            s.spawn(move || {
                for i in 0..200u16 {
                    handshake_and_close(tracker, 10_000 + t * 1_000 + i);
                }
            });
        }
    });

    assert_eq!(tracker.num_connections(), 0, "every connection was closed");
}

#[test]
fn capacity_holds_under_contention() {
    let _guard = logging::test("info");
    let config = Config::new(DEFAULT_TCP_IDLE_TIMEOUT).with_max_connections(64);
    let tracker = Tracker::with_config(config).unwrap();

    thread::scope(|s| {
        for t in 0..8u16 {
            let tracker = &tracker;

            s.spawn(move || {
                for i in 0..500u16 {
                    let port = 1_024 + t * 1_000 + i;

                    tracker.track_outbound(LOCAL_IP, REMOTE_IP, port, 80, TcpFlags::SYN);

                    assert!(tracker.num_connections() <= 64);
                }
            });
        }
    });

    assert!(tracker.num_connections() <= 64);
    assert!(tracker.num_connections() > 0);
}

#[test]
fn close_during_traffic() {
    let _guard = logging::test("info");
    let tracker = Arc::new(Tracker::new(DEFAULT_TCP_IDLE_TIMEOUT).unwrap());

    let workers = (0..4u16)
        .map(|t| {
            let tracker = tracker.clone();

            thread::spawn(move || {
                for i in 0..1_000u16 {
                    let port = 20_000 + t * 1_000 + i;

                    tracker.track_outbound(LOCAL_IP, REMOTE_IP, port, 80, TcpFlags::SYN);
                    tracker.is_valid_inbound(
                        REMOTE_IP,
                        LOCAL_IP,
                        80,
                        port,
                        TcpFlags::SYN | TcpFlags::ACK,
                    );
                }
            })
        })
        .collect::<Vec<_>>();

    tracker.close();

    for worker in workers {
        worker.join().unwrap();
    }

    assert_eq!(tracker.num_connections(), 0);
    assert!(!tracker.is_valid_inbound(REMOTE_IP, LOCAL_IP, 80, 20_000, TcpFlags::ACK));
}

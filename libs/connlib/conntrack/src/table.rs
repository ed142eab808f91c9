use std::{
    net::SocketAddr,
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
    time::Instant,
};

use dashmap::{DashMap, mapref::entry::Entry as MapEntry};

use crate::{
    ConnKey, Config,
    metrics::Metrics,
    tcp::{self, Direction, Event, State, Step, TcpState},
};

/// How many entries are considered when a full table has to make room for a new connection.
const EVICTION_SAMPLE: usize = 256;

/// A point-in-time copy of a tracked connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub key: ConnKey,
    pub state: State,
    /// The local endpoint, i.e. the one that sent the initial SYN.
    pub initiator: SocketAddr,
    pub created_at: Instant,
    pub last_activity: Instant,
    pub packets_out: u64,
    pub packets_in: u64,
    pub bytes_out: u64,
    pub bytes_in: u64,
}

#[derive(Debug)]
struct Entry {
    tcp: TcpState,
    initiator: SocketAddr,
    created_at: Instant,
    last_activity: Instant,

    packets_out: u64,
    packets_in: u64,
    bytes_out: u64,
    bytes_in: u64,
}

impl Entry {
    fn new(initiator: SocketAddr, now: Instant) -> Self {
        Self {
            tcp: TcpState::syn_sent(),
            initiator,
            created_at: now,
            last_activity: now,
            packets_out: 0,
            packets_in: 0,
            bytes_out: 0,
            bytes_in: 0,
        }
    }

    fn record(&mut self, direction: Direction, payload_len: usize, now: Instant) {
        self.last_activity = now;

        match direction {
            Direction::Outbound => {
                self.packets_out += 1;
                self.bytes_out += payload_len as u64;
            }
            Direction::Inbound => {
                self.packets_in += 1;
                self.bytes_in += payload_len as u64;
            }
        }
    }

    fn info(&self, key: ConnKey) -> ConnectionInfo {
        ConnectionInfo {
            key,
            state: self.tcp.state,
            initiator: self.initiator,
            created_at: self.created_at,
            last_activity: self.last_activity,
            packets_out: self.packets_out,
            packets_in: self.packets_in,
            bytes_out: self.bytes_out,
            bytes_in: self.bytes_in,
        }
    }
}

/// The set of tracked connections.
///
/// Entries live in a sharded map: operations on a key hold the lock of that key's shard for the whole
/// read-compute-write sequence, operations on keys in other shards proceed in parallel.
///
/// The number of entries is bounded by [`Config::max_connections`].
/// `slots` counts occupied entries so the bound holds even when new connections race each other.
pub(crate) struct ConnTable {
    entries: DashMap<ConnKey, Entry>,
    slots: AtomicUsize,
    /// Once set, no new entries are inserted.
    closed: AtomicBool,

    config: Config,
    metrics: Metrics,
}

impl ConnTable {
    pub(crate) fn new(config: Config, metrics: Metrics) -> Self {
        Self {
            entries: DashMap::new(),
            slots: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            config,
            metrics,
        }
    }

    /// Applies a segment sent by the local TCP stack.
    ///
    /// New connections are only ever created for a SYN.
    /// Returns the connection after the update or `None` if it is not tracked (anymore).
    pub(crate) fn upsert(
        &self,
        key: ConnKey,
        initiator: SocketAddr,
        event: Event,
        payload_len: usize,
        now: Instant,
    ) -> Option<ConnectionInfo> {
        // Must happen before we lock the key's shard: eviction iterates all shards.
        if event == Event::Syn
            && self.slots.load(Ordering::Acquire) >= self.config.max_connections
            && !self.entries.contains_key(&key)
        {
            self.evict_oldest();
        }

        match self.entries.entry(key) {
            MapEntry::Vacant(vacant) => {
                let transition = tcp::transition(None, Direction::Outbound, event);

                if transition.step != Step::Open {
                    return None;
                }

                // Checked under the shard lock: `close` sweeps every shard after setting the flag.
                if self.closed.load(Ordering::Acquire) {
                    return None;
                }

                if !self.reserve_slot() {
                    tracing::debug!(
                        %key,
                        "Connection table is full; not tracking new TCP connection"
                    );

                    return None;
                }

                tracing::debug!(%key, "New TCP connection");
                self.metrics.opened();

                let mut entry = Entry::new(initiator, now);
                entry.record(Direction::Outbound, payload_len, now);

                Some(vacant.insert(entry).info(key))
            }
            MapEntry::Occupied(mut occupied) => {
                let current = occupied.get().tcp;
                let transition = tcp::transition(Some(current), Direction::Outbound, event);

                match transition.step {
                    Step::Close => {
                        occupied.remove();
                        self.release_slots(1);

                        tracing::debug!(
                            %key,
                            from = ?current.state,
                            ?event,
                            "TCP connection closed by local endpoint"
                        );

                        return None;
                    }
                    Step::Open => {
                        tracing::debug!(
                            %key,
                            from = ?current.state,
                            "Restarting TCP connection; new SYN"
                        );

                        *occupied.get_mut() = Entry::new(initiator, now);
                    }
                    Step::Move(next) => {
                        tracing::trace!(
                            %key,
                            from = ?current.state,
                            to = ?next.state,
                            ?event,
                            "Outbound TCP transition"
                        );

                        occupied.get_mut().tcp = next;
                    }
                    Step::Stay | Step::Ignore => {}
                }

                let entry = occupied.get_mut();
                entry.record(Direction::Outbound, payload_len, now);

                Some(entry.info(key))
            }
        }
    }

    /// Judges a segment received from the remote peer and addressed to `dst`.
    ///
    /// Segments for unknown connections are denied and never create an entry.
    /// So are segments travelling towards the remote peer: `dst` must be the endpoint that opened the connection.
    pub(crate) fn lookup_and_transition(
        &self,
        key: ConnKey,
        dst: SocketAddr,
        event: Event,
        payload_len: usize,
        now: Instant,
    ) -> bool {
        let MapEntry::Occupied(mut occupied) = self.entries.entry(key) else {
            tracing::trace!(%key, ?event, "No TCP connection for inbound segment");

            return false;
        };

        let initiator = occupied.get().initiator;

        if dst != initiator {
            tracing::debug!(
                %key,
                %dst,
                %initiator,
                ?event,
                "Denying inbound TCP segment in wrong direction"
            );

            return false;
        }

        let current = occupied.get().tcp;
        let transition = tcp::transition(Some(current), Direction::Inbound, event);

        if !transition.is_admitted() {
            tracing::trace!(%key, state = ?current.state, ?event, "Denying inbound TCP segment");

            return false;
        }

        match transition.step {
            Step::Close => {
                occupied.remove();
                self.release_slots(1);

                tracing::debug!(
                    %key,
                    from = ?current.state,
                    ?event,
                    "TCP connection closed by remote"
                );

                return true;
            }
            Step::Move(next) => {
                tracing::trace!(
                    %key,
                    from = ?current.state,
                    to = ?next.state,
                    ?event,
                    "Inbound TCP transition"
                );

                occupied.get_mut().tcp = next;
            }
            Step::Open | Step::Stay | Step::Ignore => {}
        }

        occupied
            .get_mut()
            .record(Direction::Inbound, payload_len, now);

        true
    }

    /// Removes all connections that have been idle for longer than the timeout of their state.
    pub(crate) fn evict_idle(&self, now: Instant) -> usize {
        let mut evicted = 0;

        self.entries.retain(|key, entry| {
            let timeout = self.config.timeout_for(entry.tcp.state);
            let idle = now.saturating_duration_since(entry.last_activity);

            if idle < timeout {
                return true;
            }

            tracing::debug!(%key, state = ?entry.tcp.state, ?idle, "Removing idle TCP connection");
            evicted += 1;

            false
        });

        self.release_slots(evicted);

        evicted
    }

    /// Removes the connection that has been idle the longest among the first [`EVICTION_SAMPLE`] entries.
    ///
    /// The iterator locks one shard at a time and stops after the sample, so a full table does not make every
    /// new connection pay for a scan over all entries.
    pub(crate) fn evict_oldest(&self) -> bool {
        let Some((key, last_activity)) = self
            .entries
            .iter()
            .take(EVICTION_SAMPLE)
            .map(|e| (*e.key(), e.value().last_activity))
            .min_by_key(|(_, last_activity)| *last_activity)
        else {
            return false;
        };

        // Only evict if nobody touched the connection in the meantime.
        let Some((key, entry)) = self
            .entries
            .remove_if(&key, |_, e| e.last_activity == last_activity)
        else {
            return false;
        };

        self.release_slots(1);

        tracing::debug!(
            %key,
            state = ?entry.tcp.state,
            "Evicted oldest TCP connection; table is full"
        );

        true
    }

    pub(crate) fn get(&self, key: &ConnKey) -> Option<ConnectionInfo> {
        self.entries.get(key).map(|e| e.value().info(*e.key()))
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.load(Ordering::Acquire)
    }

    /// Removes all connections and refuses new ones from now on.
    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);

        let mut removed = 0;

        self.entries.retain(|_, _| {
            removed += 1;

            false
        });

        self.release_slots(removed);
    }

    fn reserve_slot(&self) -> bool {
        self.slots
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.config.max_connections).then_some(n + 1)
            })
            .is_ok()
    }

    fn release_slots(&self, num: usize) {
        if num == 0 {
            return;
        }

        self.slots.fetch_sub(num, Ordering::AcqRel);
        self.metrics.closed(num);
    }
}

#[cfg(test)]
mod tests {
    use std::{
        net::{IpAddr, Ipv4Addr, SocketAddr},
        time::Duration,
    };

    use super::*;

    const LOCAL: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(100, 64, 0, 1)), 12345);

    fn remote(port: u16) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::new(100, 64, 0, 2), port))
    }

    fn key(port: u16) -> ConnKey {
        ConnKey::tcp(LOCAL, remote(port)).unwrap()
    }

    fn table(max_connections: usize) -> ConnTable {
        ConnTable::new(
            Config::new(Duration::from_secs(60)).with_max_connections(max_connections),
            Metrics::new(),
        )
    }

    #[test]
    fn inbound_never_creates_entries() {
        let table = table(10);
        let now = Instant::now();

        for event in [Event::Syn, Event::SynAck, Event::Ack, Event::Rst] {
            assert!(!table.lookup_and_transition(key(80), LOCAL, event, 0, now));
        }

        assert_eq!(table.len(), 0);
        assert!(table.get(&key(80)).is_none());
    }

    #[test]
    fn outbound_non_syn_does_not_create_entries() {
        let table = table(10);

        let info = table.upsert(key(80), LOCAL, Event::Ack, 0, Instant::now());

        assert!(info.is_none());
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn retransmitted_syn_keeps_single_entry() {
        let table = table(10);
        let now = Instant::now();

        table.upsert(key(80), LOCAL, Event::Syn, 0, now);
        let info = table
            .upsert(key(80), LOCAL, Event::Syn, 0, now + Duration::from_secs(1))
            .unwrap();

        assert_eq!(table.len(), 1);
        assert_eq!(info.state, State::SynSent);
        assert_eq!(info.packets_out, 2);
        assert_eq!(info.created_at, now);
        assert_eq!(info.last_activity, now + Duration::from_secs(1));
    }

    #[test]
    fn counts_packets_and_bytes_per_direction() {
        let table = table(10);
        let now = Instant::now();

        table.upsert(key(80), LOCAL, Event::Syn, 0, now);
        assert!(table.lookup_and_transition(key(80), LOCAL, Event::SynAck, 0, now));
        table.upsert(key(80), LOCAL, Event::Data, 100, now);
        assert!(table.lookup_and_transition(key(80), LOCAL, Event::Data, 1400, now));

        let info = table.get(&key(80)).unwrap();

        assert_eq!(info.state, State::Established);
        assert_eq!(info.initiator, LOCAL);
        assert_eq!((info.packets_out, info.bytes_out), (2, 100));
        assert_eq!((info.packets_in, info.bytes_in), (2, 1400));
    }

    #[test]
    fn denied_segments_do_not_refresh_activity() {
        let table = table(10);
        let now = Instant::now();

        table.upsert(key(80), LOCAL, Event::Syn, 0, now);
        let later = now + Duration::from_secs(5);
        assert!(!table.lookup_and_transition(key(80), LOCAL, Event::Data, 10, later));

        let info = table.get(&key(80)).unwrap();

        assert_eq!(info.last_activity, now);
        assert_eq!(info.packets_in, 0);
    }

    #[test]
    fn evicts_oldest_connection_at_capacity() {
        let table = table(3);
        let now = Instant::now();

        for (i, port) in [80, 81, 82].into_iter().enumerate() {
            table.upsert(key(port), LOCAL, Event::Syn, 0, now + Duration::from_secs(i as u64));
        }
        // Touch the first connection so the second one becomes the oldest.
        table.upsert(key(80), LOCAL, Event::Syn, 0, now + Duration::from_secs(10));

        table.upsert(key(83), LOCAL, Event::Syn, 0, now + Duration::from_secs(11));

        assert_eq!(table.len(), 3);
        assert!(table.get(&key(80)).is_some());
        assert!(table.get(&key(81)).is_none());
        assert!(table.get(&key(82)).is_some());
        assert!(table.get(&key(83)).is_some());
    }

    #[test]
    fn never_exceeds_capacity() {
        let table = table(16);
        let now = Instant::now();

        for port in 0..1000 {
            table.upsert(key(port), LOCAL, Event::Syn, 0, now);
        }

        assert_eq!(table.len(), 16);
        assert_eq!(table.entries.len(), 16);
    }

    #[test]
    fn evicts_idle_connections_by_state() {
        let table = ConnTable::new(
            Config::new(Duration::from_secs(600)).with_handshake_timeout(Duration::from_secs(10)),
            Metrics::new(),
        );
        let now = Instant::now();

        table.upsert(key(80), LOCAL, Event::Syn, 0, now);

        table.upsert(key(81), LOCAL, Event::Syn, 0, now);
        table.lookup_and_transition(key(81), LOCAL, Event::SynAck, 0, now);
        table.upsert(key(81), LOCAL, Event::Ack, 0, now);

        assert_eq!(table.evict_idle(now + Duration::from_secs(9)), 0);
        assert_eq!(table.evict_idle(now + Duration::from_secs(10)), 1);
        assert!(table.get(&key(80)).is_none());
        assert!(table.get(&key(81)).is_some());

        assert_eq!(table.evict_idle(now + Duration::from_secs(600)), 1);
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn rst_removes_entry_and_frees_slot() {
        let table = table(1);
        let now = Instant::now();

        table.upsert(key(80), LOCAL, Event::Syn, 0, now);
        assert!(table.lookup_and_transition(key(80), LOCAL, Event::Rst, 0, now));

        assert_eq!(table.len(), 0);
        assert!(!table.lookup_and_transition(key(80), LOCAL, Event::Ack, 0, now));
    }

    #[test]
    fn outbound_rst_removes_entry() {
        let table = table(10);
        let now = Instant::now();

        table.upsert(key(80), LOCAL, Event::Syn, 0, now);
        let info = table.upsert(key(80), LOCAL, Event::Rst, 0, now);

        assert!(info.is_none());
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn close_releases_all_slots_and_refuses_new_connections() {
        let table = table(10);
        let now = Instant::now();

        for port in 80..85 {
            table.upsert(key(port), LOCAL, Event::Syn, 0, now);
        }
        table.close();

        assert_eq!(table.len(), 0);
        assert!(table.get(&key(80)).is_none());
        assert!(table.upsert(key(90), LOCAL, Event::Syn, 0, now).is_none());
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn inbound_towards_remote_is_denied() {
        let table = table(10);
        let now = Instant::now();

        table.upsert(key(80), LOCAL, Event::Syn, 0, now);

        assert!(!table.lookup_and_transition(key(80), remote(80), Event::SynAck, 0, now));
        assert!(!table.lookup_and_transition(key(80), remote(80), Event::Rst, 0, now));

        let info = table.get(&key(80)).unwrap();
        assert_eq!(info.state, State::SynSent);
        assert_eq!(info.packets_in, 0);

        assert!(table.lookup_and_transition(key(80), LOCAL, Event::SynAck, 0, now));
    }

    #[test]
    fn eviction_only_looks_at_a_sample() {
        let table = table(EVICTION_SAMPLE * 4);
        let now = Instant::now();

        for port in 0..(EVICTION_SAMPLE * 4) as u16 {
            table.upsert(key(port), LOCAL, Event::Syn, 0, now + Duration::from_millis(port as u64));
        }

        let sampled = table
            .entries
            .iter()
            .take(EVICTION_SAMPLE)
            .map(|e| (*e.key(), e.value().last_activity))
            .min_by_key(|(_, last_activity)| *last_activity)
            .map(|(key, _)| key)
            .unwrap();

        assert!(table.evict_oldest());

        assert!(table.get(&sampled).is_none());
        assert_eq!(table.len(), EVICTION_SAMPLE * 4 - 1);
    }
}

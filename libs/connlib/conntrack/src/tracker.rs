use std::{
    net::{IpAddr, SocketAddr},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use parking_lot::Mutex;

use crate::{
    ConnKey, Config, Error, Segment, TcpFlags,
    metrics::Metrics,
    reaper::Reaper,
    table::{ConnTable, ConnectionInfo},
    tcp::{Direction, Event},
};

/// Tracks TCP connections initiated by the local host and decides which inbound segments belong to them.
///
/// Outbound segments are recorded unconditionally via [`Tracker::track_outbound`].
/// Inbound segments are admitted by [`Tracker::is_valid_inbound`] only if they are an expected continuation of a
/// connection the local host opened; everything else, including all traffic for unknown connections, is denied.
///
/// The tracker is meant to be shared (e.g. in an [`Arc`]) between all threads processing packets.
pub struct Tracker {
    table: Arc<ConnTable>,
    reaper: Mutex<Option<Reaper>>,
    closed: AtomicBool,

    metrics: Metrics,
}

impl Tracker {
    /// Creates a tracker that forgets established connections after `idle_timeout` of inactivity.
    ///
    /// Use [`DEFAULT_TCP_IDLE_TIMEOUT`](crate::DEFAULT_TCP_IDLE_TIMEOUT) unless you have a reason not to.
    pub fn new(idle_timeout: Duration) -> Result<Self, Error> {
        Self::with_config(Config::new(idle_timeout))
    }

    pub fn with_config(config: Config) -> Result<Self, Error> {
        config.validate()?;

        let metrics = Metrics::new();
        let table = Arc::new(ConnTable::new(config, metrics.clone()));
        let reaper = Reaper::spawn(table.clone(), config.reap_interval)
            .map_err(Error::SpawnReaper)?;

        tracing::debug!(?config, "Started TCP connection tracker");

        Ok(Self {
            table,
            reaper: Mutex::new(Some(reaper)),
            closed: AtomicBool::new(false),
            metrics,
        })
    }

    /// Records a segment sent by the local TCP stack from `src` to `dst`.
    ///
    /// Only a SYN starts tracking a new connection.
    pub fn track_outbound(
        &self,
        src: IpAddr,
        dst: IpAddr,
        src_port: u16,
        dst_port: u16,
        flags: TcpFlags,
    ) {
        self.outbound(
            SocketAddr::new(src, src_port),
            SocketAddr::new(dst, dst_port),
            flags,
            0,
        );
    }

    /// Decides whether a segment received from the remote peer may pass.
    ///
    /// `src` and `dst` are the addresses of the inbound segment as seen on the wire, i.e. `src` is the remote peer
    /// and `dst` the local host. They map to the same connection as the [`Tracker::track_outbound`] call with the
    /// addresses swapped.
    pub fn is_valid_inbound(
        &self,
        src: IpAddr,
        dst: IpAddr,
        src_port: u16,
        dst_port: u16,
        flags: TcpFlags,
    ) -> bool {
        self.inbound(
            SocketAddr::new(src, src_port),
            SocketAddr::new(dst, dst_port),
            flags,
            0,
        )
    }

    /// Records an outbound IP packet. Packets that are not TCP are ignored.
    pub fn track_outbound_packet(&self, packet: &[u8]) {
        match Segment::parse(packet) {
            Ok(segment) => {
                self.outbound(segment.src, segment.dst, segment.flags, segment.payload_len);
            }
            Err(e) => {
                tracing::trace!("Not tracking outbound packet: {e:#}");
            }
        }
    }

    /// Decides whether an inbound IP packet may pass. Packets that cannot be parsed as TCP are denied.
    pub fn is_valid_inbound_packet(&self, packet: &[u8]) -> bool {
        match Segment::parse(packet) {
            Ok(segment) => {
                self.inbound(segment.src, segment.dst, segment.flags, segment.payload_len)
            }
            Err(e) => {
                tracing::trace!("Denying inbound packet: {e:#}");

                false
            }
        }
    }

    /// Returns a copy of the connection between the two endpoints, if it is tracked.
    pub fn connection(
        &self,
        src: IpAddr,
        dst: IpAddr,
        src_port: u16,
        dst_port: u16,
    ) -> Option<ConnectionInfo> {
        let key = ConnKey::tcp(SocketAddr::new(src, src_port), SocketAddr::new(dst, dst_port))?;

        self.table.get(&key)
    }

    pub fn num_connections(&self) -> usize {
        self.table.len()
    }

    /// Stops the background reaper and forgets all connections.
    ///
    /// Afterwards, outbound segments are ignored and all inbound segments are denied.
    /// Calling this more than once is fine.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let reaper = self.reaper.lock().take();

        if let Some(reaper) = reaper {
            reaper.stop();
        }

        self.table.close();

        tracing::debug!("Closed TCP connection tracker");
    }

    fn outbound(&self, src: SocketAddr, dst: SocketAddr, flags: TcpFlags, payload_len: usize) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }

        let Some(key) = ConnKey::tcp(src, dst) else {
            tracing::debug!(%src, %dst, "Ignoring outbound segment with mixed IP versions");
            return;
        };

        let Some(event) = Event::from_flags(flags, payload_len) else {
            tracing::trace!(%key, %flags, "Ignoring outbound segment with invalid flags");
            self.metrics.packet(Direction::Outbound, false);
            return;
        };

        self.metrics.packet(Direction::Outbound, true);

        self.table.upsert(key, src, event, payload_len, Instant::now());
    }

    fn inbound(
        &self,
        src: SocketAddr,
        dst: SocketAddr,
        flags: TcpFlags,
        payload_len: usize,
    ) -> bool {
        let admitted = self.judge_inbound(src, dst, flags, payload_len);

        self.metrics.packet(Direction::Inbound, admitted);

        admitted
    }

    fn judge_inbound(
        &self,
        src: SocketAddr,
        dst: SocketAddr,
        flags: TcpFlags,
        payload_len: usize,
    ) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }

        // Checked before looking up the connection: these are never legitimate, whatever the state.
        let Some(event) = Event::from_flags(flags, payload_len) else {
            tracing::trace!(%src, %dst, %flags, "Denying inbound segment with invalid flags");
            return false;
        };

        let Some(key) = ConnKey::tcp(src, dst) else {
            tracing::debug!(%src, %dst, "Denying inbound segment with mixed IP versions");
            return false;
        };

        self.table
            .lookup_and_transition(key, dst, event, payload_len, Instant::now())
    }
}

impl Drop for Tracker {
    fn drop(&mut self) {
        self.close();
    }
}

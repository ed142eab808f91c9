use std::{fmt, net::SocketAddr};

/// The layer-4 protocol of a tracked flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[non_exhaustive]
pub enum Protocol {
    Tcp,
}

/// Identifies a single flow, independent of the direction it was observed in.
///
/// The two endpoints are stored in canonical order (the smaller `(ip, port)` pair first),
/// so an outbound segment and the reply to it map to the same key.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnKey {
    protocol: Protocol,
    a: SocketAddr,
    b: SocketAddr,
}

impl ConnKey {
    /// Builds the key of a flow between `x` and `y`.
    ///
    /// Returns `None` if the endpoints don't share an IP version; no such flow can exist.
    pub fn new(protocol: Protocol, x: SocketAddr, y: SocketAddr) -> Option<Self> {
        if x.is_ipv4() != y.is_ipv4() {
            return None;
        }

        let (a, b) = if (x.ip(), x.port()) <= (y.ip(), y.port()) {
            (x, y)
        } else {
            (y, x)
        };

        Some(Self { protocol, a, b })
    }

    pub fn tcp(x: SocketAddr, y: SocketAddr) -> Option<Self> {
        Self::new(Protocol::Tcp, x, y)
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// The endpoints of this flow in canonical order.
    pub fn endpoints(&self) -> (SocketAddr, SocketAddr) {
        (self.a, self.b)
    }
}

impl fmt::Display for ConnKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let protocol = match self.protocol {
            Protocol::Tcp => "tcp",
        };

        write!(f, "{protocol} {} <-> {}", self.a, self.b)
    }
}

impl fmt::Debug for ConnKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

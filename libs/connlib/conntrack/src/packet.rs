use std::net::SocketAddr;

use anyhow::{Context as _, Result};
use etherparse::{IpNumber, IpSlice, TcpSlice};

use crate::TcpFlags;

/// The parts of a TCP segment the tracker looks at, parsed from a raw IPv4 or IPv6 packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub src: SocketAddr,
    pub dst: SocketAddr,
    pub flags: TcpFlags,
    pub payload_len: usize,
}

impl Segment {
    pub fn parse(packet: &[u8]) -> Result<Self> {
        let ip = IpSlice::from_slice(packet).context("Failed to parse IP packet")?;

        anyhow::ensure!(
            !ip.is_fragmenting_payload(),
            "Cannot track fragmented IP packets"
        );

        let protocol = ip.payload_ip_number();
        anyhow::ensure!(
            protocol == IpNumber::TCP,
            "Not a TCP packet (protocol: {protocol:?})"
        );

        let tcp = TcpSlice::from_slice(ip.payload().payload).with_context(|| {
            format!(
                "Failed to parse TCP segment; src IP = {}, dst IP = {}",
                ip.source_addr(),
                ip.destination_addr()
            )
        })?;

        Ok(Self {
            src: SocketAddr::new(ip.source_addr(), tcp.source_port()),
            dst: SocketAddr::new(ip.destination_addr(), tcp.destination_port()),
            flags: flags(&tcp),
            payload_len: tcp.payload().len(),
        })
    }
}

fn flags(tcp: &TcpSlice<'_>) -> TcpFlags {
    [
        (tcp.syn(), TcpFlags::SYN),
        (tcp.ack(), TcpFlags::ACK),
        (tcp.fin(), TcpFlags::FIN),
        (tcp.rst(), TcpFlags::RST),
        (tcp.psh(), TcpFlags::PSH),
        (tcp.urg(), TcpFlags::URG),
    ]
    .into_iter()
    .filter(|(set, _)| *set)
    .fold(TcpFlags::empty(), |flags, (_, flag)| flags | flag)
}

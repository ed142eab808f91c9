use opentelemetry::{
    KeyValue,
    metrics::{Counter, UpDownCounter},
};

use crate::tcp::Direction;

#[derive(Clone)]
pub(crate) struct Metrics {
    packets: Counter<u64>,
    connections: UpDownCounter<i64>,
}

impl Metrics {
    pub(crate) fn new() -> Self {
        let meter = opentelemetry::global::meter("conntrack");

        Self {
            packets: meter
                .u64_counter("network.conntrack.packets")
                .with_description("Number of TCP segments judged by the connection tracker")
                .with_unit("{packet}")
                .build(),
            connections: meter
                .i64_up_down_counter("network.conntrack.connections")
                .with_description("Number of tracked TCP connections")
                .with_unit("{connection}")
                .build(),
        }
    }

    /// Counts a judged segment.
    ///
    /// Outbound segments are only denied if their flags are invalid; those are never recorded in the table.
    pub(crate) fn packet(&self, direction: Direction, admitted: bool) {
        let direction = match direction {
            Direction::Outbound => "outbound",
            Direction::Inbound => "inbound",
        };
        let verdict = if admitted { "admit" } else { "deny" };

        self.packets.add(
            1,
            &[
                KeyValue::new("network.io.direction", direction),
                KeyValue::new("conntrack.verdict", verdict),
            ],
        );
    }

    pub(crate) fn opened(&self) {
        self.connections.add(1, &[]);
    }

    pub(crate) fn closed(&self, num: usize) {
        if num == 0 {
            return;
        }

        self.connections.add(-(num as i64), &[]);
    }
}

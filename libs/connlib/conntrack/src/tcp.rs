//! The TCP state machine used to judge segments of a tracked connection.
//!
//! Everything in here is pure: given the current state of a connection, the direction of a segment and its [`Event`],
//! [`transition`] computes what should happen to the connection and whether an inbound segment may pass.
//! The connection table applies the result while holding the lock for the connection's key.
//!
//! States are named from the point of view of the local endpoint, which is always the side that sent the initial SYN.

use crate::TcpFlags;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    /// We sent a SYN and are waiting for the SYN-ACK.
    SynSent,
    /// The remote answered with a SYN-ACK; our ACK is outstanding.
    SynReceived,
    Established,
    /// We sent a FIN, the remote has not acknowledged it yet.
    FinWait1,
    /// Our FIN has been acknowledged; the remote may still send data.
    FinWait2,
    /// The remote sent a FIN while ours was either not sent or not yet acknowledged.
    ClosingSimultaneous,
    /// Both sides sent a FIN and only one acknowledgement is outstanding.
    LastAck,
    /// Both FINs have been acknowledged. Connections in this state are removed immediately.
    Closed,
}

impl State {
    pub fn is_handshake(self) -> bool {
        matches!(self, State::SynSent | State::SynReceived)
    }

    pub fn is_closing(self) -> bool {
        matches!(
            self,
            State::FinWait1
                | State::FinWait2
                | State::ClosingSimultaneous
                | State::LastAck
                | State::Closed
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Sent by the local TCP stack.
    Outbound,
    /// Received from the remote peer.
    Inbound,
}

/// What a segment means for the state machine, derived from its flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Syn,
    SynAck,
    Ack,
    /// An ACK that carries payload.
    Data,
    Fin,
    Rst,
}

impl Event {
    /// Classifies a segment.
    ///
    /// Returns `None` for flag combinations that [`TcpFlags::is_valid`] rejects.
    pub fn from_flags(flags: TcpFlags, payload_len: usize) -> Option<Self> {
        if !flags.is_valid() {
            return None;
        }

        let event = if flags.rst() {
            Event::Rst
        } else if flags.syn() && flags.ack() {
            Event::SynAck
        } else if flags.syn() {
            Event::Syn
        } else if flags.fin() {
            Event::Fin
        } else if flags.psh() || payload_len > 0 {
            Event::Data
        } else {
            Event::Ack
        };

        Some(event)
    }
}

/// Which FINs have been sent and acknowledged.
///
/// The [`State`] alone cannot tell a simultaneous close apart from a regular one once both FINs are out,
/// so the close sequence is tracked explicitly.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FinSequence {
    pub local_fin: bool,
    pub remote_fin: bool,
    /// The remote acknowledged our FIN.
    pub local_fin_acked: bool,
    /// We acknowledged the remote's FIN.
    pub remote_fin_acked: bool,
}

impl FinSequence {
    pub fn is_complete(&self) -> bool {
        self.local_fin && self.remote_fin && self.local_fin_acked && self.remote_fin_acked
    }
}

/// The state of a tracked TCP connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpState {
    pub state: State,
    pub fins: FinSequence,
}

impl TcpState {
    pub fn syn_sent() -> Self {
        Self {
            state: State::SynSent,
            fins: FinSequence::default(),
        }
    }

    fn with(self, state: State, fins: FinSequence) -> Step {
        if fins.is_complete() {
            return Step::Close;
        }

        let next = TcpState { state, fins };

        if next == self {
            return Step::Stay;
        }

        Step::Move(next)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Start tracking a fresh connection in [`State::SynSent`], replacing what was there before.
    Open,
    Stay,
    Move(TcpState),
    /// The connection is over and its entry must be removed.
    Close,
    /// There is nothing to track.
    Ignore,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Admit,
    Deny,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub step: Step,
    pub verdict: Verdict,
}

impl Transition {
    fn admit(step: Step) -> Self {
        Self {
            step,
            verdict: Verdict::Admit,
        }
    }

    fn deny() -> Self {
        Self {
            step: Step::Stay,
            verdict: Verdict::Deny,
        }
    }

    pub fn is_admitted(&self) -> bool {
        self.verdict == Verdict::Admit
    }

    /// The state the connection ends up in, `None` if it is not (or no longer) tracked.
    pub fn next_state(&self, current: Option<TcpState>) -> Option<State> {
        match self.step {
            Step::Open => Some(State::SynSent),
            Step::Stay => current.map(|c| c.state),
            Step::Move(next) => Some(next.state),
            Step::Close => Some(State::Closed),
            Step::Ignore => None,
        }
    }
}

/// Computes the effect of a segment on a connection.
///
/// `current` is `None` if no connection is tracked for the segment's key.
/// Outbound segments are always admitted: we only ever gate what the remote sends us.
pub fn transition(current: Option<TcpState>, direction: Direction, event: Event) -> Transition {
    match (current, direction) {
        (None, Direction::Outbound) if event == Event::Syn => Transition::admit(Step::Open),
        (None, Direction::Outbound) => Transition::admit(Step::Ignore),
        (None, Direction::Inbound) => Transition {
            step: Step::Ignore,
            verdict: Verdict::Deny,
        },
        (Some(current), Direction::Outbound) => Transition::admit(outbound(current, event)),
        (Some(current), Direction::Inbound) => inbound(current, event),
    }
}

fn outbound(current: TcpState, event: Event) -> Step {
    let TcpState { state, mut fins } = current;

    match (state, event) {
        (_, Event::Rst) => Step::Close,
        (State::SynSent, Event::Syn) => Step::Stay,
        (_, Event::Syn) => Step::Open,
        (State::SynReceived, Event::Ack | Event::Data) => current.with(State::Established, fins),
        (State::SynReceived | State::Established, Event::Fin) => {
            fins.local_fin = true;

            current.with(State::FinWait1, fins)
        }
        (State::ClosingSimultaneous, Event::Fin) if !fins.local_fin => {
            // Sent after the remote's FIN, so it acknowledges it.
            fins.local_fin = true;
            fins.remote_fin_acked = true;

            current.with(State::LastAck, fins)
        }
        (State::ClosingSimultaneous | State::LastAck, Event::Ack | Event::Data) => {
            fins.remote_fin_acked = true;

            current.with(state, fins)
        }
        (
            State::SynSent
            | State::SynReceived
            | State::Established
            | State::FinWait1
            | State::FinWait2
            | State::ClosingSimultaneous
            | State::LastAck
            | State::Closed,
            Event::SynAck | Event::Ack | Event::Data | Event::Fin,
        ) => Step::Stay,
    }
}

fn inbound(current: TcpState, event: Event) -> Transition {
    let TcpState { state, mut fins } = current;

    match (state, event) {
        (State::Closed, _) => Transition::deny(),
        (_, Event::Rst) => Transition::admit(Step::Close),
        (_, Event::Syn) => Transition::deny(),

        (State::SynSent, Event::SynAck) => {
            Transition::admit(current.with(State::SynReceived, fins))
        }
        (State::SynSent, Event::Ack | Event::Data | Event::Fin) => Transition::deny(),

        // Our ACK got lost and the remote retransmits.
        (State::SynReceived | State::Established, Event::SynAck) => Transition::admit(Step::Stay),
        (State::SynReceived, Event::Ack | Event::Data | Event::Fin) => Transition::deny(),

        (State::Established, Event::Ack | Event::Data) => Transition::admit(Step::Stay),
        (State::Established, Event::Fin) => {
            fins.remote_fin = true;

            Transition::admit(current.with(State::ClosingSimultaneous, fins))
        }

        (State::FinWait1, Event::Ack) => {
            fins.local_fin_acked = true;

            Transition::admit(current.with(State::FinWait2, fins))
        }
        (State::FinWait1, Event::Data) => Transition::admit(Step::Stay),
        (State::FinWait1, Event::Fin) => {
            fins.remote_fin = true;

            Transition::admit(current.with(State::ClosingSimultaneous, fins))
        }

        (State::FinWait2, Event::Ack | Event::Data) => Transition::admit(Step::Stay),
        (State::FinWait2, Event::Fin) => {
            fins.remote_fin = true;

            Transition::admit(current.with(State::LastAck, fins))
        }

        // Retransmitted FIN.
        (State::ClosingSimultaneous | State::LastAck, Event::Fin) => Transition::admit(Step::Stay),
        (State::ClosingSimultaneous | State::LastAck, Event::Ack) => {
            if fins.local_fin {
                fins.local_fin_acked = true;
            }

            Transition::admit(current.with(state, fins))
        }
        // The remote already sent its FIN, it has no business sending more data.
        (State::ClosingSimultaneous | State::LastAck, Event::Data) => Transition::deny(),

        (
            State::FinWait1 | State::FinWait2 | State::ClosingSimultaneous | State::LastAck,
            Event::SynAck,
        ) => Transition::deny(),
    }
}

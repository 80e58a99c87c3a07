//! # Stream States (RFC 9000 Section 3)
//!
//! The sending and receiving halves of a stream each follow their own
//! lattice of states. A bidirectional stream reports a composite state that
//! is derived from the pair, never stored.
//!
//! ```text
//! Sending (Section 3.1)                Receiving (Section 3.2)
//!
//!  Ready -> Send -> DataSent -> DataRecvd   Recv -> SizeKnown -> DataRecvd -> DataRead
//!    |        |        |                      |         |
//!    +--------+--------+-> ResetSent          +---------+-> ResetRecvd -> ResetRead
//!                              |
//!                              v
//!                          ResetRecvd
//! ```
//!
//! Transitions are compare-and-set on an atomic byte. A request for a state
//! already reached or passed is a no-op; a request with no legal edge from
//! the current state is a bug in the caller and panics.

#![forbid(unsafe_code)]

use core::fmt;
use core::marker::PhantomData;
use std::sync::atomic::{AtomicU8, Ordering};

/// Sending part state (RFC 9000 Section 3.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SendingState {
    /// Created, nothing sent yet
    Ready = 0,

    /// Sending data
    Send = 1,

    /// All data including FIN handed to the packet assembler
    DataSent = 2,

    /// All data acknowledged (terminal)
    DataRecvd = 3,

    /// RESET_STREAM sent
    ResetSent = 4,

    /// RESET_STREAM acknowledged (terminal)
    ResetRecvd = 5,
}

impl SendingState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SendingState::DataRecvd | SendingState::ResetRecvd)
    }

    pub fn is_reset(self) -> bool {
        matches!(self, SendingState::ResetSent | SendingState::ResetRecvd)
    }

    /// Ready, Send or DataSent: the stream may still be reset.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            SendingState::Ready | SendingState::Send | SendingState::DataSent
        )
    }
}

/// Receiving part state (RFC 9000 Section 3.2)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ReceivingState {
    /// Receiving data
    Recv = 0,

    /// Final size known (FIN received)
    SizeKnown = 1,

    /// All data up to the final size received
    DataRecvd = 2,

    /// All data delivered to the application (terminal)
    DataRead = 3,

    /// RESET_STREAM received
    ResetRecvd = 4,

    /// Reset delivered to the application (terminal)
    ResetRead = 5,
}

impl ReceivingState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ReceivingState::DataRead | ReceivingState::ResetRead)
    }

    pub fn is_reset(self) -> bool {
        matches!(self, ReceivingState::ResetRecvd | ReceivingState::ResetRead)
    }

    /// Recv or SizeKnown: more data may still arrive.
    pub fn is_receiving(self) -> bool {
        matches!(self, ReceivingState::Recv | ReceivingState::SizeKnown)
    }
}

/// Composite bidirectional stream state (RFC 9000 Section 3.4)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BidiState {
    Idle,
    Open,
    HalfClosedLocal,
    HalfClosedRemote,
    Closed,
}

impl BidiState {
    /// Derive the composite state from the two halves, following the table
    /// in RFC 9000 Section 3.4.
    pub fn derive(sending: SendingState, receiving: ReceivingState) -> Self {
        use ReceivingState as R;
        use SendingState as S;

        match (sending, receiving) {
            (S::Ready, R::Recv) => BidiState::Idle,
            (S::Ready | S::Send | S::DataSent, R::Recv | R::SizeKnown) => BidiState::Open,
            (S::Ready | S::Send | S::DataSent, _) => BidiState::HalfClosedRemote,
            (S::DataRecvd | S::ResetSent | S::ResetRecvd, R::Recv | R::SizeKnown) => {
                BidiState::HalfClosedLocal
            }
            _ => BidiState::Closed,
        }
    }

    pub fn is_terminal(self) -> bool {
        self == BidiState::Closed
    }
}

/// A half reaching a terminal state, as reported to the directory and the
/// connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalState {
    Sending(SendingState),
    Receiving(ReceivingState),
}

impl fmt::Display for TerminalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminalState::Sending(s) => write!(f, "sending {:?}", s),
            TerminalState::Receiving(s) => write!(f, "receiving {:?}", s),
        }
    }
}

/// Result of a transition request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition<S> {
    /// The state changed from `from`.
    Switched { from: S },

    /// Already in or past the target state.
    Ignored { current: S },
}

impl<S> Transition<S> {
    pub fn switched(&self) -> bool {
        matches!(self, Transition::Switched { .. })
    }
}

/// Decision for one edge of a lattice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Edge {
    Switch,
    Ignore,
    Illegal,
}

/// A state lattice that can live in a [`StateCell`].
pub(crate) trait Lattice: Copy + PartialEq + fmt::Debug {
    const NAME: &'static str;

    fn to_raw(self) -> u8;
    fn from_raw(raw: u8) -> Self;
    fn edge(from: Self, to: Self) -> Edge;
}

impl Lattice for SendingState {
    const NAME: &'static str = "sending";

    fn to_raw(self) -> u8 {
        self as u8
    }

    fn from_raw(raw: u8) -> Self {
        match raw {
            0 => SendingState::Ready,
            1 => SendingState::Send,
            2 => SendingState::DataSent,
            3 => SendingState::DataRecvd,
            4 => SendingState::ResetSent,
            _ => SendingState::ResetRecvd,
        }
    }

    fn edge(from: Self, to: Self) -> Edge {
        use SendingState as S;

        match (from, to) {
            (S::Ready, S::Send) => Edge::Switch,
            (S::DataSent, S::Send) => Edge::Illegal,

            (S::Ready | S::Send, S::DataSent) => Edge::Switch,

            (S::DataSent, S::DataRecvd) => Edge::Switch,
            (S::Ready | S::Send, S::DataRecvd) => Edge::Illegal,

            (S::Ready | S::Send | S::DataSent, S::ResetSent) => Edge::Switch,

            (S::ResetSent, S::ResetRecvd) => Edge::Switch,
            (S::Ready | S::Send | S::DataSent, S::ResetRecvd) => Edge::Illegal,

            _ => Edge::Ignore,
        }
    }
}

impl Lattice for ReceivingState {
    const NAME: &'static str = "receiving";

    fn to_raw(self) -> u8 {
        self as u8
    }

    fn from_raw(raw: u8) -> Self {
        match raw {
            0 => ReceivingState::Recv,
            1 => ReceivingState::SizeKnown,
            2 => ReceivingState::DataRecvd,
            3 => ReceivingState::DataRead,
            4 => ReceivingState::ResetRecvd,
            _ => ReceivingState::ResetRead,
        }
    }

    fn edge(from: Self, to: Self) -> Edge {
        use ReceivingState as R;

        match (from, to) {
            (R::Recv, R::SizeKnown) => Edge::Switch,

            (R::Recv | R::SizeKnown, R::DataRecvd) => Edge::Switch,

            (R::DataRecvd, R::DataRead) => Edge::Switch,
            (R::Recv | R::SizeKnown, R::DataRead) => Edge::Illegal,

            (R::Recv | R::SizeKnown, R::ResetRecvd) => Edge::Switch,

            (R::ResetRecvd, R::ResetRead) => Edge::Switch,
            (R::Recv | R::SizeKnown, R::ResetRead) => Edge::Illegal,

            _ => Edge::Ignore,
        }
    }
}

/// Atomic holder of a lattice state.
pub(crate) struct StateCell<S> {
    raw: AtomicU8,
    _state: PhantomData<S>,
}

impl<S: Lattice> StateCell<S> {
    pub(crate) fn new(initial: S) -> Self {
        Self {
            raw: AtomicU8::new(initial.to_raw()),
            _state: PhantomData,
        }
    }

    pub(crate) fn get(&self) -> S {
        S::from_raw(self.raw.load(Ordering::Acquire))
    }

    /// Move to `to` if the lattice has a forward edge from the current state.
    ///
    /// # Panics
    ///
    /// If there is no legal edge from the current state to `to`.
    pub(crate) fn switch_to(&self, to: S) -> Transition<S> {
        let mut raw = self.raw.load(Ordering::Acquire);
        loop {
            let from = S::from_raw(raw);
            match S::edge(from, to) {
                Edge::Ignore => return Transition::Ignored { current: from },
                Edge::Illegal => panic!(
                    "illegal {} state transition {:?} -> {:?}",
                    S::NAME,
                    from,
                    to
                ),
                Edge::Switch => {
                    match self.raw.compare_exchange_weak(
                        raw,
                        to.to_raw(),
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => return Transition::Switched { from },
                        Err(actual) => raw = actual,
                    }
                }
            }
        }
    }
}

impl<S: Lattice> fmt::Debug for StateCell<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("StateCell").field(&self.get()).finish()
    }
}

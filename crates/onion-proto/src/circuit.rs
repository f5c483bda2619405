//! The circuit model: the per-circuit state that the relay cell engine
//! reads and mutates.
//!
//! A circuit comes in two variants.  An *origin* circuit belongs to the
//! node that built it: it carries the full list of hops with their key
//! material, and the client streams multiplexed over it.  A *transit*
//! circuit belongs to a relay somewhere along the path: it carries a
//! single pair of crypt states for each side it touches, and (at an
//! exit) the streams leaving the network.
//!
//! Circuits are created and destroyed by the handshake and close
//! protocols, which live outside this crate; the engine only consumes
//! them.

use crate::cellqueue::CellQueue;
use crate::channel::{ChanKey, ChanSide};
use crate::crypto::cell::{ClientLayer, CryptInit, HopNum, RelayCrypt, RelayCryptState};
use crate::sendme::{CircRecvWindow, CircSendWindow};
use crate::stream::StreamKey;
use crate::{Error, Result};
use onion_cell::chancell::{CircId, DestroyReason};
use onion_cell::relaycell::RelayCmd;

slotmap_careful::new_key_type! {
    /// Handle to a circuit within the engine.
    pub struct CircKey;
}

/// Which way a cell is travelling along a circuit.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[non_exhaustive]
pub enum Direction {
    /// Away from the origin, toward the exit.
    Outbound,
    /// Toward the origin.
    Inbound,
}

/// How many RELAY_EARLY cells an origin may send on one circuit.
pub const MAX_RELAY_EARLY_CELLS: u8 = 8;

/// Ring links for one side of a circuit: its position among the
/// circuits with cells pending toward one channel.
///
/// Both links are present exactly when the circuit is on that
/// channel's active ring.
#[derive(Copy, Clone, Default, Debug)]
pub(crate) struct RingLinks {
    /// The next active circuit on the channel.
    pub(crate) next: Option<CircKey>,
    /// The previous active circuit on the channel.
    pub(crate) prev: Option<CircKey>,
}

/// The state of one hop, as known at the origin.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[non_exhaustive]
pub enum HopState {
    /// The handshake with this hop has not finished yet.
    Opening,
    /// The hop is established and may carry traffic.
    Open,
    /// The hop has been abandoned (for example by truncation).
    Closed,
}

/// What a circuit is for, as far as the engine cares.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[non_exhaustive]
pub enum CircPurpose {
    /// An ordinary circuit.
    General,
    /// A transit circuit serving as one side of an established
    /// rendezvous; eligible for splicing.
    RendEstablished,
    /// An origin circuit on which a rendezvous has been joined; the
    /// one case where a BEGIN may arrive at an origin.
    RendJoined,
}

/// One hop of an origin circuit: its key material, state, and windows.
pub(crate) struct CircHop {
    /// Whether the hop is usable.
    pub(crate) state: HopState,
    /// Crypt state for cells we send toward this hop.
    pub(crate) fwd: RelayCryptState,
    /// Crypt state for cells this hop sends toward us.
    pub(crate) back: RelayCryptState,
    /// How many more cells we may package for this hop.
    pub(crate) package_window: CircSendWindow,
    /// How many more cells this hop may deliver to us.
    pub(crate) deliver_window: CircRecvWindow,
}

impl CircHop {
    /// Construct a hop from a handshake seed, in the Opening state.
    pub(crate) fn from_seed(seed: &[u8]) -> Result<Self> {
        let (fwd, back) = RelayCrypt::initialize(seed)?.split_client_layer();
        Ok(CircHop {
            state: HopState::Opening,
            fwd,
            back,
            package_window: CircSendWindow::new(),
            deliver_window: CircRecvWindow::new(),
        })
    }
}

/// State specific to an origin circuit.
pub(crate) struct OriginState {
    /// The hops of the circuit, in forward order: first hop first.
    pub(crate) hops: Vec<CircHop>,
    /// How many RELAY_EARLY cells we may still send.
    pub(crate) remaining_early: u8,
    /// The relay commands we have sent as RELAY_EARLY cells, kept for
    /// the exhaustion advisory.
    pub(crate) early_commands: Vec<RelayCmd>,
    /// The client streams attached to this circuit.
    pub(crate) streams: Vec<StreamKey>,
    /// The next stream id to hand out.
    pub(crate) next_stream_id: u16,
}

/// State specific to a transit circuit.
pub(crate) struct TransitState {
    /// The channel toward the origin.
    pub(crate) p_chan: Option<ChanKey>,
    /// Our circuit id on the channel toward the origin.
    pub(crate) p_circ_id: Option<CircId>,
    /// Cells waiting to be flushed toward the origin.
    pub(crate) p_queue: CellQueue,
    /// Whether this circuit's streams are blocked because the
    /// previous-side queue crossed its high-water mark.
    pub(crate) streams_blocked_on_p: bool,
    /// Crypt state for cells we relay toward the origin (keyed Kb/Db).
    pub(crate) inbound: RelayCryptState,
    /// Crypt state for cells arriving from the origin (keyed Kf/Df).
    pub(crate) outbound: RelayCryptState,
    /// How many more cells we may package toward the origin.
    pub(crate) package_window: CircSendWindow,
    /// How many more cells the origin may deliver to us.
    pub(crate) deliver_window: CircRecvWindow,
    /// The exit streams attached to this circuit.
    pub(crate) n_streams: Vec<StreamKey>,
    /// Exit streams still waiting on name resolution.
    pub(crate) resolving_streams: Vec<StreamKey>,
    /// A spliced rendezvous peer: cells exiting this circuit's missing
    /// next side re-enter the peer as if received from its previous
    /// side.
    pub(crate) rend_splice: Option<CircKey>,
}

/// The variant-specific part of a circuit.
pub(crate) enum CircuitKind {
    /// We are the origin of this circuit.
    Origin(OriginState),
    /// We are relaying this circuit for someone else.
    Transit(TransitState),
}

/// A circuit, as the engine sees it.
pub struct Circuit {
    /// Identifier for logging; never reused within one engine.
    pub(crate) unique_id: u64,
    /// What the circuit is for.
    pub(crate) purpose: CircPurpose,
    /// The channel away from the origin, if attached.
    pub(crate) n_chan: Option<ChanKey>,
    /// Our circuit id on the channel away from the origin.
    pub(crate) n_circ_id: Option<CircId>,
    /// Cells waiting to be flushed away from the origin.
    pub(crate) n_queue: CellQueue,
    /// Whether this circuit's streams are blocked because the
    /// next-side queue crossed its high-water mark.
    pub(crate) streams_blocked_on_n: bool,
    /// Ring links, indexed by [`ChanSide`].
    pub(crate) ring: [RingLinks; 2],
    /// Set when the circuit has been marked for close; all further
    /// cells are dropped.
    pub(crate) marked_for_close: Option<DestroyReason>,
    /// The variant-specific state.
    pub(crate) kind: CircuitKind,
}

impl Circuit {
    /// Return true if we are the origin of this circuit.
    pub fn is_origin(&self) -> bool {
        matches!(self.kind, CircuitKind::Origin(_))
    }

    /// Return the number of cells queued toward `side`.
    ///
    /// The previous side of an origin circuit has no queue.
    pub(crate) fn queue_len(&self, side: ChanSide) -> usize {
        match side {
            ChanSide::Next => self.n_queue.len(),
            ChanSide::Previous => match &self.kind {
                CircuitKind::Transit(t) => t.p_queue.len(),
                CircuitKind::Origin(_) => 0,
            },
        }
    }

    /// Return the channel attached on `side`, if any.
    pub(crate) fn chan(&self, side: ChanSide) -> Option<ChanKey> {
        match side {
            ChanSide::Next => self.n_chan,
            ChanSide::Previous => match &self.kind {
                CircuitKind::Transit(t) => t.p_chan,
                CircuitKind::Origin(_) => None,
            },
        }
    }

    /// Return which side of this circuit `chan` is attached to.
    pub(crate) fn side_of(&self, chan: ChanKey) -> Result<ChanSide> {
        if self.n_chan == Some(chan) {
            Ok(ChanSide::Next)
        } else if self.chan(ChanSide::Previous) == Some(chan) {
            Ok(ChanSide::Previous)
        } else {
            Err(Error::Internal(format!(
                "channel not attached to circuit {}",
                self.unique_id
            )))
        }
    }

    /// Return the origin-specific state, or an internal error.
    pub(crate) fn origin(&self) -> Result<&OriginState> {
        match &self.kind {
            CircuitKind::Origin(o) => Ok(o),
            CircuitKind::Transit(_) => Err(Error::Internal(format!(
                "expected an origin circuit at {}",
                self.unique_id
            ))),
        }
    }

    /// Return the origin-specific state mutably, or an internal error.
    pub(crate) fn origin_mut(&mut self) -> Result<&mut OriginState> {
        match &mut self.kind {
            CircuitKind::Origin(o) => Ok(o),
            CircuitKind::Transit(_) => Err(Error::Internal(format!(
                "expected an origin circuit at {}",
                self.unique_id
            ))),
        }
    }

    /// Return the transit-specific state, or an internal error.
    pub(crate) fn transit(&self) -> Result<&TransitState> {
        match &self.kind {
            CircuitKind::Transit(t) => Ok(t),
            CircuitKind::Origin(_) => Err(Error::Internal(format!(
                "expected a transit circuit at {}",
                self.unique_id
            ))),
        }
    }

    /// Return the transit-specific state mutably, or an internal error.
    pub(crate) fn transit_mut(&mut self) -> Result<&mut TransitState> {
        match &mut self.kind {
            CircuitKind::Transit(t) => Ok(t),
            CircuitKind::Origin(_) => Err(Error::Internal(format!(
                "expected a transit circuit at {}",
                self.unique_id
            ))),
        }
    }

    /// Return a hop of an origin circuit, mutably.
    pub(crate) fn hop_mut(&mut self, hop: HopNum) -> Result<&mut CircHop> {
        let unique_id = self.unique_id;
        self.origin_mut()?
            .hops
            .get_mut(usize::from(hop))
            .ok_or(Error::NoSuchHop)
            .map_err(|e| {
                tracing::warn!("no hop {} on circuit {}", hop.display(), unique_id);
                e
            })
    }
}

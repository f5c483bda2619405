//! Cells as they are transmitted over a channel.
//!
//! A 'channel' is a direct transport connection between two adjacent
//! relays, or between a client and its first relay.  This module
//! implements the [`Cell`] type: the fixed-size encoding sent over a
//! channel, made of a circuit identifier, a command, and a 509-byte
//! body.

use crate::{Error, Result};
use caret::caret_int;
use std::num::NonZeroU16;

/// The amount of data sent in a fixed-length cell.
///
/// Cells are 512 bytes long once the circuit id and command are added.
pub const CELL_DATA_LEN: usize = 509;

/// The length of a cell as it appears on the wire: a two-byte circuit
/// id, a one-byte command, and [`CELL_DATA_LEN`] bytes of body.
///
/// (A later link protocol variant widens the circuit id to four bytes;
/// dispatching on that variant belongs to the transport layer, not
/// here.)
pub const CELL_NETWORK_LEN: usize = 512;

/// A cell body considered as a raw array of bytes.
pub type RawCellBody = [u8; CELL_DATA_LEN];

/// A [`RawCellBody`] stored on the heap.
///
/// We use this often to avoid copying cell bodies around.
pub type BoxedCellBody = Box<RawCellBody>;

/// Channel-local identifier for a circuit.
///
/// Cannot be zero. For an "optional" circuit ID, use `Option<CircId>`.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Hash)]
pub struct CircId(NonZeroU16);

impl From<NonZeroU16> for CircId {
    fn from(item: NonZeroU16) -> Self {
        Self(item)
    }
}
impl From<CircId> for u16 {
    fn from(id: CircId) -> u16 {
        id.0.get()
    }
}
impl std::fmt::Display for CircId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::result::Result<(), std::fmt::Error> {
        self.0.fmt(f)
    }
}
impl CircId {
    /// Creates a `CircId` for non-zero `val`.
    ///
    /// Returns `None` when `val` is zero.  Cells with a zero circuit id
    /// apply to the channel as a whole.
    pub fn new(val: u16) -> Option<Self> {
        NonZeroU16::new(val).map(Self)
    }

    /// Convenience function to convert to a `u16`; `None` is mapped to 0.
    pub fn get_or_zero(circ_id: Option<Self>) -> u16 {
        match circ_id {
            Some(circ_id) => circ_id.0.get(),
            None => 0,
        }
    }
}

caret_int! {
    /// A ChanCmd is the type of a channel cell.  The value of the ChanCmd
    /// indicates the meaning of the cell, and (possibly) its length.
    pub struct ChanCmd(u8) {
        /// A fixed-length cell that will be dropped.
        PADDING = 0,
        /// Create a new circuit (obsolete format)
        CREATE = 1,
        /// Finish circuit-creation handshake (obsolete format)
        CREATED = 2,
        /// Relay cell, transmitted over a circuit.
        RELAY = 3,
        /// Destroy a circuit
        DESTROY = 4,
        /// Create a new circuit (no public-key)
        CREATE_FAST = 5,
        /// Finish a circuit-creation handshake (no public-key)
        CREATED_FAST = 6,
        /// Negotiate versions (variable-length despite its number)
        VERSIONS = 7,
        /// Finish a channel handshake with time and address information
        NETINFO = 8,
        /// Relay cell, transmitted over a circuit.  Limited.
        RELAY_EARLY = 9,
    }
}

impl ChanCmd {
    /// Return true if this command carries a relay cell that the relay
    /// cell engine should handle.
    pub fn is_relay(self) -> bool {
        self == ChanCmd::RELAY || self == ChanCmd::RELAY_EARLY
    }
}

caret_int! {
    /// A declared reason for tearing down a circuit.
    ///
    /// These appear in DESTROY cells and in the payload of TRUNCATED
    /// relay messages.
    pub struct DestroyReason(u8) {
        /// No reason given.
        ///
        /// (This is the only reason that clients send.)
        NONE = 0,
        /// Protocol violation
        PROTOCOL = 1,
        /// Internal error.
        INTERNAL = 2,
        /// Client sent a TRUNCATE command.
        REQUESTED = 3,
        /// Relay is hibernating and not accepting requests
        HIBERNATING = 4,
        /// Ran out of memory, sockets, or circuit IDs
        RESOURCELIMIT = 5,
        /// Couldn't connect to relay.
        CONNECTFAILED = 6,
        /// Connected to a relay, but its OR identity was not as expected.
        OR_IDENTITY = 7,
        /// One of the OR channels carrying this circuit died.
        CHANNEL_CLOSED = 8,
        /// Circuit expired for being too dirty or old
        FINISHED = 9,
        /// Circuit construction took too long
        TIMEOUT = 10,
        /// Circuit was destroyed without client truncate
        DESTROYED = 11,
        /// Request for an unknown hidden service
        NOSUCHSERVICE = 12,
    }
}

/// A cell joined with its circuit id and command, ready to be packed
/// onto (or just unpacked from) a channel.
#[derive(Clone, Debug)]
pub struct Cell {
    /// Which circuit on the channel this cell belongs to.
    circid: CircId,
    /// The command byte that tells the recipient what to do with the body.
    cmd: ChanCmd,
    /// The cell body.
    body: BoxedCellBody,
}

impl Cell {
    /// Construct a new cell.
    pub fn new(circid: CircId, cmd: ChanCmd, body: BoxedCellBody) -> Self {
        Cell { circid, cmd, body }
    }

    /// Return the circuit id for this cell.
    pub fn circid(&self) -> CircId {
        self.circid
    }
    /// Replace the circuit id on this cell.
    ///
    /// Used when forwarding: the id is channel-local, so a cell changes
    /// id every time it crosses a relay.
    pub fn set_circid(&mut self, circid: CircId) {
        self.circid = circid;
    }
    /// Return this cell's command.
    pub fn cmd(&self) -> ChanCmd {
        self.cmd
    }
    /// Replace this cell's command.
    pub fn set_cmd(&mut self, cmd: ChanCmd) {
        self.cmd = cmd;
    }
    /// Return a reference to the cell body.
    pub fn body(&self) -> &RawCellBody {
        &self.body
    }
    /// Return a mutable reference to the cell body.
    pub fn body_mut(&mut self) -> &mut RawCellBody {
        &mut self.body
    }
    /// Consume this cell and return its body.
    pub fn into_body(self) -> BoxedCellBody {
        self.body
    }

    /// Encode this cell into its wire image.
    pub fn pack(&self) -> [u8; CELL_NETWORK_LEN] {
        let mut wire = [0_u8; CELL_NETWORK_LEN];
        wire[0..2].copy_from_slice(&u16::from(self.circid).to_be_bytes());
        wire[2] = self.cmd.into();
        wire[3..].copy_from_slice(&self.body[..]);
        wire
    }

    /// Decode a cell from its wire image.
    ///
    /// Fails if the input is shorter than a cell, or if the circuit id
    /// is zero: cells without a circuit id never reach the relay cell
    /// engine.
    pub fn unpack(wire: &[u8]) -> Result<Self> {
        if wire.len() < CELL_NETWORK_LEN {
            return Err(Error::Truncated {
                wanted: CELL_NETWORK_LEN,
                have: wire.len(),
            });
        }
        let circid = CircId::new(u16::from_be_bytes([wire[0], wire[1]])).ok_or(Error::MissingCircId)?;
        let cmd: ChanCmd = wire[2].into();
        let mut body: BoxedCellBody = Box::new([0_u8; CELL_DATA_LEN]);
        body.copy_from_slice(&wire[3..CELL_NETWORK_LEN]);
        Ok(Cell { circid, cmd, body })
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;

    fn circid(n: u16) -> CircId {
        CircId::new(n).unwrap()
    }

    #[test]
    fn cell_roundtrip() {
        let mut body: BoxedCellBody = Box::new([0_u8; CELL_DATA_LEN]);
        body[0] = 2;
        body[508] = 77;
        let cell = Cell::new(circid(0x2021), ChanCmd::RELAY, body);
        let wire = cell.pack();
        assert_eq!(wire[0..3], [0x20, 0x21, 3]);
        let back = Cell::unpack(&wire).unwrap();
        assert_eq!(back.circid(), circid(0x2021));
        assert_eq!(back.cmd(), ChanCmd::RELAY);
        assert_eq!(back.body()[..], cell.body()[..]);
    }

    #[test]
    fn bad_unpack() {
        assert!(matches!(
            Cell::unpack(&[0_u8; 100]),
            Err(Error::Truncated { .. })
        ));
        // Zero circuit id is rejected.
        let wire = [0_u8; CELL_NETWORK_LEN];
        assert!(matches!(Cell::unpack(&wire), Err(Error::MissingCircId)));
    }

    #[test]
    fn relay_cmds() {
        assert!(ChanCmd::RELAY.is_relay());
        assert!(ChanCmd::RELAY_EARLY.is_relay());
        assert!(!ChanCmd::DESTROY.is_relay());
        assert_eq!(format!("{}", ChanCmd::RELAY_EARLY), "RELAY_EARLY");
        let unknown: ChanCmd = 200.into();
        assert!(!unknown.is_recognized());
    }
}

//! Implementation for parsing and encoding relay cells.
//!
//! A relay cell is the end-to-end unit carried in the body of a RELAY
//! or RELAY_EARLY channel cell.  Its first eleven bytes are the *relay
//! header*; the rest is a command-specific message body followed by
//! padding.

use crate::{Error, Result};
use caret::caret_int;
use std::num::NonZeroU16;

pub mod msg;

/// Number of bytes in a relay header.
pub const RELAY_HEADER_LEN: usize = 11;

/// Longest allowable relay message body: a cell body minus the relay
/// header.
pub const RELAY_PAYLOAD_LEN: usize = crate::chancell::CELL_DATA_LEN - RELAY_HEADER_LEN;

caret_int! {
    /// A command that identifies the type of a relay cell
    pub struct RelayCmd(u8) {
        /// Start a new stream
        BEGIN = 1,
        /// Data on a stream
        DATA = 2,
        /// Close a stream
        END = 3,
        /// Acknowledge a BEGIN; stream is open
        CONNECTED = 4,
        /// Used for flow control
        SENDME = 5,
        /// Extend a circuit to a new hop
        EXTEND = 6,
        /// Reply to EXTEND handshake
        EXTENDED = 7,
        /// Partially close a circuit
        TRUNCATE = 8,
        /// Circuit has been partially closed
        TRUNCATED = 9,
        /// Padding cell
        DROP = 10,
        /// Start a DNS lookup
        RESOLVE = 11,
        /// Reply to a DNS lookup
        RESOLVED = 12,
        /// Start a directory stream
        BEGIN_DIR = 13,

        /// HS: establish an introduction point.
        ESTABLISH_INTRO = 32,
        /// HS: establish a rendezvous point.
        ESTABLISH_RENDEZVOUS = 33,
        /// HS: send introduction (client to introduction point)
        INTRODUCE1 = 34,
        /// HS: send introduction (introduction point to service)
        INTRODUCE2 = 35,
        /// HS: connect rendezvous point (service to rendezvous point)
        RENDEZVOUS1 = 36,
        /// HS: connect rendezvous point (rendezvous point to client)
        RENDEZVOUS2 = 37,
        /// HS: Response to ESTABLISH_INTRO
        INTRO_ESTABLISHED = 38,
        /// HS: Response to ESTABLISH_RENDEZVOUS
        RENDEZVOUS_ESTABLISHED = 39,
        /// HS: Response to INTRODUCE1 from introduction point to client
        INTRODUCE_ACK = 40,
    }
}

/// Possible requirements on stream IDs for a relay command.
enum StreamIdReq {
    /// Can only be used with a stream ID of 0.
    WantNone,
    /// Can only be used with a stream ID that isn't 0.
    WantSome,
    /// Can be used with any stream ID.
    Any,
    /// Unrecognized; might be used with a stream ID or without.
    Unrecognized,
}

impl RelayCmd {
    /// Check whether this command requires a certain kind of stream ID.
    fn expects_streamid(self) -> StreamIdReq {
        match self {
            RelayCmd::BEGIN
            | RelayCmd::DATA
            | RelayCmd::END
            | RelayCmd::CONNECTED
            | RelayCmd::RESOLVE
            | RelayCmd::RESOLVED
            | RelayCmd::BEGIN_DIR => StreamIdReq::WantSome,
            RelayCmd::EXTEND
            | RelayCmd::EXTENDED
            | RelayCmd::TRUNCATE
            | RelayCmd::TRUNCATED
            | RelayCmd::DROP
            | RelayCmd::ESTABLISH_INTRO
            | RelayCmd::ESTABLISH_RENDEZVOUS
            | RelayCmd::INTRODUCE1
            | RelayCmd::INTRODUCE2
            | RelayCmd::RENDEZVOUS1
            | RelayCmd::RENDEZVOUS2
            | RelayCmd::INTRO_ESTABLISHED
            | RelayCmd::RENDEZVOUS_ESTABLISHED
            | RelayCmd::INTRODUCE_ACK => StreamIdReq::WantNone,
            RelayCmd::SENDME => StreamIdReq::Any,
            _ => StreamIdReq::Unrecognized,
        }
    }
    /// Return true if this command is one that accepts the particular
    /// stream ID `id`.
    pub fn accepts_streamid_val(self, id: Option<StreamId>) -> bool {
        match self.expects_streamid() {
            StreamIdReq::WantNone => id.is_none(),
            StreamIdReq::WantSome => id.is_some(),
            StreamIdReq::Any => true,
            StreamIdReq::Unrecognized => true,
        }
    }
}

/// Identify a single stream on a circuit.
///
/// These identifiers are local to each hop on a circuit.  This can't be
/// zero; if you need something that can be zero in the protocol, use
/// `Option<StreamId>`.
#[derive(Copy, Clone, PartialEq, Eq, Ord, PartialOrd, Debug, Hash)]
pub struct StreamId(NonZeroU16);

impl From<NonZeroU16> for StreamId {
    fn from(id: NonZeroU16) -> Self {
        Self(id)
    }
}

impl From<StreamId> for NonZeroU16 {
    fn from(id: StreamId) -> NonZeroU16 {
        id.0
    }
}

impl From<StreamId> for u16 {
    fn from(id: StreamId) -> u16 {
        id.0.get()
    }
}

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::result::Result<(), std::fmt::Error> {
        self.0.fmt(f)
    }
}

impl StreamId {
    /// Creates a `StreamId` for non-zero `stream_id`.
    ///
    /// Returns `None` when `stream_id` is zero.  Messages with a
    /// zero/None stream ID apply to the circuit as a whole instead of a
    /// particular stream.
    pub fn new(stream_id: u16) -> Option<Self> {
        NonZeroU16::new(stream_id).map(Self)
    }

    /// Convenience function to convert to a `u16`; `None` is mapped to 0.
    pub fn get_or_zero(stream_id: Option<Self>) -> u16 {
        match stream_id {
            Some(stream_id) => stream_id.0.get(),
            None => 0,
        }
    }
}

/// The parsed header of a relay cell.
///
/// Fields are big-endian on the wire, in this order: `command` (u8),
/// `recognized` (u16), `stream_id` (u16), `integrity` (4 bytes of
/// running digest), `length` (u16).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RelayHeader {
    /// The relay command.
    pub cmd: RelayCmd,
    /// The "recognized" field.  Zero on every cell as sent; zero after
    /// decryption is a necessary (but not sufficient) sign that the
    /// cell is addressed to us.
    pub recognized: u16,
    /// The stream this cell applies to, or None for a circuit-level
    /// (control) cell.
    pub stream_id: Option<StreamId>,
    /// Four bytes of the sender's running digest, used to authenticate
    /// delivery.
    pub integrity: [u8; 4],
    /// Number of meaningful bytes in the message body.
    pub length: u16,
}

impl RelayHeader {
    /// Create a header for a fresh outgoing message: recognized and
    /// integrity are zero until the crypto layer fills them in.
    pub fn new(cmd: RelayCmd, stream_id: Option<StreamId>, length: u16) -> Self {
        RelayHeader {
            cmd,
            recognized: 0,
            stream_id,
            integrity: [0_u8; 4],
            length,
        }
    }

    /// Encode this header into the first [`RELAY_HEADER_LEN`] bytes of
    /// `out`.
    ///
    /// Pure and allocation-free; fails only if `out` is too short.
    pub fn pack(&self, out: &mut [u8]) -> Result<()> {
        if out.len() < RELAY_HEADER_LEN {
            return Err(Error::Truncated {
                wanted: RELAY_HEADER_LEN,
                have: out.len(),
            });
        }
        out[0] = self.cmd.into();
        out[1..3].copy_from_slice(&self.recognized.to_be_bytes());
        out[3..5].copy_from_slice(&StreamId::get_or_zero(self.stream_id).to_be_bytes());
        out[5..9].copy_from_slice(&self.integrity);
        out[9..11].copy_from_slice(&self.length.to_be_bytes());
        Ok(())
    }

    /// Decode a header from the first [`RELAY_HEADER_LEN`] bytes of
    /// `buf`.
    ///
    /// Rejects buffers shorter than a header, and length fields that
    /// exceed [`RELAY_PAYLOAD_LEN`].
    pub fn unpack(buf: &[u8]) -> Result<Self> {
        if buf.len() < RELAY_HEADER_LEN {
            return Err(Error::Truncated {
                wanted: RELAY_HEADER_LEN,
                have: buf.len(),
            });
        }
        let length = u16::from_be_bytes([buf[9], buf[10]]);
        if usize::from(length) > RELAY_PAYLOAD_LEN {
            return Err(Error::BadLength);
        }
        let mut integrity = [0_u8; 4];
        integrity.copy_from_slice(&buf[5..9]);
        Ok(RelayHeader {
            cmd: buf[0].into(),
            recognized: u16::from_be_bytes([buf[1], buf[2]]),
            stream_id: StreamId::new(u16::from_be_bytes([buf[3], buf[4]])),
            integrity,
            length,
        })
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use hex_literal::hex;

    #[test]
    fn header_roundtrip() {
        let hdr = RelayHeader {
            cmd: RelayCmd::DATA,
            recognized: 0,
            stream_id: StreamId::new(0x0103),
            integrity: [0xde, 0xad, 0xbe, 0xef],
            length: 498,
        };
        let mut buf = [0_u8; RELAY_HEADER_LEN];
        hdr.pack(&mut buf).unwrap();
        assert_eq!(buf, hex!("02 0000 0103 deadbeef 01f2"));
        assert_eq!(RelayHeader::unpack(&buf).unwrap(), hdr);
    }

    #[test]
    fn header_roundtrip_boundaries() {
        // Both length == 0 and length == RELAY_PAYLOAD_LEN round-trip.
        for length in [0_u16, RELAY_PAYLOAD_LEN as u16] {
            let hdr = RelayHeader::new(RelayCmd::SENDME, None, length);
            let mut buf = [0_u8; RELAY_HEADER_LEN];
            hdr.pack(&mut buf).unwrap();
            assert_eq!(RelayHeader::unpack(&buf).unwrap(), hdr);
        }
    }

    #[test]
    fn header_rejects_short_and_long() {
        let buf = [0_u8; RELAY_HEADER_LEN - 1];
        assert!(matches!(
            RelayHeader::unpack(&buf),
            Err(Error::Truncated { .. })
        ));

        let mut buf = [0_u8; RELAY_HEADER_LEN];
        RelayHeader::new(RelayCmd::DATA, StreamId::new(7), 0)
            .pack(&mut buf)
            .unwrap();
        buf[9..11].copy_from_slice(&499_u16.to_be_bytes());
        assert!(matches!(RelayHeader::unpack(&buf), Err(Error::BadLength)));

        let mut short = [0_u8; 4];
        assert!(matches!(
            RelayHeader::new(RelayCmd::DATA, StreamId::new(7), 0).pack(&mut short),
            Err(Error::Truncated { .. })
        ));
    }

    #[test]
    fn streamid_expectations() {
        assert!(RelayCmd::DATA.accepts_streamid_val(StreamId::new(2)));
        assert!(!RelayCmd::DATA.accepts_streamid_val(None));
        assert!(RelayCmd::EXTEND.accepts_streamid_val(None));
        assert!(!RelayCmd::EXTEND.accepts_streamid_val(StreamId::new(2)));
        // SENDME is both a circuit-level and a stream-level message.
        assert!(RelayCmd::SENDME.accepts_streamid_val(None));
        assert!(RelayCmd::SENDME.accepts_streamid_val(StreamId::new(2)));
        // Unknown commands might do either.
        let unknown: RelayCmd = 77.into();
        assert!(unknown.accepts_streamid_val(None));
        assert!(unknown.accepts_streamid_val(StreamId::new(2)));
    }
}

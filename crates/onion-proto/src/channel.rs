//! The channel model: what the engine knows about one transport
//! connection.
//!
//! The transport itself (TLS, framing, readiness) lives outside this
//! crate.  Here a channel is a link protocol version, an output buffer
//! that the transport drains, and the head of the active-circuit ring
//! that the scheduler walks.

use bytes::{Bytes, BytesMut};

slotmap_careful::new_key_type! {
    /// Handle to a channel within the engine.
    pub struct ChanKey;
}

/// Which side of a circuit a channel is attached to.
///
/// Used to index the per-circuit ring links and queues.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[non_exhaustive]
pub enum ChanSide {
    /// The channel leading away from the origin.
    Next,
    /// The channel leading toward the origin.
    Previous,
}

impl ChanSide {
    /// Index of this side in per-circuit arrays.
    pub(crate) fn idx(self) -> usize {
        match self {
            ChanSide::Next => 0,
            ChanSide::Previous => 1,
        }
    }
}

/// A transport connection, as the engine sees it.
pub struct Channel {
    /// The negotiated link protocol version.  Versions before 2 do not
    /// understand RELAY_EARLY.
    pub(crate) link_proto: u16,
    /// Bytes waiting for the transport to write out.
    pub(crate) outbuf: BytesMut,
    /// Head of the ring of circuits with cells pending toward this
    /// channel, or None when no circuit is active.
    pub(crate) active_head: Option<crate::circuit::CircKey>,
    /// When we last flushed cells onto the outbuf, in engine time.
    pub(crate) last_flush_at: Option<u64>,
}

impl Channel {
    /// Create a channel with the given negotiated link protocol
    /// version.
    pub(crate) fn new(link_proto: u16) -> Self {
        Channel {
            link_proto,
            outbuf: BytesMut::new(),
            active_head: None,
            last_flush_at: None,
        }
    }

    /// Number of bytes waiting to be written to the transport.
    pub fn outbuf_len(&self) -> usize {
        self.outbuf.len()
    }

    /// Take everything waiting to be written to the transport.
    ///
    /// The transport collaborator calls this when the connection is
    /// writable.
    pub(crate) fn take_outbuf(&mut self) -> Bytes {
        self.outbuf.split().freeze()
    }
}

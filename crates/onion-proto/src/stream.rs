//! The edge-stream model: one application byte-conduit multiplexed
//! onto a circuit.
//!
//! On the origin side a stream belongs to a client request (a SOCKS
//! connect, a resolve, or a directory fetch) and is tied to one hop of
//! the circuit.  On the exit side a stream is a connection leaving the
//! network, created by the exit collaborator in response to a BEGIN.
//! Either way the engine owns the stream's flow-control state and its
//! buffered bytes; the actual socket lives with the edge collaborator,
//! which is told when to start and stop reading.

use crate::circuit::CircKey;
use crate::crypto::cell::HopNum;
use crate::sendme::{StreamRecvWindow, StreamSendWindow};
use bytes::BytesMut;
use onion_cell::relaycell::msg::EndReason;
use onion_cell::relaycell::StreamId;

slotmap_careful::new_key_type! {
    /// Handle to an edge stream within the engine.
    pub struct StreamKey;
}

/// The connection state of a stream.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[non_exhaustive]
pub enum StreamState {
    /// Origin side: we sent a BEGIN and await a CONNECTED.
    ConnectWait,
    /// Origin side: we sent a RESOLVE and await a RESOLVED.
    ResolveWait,
    /// The stream is open and may carry data.
    Open,
}

/// What kind of request a client stream is for.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[non_exhaustive]
pub enum RequestKind {
    /// An ordinary connect request.
    Connect,
    /// A name-resolution request.
    Resolve,
    /// A directory fetch.
    Dir,
}

/// The request a client stream was created for.
#[derive(Clone, Debug)]
pub struct StreamRequest {
    /// The target address, as the application named it.
    pub addr: String,
    /// The target port.
    pub port: u16,
    /// What the application asked for.
    pub kind: RequestKind,
    /// A specific exit the application insisted on, if any.
    pub chosen_exit: Option<String>,
    /// Whether the chosen exit was merely a preference.
    pub chosen_exit_optional: bool,
    /// Retries left on the chosen exit.
    pub chosen_exit_retries: u32,
}

impl StreamRequest {
    /// Create a request with no exit preference.
    pub fn new(addr: impl Into<String>, port: u16, kind: RequestKind) -> Self {
        StreamRequest {
            addr: addr.into(),
            port,
            kind,
            chosen_exit: None,
            chosen_exit_optional: false,
            chosen_exit_retries: 0,
        }
    }
}

/// An edge stream, as the engine sees it.
pub struct Stream {
    /// The stream's id, unique on its circuit.
    pub(crate) id: StreamId,
    /// The circuit the stream is multiplexed onto.
    pub(crate) circ: CircKey,
    /// Origin side: the hop the stream exits at.  None on the exit
    /// side.
    pub(crate) hop: Option<HopNum>,
    /// Where the stream is in its life cycle.
    pub(crate) state: StreamState,
    /// True for origin-side client streams; false for exit streams.
    pub(crate) is_client: bool,
    /// True for streams that serve a rendezvous: they may receive
    /// "outbound" cells even on the exit side.
    pub(crate) is_rendezvous: bool,
    /// How many more DATA cells we may package from this stream.
    pub(crate) package_window: StreamSendWindow,
    /// How many more DATA cells the far end may deliver to it.
    pub(crate) deliver_window: StreamRecvWindow,
    /// Bytes read from the edge, waiting to be packaged.
    pub(crate) inbuf: BytesMut,
    /// Bytes delivered from the circuit, waiting for the edge to
    /// drain.
    pub(crate) outbuf: BytesMut,
    /// Whether the edge reader is currently armed.
    pub(crate) reading: bool,
    /// False for placeholder streams (for example pending DNS
    /// requests) that have nothing to read from.
    pub(crate) has_reader: bool,
    /// Whether the stream is blocked because a circuit queue crossed
    /// its high-water mark.
    pub(crate) blocked_on_circ: bool,
    /// Whether we already sent (or received) an END for this stream.
    pub(crate) has_sent_end: bool,
    /// The reason the stream ended, once known.
    pub(crate) end_reason: Option<EndReason>,
    /// Whether the end reason came from the far end.
    pub(crate) end_was_remote: bool,
    /// Whether the stream has been marked for close.
    pub(crate) marked_for_close: bool,
    /// Keep the stream open until its outbuf has drained.
    pub(crate) hold_open_until_flushed: bool,
    /// Origin side: whether the SOCKS layer has been answered.
    pub(crate) socks_replied: bool,
    /// Whether the stream has been detached from its circuit for
    /// reattachment elsewhere.
    pub(crate) detached: bool,
    /// The client request behind this stream, origin side only.
    pub(crate) request: Option<StreamRequest>,
}

impl Stream {
    /// Create a client stream in its initial wait state.
    pub(crate) fn new_client(
        id: StreamId,
        circ: CircKey,
        hop: HopNum,
        request: StreamRequest,
    ) -> Self {
        let state = match request.kind {
            RequestKind::Resolve => StreamState::ResolveWait,
            _ => StreamState::ConnectWait,
        };
        Stream {
            id,
            circ,
            hop: Some(hop),
            state,
            is_client: true,
            is_rendezvous: false,
            package_window: StreamSendWindow::new(),
            deliver_window: StreamRecvWindow::new(),
            inbuf: BytesMut::new(),
            outbuf: BytesMut::new(),
            reading: false,
            has_reader: request.kind != RequestKind::Resolve,
            blocked_on_circ: false,
            has_sent_end: false,
            end_reason: None,
            end_was_remote: false,
            marked_for_close: false,
            hold_open_until_flushed: false,
            socks_replied: false,
            detached: false,
            request: Some(request),
        }
    }

    /// Create an exit stream.
    ///
    /// A resolving stream is a placeholder with no reader; it exists
    /// only so that a RESOLVED can be addressed back to the right
    /// stream id.
    pub(crate) fn new_exit(id: StreamId, circ: CircKey, resolving: bool) -> Self {
        Stream {
            id,
            circ,
            hop: None,
            state: if resolving {
                StreamState::ResolveWait
            } else {
                StreamState::Open
            },
            is_client: false,
            is_rendezvous: false,
            package_window: StreamSendWindow::new(),
            deliver_window: StreamRecvWindow::new(),
            inbuf: BytesMut::new(),
            outbuf: BytesMut::new(),
            reading: false,
            has_reader: !resolving,
            blocked_on_circ: false,
            has_sent_end: false,
            end_reason: None,
            end_was_remote: false,
            marked_for_close: false,
            hold_open_until_flushed: false,
            socks_replied: false,
            detached: false,
            request: None,
        }
    }

    /// The stream's id on its circuit.
    pub fn id(&self) -> StreamId {
        self.id
    }
    /// The stream's state.
    pub fn state(&self) -> StreamState {
        self.state
    }
    /// Whether the edge reader is currently armed.
    pub fn is_reading(&self) -> bool {
        self.reading
    }
    /// Whether the stream has been marked for close.
    pub fn is_marked_for_close(&self) -> bool {
        self.marked_for_close
    }
    /// The reason the stream ended, if it has.
    pub fn end_reason(&self) -> Option<EndReason> {
        self.end_reason
    }
    /// Whether the end reason came from the far end.
    pub fn end_was_remote(&self) -> bool {
        self.end_was_remote
    }
    /// Number of bytes delivered from the circuit and not yet drained
    /// by the edge.
    pub fn outbuf_len(&self) -> usize {
        self.outbuf.len()
    }
}

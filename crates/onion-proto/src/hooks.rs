//! The seam between the relay cell engine and its collaborators.
//!
//! The engine never opens sockets, resolves names, builds circuits, or
//! answers SOCKS requests; it dispatches those jobs through
//! [`EngineHooks`].  Every method has a default implementation that
//! does nothing (or declines), so tests and partial deployments can
//! implement only the parts they care about.
//!
//! Reader control is edge-triggered: [`EngineHooks::edge_start_reading`]
//! and [`EngineHooks::edge_stop_reading`] fire only on transitions, and
//! the transport is expected to arm or disarm the edge socket in
//! response.

use crate::channel::ChanKey;
use crate::circuit::CircKey;
use crate::crypto::cell::HopNum;
use crate::stream::StreamKey;
use crate::Result;
use onion_cell::chancell::{Cell, CircId, DestroyReason};
use onion_cell::relaycell::msg::{EndReason, Resolved};
use onion_cell::relaycell::RelayCmd;
use std::net::IpAddr;

/// The collaborators of the relay cell engine, as one trait.
pub trait EngineHooks {
    /// A BEGIN (or BEGIN_DIR) arrived for an unused stream id: create
    /// an exit stream.
    ///
    /// The implementation is expected to parse the BEGIN body, apply
    /// exit policy, and attach a stream to the circuit via the
    /// reactor's exit-stream API.
    fn exit_begin_conn(&mut self, circ: CircKey, cell: &Cell) -> Result<()> {
        let _ = (circ, cell);
        Ok(())
    }

    /// A RESOLVE arrived: start a name resolution.
    fn exit_begin_resolve(&mut self, circ: CircKey, cell: &Cell) -> Result<()> {
        let _ = (circ, cell);
        Ok(())
    }

    /// An EXTEND arrived at a transit circuit: extend the circuit to a
    /// new hop.
    fn circuit_extend(&mut self, circ: CircKey, cell: &Cell) -> Result<()> {
        let _ = (circ, cell);
        Ok(())
    }

    /// An EXTENDED arrived at the origin: finish the pending handshake
    /// for the newest hop.
    fn circuit_finish_handshake(&mut self, circ: CircKey, payload: &[u8]) -> Result<()> {
        let _ = (circ, payload);
        Ok(())
    }

    /// Called after a handshake completes, to continue building the
    /// circuit.
    fn circuit_send_next_onion_skin(&mut self, circ: CircKey) -> Result<()> {
        let _ = circ;
        Ok(())
    }

    /// A TRUNCATED arrived at the origin: the circuit now ends at
    /// `hop`.
    fn circuit_truncated(&mut self, circ: CircKey, hop: HopNum) {
        let _ = (circ, hop);
    }

    /// A hidden-service command arrived; it is the rendezvous
    /// collaborator's to interpret.
    fn rendezvous_cell(&mut self, circ: CircKey, hop: Option<HopNum>, cmd: RelayCmd, body: &[u8]) {
        let _ = (circ, hop, cmd, body);
    }

    /// Send a DESTROY for `circ_id` on `chan` (used when handling
    /// TRUNCATE).
    fn send_destroy(&mut self, chan: ChanKey, circ_id: CircId, reason: DestroyReason) {
        let _ = (chan, circ_id, reason);
    }

    /// Detach a stream from its circuit so it can be reattached
    /// elsewhere.  Return true on success; on false the engine closes
    /// the stream instead.
    fn detach_retriable(&mut self, stream: StreamKey, circ: CircKey, reason: EndReason) -> bool {
        let _ = (stream, circ, reason);
        false
    }

    /// Close a client stream that never got attached (or must be
    /// given up on), reporting `reason` to the application.
    fn mark_unattached(&mut self, stream: StreamKey, reason: EndReason) {
        let _ = (stream, reason);
    }

    /// Answer the SOCKS layer: the stream is connected.
    fn socks_reply_connected(&mut self, stream: StreamKey) {
        let _ = stream;
    }

    /// Answer the SOCKS layer with a resolution result.
    fn socks_resolved(&mut self, stream: StreamKey, answer: &Resolved) {
        let _ = (stream, answer);
    }

    /// Answer the SOCKS layer with a transient resolution error (used
    /// when a RESOLVED answer is rejected by policy).
    fn socks_resolve_error(&mut self, stream: StreamKey) {
        let _ = stream;
    }

    /// The stream's target was remapped to a concrete address learned
    /// from the exit.
    fn stream_remapped(&mut self, stream: StreamKey, addr: IpAddr) {
        let _ = (stream, addr);
    }

    /// A directory stream finished connecting; a bootstrap milestone
    /// may be due.
    fn dir_stream_connected(&mut self, stream: StreamKey) {
        let _ = stream;
    }

    /// Whether addresses resolving to internal networks should be
    /// rejected.
    fn reject_internal_addresses(&self) -> bool {
        true
    }

    /// Return true if `addr` is an internal (non-routable) address.
    fn is_internal_address(&self, addr: IpAddr) -> bool {
        match addr {
            IpAddr::V4(a) => {
                a.is_unspecified()
                    || a.is_loopback()
                    || a.is_private()
                    || a.is_link_local()
                    || a.is_broadcast()
            }
            IpAddr::V6(a) => a.is_unspecified() || a.is_loopback(),
        }
    }

    /// Record a learned address mapping in the client DNS cache.
    fn dns_set_addressmap(
        &mut self,
        addr: &str,
        resolved: IpAddr,
        exit: Option<&str>,
        ttl: Option<u32>,
    ) {
        let _ = (addr, resolved, exit, ttl);
    }

    /// Bump and return the failure counter for resolving or reaching
    /// `addr`.
    fn dns_incr_failures(&mut self, addr: &str) -> u32 {
        let _ = addr;
        0
    }

    /// Clear the failure counter for `addr`, giving it a full set of
    /// retries next time.
    fn dns_clear_failures(&mut self, addr: &str) {
        let _ = addr;
    }

    /// Penalize the exit serving `circ`: treat its exit policy as
    /// reject-all until we learn better.
    fn exitpolicy_reject_all(&mut self, circ: CircKey) {
        let _ = circ;
    }

    /// Arm the edge reader for `stream`.  Edge-triggered.
    fn edge_start_reading(&mut self, stream: StreamKey) {
        let _ = stream;
    }

    /// Disarm the edge reader for `stream`.  Edge-triggered.
    fn edge_stop_reading(&mut self, stream: StreamKey) {
        let _ = stream;
    }
}

/// An [`EngineHooks`] that takes every default: declines every retry,
/// performs no side effects.
#[derive(Default, Debug, Clone, Copy)]
#[non_exhaustive]
pub struct NoopHooks;

impl EngineHooks for NoopHooks {}

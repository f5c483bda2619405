//! The engine object that owns every circuit, channel, stream, and
//! queued cell, and drives them from a single-threaded event loop.
//!
//! Nothing here blocks: the entry points are called from transport
//! readiness callbacks and from the surrounding scheduler's timers, do
//! a bounded amount of work, and return.  Handshaking and path
//! selection happen elsewhere; their results enter the engine through
//! the constructor methods below.

use crate::cellpool::CellPool;
use crate::channel::{ChanKey, Channel};
use crate::circuit::{
    CircHop, CircKey, CircPurpose, Circuit, CircuitKind, HopState, OriginState, TransitState,
    MAX_RELAY_EARLY_CELLS,
};
use crate::crypto::cell::{CryptInit, HopNum, RelayCrypt, RelayLayer};
use crate::hooks::EngineHooks;
use crate::sendme::{CircRecvWindow, CircSendWindow};
use crate::stats::Stats;
use crate::stream::{Stream, StreamKey, StreamRequest, StreamState};
use crate::util::err::internal;
use crate::{Error, Result};
use bytes::Bytes;
use onion_cell::chancell::{CircId, DestroyReason};
use onion_cell::relaycell::msg::EndReason;
use onion_cell::relaycell::StreamId;
use slotmap_careful::SlotMap;
use tracing::{debug, info};

/// The relay cell engine.
///
/// One of these exists per process; it owns the packed-cell pool, the
/// circuit, channel, and stream tables, and the statistics counters.
pub struct Reactor {
    /// The process-wide packed-cell pool.
    pub(crate) pool: CellPool,
    /// Every circuit the engine knows about.
    pub(crate) circs: SlotMap<CircKey, Circuit>,
    /// Every channel the engine knows about.
    pub(crate) chans: SlotMap<ChanKey, Channel>,
    /// Every edge stream the engine knows about.
    pub(crate) streams: SlotMap<StreamKey, Stream>,
    /// Statistics counters.
    pub(crate) stats: Stats,
    /// The engine's coarse clock, in seconds; advanced by `tick`.
    pub(crate) now: u64,
    /// When the engine was created, in the same clock.
    started_at: u64,
    /// Source of unique circuit ids for logging.
    next_circ_unique_id: u64,
}

impl Reactor {
    /// Create a new engine whose clock starts at `now`.
    pub fn new(now: u64) -> Self {
        Reactor {
            pool: CellPool::new(),
            circs: SlotMap::with_key(),
            chans: SlotMap::with_key(),
            streams: SlotMap::with_key(),
            stats: Stats::default(),
            now,
            started_at: now,
            next_circ_unique_id: 1,
        }
    }

    /// Advance the engine's coarse clock.
    pub fn tick(&mut self, now: u64) {
        self.now = now;
    }

    /// Return the statistics counters.
    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    //
    // Channels.
    //

    /// Register a transport connection with its negotiated link
    /// protocol version.
    pub fn add_channel(&mut self, link_proto: u16) -> ChanKey {
        self.chans.insert(Channel::new(link_proto))
    }

    /// Look up a channel.
    pub fn channel(&self, chan: ChanKey) -> Option<&Channel> {
        self.chans.get(chan)
    }

    /// Take the bytes waiting to be written on `chan`.
    ///
    /// The transport collaborator calls this when the connection is
    /// writable.
    pub fn take_channel_output(&mut self, chan: ChanKey) -> Option<Bytes> {
        Some(self.chans.get_mut(chan)?.take_outbuf())
    }

    //
    // Circuits.
    //

    /// Create an origin circuit attached to `n_chan` with our chosen
    /// circuit id, with no hops yet.
    pub fn add_origin_circuit(
        &mut self,
        n_chan: ChanKey,
        n_circ_id: CircId,
        purpose: CircPurpose,
    ) -> Result<CircKey> {
        if !self.chans.contains_key(n_chan) {
            return Err(internal!("no such channel"));
        }
        let unique_id = self.fresh_unique_id();
        Ok(self.circs.insert(Circuit {
            unique_id,
            purpose,
            n_chan: Some(n_chan),
            n_circ_id: Some(n_circ_id),
            n_queue: Default::default(),
            streams_blocked_on_n: false,
            ring: Default::default(),
            marked_for_close: None,
            kind: CircuitKind::Origin(OriginState {
                hops: Vec::new(),
                remaining_early: MAX_RELAY_EARLY_CELLS,
                early_commands: Vec::new(),
                streams: Vec::new(),
                next_stream_id: 1,
            }),
        }))
    }

    /// Create a transit circuit whose previous side is `p_chan` with
    /// the peer's circuit id, keyed from a handshake seed.
    pub fn add_transit_circuit(
        &mut self,
        p_chan: ChanKey,
        p_circ_id: CircId,
        seed: &[u8],
    ) -> Result<CircKey> {
        if !self.chans.contains_key(p_chan) {
            return Err(internal!("no such channel"));
        }
        let (outbound, inbound) = RelayCrypt::initialize(seed)?.split_relay_layer();
        let unique_id = self.fresh_unique_id();
        Ok(self.circs.insert(Circuit {
            unique_id,
            purpose: CircPurpose::General,
            n_chan: None,
            n_circ_id: None,
            n_queue: Default::default(),
            streams_blocked_on_n: false,
            ring: Default::default(),
            marked_for_close: None,
            kind: CircuitKind::Transit(TransitState {
                p_chan: Some(p_chan),
                p_circ_id: Some(p_circ_id),
                p_queue: Default::default(),
                streams_blocked_on_p: false,
                inbound,
                outbound,
                package_window: CircSendWindow::new(),
                deliver_window: CircRecvWindow::new(),
                n_streams: Vec::new(),
                resolving_streams: Vec::new(),
                rend_splice: None,
            }),
        }))
    }

    /// Add a hop to an origin circuit from a handshake seed.  The hop
    /// starts in the Opening state.
    pub fn add_origin_hop(&mut self, circ: CircKey, seed: &[u8]) -> Result<HopNum> {
        let hop = CircHop::from_seed(seed)?;
        let org = self.circ_mut(circ)?.origin_mut()?;
        if org.hops.len() >= usize::from(u8::MAX) {
            return Err(internal!("too many hops on a circuit"));
        }
        org.hops.push(hop);
        Ok(HopNum::from((org.hops.len() - 1) as u8))
    }

    /// Change the state of a hop (the handshake layer calls this when
    /// a hop finishes opening).
    pub fn set_hop_state(&mut self, circ: CircKey, hop: HopNum, state: HopState) -> Result<()> {
        self.circ_mut(circ)?.hop_mut(hop)?.state = state;
        Ok(())
    }

    /// Attach (or replace) the next-side channel of a transit circuit.
    pub fn set_next_attachment(
        &mut self,
        circ: CircKey,
        n_chan: ChanKey,
        n_circ_id: CircId,
    ) -> Result<()> {
        if !self.chans.contains_key(n_chan) {
            return Err(internal!("no such channel"));
        }
        let c = self.circ_mut(circ)?;
        c.transit()?;
        c.n_chan = Some(n_chan);
        c.n_circ_id = Some(n_circ_id);
        Ok(())
    }

    /// Set a circuit's purpose.
    pub fn set_circuit_purpose(&mut self, circ: CircKey, purpose: CircPurpose) -> Result<()> {
        self.circ_mut(circ)?.purpose = purpose;
        Ok(())
    }

    /// Splice two transit circuits into a rendezvous: cells leaving the
    /// dangling next side of either re-enter the other as if received
    /// from its previous side.
    pub fn splice_rendezvous(&mut self, a: CircKey, b: CircKey) -> Result<()> {
        if a == b {
            return Err(internal!("cannot splice a circuit to itself"));
        }
        for key in [a, b] {
            let c = self.circ_mut(key)?;
            c.transit()?;
            c.purpose = CircPurpose::RendEstablished;
        }
        self.circ_mut(a)?.transit_mut()?.rend_splice = Some(b);
        self.circ_mut(b)?.transit_mut()?.rend_splice = Some(a);
        Ok(())
    }

    /// Look up a circuit.
    pub fn circuit(&self, circ: CircKey) -> Option<&Circuit> {
        self.circs.get(circ)
    }

    /// Number of circuits not yet marked for close.
    pub fn n_open_circuits(&self) -> usize {
        self.circs
            .iter()
            .filter(|(_, c)| c.marked_for_close.is_none())
            .count()
    }

    /// Mark a circuit for close: drop it from every active ring, drain
    /// its queues, and mark all of its streams for close.
    ///
    /// Idempotent; the actual removal happens later, via
    /// [`remove_circuit`](Reactor::remove_circuit), once the external
    /// close protocol has run.
    pub fn mark_circuit_for_close(
        &mut self,
        hooks: &mut dyn EngineHooks,
        circ: CircKey,
        reason: DestroyReason,
    ) {
        let Some(c) = self.circs.get_mut(circ) else {
            return;
        };
        if c.marked_for_close.is_some() {
            return;
        }
        c.marked_for_close = Some(reason);
        debug!("Marking circuit {} for close: {}", c.unique_id, reason);

        for side in [crate::channel::ChanSide::Next, crate::channel::ChanSide::Previous] {
            if let Some(chan) = self.circs[circ].chan(side) {
                self.make_circuit_inactive(circ, chan);
            }
        }
        // Drain the queues back into the pool.
        {
            let c = &mut self.circs[circ];
            let mut n_queue = std::mem::take(&mut c.n_queue);
            n_queue.clear(&mut self.pool);
            if let CircuitKind::Transit(t) = &mut c.kind {
                let mut p_queue = std::mem::take(&mut t.p_queue);
                p_queue.clear(&mut self.pool);
            }
        }
        // Mark every attached stream for close.
        for sk in self.circuit_stream_keys(circ) {
            self.mark_stream_for_close(hooks, sk, EndReason::DESTROY, true);
        }
    }

    /// Remove a circuit that has been marked for close, once the close
    /// protocol has finished with it.  Streams that were attached are
    /// removed as well.
    pub fn remove_circuit(&mut self, circ: CircKey) -> Result<()> {
        {
            let c = self.circ(circ)?;
            if c.marked_for_close.is_none() {
                return Err(internal!("removing a circuit that is not marked for close"));
            }
        }
        for sk in self.circuit_stream_keys(circ) {
            self.streams.remove(sk);
        }
        // Unsplice a rendezvous peer, if any.
        let peer = match &self.circs[circ].kind {
            CircuitKind::Transit(t) => t.rend_splice,
            CircuitKind::Origin(_) => None,
        };
        if let Some(peer) = peer {
            if let Some(p) = self.circs.get_mut(peer) {
                if let CircuitKind::Transit(pt) = &mut p.kind {
                    pt.rend_splice = None;
                }
            }
        }
        self.circs.remove(circ);
        Ok(())
    }

    //
    // Streams.
    //

    /// Attach a client stream to an origin circuit, bound for `hop`.
    ///
    /// Picks a stream id that is unused on the circuit, and starts the
    /// stream in the wait state matching its request kind.
    pub fn add_client_stream(
        &mut self,
        circ: CircKey,
        hop: HopNum,
        request: StreamRequest,
    ) -> Result<StreamKey> {
        // Make sure the hop exists.
        self.circ_mut(circ)?.hop_mut(hop)?;
        let id = self.pick_stream_id(circ)?;
        let stream = Stream::new_client(id, circ, hop, request);
        let sk = self.streams.insert(stream);
        self.circs[circ]
            .origin_mut()
            .expect("checked above")
            .streams
            .push(sk);
        Ok(sk)
    }

    /// Attach an exit stream to a transit circuit, under the stream id
    /// the BEGIN (or RESOLVE) arrived with.
    ///
    /// The exit collaborator calls this from its begin hook.  A
    /// resolving stream is a reader-less placeholder.
    pub fn add_exit_stream(
        &mut self,
        circ: CircKey,
        id: StreamId,
        resolving: bool,
    ) -> Result<StreamKey> {
        {
            let t = self.circ(circ)?.transit()?;
            let in_use = t
                .n_streams
                .iter()
                .chain(t.resolving_streams.iter())
                .any(|sk| self.streams.get(*sk).map(|s| s.id) == Some(id));
            if in_use {
                return Err(Error::StreamProto(format!(
                    "stream id {} already in use on this circuit",
                    id
                )));
            }
        }
        let stream = Stream::new_exit(id, circ, resolving);
        let sk = self.streams.insert(stream);
        let t = self.circs[circ].transit_mut().expect("checked above");
        if resolving {
            t.resolving_streams.push(sk);
        } else {
            t.n_streams.push(sk);
        }
        Ok(sk)
    }

    /// Mark a stream as serving a rendezvous.
    pub fn set_stream_rendezvous(&mut self, stream: StreamKey) -> Result<()> {
        self.stream_mut(stream)?.is_rendezvous = true;
        Ok(())
    }

    /// Move a stream to the open state (for example, when an exit
    /// finishes connecting).
    pub fn set_stream_open(&mut self, stream: StreamKey) -> Result<()> {
        self.stream_mut(stream)?.state = StreamState::Open;
        Ok(())
    }

    /// Look up a stream.
    pub fn stream(&self, stream: StreamKey) -> Option<&Stream> {
        self.streams.get(stream)
    }

    /// Append bytes read from the edge to a stream's input buffer.
    ///
    /// Call [`package_raw_inbuf`](Reactor::package_raw_inbuf) afterward
    /// to turn them into cells.
    pub fn stream_inbuf_write(&mut self, stream: StreamKey, data: &[u8]) -> Result<()> {
        let s = self.stream_mut(stream)?;
        s.inbuf.extend_from_slice(data);
        Ok(())
    }

    /// Take the bytes delivered to a stream and not yet drained by the
    /// edge.
    pub fn take_stream_output(&mut self, stream: StreamKey) -> Option<Bytes> {
        Some(self.streams.get_mut(stream)?.outbuf.split().freeze())
    }

    /// Mark a stream for close.
    ///
    /// Idempotent.  The reason is recorded (first writer wins), the
    /// reader is disarmed, and an unflushed outbuf keeps the stream
    /// alive until drained.
    pub fn mark_stream_for_close(
        &mut self,
        hooks: &mut dyn EngineHooks,
        stream: StreamKey,
        reason: EndReason,
        remote: bool,
    ) {
        self.stop_reading(hooks, stream);
        let Some(s) = self.streams.get_mut(stream) else {
            return;
        };
        if s.end_reason.is_none() {
            s.end_reason = Some(reason);
            s.end_was_remote = remote;
        }
        if !s.marked_for_close {
            s.marked_for_close = true;
            s.hold_open_until_flushed = !s.outbuf.is_empty();
        }
    }

    /// Detach a stream from its circuit, leaving it to be reattached
    /// (or closed) by the client side.
    pub fn detach_stream(&mut self, stream: StreamKey) -> Result<()> {
        let circ = self.stream_mut(stream)?.circ;
        if let Some(c) = self.circs.get_mut(circ) {
            match &mut c.kind {
                CircuitKind::Origin(o) => o.streams.retain(|sk| *sk != stream),
                CircuitKind::Transit(t) => {
                    t.n_streams.retain(|sk| *sk != stream);
                    t.resolving_streams.retain(|sk| *sk != stream);
                }
            }
        }
        let s = self.stream_mut(stream)?;
        s.detached = true;
        Ok(())
    }

    //
    // The pool.
    //

    /// Free excess storage in the cell pool.
    pub fn clean_cell_pool(&mut self, aggressive: bool) {
        self.pool.clean(aggressive);
    }

    /// Log current statistics for cell pool allocation.
    ///
    /// The leak counter is advisory: cells being copied to a transport
    /// buffer are briefly off-queue while still allocated.
    pub fn dump_pool_usage(&self) {
        let mut n_cells = 0_usize;
        let mut n_circs = 0_usize;
        for (_, c) in self.circs.iter() {
            n_cells += c.n_queue.len();
            if let CircuitKind::Transit(t) = &c.kind {
                n_cells += t.p_queue.len();
            }
            n_circs += 1;
        }
        info!(
            "{} cells allocated on {} circuits. {} cells leaked.",
            n_cells,
            n_circs,
            self.pool.leaked(n_cells)
        );
    }

    /// Emit the periodic heartbeat log line.
    pub fn log_heartbeat(&self) {
        crate::stats::log_heartbeat(
            &self.stats,
            self.now.saturating_sub(self.started_at),
            self.n_open_circuits(),
        );
    }

    //
    // Internal helpers.
    //

    /// Return a fresh unique id for logging.
    fn fresh_unique_id(&mut self) -> u64 {
        let id = self.next_circ_unique_id;
        self.next_circ_unique_id += 1;
        id
    }

    /// Look up a circuit, or fail with an internal error.
    pub(crate) fn circ(&self, circ: CircKey) -> Result<&Circuit> {
        self.circs.get(circ).ok_or_else(|| internal!("no such circuit"))
    }

    /// Look up a circuit mutably, or fail with an internal error.
    pub(crate) fn circ_mut(&mut self, circ: CircKey) -> Result<&mut Circuit> {
        self.circs
            .get_mut(circ)
            .ok_or_else(|| internal!("no such circuit"))
    }

    /// Look up a stream mutably, or fail with an internal error.
    pub(crate) fn stream_mut(&mut self, stream: StreamKey) -> Result<&mut Stream> {
        self.streams
            .get_mut(stream)
            .ok_or_else(|| internal!("no such stream"))
    }

    /// Every stream key attached to a circuit, in one list.
    pub(crate) fn circuit_stream_keys(&self, circ: CircKey) -> Vec<StreamKey> {
        match self.circs.get(circ).map(|c| &c.kind) {
            Some(CircuitKind::Origin(o)) => o.streams.clone(),
            Some(CircuitKind::Transit(t)) => t
                .n_streams
                .iter()
                .chain(t.resolving_streams.iter())
                .copied()
                .collect(),
            None => Vec::new(),
        }
    }

    /// Pick a stream id unused on `circ`.
    fn pick_stream_id(&mut self, circ: CircKey) -> Result<StreamId> {
        let in_use: Vec<StreamId> = self
            .circuit_stream_keys(circ)
            .iter()
            .filter_map(|sk| self.streams.get(*sk).map(|s| s.id))
            .collect();
        let org = self.circ_mut(circ)?.origin_mut()?;
        for _ in 0..u16::MAX {
            let candidate = org.next_stream_id;
            org.next_stream_id = org.next_stream_id.wrapping_add(1);
            if let Some(id) = StreamId::new(candidate) {
                if !in_use.contains(&id) {
                    return Ok(id);
                }
            }
        }
        Err(Error::Internal("out of stream ids".into()))
    }

    /// Arm a stream's edge reader, if it has one and it is off.
    /// Edge-triggered: the hook fires only on a transition.
    pub(crate) fn start_reading(&mut self, hooks: &mut dyn EngineHooks, stream: StreamKey) {
        if let Some(s) = self.streams.get_mut(stream) {
            if s.has_reader && !s.reading {
                s.reading = true;
                hooks.edge_start_reading(stream);
            }
        }
    }

    /// Disarm a stream's edge reader, if it has one and it is on.
    pub(crate) fn stop_reading(&mut self, hooks: &mut dyn EngineHooks, stream: StreamKey) {
        if let Some(s) = self.streams.get_mut(stream) {
            if s.has_reader && s.reading {
                s.reading = false;
                hooks.edge_stop_reading(stream);
            }
        }
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::crypto::cell::RelayCrypt;
    use crate::hooks::NoopHooks;
    use crate::stream::RequestKind;

    fn seed(tweak: u8) -> Vec<u8> {
        let mut s = vec![0_u8; RelayCrypt::seed_len()];
        let mut v = tweak;
        for b in s.iter_mut() {
            v = v.wrapping_mul(167).wrapping_add(41);
            *b = v;
        }
        s
    }

    #[test]
    fn stream_ids_are_unique_per_circuit() {
        let mut r = Reactor::new(0);
        let chan = r.add_channel(2);
        let circ = r
            .add_origin_circuit(chan, CircId::new(1).unwrap(), CircPurpose::General)
            .unwrap();
        r.add_origin_hop(circ, &seed(1)).unwrap();
        let mut seen = Vec::new();
        for _ in 0..10 {
            let sk = r
                .add_client_stream(
                    circ,
                    HopNum::from(0),
                    StreamRequest::new("example.com", 443, RequestKind::Connect),
                )
                .unwrap();
            let id = r.stream(sk).unwrap().id();
            assert!(!seen.contains(&id));
            seen.push(id);
        }
    }

    #[test]
    fn exit_stream_ids_must_be_free() {
        let mut r = Reactor::new(0);
        let chan = r.add_channel(2);
        let circ = r
            .add_transit_circuit(chan, CircId::new(1).unwrap(), &seed(1))
            .unwrap();
        let id = StreamId::new(5).unwrap();
        r.add_exit_stream(circ, id, false).unwrap();
        assert!(matches!(
            r.add_exit_stream(circ, id, true),
            Err(Error::StreamProto(_))
        ));
        // A different id is fine, including for a resolving
        // placeholder.
        let sk = r.add_exit_stream(circ, StreamId::new(6).unwrap(), true).unwrap();
        assert!(!r.streams[sk].has_reader);
    }

    #[test]
    fn splice_requires_two_distinct_transit_circuits() {
        let mut r = Reactor::new(0);
        let chan = r.add_channel(2);
        let a = r
            .add_transit_circuit(chan, CircId::new(1).unwrap(), &seed(1))
            .unwrap();
        let origin = r
            .add_origin_circuit(chan, CircId::new(2).unwrap(), CircPurpose::General)
            .unwrap();
        assert!(r.splice_rendezvous(a, a).is_err());
        assert!(r.splice_rendezvous(a, origin).is_err());

        let b = r
            .add_transit_circuit(chan, CircId::new(3).unwrap(), &seed(2))
            .unwrap();
        r.splice_rendezvous(a, b).unwrap();
        assert_eq!(r.circs[a].purpose, CircPurpose::RendEstablished);
        assert_eq!(r.circs[b].purpose, CircPurpose::RendEstablished);
    }

    #[test]
    fn reader_signals_are_edge_triggered() {
        #[derive(Default)]
        struct Counting {
            starts: usize,
            stops: usize,
        }
        impl EngineHooks for Counting {
            fn edge_start_reading(&mut self, _stream: StreamKey) {
                self.starts += 1;
            }
            fn edge_stop_reading(&mut self, _stream: StreamKey) {
                self.stops += 1;
            }
        }

        let mut r = Reactor::new(0);
        let mut hooks = Counting::default();
        let chan = r.add_channel(2);
        let circ = r
            .add_transit_circuit(chan, CircId::new(1).unwrap(), &seed(1))
            .unwrap();
        let sk = r.add_exit_stream(circ, StreamId::new(1).unwrap(), false).unwrap();

        r.start_reading(&mut hooks, sk);
        r.start_reading(&mut hooks, sk);
        assert_eq!(hooks.starts, 1);
        r.stop_reading(&mut hooks, sk);
        r.stop_reading(&mut hooks, sk);
        assert_eq!(hooks.stops, 1);

        // Placeholder streams never signal.
        let placeholder = r.add_exit_stream(circ, StreamId::new(2).unwrap(), true).unwrap();
        r.start_reading(&mut hooks, placeholder);
        assert_eq!(hooks.starts, 1);
    }

    #[test]
    fn heartbeat_and_pool_dump_do_not_panic() {
        let mut r = Reactor::new(100);
        let chan = r.add_channel(2);
        r.add_transit_circuit(chan, CircId::new(1).unwrap(), &seed(1))
            .unwrap();
        r.tick(100 + 86_400 + 90);
        r.log_heartbeat();
        r.dump_pool_usage();
        r.clean_cell_pool(true);
        assert_eq!(r.n_open_circuits(), 1);
    }

    #[test]
    fn hop_states_gate_the_crypt_path() {
        let mut r = Reactor::new(0);
        let mut hooks = NoopHooks;
        let chan = r.add_channel(2);
        let circ = r
            .add_origin_circuit(chan, CircId::new(1).unwrap(), CircPurpose::General)
            .unwrap();
        let hop = r.add_origin_hop(circ, &seed(1)).unwrap();
        // The first hop is still opening: inbound relay cells are a
        // protocol violation.
        let mut cell = onion_cell::chancell::Cell::new(
            CircId::new(1).unwrap(),
            onion_cell::chancell::ChanCmd::RELAY,
            Box::new([0_u8; onion_cell::chancell::CELL_DATA_LEN]),
        );
        let err = r
            .receive_relay_cell(&mut hooks, circ, &mut cell, crate::circuit::Direction::Inbound)
            .unwrap_err();
        assert!(matches!(err, Error::CircProto(_)));
        // (The circuit is closed now; this just exercises the state
        // setter.)
        r.set_hop_state(circ, hop, HopState::Open).unwrap();
    }
}

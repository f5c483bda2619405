//! The per-channel scheduler: a ring of circuits with pending cells.
//!
//! Every channel keeps a circular, doubly-linked ring of the circuits
//! that currently have cells queued toward it.  Flushing pulls a
//! bounded burst from the head circuit and then advances the head, so
//! circuits sharing a channel are served round-robin.  Queue depth
//! drives backpressure: past the high-water mark a circuit's edge
//! streams stop reading, and they resume once the queue drains below
//! the low-water mark.
//!
//! The ring is expressed as key-indexed links stored on the circuits
//! themselves, dual-indexed by which side of the circuit the channel
//! is on.

use crate::channel::{ChanKey, ChanSide};
use crate::circuit::{CircKey, CircuitKind, Direction, RingLinks};
use crate::hooks::EngineHooks;
use crate::reactor::Reactor;
use onion_cell::chancell::{Cell, ChanCmd, CELL_NETWORK_LEN};
use tracing::{debug, trace, warn};

/// Stop reading on edge streams when a circuit has this many cells
/// waiting on the appropriate queue.
pub const CELL_QUEUE_HIGHWATER_SIZE: usize = 256;
/// Start reading from edge streams again when we get down to this many
/// cells.
pub const CELL_QUEUE_LOWWATER_SIZE: usize = 64;

impl Reactor {
    /// Add `circ` to the ring of circuits with pending cells on
    /// `chan`.  No effect if it is already linked.
    pub(crate) fn make_circuit_active(&mut self, circ: CircKey, chan: ChanKey) {
        let Ok(side) = self.circs[circ].side_of(chan) else {
            warn!("tried to activate a circuit on an unrelated channel");
            return;
        };
        let links = self.circs[circ].ring[side.idx()];
        if links.next.is_some() && links.prev.is_some() {
            // Already active.
            return;
        }

        match self.chans[chan].active_head {
            None => {
                self.chans[chan].active_head = Some(circ);
                let links = &mut self.circs[circ].ring[side.idx()];
                links.next = Some(circ);
                links.prev = Some(circ);
            }
            Some(head) => {
                let head_side = self.circs[head]
                    .side_of(chan)
                    .expect("ring head not attached to its channel");
                let old_tail = self.circs[head].ring[head_side.idx()]
                    .prev
                    .expect("ring head with no tail link");
                let tail_side = self.circs[old_tail]
                    .side_of(chan)
                    .expect("ring tail not attached to its channel");
                self.circs[old_tail].ring[tail_side.idx()].next = Some(circ);
                self.circs[circ].ring[side.idx()].next = Some(head);
                self.circs[head].ring[head_side.idx()].prev = Some(circ);
                self.circs[circ].ring[side.idx()].prev = Some(old_tail);
            }
        }
    }

    /// Remove `circ` from the ring of circuits with pending cells on
    /// `chan`.  No effect if it is already unlinked.
    pub(crate) fn make_circuit_inactive(&mut self, circ: CircKey, chan: ChanKey) {
        let Ok(side) = self.circs[circ].side_of(chan) else {
            return;
        };
        let links = self.circs[circ].ring[side.idx()];
        let (Some(next), Some(prev)) = (links.next, links.prev) else {
            // Already inactive.
            debug_assert!(links.next.is_none() && links.prev.is_none());
            return;
        };

        if next == circ {
            self.chans[chan].active_head = None;
        } else {
            let next_side = self.circs[next]
                .side_of(chan)
                .expect("ring successor not attached to its channel");
            let prev_side = self.circs[prev]
                .side_of(chan)
                .expect("ring predecessor not attached to its channel");
            debug_assert_eq!(self.circs[next].ring[next_side.idx()].prev, Some(circ));
            debug_assert_eq!(self.circs[prev].ring[prev_side.idx()].next, Some(circ));
            self.circs[next].ring[next_side.idx()].prev = Some(prev);
            self.circs[prev].ring[prev_side.idx()].next = Some(next);
            if self.chans[chan].active_head == Some(circ) {
                self.chans[chan].active_head = Some(next);
            }
        }
        self.circs[circ].ring[side.idx()] = RingLinks::default();
    }

    /// Remove every circuit from the ring on `chan`, without touching
    /// their queues.  Used when a channel is going away.
    pub fn unlink_all_active(&mut self, chan: ChanKey) {
        let Some(head) = self.chans.get(chan).and_then(|c| c.active_head) else {
            return;
        };
        let mut cur = head;
        loop {
            let side = self.circs[cur]
                .side_of(chan)
                .expect("ring member not attached to its channel");
            let next = self.circs[cur].ring[side.idx()]
                .next
                .expect("ring member with no link");
            self.circs[cur].ring[side.idx()] = RingLinks::default();
            cur = next;
            if cur == head {
                break;
            }
        }
        self.chans[chan].active_head = None;
    }

    /// Pull as many cells as possible (but no more than `max`) from the
    /// queue of the first active circuit on `chan`, write them to the
    /// channel's outbuf, and advance the head to the next circuit in
    /// the ring.  Return the number of cells written.
    pub fn flush_channel(&mut self, hooks: &mut dyn EngineHooks, chan: ChanKey, max: usize) -> usize {
        let Some(circ) = self.chans.get(chan).and_then(|c| c.active_head) else {
            return 0;
        };
        let Ok(side) = self.circs[circ].side_of(chan) else {
            warn!("active head not attached to its channel");
            return 0;
        };
        let streams_blocked = match side {
            ChanSide::Next => self.circs[circ].streams_blocked_on_n,
            ChanSide::Previous => self.circs[circ]
                .transit()
                .map(|t| t.streams_blocked_on_p)
                .unwrap_or(false),
        };

        let mut n_flushed = 0;
        while n_flushed < max {
            let popped = {
                let Reactor { circs, pool, .. } = self;
                let c = &mut circs[circ];
                match side {
                    ChanSide::Next => c.n_queue.pop(pool),
                    ChanSide::Previous => match &mut c.kind {
                        CircuitKind::Transit(t) => t.p_queue.pop(pool),
                        CircuitKind::Origin(_) => None,
                    },
                }
            };
            let Some(cell) = popped else {
                break;
            };
            {
                let Reactor { chans, pool, .. } = self;
                chans[chan].outbuf.extend_from_slice(&pool.body(cell)[..]);
            }
            self.pool.release(cell);
            self.stats.n_bytes_written += CELL_NETWORK_LEN as u64;
            n_flushed += 1;

            // A transport write may have changed the active head under
            // us (a close can make this circuit inactive); if so, it
            // already advanced the head, and we must yield.
            if self.chans[chan].active_head != Some(circ) {
                if n_flushed > 0 {
                    self.chans[chan].last_flush_at = Some(self.now);
                }
                return n_flushed;
            }
        }

        // Round-robin: the next active circuit gets the next flush.
        let next = self.circs[circ].ring[side.idx()].next;
        debug_assert!(next.is_some());
        self.chans[chan].active_head = next;

        // Is the queue low enough to unblock the streams waiting to
        // write to this circuit?
        let qlen = self.circs[circ].queue_len(side);
        if streams_blocked && qlen <= CELL_QUEUE_LOWWATER_SIZE {
            self.set_streams_blocked_on_circ(hooks, circ, chan, false);
        }

        // Did we just run out of cells on this queue?
        if qlen == 0 {
            debug!("Made a circuit inactive.");
            self.make_circuit_inactive(circ, chan);
        }

        if n_flushed > 0 {
            self.chans[chan].last_flush_at = Some(self.now);
        }
        n_flushed
    }

    /// Add `cell` to the queue of `circ` writing to `chan`,
    /// transmitting in `direction`.
    pub(crate) fn append_cell_to_circuit_queue(
        &mut self,
        hooks: &mut dyn EngineHooks,
        circ: CircKey,
        chan: ChanKey,
        cell: &mut Cell,
        direction: Direction,
    ) {
        let (side, streams_blocked) = match direction {
            Direction::Outbound => (ChanSide::Next, self.circs[circ].streams_blocked_on_n),
            Direction::Inbound => (
                ChanSide::Previous,
                self.circs[circ]
                    .transit()
                    .map(|t| t.streams_blocked_on_p)
                    .unwrap_or(false),
            ),
        };

        if cell.cmd() == ChanCmd::RELAY_EARLY && self.chans[chan].link_proto < 2 {
            // Old link protocols don't understand RELAY_EARLY.
            cell.set_cmd(ChanCmd::RELAY);
        }

        {
            let Reactor { circs, pool, .. } = self;
            let c = &mut circs[circ];
            match side {
                ChanSide::Next => c.n_queue.append_copy_of(pool, cell),
                ChanSide::Previous => match &mut c.kind {
                    CircuitKind::Transit(t) => t.p_queue.append_copy_of(pool, cell),
                    CircuitKind::Origin(_) => {
                        warn!("tried to queue an inbound cell on an origin circuit");
                        return;
                    }
                },
            }
        }
        let qlen = self.circs[circ].queue_len(side);

        // If we have too many cells on the circuit, stop reading from
        // the edge streams for a while.
        if !streams_blocked && qlen >= CELL_QUEUE_HIGHWATER_SIZE {
            self.set_streams_blocked_on_circ(hooks, circ, chan, true);
        }

        if qlen == 1 {
            // This was the first cell added to the queue: the circuit
            // becomes active.
            trace!("Made a circuit active.");
            self.make_circuit_active(circ, chan);
        }

        if self.chans[chan].outbuf.is_empty() {
            // Nothing at all is waiting to be sent on the channel.
            // Prime the buffer with one cell so the transport notices
            // it has work, and flushed-some callbacks start flowing.
            trace!("Primed a buffer.");
            self.flush_channel(hooks, chan, 1);
        }
    }

    /// Block (or unblock) every edge stream that is using `circ` to
    /// write to `chan`, and stop or start reading as appropriate.
    ///
    /// Streams without a reader (placeholders for pending resolves) are
    /// flagged but otherwise skipped.
    pub(crate) fn set_streams_blocked_on_circ(
        &mut self,
        hooks: &mut dyn EngineHooks,
        circ: CircKey,
        chan: ChanKey,
        block: bool,
    ) {
        let edges = {
            let c = &mut self.circs[circ];
            if c.n_chan == Some(chan) {
                c.streams_blocked_on_n = block;
                match &c.kind {
                    // The streams feeding the next-side queue are the
                    // origin's client streams.
                    CircuitKind::Origin(o) => o.streams.clone(),
                    CircuitKind::Transit(_) => Vec::new(),
                }
            } else {
                match &mut c.kind {
                    CircuitKind::Transit(t) => {
                        t.streams_blocked_on_p = block;
                        t.n_streams.clone()
                    }
                    CircuitKind::Origin(_) => {
                        warn!("blocking the previous side of an origin circuit");
                        Vec::new()
                    }
                }
            }
        };

        for sk in edges {
            let has_reader = match self.streams.get_mut(sk) {
                Some(s) => {
                    s.blocked_on_circ = block;
                    s.has_reader
                }
                None => continue,
            };
            if !has_reader {
                // A placeholder for something (probably a pending
                // resolve); it can't actually stop or start reading.
                continue;
            }
            if block {
                self.stop_reading(hooks, sk);
            } else {
                self.start_reading(hooks, sk);
            }
        }
    }

    /// Panic unless the active-circuit ring on `chan` is structurally
    /// sound: circular both ways, mutually consistent links, and
    /// holding exactly the circuits with cells pending toward `chan`.
    pub fn assert_active_circuits_ok(&self, chan: ChanKey) {
        let chan_ref = self.chans.get(chan).expect("no such channel");
        let pending = self
            .circs
            .iter()
            .filter(|(_, c)| {
                c.side_of(chan)
                    .map(|side| c.queue_len(side) > 0)
                    .unwrap_or(false)
            })
            .count();
        let Some(head) = chan_ref.active_head else {
            assert_eq!(pending, 0, "pending cells but no active ring");
            return;
        };
        let mut n = 0_usize;
        let mut cur = head;
        loop {
            let side = self.circs[cur]
                .side_of(chan)
                .expect("ring member not attached to its channel");
            let links = self.circs[cur].ring[side.idx()];
            let next = links.next.expect("active circuit with no next link");
            let prev = links.prev.expect("active circuit with no prev link");
            let next_side = self.circs[next]
                .side_of(chan)
                .expect("ring successor not attached");
            let prev_side = self.circs[prev]
                .side_of(chan)
                .expect("ring predecessor not attached");
            assert_eq!(
                self.circs[next].ring[next_side.idx()].prev,
                Some(cur),
                "ring links disagree"
            );
            assert_eq!(
                self.circs[prev].ring[prev_side.idx()].next,
                Some(cur),
                "ring links disagree"
            );
            n += 1;
            assert!(n <= self.circs.len(), "active ring does not close");
            cur = next;
            if cur == head {
                break;
            }
        }
        assert_eq!(
            n, pending,
            "active ring size does not match circuits with pending cells"
        );
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::crypto::cell::{CryptInit, RelayCrypt};
    use crate::hooks::NoopHooks;
    use crate::reactor::Reactor;
    use onion_cell::chancell::{BoxedCellBody, CircId, CELL_DATA_LEN};
    use onion_cell::relaycell::StreamId;

    fn seed(tweak: u8) -> Vec<u8> {
        let mut s = vec![0_u8; RelayCrypt::seed_len()];
        let mut v = tweak;
        for b in s.iter_mut() {
            v = v.wrapping_mul(167).wrapping_add(41);
            *b = v;
        }
        s
    }

    fn test_cell(circ_id: u16, tag: u8) -> Cell {
        let mut body: BoxedCellBody = Box::new([0_u8; CELL_DATA_LEN]);
        body[0] = tag;
        Cell::new(CircId::new(circ_id).unwrap(), ChanCmd::RELAY, body)
    }

    /// A channel with two transit circuits writing toward it from
    /// their previous side.
    fn two_circuits() -> (Reactor, ChanKey, CircKey, CircKey) {
        let mut r = Reactor::new(0);
        let chan = r.add_channel(2);
        let a = r
            .add_transit_circuit(chan, CircId::new(1).unwrap(), &seed(1))
            .unwrap();
        let b = r
            .add_transit_circuit(chan, CircId::new(2).unwrap(), &seed(2))
            .unwrap();
        (r, chan, a, b)
    }

    /// Keep the channel outbuf non-empty so appends don't self-prime.
    fn busy_outbuf(r: &mut Reactor, chan: ChanKey) {
        r.chans[chan].outbuf.extend_from_slice(&[0xEE]);
    }

    #[test]
    fn activation_is_idempotent_and_ring_stays_sound() {
        let (mut r, chan, a, b) = two_circuits();
        let mut hooks = NoopHooks;
        busy_outbuf(&mut r, chan);

        let mut cell = test_cell(1, 1);
        r.append_cell_to_circuit_queue(&mut hooks, a, chan, &mut cell, Direction::Inbound);
        r.assert_active_circuits_ok(chan);
        r.make_circuit_active(a, chan);
        r.assert_active_circuits_ok(chan);

        let mut cell = test_cell(2, 2);
        r.append_cell_to_circuit_queue(&mut hooks, b, chan, &mut cell, Direction::Inbound);
        r.assert_active_circuits_ok(chan);

        r.make_circuit_inactive(b, chan);
        r.make_circuit_inactive(b, chan);
        // b still has a queued cell, so the count invariant is off; put
        // it back before asserting.
        r.make_circuit_active(b, chan);
        r.assert_active_circuits_ok(chan);

        // Draining everything empties the ring.
        while r.flush_channel(&mut hooks, chan, 4) > 0 {}
        r.assert_active_circuits_ok(chan);
        assert!(r.chans[chan].active_head.is_none());
    }

    #[test]
    fn flush_is_round_robin_across_circuits() {
        let (mut r, chan, a, b) = two_circuits();
        let mut hooks = NoopHooks;
        busy_outbuf(&mut r, chan);

        for tag in 0..3 {
            let mut cell = test_cell(1, tag);
            r.append_cell_to_circuit_queue(&mut hooks, a, chan, &mut cell, Direction::Inbound);
            let mut cell = test_cell(2, 100 + tag);
            r.append_cell_to_circuit_queue(&mut hooks, b, chan, &mut cell, Direction::Inbound);
        }
        // One cell per flush call: the head advances each time.
        let junk = r.take_channel_output(chan).unwrap();
        assert_eq!(junk.len(), 1);
        let mut order = Vec::new();
        for _ in 0..6 {
            assert_eq!(r.flush_channel(&mut hooks, chan, 1), 1);
            let bytes = r.take_channel_output(chan).unwrap();
            let cell = Cell::unpack(&bytes).unwrap();
            order.push(u16::from(cell.circid()));
            r.assert_active_circuits_ok(chan);
        }
        assert_eq!(order, vec![1, 2, 1, 2, 1, 2]);
        assert_eq!(r.flush_channel(&mut hooks, chan, 1), 0);
    }

    #[test]
    fn queue_backpressure_blocks_and_unblocks_once() {
        let (mut r, chan, a, _b) = two_circuits();
        let mut hooks = NoopHooks;
        busy_outbuf(&mut r, chan);

        let sid = StreamId::new(7).unwrap();
        let sk = r.add_exit_stream(a, sid, false).unwrap();
        r.start_reading(&mut hooks, sk);
        assert!(r.streams[sk].is_reading());

        // Crossing the high-water mark stops the edge reader.
        for tag in 0..CELL_QUEUE_HIGHWATER_SIZE {
            let mut cell = test_cell(1, tag as u8);
            r.append_cell_to_circuit_queue(&mut hooks, a, chan, &mut cell, Direction::Inbound);
        }
        assert!(r.streams[sk].blocked_on_circ);
        assert!(!r.streams[sk].is_reading());
        match &r.circs[a].kind {
            CircuitKind::Transit(t) => assert!(t.streams_blocked_on_p),
            CircuitKind::Origin(_) => unreachable!(),
        }

        // Drain down to the low-water mark: one flush of 193 cells
        // leaves 63 queued, and the streams resume.
        assert_eq!(r.flush_channel(&mut hooks, chan, 193), 193);
        assert_eq!(r.circs[a].queue_len(ChanSide::Previous), 63);
        assert!(!r.streams[sk].blocked_on_circ);
        assert!(r.streams[sk].is_reading());
    }

    #[test]
    fn relay_early_downgraded_on_old_links() {
        let mut r = Reactor::new(0);
        let mut hooks = NoopHooks;
        let chan = r.add_channel(1);
        let circ = r
            .add_transit_circuit(chan, CircId::new(3).unwrap(), &seed(3))
            .unwrap();
        let mut cell = test_cell(3, 9);
        cell.set_cmd(ChanCmd::RELAY_EARLY);
        r.append_cell_to_circuit_queue(&mut hooks, circ, chan, &mut cell, Direction::Inbound);
        while r.flush_channel(&mut hooks, chan, 4) > 0 {}
        let bytes = r.take_channel_output(chan).unwrap();
        let cell = Cell::unpack(&bytes).unwrap();
        assert_eq!(cell.cmd(), ChanCmd::RELAY);
    }

    #[test]
    fn append_primes_an_empty_outbuf() {
        let (mut r, chan, a, _b) = two_circuits();
        let mut hooks = NoopHooks;
        assert_eq!(r.chans[chan].outbuf_len(), 0);
        let mut cell = test_cell(1, 5);
        r.append_cell_to_circuit_queue(&mut hooks, a, chan, &mut cell, Direction::Inbound);
        // The cell went straight through the queue into the outbuf.
        assert_eq!(r.chans[chan].outbuf_len(), CELL_NETWORK_LEN);
        assert_eq!(r.circs[a].queue_len(ChanSide::Previous), 0);
        assert!(r.chans[chan].active_head.is_none());
        r.assert_active_circuits_ok(chan);
    }

    #[test]
    fn mark_for_close_drains_queues_and_deactivates() {
        let (mut r, chan, a, b) = two_circuits();
        let mut hooks = NoopHooks;
        busy_outbuf(&mut r, chan);
        for tag in 0..4 {
            let mut cell = test_cell(1, tag);
            r.append_cell_to_circuit_queue(&mut hooks, a, chan, &mut cell, Direction::Inbound);
            let mut cell = test_cell(2, tag);
            r.append_cell_to_circuit_queue(&mut hooks, b, chan, &mut cell, Direction::Inbound);
        }
        let sk = r.add_exit_stream(a, StreamId::new(4).unwrap(), false).unwrap();
        r.mark_circuit_for_close(&mut hooks, a, onion_cell::chancell::DestroyReason::PROTOCOL);
        r.assert_active_circuits_ok(chan);
        assert_eq!(r.circs[a].queue_len(ChanSide::Previous), 0);
        assert!(r.streams[sk].is_marked_for_close());
        // The other circuit's cells are unaffected.
        assert_eq!(r.circs[b].queue_len(ChanSide::Previous), 4);
        // Closing is idempotent.
        r.mark_circuit_for_close(&mut hooks, a, onion_cell::chancell::DestroyReason::NONE);
        assert_eq!(
            r.circs[a].marked_for_close,
            Some(onion_cell::chancell::DestroyReason::PROTOCOL)
        );
        r.remove_circuit(a).unwrap();
        assert!(r.circuit(a).is_none());
        assert!(r.stream(sk).is_none());
    }
}

//! Relay cell handling: the receive dispatcher, the package (send)
//! path, and the flow-control decisions in between.
//!
//! The receive path decrypts one layer per hop, decides whether a cell
//! is addressed to this node, and either dispatches it by command or
//! forwards it toward the other side of the circuit.  The send path
//! packages stream bytes (or control messages) into relay cells,
//! layer-encrypts them, and queues them toward the right channel.

use crate::circuit::{CircKey, CircuitKind, Direction, HopState, CircPurpose};
use crate::crypto::cell::{
    HopNum, InboundClientLayer, InboundRelayLayer, OutboundClientLayer, OutboundRelayLayer,
};
use crate::hooks::EngineHooks;
use crate::reactor::Reactor;
use crate::stream::{RequestKind, StreamKey, StreamState};
use crate::util::err::internal;
use crate::{Error, Result};
use onion_cell::chancell::{
    BoxedCellBody, Cell, ChanCmd, DestroyReason, CELL_DATA_LEN, CELL_NETWORK_LEN,
};
use onion_cell::relaycell::msg::{Connected, End, EndReason, Resolved, ResolvedAnswer};
use onion_cell::relaycell::{RelayCmd, RelayHeader, StreamId, RELAY_HEADER_LEN, RELAY_PAYLOAD_LEN};
use std::net::IpAddr;
use tracing::{debug, info, trace, warn};

/// How many times we will retry a stream that fails due to a resolve
/// failure or a miscellaneous error before giving up on it.
pub const MAX_RESOLVE_FAILURES: u32 = 3;

/// What the crypto pipeline decided about a cell on the receive path.
enum RelayCryptOutcome {
    /// The cell is addressed to this node.  At the origin, the hop that
    /// sent it; elsewhere None.
    Recognized(Option<HopNum>),
    /// The cell belongs to somebody further along; pass it on.
    NotRecognized,
}

impl Reactor {
    /// Receive a relay cell that arrived on `circ` travelling in
    /// `direction`.
    ///
    /// Decrypt it one layer (or all layers, at the origin), deliver it
    /// locally if it is recognized, and otherwise enqueue it toward the
    /// opposite side.  On error the circuit is marked for close with
    /// the matching reason, and the error is returned.
    pub fn receive_relay_cell(
        &mut self,
        hooks: &mut dyn EngineHooks,
        circ: CircKey,
        cell: &mut Cell,
        direction: Direction,
    ) -> Result<()> {
        match self.receive_relay_cell_inner(hooks, circ, cell, direction) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.mark_circuit_for_close(hooks, circ, e.close_reason());
                Err(e)
            }
        }
    }

    /// The receive path proper; errors propagate to
    /// [`receive_relay_cell`], which turns them into a close.
    fn receive_relay_cell_inner(
        &mut self,
        hooks: &mut dyn EngineHooks,
        circ: CircKey,
        cell: &mut Cell,
        direction: Direction,
    ) -> Result<()> {
        // A rendezvous splice re-enters this loop at most once, as an
        // inbound delivery on the peer circuit.
        let mut circ = circ;
        let mut direction = direction;
        loop {
            if self.circ(circ)?.marked_for_close.is_some() {
                return Ok(());
            }
            self.stats.n_bytes_read += CELL_NETWORK_LEN as u64;

            match self.relay_crypt(circ, cell, direction)? {
                RelayCryptOutcome::Recognized(hop_hint) => {
                    let rh = RelayHeader::unpack(&cell.body()[..])?;
                    let stream = self.relay_lookup_stream(circ, &rh, direction, hop_hint);
                    self.stats.n_relay_cells_delivered += 1;
                    trace!(
                        "cell for us: command {} stream {}",
                        rh.cmd,
                        StreamId::get_or_zero(rh.stream_id)
                    );
                    return self.process_relay_cell(hooks, circ, cell, &rh, stream, hop_hint);
                }
                RelayCryptOutcome::NotRecognized => {}
            }

            // Not recognized: pass it on.
            let (next_circ_id, next_chan) = match direction {
                Direction::Outbound => {
                    let c = self.circ(circ)?;
                    (c.n_circ_id, c.n_chan)
                }
                Direction::Inbound => match &self.circ(circ)?.kind {
                    CircuitKind::Transit(t) => (t.p_circ_id, t.p_chan),
                    CircuitKind::Origin(_) => {
                        warn!("Dropping unrecognized inbound cell on an origin circuit.");
                        return Ok(());
                    }
                },
            };

            if let Some(chan) = next_chan {
                let id = next_circ_id
                    .ok_or_else(|| internal!("forwarding over a channel with no circuit id"))?;
                cell.set_circid(id);
                trace!("Passing on unrecognized cell.");
                self.stats.n_relay_cells_relayed += 1;
                self.append_cell_to_circuit_queue(hooks, circ, chan, cell, direction);
                return Ok(());
            }

            // No channel on that side.  An outbound cell may cross a
            // rendezvous splice and re-enter the peer circuit as if
            // received from its previous side.
            let splice = match (direction, &self.circ(circ)?.kind) {
                (Direction::Outbound, CircuitKind::Transit(t)) => t.rend_splice,
                _ => None,
            };
            if let Some(peer) = splice {
                debug_assert_eq!(self.circ(circ)?.purpose, CircPurpose::RendEstablished);
                let peer_id = self
                    .circ(peer)?
                    .transit()?
                    .p_circ_id
                    .ok_or_else(|| internal!("spliced circuit with no previous circuit id"))?;
                cell.set_circid(peer_id);
                circ = peer;
                direction = Direction::Inbound;
                continue;
            }

            warn!("Didn't recognize the cell, but the circuit stops here! Closing.");
            return Err(Error::CircProto(
                "unrecognized cell at the end of a circuit".into(),
            ));
        }
    }

    /// Do the appropriate en/decryptions for a cell arriving on `circ`
    /// in `direction`, and decide whether it is addressed to this node.
    ///
    /// Inbound at the origin, decrypt hop by hop, stopping at the first
    /// open hop whose digest authenticates the cell.  Inbound at a
    /// transit node, add one layer of encryption; such a cell is never
    /// recognized here.  Outbound (transit only), strip one layer and
    /// test recognition.
    fn relay_crypt(
        &mut self,
        circ: CircKey,
        cell: &mut Cell,
        direction: Direction,
    ) -> Result<RelayCryptOutcome> {
        let c = self.circ_mut(circ)?;
        match (direction, &mut c.kind) {
            (Direction::Inbound, CircuitKind::Origin(org)) => {
                if org.hops.first().map(|h| h.state) != Some(HopState::Open) {
                    warn!("Relay cell before the first hop was created? Closing.");
                    return Err(Error::CircProto(
                        "relay cell on a circuit with no open hops".into(),
                    ));
                }
                // The hop list is in forward order: first hop first.
                // Decryption halts at the first hop that authenticates.
                for (i, hop) in org.hops.iter_mut().enumerate() {
                    if i > 0 && hop.state != HopState::Open {
                        break;
                    }
                    if hop.back.decrypt_inbound(cell.body_mut()) {
                        return Ok(RelayCryptOutcome::Recognized(Some(HopNum::from(i as u8))));
                    }
                }
                warn!("Incoming cell at the origin not recognized. Closing.");
                Err(Error::BadCellAuth)
            }
            (Direction::Inbound, CircuitKind::Transit(t)) => {
                t.inbound.encrypt_inbound(cell.body_mut());
                Ok(RelayCryptOutcome::NotRecognized)
            }
            (Direction::Outbound, CircuitKind::Transit(t)) => {
                if t.outbound.decrypt_outbound(cell.body_mut()) {
                    Ok(RelayCryptOutcome::Recognized(None))
                } else {
                    Ok(RelayCryptOutcome::NotRecognized)
                }
            }
            (Direction::Outbound, CircuitKind::Origin(_)) => {
                Err(internal!("outbound relay cell received at the origin"))
            }
        }
    }

    /// If the cell's stream id matches a live stream attached to
    /// `circ`, return it.
    fn relay_lookup_stream(
        &self,
        circ: CircKey,
        rh: &RelayHeader,
        direction: Direction,
        hop_hint: Option<HopNum>,
    ) -> Option<StreamKey> {
        let sid = rh.stream_id?;
        let c = self.circs.get(circ)?;
        match &c.kind {
            CircuitKind::Origin(o) => {
                for sk in &o.streams {
                    let Some(s) = self.streams.get(*sk) else {
                        continue;
                    };
                    if s.id == sid && !s.marked_for_close && s.hop == hop_hint {
                        return Some(*sk);
                    }
                }
                None
            }
            CircuitKind::Transit(t) => {
                for sk in &t.n_streams {
                    let Some(s) = self.streams.get(*sk) else {
                        continue;
                    };
                    if s.id == sid && !s.marked_for_close {
                        // Now that rendezvous streams exist, inbound
                        // cells can be for an exit-side stream too.
                        if direction == Direction::Outbound || s.is_rendezvous {
                            return Some(*sk);
                        }
                    }
                }
                for sk in &t.resolving_streams {
                    let Some(s) = self.streams.get(*sk) else {
                        continue;
                    };
                    if s.id == sid && !s.marked_for_close {
                        return Some(*sk);
                    }
                }
                // Probably a BEGIN for a stream that doesn't exist yet.
                None
            }
        }
    }

    /// Dispatch a recognized relay cell by command.
    ///
    /// `stream` is the stream the cell is addressed to, or None for a
    /// control cell.  `hop_hint` is the hop that packaged the cell when
    /// we are the origin, and None otherwise.  A negative outcome tears
    /// the circuit down; anything merely suspicious is dropped for
    /// forward compatibility.
    fn process_relay_cell(
        &mut self,
        hooks: &mut dyn EngineHooks,
        circ: CircKey,
        cell: &Cell,
        rh: &RelayHeader,
        stream: Option<StreamKey>,
        hop_hint: Option<HopNum>,
    ) -> Result<()> {
        let body: Vec<u8> =
            cell.body()[RELAY_HEADER_LEN..RELAY_HEADER_LEN + usize::from(rh.length)].to_vec();

        // A stream that is not yet open has its own, smaller state
        // machine.
        if let Some(sk) = stream {
            if self.stream_mut(sk)?.state != StreamState::Open {
                return self.process_relay_cell_not_open(hooks, circ, cell, rh, &body, sk, hop_hint);
            }
        }

        match rh.cmd {
            RelayCmd::DROP => {
                // Long-range padding; ignore.
                Ok(())
            }
            RelayCmd::BEGIN | RelayCmd::BEGIN_DIR => {
                let purpose = self.circ(circ)?.purpose;
                if hop_hint.is_some() && purpose != CircPurpose::RendJoined {
                    warn!("Relay begin request unsupported at origin. Dropping.");
                    return Ok(());
                }
                if purpose == CircPurpose::RendJoined {
                    let n_hops = self.circ(circ)?.origin()?.hops.len();
                    let last = HopNum::from((n_hops.saturating_sub(1)) as u8);
                    if hop_hint != Some(last) {
                        warn!("Relay begin request to a joined rendezvous from an intermediary hop. Dropping.");
                        return Ok(());
                    }
                }
                if stream.is_some() {
                    warn!("Begin cell for a known stream. Dropping.");
                    return Ok(());
                }
                hooks.exit_begin_conn(circ, cell)
            }
            RelayCmd::DATA => {
                self.stats.n_data_cells_received += 1;
                let window_ok = {
                    let c = self.circ_mut(circ)?;
                    match (&mut c.kind, hop_hint) {
                        (CircuitKind::Origin(o), Some(h)) => o
                            .hops
                            .get_mut(usize::from(h))
                            .ok_or(Error::NoSuchHop)?
                            .deliver_window
                            .take(),
                        (CircuitKind::Transit(t), None) => t.deliver_window.take(),
                        _ => Err(internal!("data cell with a mismatched hop hint")),
                    }
                };
                if let Err(e) = window_ok {
                    warn!("(relay data) circuit deliver window below 0. Killing.");
                    if let Some(sk) = stream {
                        self.edge_end(hooks, sk, EndReason::TORPROTOCOL);
                        self.mark_stream_for_close(hooks, sk, EndReason::TORPROTOCOL, false);
                    }
                    return Err(e);
                }

                self.consider_sending_circ_sendme(hooks, circ, hop_hint);

                let Some(sk) = stream else {
                    info!(
                        "data cell dropped, unknown stream (streamid {}).",
                        StreamId::get_or_zero(rh.stream_id)
                    );
                    return Ok(());
                };

                if self.stream_mut(sk)?.deliver_window.take().is_err() {
                    warn!("(relay data) stream deliver window below 0. Killing.");
                    return Err(Error::CircProto("stream deliver window underflow".into()));
                }

                self.stats.n_data_bytes_received += body.len() as u64;
                self.stream_mut(sk)?.outbuf.extend_from_slice(&body);
                self.consider_sending_stream_sendme(hooks, sk);
                Ok(())
            }
            RelayCmd::END => {
                let end = End::decode(&body).unwrap_or_else(|_| End::new_misc());
                let Some(sk) = stream else {
                    info!("end cell ({}) dropped, unknown stream.", end.reason());
                    return Ok(());
                };
                info!(
                    "end cell ({}) for stream {}. Removing stream.",
                    end.reason(),
                    StreamId::get_or_zero(rh.stream_id)
                );
                // We just *got* an END; no reason to send one back.
                self.stream_mut(sk)?.has_sent_end = true;
                self.mark_stream_for_close(hooks, sk, end.reason(), true);
                self.stream_mut(sk)?.hold_open_until_flushed = true;
                Ok(())
            }
            RelayCmd::EXTEND => {
                if stream.is_some() {
                    warn!("'extend' cell received for a nonzero stream. Dropping.");
                    return Ok(());
                }
                if hop_hint.is_some() {
                    warn!("'extend' cell received at the origin. Dropping.");
                    return Ok(());
                }
                hooks.circuit_extend(circ, cell)
            }
            RelayCmd::EXTENDED => {
                if hop_hint.is_none() {
                    warn!("'extended' cell unsupported at non-origin. Dropping.");
                    return Ok(());
                }
                debug!("Got an extended cell!");
                hooks.circuit_finish_handshake(circ, &body)?;
                hooks.circuit_send_next_onion_skin(circ)?;
                Ok(())
            }
            RelayCmd::TRUNCATE => {
                if hop_hint.is_some() {
                    warn!("'truncate' cell unsupported at the origin. Dropping.");
                    return Ok(());
                }
                let (n_chan, n_circ_id) = {
                    let c = self.circ(circ)?;
                    (c.n_chan, c.n_circ_id)
                };
                if let (Some(chan), Some(id)) = (n_chan, n_circ_id) {
                    let trunc_reason = body
                        .first()
                        .copied()
                        .map(DestroyReason::from)
                        .unwrap_or(DestroyReason::NONE);
                    hooks.send_destroy(chan, id, trunc_reason);
                    self.make_circuit_inactive(circ, chan);
                    let c = self.circ_mut(circ)?;
                    c.n_chan = None;
                    c.n_circ_id = None;
                    let mut queue = std::mem::take(&mut c.n_queue);
                    queue.clear(&mut self.pool);
                }
                debug!("Processed 'truncate', replying.");
                let payload = [u8::from(DestroyReason::REQUESTED)];
                self.send_relay_command_from_edge(
                    hooks,
                    circ,
                    None,
                    RelayCmd::TRUNCATED,
                    &payload,
                    None,
                )
            }
            RelayCmd::TRUNCATED => {
                let Some(hop) = hop_hint else {
                    warn!("'truncated' cell unsupported at non-origin. Dropping.");
                    return Ok(());
                };
                // The circuit now ends at the hop that answered.
                self.circ_mut(circ)?
                    .origin_mut()?
                    .hops
                    .truncate(usize::from(hop) + 1);
                hooks.circuit_truncated(circ, hop);
                Ok(())
            }
            RelayCmd::CONNECTED => {
                if stream.is_some() {
                    warn!("'connected' cell unsupported while a stream is open. Closing circuit.");
                    return Err(Error::CircProto(
                        "connected cell on an open stream".into(),
                    ));
                }
                info!("'connected' received, no stream attached anymore. Ignoring.");
                Ok(())
            }
            RelayCmd::SENDME => {
                match stream {
                    None => {
                        // Circuit-level sendme.
                        match hop_hint {
                            Some(h) => {
                                let hop = self.circ_mut(circ)?.hop_mut(h)?;
                                hop.package_window.put()?;
                                debug!(
                                    "circuit-level sendme at origin, package window now {}.",
                                    hop.package_window.window()
                                );
                            }
                            None => {
                                let t = self.circ_mut(circ)?.transit_mut()?;
                                t.package_window.put()?;
                                debug!(
                                    "circuit-level sendme at non-origin, package window now {}.",
                                    t.package_window.window()
                                );
                            }
                        }
                        self.resume_edge_reading(hooks, circ, hop_hint);
                        Ok(())
                    }
                    Some(sk) => {
                        {
                            let s = self.stream_mut(sk)?;
                            s.package_window.put()?;
                            debug!(
                                "stream-level sendme, package window now {}.",
                                s.package_window.window()
                            );
                        }
                        self.start_reading(hooks, sk);
                        // Handle whatever is waiting on the inbuf.
                        if self.package_raw_inbuf(hooks, sk, true).is_err() {
                            self.mark_stream_for_close(hooks, sk, EndReason::INTERNAL, false);
                        }
                        Ok(())
                    }
                }
            }
            RelayCmd::RESOLVE => {
                if hop_hint.is_some() {
                    warn!("resolve request unsupported at origin; dropping.");
                    return Ok(());
                }
                if stream.is_some() {
                    warn!("resolve request for a known stream; dropping.");
                    return Ok(());
                }
                if self.circ(circ)?.purpose != CircPurpose::General {
                    warn!("resolve request on a special-purpose circuit; dropping.");
                    return Ok(());
                }
                hooks.exit_begin_resolve(circ, cell)
            }
            RelayCmd::RESOLVED => {
                if stream.is_some() {
                    warn!("'resolved' cell unsupported while a stream is open. Closing circuit.");
                    return Err(Error::CircProto("resolved cell on an open stream".into()));
                }
                info!("'resolved' received, no stream attached anymore. Ignoring.");
                Ok(())
            }
            RelayCmd::ESTABLISH_INTRO
            | RelayCmd::ESTABLISH_RENDEZVOUS
            | RelayCmd::INTRODUCE1
            | RelayCmd::INTRODUCE2
            | RelayCmd::INTRODUCE_ACK
            | RelayCmd::RENDEZVOUS1
            | RelayCmd::RENDEZVOUS2
            | RelayCmd::INTRO_ESTABLISHED
            | RelayCmd::RENDEZVOUS_ESTABLISHED => {
                hooks.rendezvous_cell(circ, hop_hint, rh.cmd, &body);
                Ok(())
            }
            _ => {
                // For forward compatibility, don't kill the circuit.
                warn!(
                    "Received unknown relay command {}. Perhaps the other side is using \
                     a newer protocol version? Dropping.",
                    rh.cmd
                );
                Ok(())
            }
        }
    }

    /// A recognized relay cell arrived for a stream that is not open
    /// yet.
    fn process_relay_cell_not_open(
        &mut self,
        hooks: &mut dyn EngineHooks,
        circ: CircKey,
        _cell: &Cell,
        rh: &RelayHeader,
        body: &[u8],
        sk: StreamKey,
        _hop_hint: Option<HopNum>,
    ) -> Result<()> {
        let is_client = self.stream_mut(sk)?.is_client;

        if rh.cmd == RelayCmd::END {
            if is_client && self.circ(circ)?.is_origin() {
                return self.process_end_not_open(hooks, circ, body, sk);
            }
            // We just got an 'end'; no need to send one.
            let reason = body
                .first()
                .copied()
                .map(EndReason::from)
                .unwrap_or(EndReason::MISC);
            self.stream_mut(sk)?.has_sent_end = true;
            self.mark_stream_for_close(hooks, sk, reason, true);
            return Ok(());
        }

        if is_client && rh.cmd == RelayCmd::CONNECTED {
            if self.stream_mut(sk)?.state != StreamState::ConnectWait {
                warn!("Got 'connected' while not in state connect_wait. Dropping.");
                return Ok(());
            }
            self.stream_mut(sk)?.state = StreamState::Open;
            info!("'connected' received for stream {}.", rh.stream_id.map_or(0, u16::from));
            let connected = Connected::decode(body)?;
            if let Some(addr) = connected.addr() {
                let ip = IpAddr::V4(addr);
                if addr.is_unspecified()
                    || (hooks.reject_internal_addresses() && hooks.is_internal_address(ip))
                {
                    info!("...but it claims the IP address was {}. Closing.", addr);
                    self.edge_end(hooks, sk, EndReason::TORPROTOCOL);
                    hooks.mark_unattached(sk, EndReason::TORPROTOCOL);
                    self.mark_stream_for_close(hooks, sk, EndReason::TORPROTOCOL, false);
                    return Ok(());
                }
                let (addr_str, chosen_exit) = {
                    let s = self.stream_mut(sk)?;
                    match &s.request {
                        Some(r) => (r.addr.clone(), r.chosen_exit.clone()),
                        None => (String::new(), None),
                    }
                };
                hooks.dns_set_addressmap(&addr_str, ip, chosen_exit.as_deref(), connected.ttl());
                hooks.stream_remapped(sk, ip);
            }
            // Don't answer SOCKS twice.
            if !self.stream_mut(sk)?.socks_replied {
                self.stream_mut(sk)?.socks_replied = true;
                hooks.socks_reply_connected(sk);
            }
            let is_dir = matches!(
                self.stream_mut(sk)?.request.as_ref().map(|r| r.kind),
                Some(RequestKind::Dir)
            );
            if is_dir {
                // A directory request just started to fetch something;
                // this could be a bootstrap milestone.
                hooks.dir_stream_connected(sk);
            }
            // Handle anything that might have queued on the inbuf.
            if self.package_raw_inbuf(hooks, sk, true).is_err() {
                self.mark_stream_for_close(hooks, sk, EndReason::INTERNAL, false);
            }
            return Ok(());
        }

        if is_client && rh.cmd == RelayCmd::RESOLVED {
            if self.stream_mut(sk)?.state != StreamState::ResolveWait {
                warn!("Got a 'resolved' cell while not in state resolve_wait. Dropping.");
                return Ok(());
            }
            debug_assert!(matches!(
                self.stream_mut(sk)?.request.as_ref().map(|r| r.kind),
                Some(RequestKind::Resolve)
            ));
            let resolved = match Resolved::decode(body) {
                Ok(r) => r,
                Err(_) => {
                    warn!("Dropping malformed 'resolved' cell.");
                    hooks.mark_unattached(sk, EndReason::TORPROTOCOL);
                    self.mark_stream_for_close(hooks, sk, EndReason::TORPROTOCOL, false);
                    return Ok(());
                }
            };
            if let ResolvedAnswer::Ip(ip @ IpAddr::V4(_)) = resolved.answer() {
                if hooks.reject_internal_addresses() && hooks.is_internal_address(*ip) {
                    info!("Got a resolve with answer {}. Rejecting.", ip);
                    hooks.socks_resolve_error(sk);
                    hooks.mark_unattached(sk, EndReason::TORPROTOCOL);
                    self.mark_stream_for_close(hooks, sk, EndReason::TORPROTOCOL, false);
                    return Ok(());
                }
            }
            hooks.socks_resolved(sk, &resolved);
            if let ResolvedAnswer::Ip(ip @ IpAddr::V4(_)) = resolved.answer() {
                hooks.stream_remapped(sk, *ip);
            }
            hooks.mark_unattached(sk, EndReason::DONE);
            self.mark_stream_for_close(hooks, sk, EndReason::DONE, false);
            return Ok(());
        }

        // For forward compatibility, don't kill the circuit.
        warn!(
            "Got an unexpected relay command {} on a stream that isn't open. Dropping.",
            rh.cmd
        );
        Ok(())
    }

    /// An END arrived for a client stream that never finished opening:
    /// decide whether to retry the request elsewhere.
    fn process_end_not_open(
        &mut self,
        hooks: &mut dyn EngineHooks,
        circ: CircKey,
        body: &[u8],
        sk: StreamKey,
    ) -> Result<()> {
        let end = End::decode(body).unwrap_or_else(|_| End::new_misc());
        let reason = end.reason();
        let retriable = matches!(
            reason,
            EndReason::HIBERNATING
                | EndReason::RESOURCELIMIT
                | EndReason::EXITPOLICY
                | EndReason::RESOLVEFAILED
                | EndReason::TIMEOUT
                | EndReason::CONNECTREFUSED
                | EndReason::MISC
        );
        let is_rend = self.stream_mut(sk)?.is_rendezvous;
        let request = self.stream_mut(sk)?.request.clone();

        // Avoid retrying rendezvous streams; there is nowhere else to
        // take them.
        if let (false, Some(req), true) = (body.is_empty(), request, retriable && !is_rend) {
            info!(
                "Address '{}' refused due to '{}'. Considering retrying.",
                req.addr, reason
            );
            match reason {
                EndReason::EXITPOLICY => {
                    if let Some((addr, ttl)) = end.addr() {
                        let zero = match addr {
                            IpAddr::V4(a) => a.is_unspecified(),
                            IpAddr::V6(a) => a.is_unspecified(),
                        };
                        if zero {
                            info!("Address '{}' resolved to 0.0.0.0. Closing.", req.addr);
                            hooks.mark_unattached(sk, EndReason::TORPROTOCOL);
                            self.mark_stream_for_close(hooks, sk, EndReason::TORPROTOCOL, false);
                            return Ok(());
                        }
                        if hooks.reject_internal_addresses() && hooks.is_internal_address(addr) {
                            info!("Address '{}' resolved to internal. Closing.", req.addr);
                            hooks.mark_unattached(sk, EndReason::TORPROTOCOL);
                            self.mark_stream_for_close(hooks, sk, EndReason::TORPROTOCOL, false);
                            return Ok(());
                        }
                        let ttl = (ttl != u32::MAX).then_some(ttl);
                        hooks.dns_set_addressmap(&req.addr, addr, req.chosen_exit.as_deref(), ttl);
                    }
                    // Check whether the exit *ought* to have allowed
                    // this: if it refused an address it never resolved,
                    // or an address literal we never steered toward it,
                    // its declared policy is too generous.
                    if end.addr().is_none()
                        || (req.addr.parse::<IpAddr>().is_ok() && req.chosen_exit.is_none())
                    {
                        info!(
                            "Exit seems more restrictive than its exit policy. \
                             Not using this exit for now."
                        );
                        hooks.exitpolicy_reject_all(circ);
                    }
                    self.clear_chosen_exit(sk);
                    if hooks.detach_retriable(sk, circ, reason) {
                        self.detach_stream(sk)?;
                        return Ok(());
                    }
                }
                EndReason::CONNECTREFUSED if !req.chosen_exit_optional => {
                    // A refused connection to a mandatory exit closes
                    // the stream below.
                }
                EndReason::CONNECTREFUSED
                | EndReason::RESOLVEFAILED
                | EndReason::TIMEOUT
                | EndReason::MISC => {
                    if hooks.dns_incr_failures(&req.addr) < MAX_RESOLVE_FAILURES {
                        // We haven't retried too many times; reattach.
                        self.clear_chosen_exit(sk);
                        if hooks.detach_retriable(sk, circ, reason) {
                            self.detach_stream(sk)?;
                            return Ok(());
                        }
                    } else {
                        info!(
                            "Have tried resolving or connecting to address '{}' at {} \
                             different places. Giving up.",
                            req.addr, MAX_RESOLVE_FAILURES
                        );
                        // Clear the failures, so it gets a full set of
                        // retries next time.
                        hooks.dns_clear_failures(&req.addr);
                    }
                }
                EndReason::HIBERNATING | EndReason::RESOURCELIMIT => {
                    hooks.exitpolicy_reject_all(circ);
                    self.clear_chosen_exit(sk);
                    if hooks.detach_retriable(sk, circ, reason) {
                        self.detach_stream(sk)?;
                        return Ok(());
                    }
                }
                _ => {}
            }
            info!("Giving up on retrying; stream can't be handled.");
        }

        info!(
            "Edge got end ({}) before we're connected. Marking for close.",
            reason
        );
        if !self.stream_mut(sk)?.marked_for_close {
            hooks.mark_unattached(sk, reason);
            self.mark_stream_for_close(hooks, sk, reason, true);
        }
        Ok(())
    }

    /// Stop wanting a specific exit for a stream.
    fn clear_chosen_exit(&mut self, sk: StreamKey) {
        if let Ok(s) = self.stream_mut(sk) {
            if let Some(req) = s.request.as_mut() {
                if req.chosen_exit_optional || req.chosen_exit_retries > 0 {
                    req.chosen_exit_optional = false;
                    req.chosen_exit_retries = 0;
                    req.chosen_exit = None;
                }
            }
        }
    }

    /// Make a relay cell out of `cmd` and `payload`, and send it onto
    /// `circ`.
    ///
    /// `stream_id` is the sending stream's id, or None for a control
    /// cell.  `hop` is None for cells toward the origin, or the
    /// destination hop for cells away from it (which makes this the
    /// origin).  On failure the circuit is marked for close and an
    /// error is returned.
    pub fn send_relay_command_from_edge(
        &mut self,
        hooks: &mut dyn EngineHooks,
        circ: CircKey,
        stream_id: Option<StreamId>,
        cmd: RelayCmd,
        payload: &[u8],
        hop: Option<HopNum>,
    ) -> Result<()> {
        if payload.len() > RELAY_PAYLOAD_LEN {
            return Err(internal!("relay payload too long"));
        }
        debug_assert!(cmd.accepts_streamid_val(stream_id));
        let direction = match hop {
            Some(_) => Direction::Outbound,
            None => {
                if self.circ(circ)?.is_origin() {
                    return Err(internal!("inbound send from an origin circuit"));
                }
                Direction::Inbound
            }
        };

        let mut body: BoxedCellBody = Box::new([0_u8; CELL_DATA_LEN]);
        let rh = RelayHeader::new(cmd, stream_id, payload.len() as u16);
        rh.pack(&mut body[..])?;
        body[RELAY_HEADER_LEN..RELAY_HEADER_LEN + payload.len()].copy_from_slice(payload);

        trace!(
            "delivering {} cell {}.",
            cmd,
            match direction {
                Direction::Outbound => "forward",
                Direction::Inbound => "backward",
            }
        );

        let mut chan_cmd = ChanCmd::RELAY;
        if direction == Direction::Outbound {
            let org = self.circ_mut(circ)?.origin_mut()?;
            if org.remaining_early > 0
                && (cmd == RelayCmd::EXTEND || hop.map_or(false, |h| !h.is_first_hop()))
            {
                // If we still have RELAY_EARLY cells, and this is an
                // extension or we're talking past the first hop, spend
                // one.  (The queue layer downgrades it again for links
                // that predate RELAY_EARLY.)
                chan_cmd = ChanCmd::RELAY_EARLY;
                org.remaining_early -= 1;
                debug!(
                    "Sending a RELAY_EARLY cell; {} remaining.",
                    org.remaining_early
                );
                org.early_commands.push(cmd);
            } else if cmd == RelayCmd::EXTEND {
                let commands = org
                    .early_commands
                    .iter()
                    .map(|c| c.to_string())
                    .collect::<Vec<_>>()
                    .join(",");
                warn!(
                    "We're sending an EXTEND cell, but we have run out of RELAY_EARLY \
                     cells on this circuit. Commands sent before: {}",
                    commands
                );
            }
        }

        if let Err(e) = self.package_relay_cell(hooks, circ, body, chan_cmd, direction, hop) {
            warn!("packaging relay cell failed ({}). Closing.", e);
            self.mark_circuit_for_close(hooks, circ, DestroyReason::INTERNAL);
            return Err(Error::CircuitClosed);
        }
        Ok(())
    }

    /// Encrypt a finished relay cell body to the right layer and append
    /// it to the right queue.
    fn package_relay_cell(
        &mut self,
        hooks: &mut dyn EngineHooks,
        circ: CircKey,
        mut body: BoxedCellBody,
        chan_cmd: ChanCmd,
        direction: Direction,
        hop: Option<HopNum>,
    ) -> Result<()> {
        match direction {
            Direction::Outbound => {
                let (n_chan, n_circ_id) = {
                    let c = self.circ(circ)?;
                    if !c.is_origin() {
                        return Err(internal!("outbound package on a transit circuit"));
                    }
                    (c.n_chan, c.n_circ_id)
                };
                let Some(chan) = n_chan else {
                    warn!("outgoing relay cell has no next channel. Dropping.");
                    return Ok(());
                };
                let target = hop.ok_or_else(|| internal!("outbound package with no hop"))?;
                {
                    let org = self.circ_mut(circ)?.origin_mut()?;
                    let t = usize::from(target);
                    if t >= org.hops.len() {
                        return Err(Error::NoSuchHop);
                    }
                    // Set the digest at the target hop, then apply one
                    // forward cipher per hop from the target down to
                    // and including the first.
                    org.hops[t].fwd.originate_for(&mut body);
                    for hop in org.hops[..t].iter_mut().rev() {
                        hop.fwd.encrypt_outbound(&mut body);
                    }
                }
                let id =
                    n_circ_id.ok_or_else(|| internal!("next channel without a circuit id"))?;
                let mut cell = Cell::new(id, chan_cmd, body);
                self.stats.n_relay_cells_relayed += 1;
                self.append_cell_to_circuit_queue(hooks, circ, chan, &mut cell, direction);
                Ok(())
            }
            Direction::Inbound => {
                let (p_chan, p_circ_id) = {
                    let t = self.circ_mut(circ)?.transit_mut()?;
                    t.inbound.originate(&mut body);
                    (t.p_chan, t.p_circ_id)
                };
                let (Some(chan), Some(id)) = (p_chan, p_circ_id) else {
                    warn!("incoming relay cell has no previous channel. Dropping.");
                    return Ok(());
                };
                let mut cell = Cell::new(id, chan_cmd, body);
                self.stats.n_relay_cells_relayed += 1;
                self.append_cell_to_circuit_queue(hooks, circ, chan, &mut cell, direction);
                Ok(())
            }
        }
    }

    /// Make a relay cell from a stream and send it onto the stream's
    /// circuit, in the direction the stream faces.
    pub fn send_command_from_stream(
        &mut self,
        hooks: &mut dyn EngineHooks,
        sk: StreamKey,
        cmd: RelayCmd,
        payload: &[u8],
    ) -> Result<()> {
        let (circ, id, hop, marked, is_client) = {
            let s = self.stream_mut(sk)?;
            (s.circ, s.id, s.hop, s.marked_for_close, s.is_client)
        };
        if marked {
            warn!("called on a stream already marked for close.");
            return Ok(());
        }
        let circuit_ok = self
            .circs
            .get(circ)
            .map(|c| c.marked_for_close.is_none())
            .unwrap_or(false);
        if !circuit_ok {
            info!("stream has no circuit. Closing stream.");
            if is_client {
                hooks.mark_unattached(sk, EndReason::INTERNAL);
            } else if let Ok(s) = self.stream_mut(sk) {
                s.has_sent_end = true;
            }
            self.mark_stream_for_close(hooks, sk, EndReason::INTERNAL, false);
            return Err(Error::CircuitClosed);
        }
        self.send_relay_command_from_edge(hooks, circ, Some(id), cmd, payload, hop)
    }

    /// While a stream's inbuf has a full relay payload of bytes (or any
    /// bytes, when `package_partial`), and the package windows aren't
    /// empty, package a DATA cell and send it down the circuit.
    pub fn package_raw_inbuf(
        &mut self,
        hooks: &mut dyn EngineHooks,
        sk: StreamKey,
        package_partial: bool,
    ) -> Result<()> {
        loop {
            let (circ, hop, marked) = {
                let s = self.stream_mut(sk)?;
                (s.circ, s.hop, s.marked_for_close)
            };
            if marked {
                warn!("called on a stream marked for close.");
                return Ok(());
            }
            let circuit_ok = self
                .circs
                .get(circ)
                .map(|c| c.marked_for_close.is_none())
                .unwrap_or(false);
            if !circuit_ok {
                info!("stream has no circuit! Closing.");
                self.mark_stream_for_close(hooks, sk, EndReason::DESTROY, false);
                return Ok(());
            }

            if self.consider_stop_edge_reading(hooks, circ, hop) {
                return Ok(());
            }
            if self.stream_mut(sk)?.package_window.window() == 0 {
                info!("called with a package window of 0. Skipping.");
                self.stop_reading(hooks, sk);
                return Ok(());
            }

            let amount_to_process = self.stream_mut(sk)?.inbuf.len();
            if amount_to_process == 0 {
                return Ok(());
            }
            if !package_partial && amount_to_process < RELAY_PAYLOAD_LEN {
                return Ok(());
            }
            let length = amount_to_process.min(RELAY_PAYLOAD_LEN);

            let payload = self.stream_mut(sk)?.inbuf.split_to(length);
            self.stats.n_data_cells_packaged += 1;
            self.stats.n_data_bytes_packaged += length as u64;
            debug!(
                "Packaging {} bytes ({} waiting).",
                length,
                amount_to_process - length
            );

            if self
                .send_command_from_stream(hooks, sk, RelayCmd::DATA, &payload)
                .is_err()
            {
                // The circuit got marked for close; don't continue, and
                // don't mark the stream: that already happened if it
                // was going to.
                return Ok(());
            }

            // One token off the circuit (or hop) window...
            {
                let c = self.circ_mut(circ)?;
                match (&mut c.kind, hop) {
                    (CircuitKind::Origin(o), Some(h)) => o
                        .hops
                        .get_mut(usize::from(h))
                        .ok_or(Error::NoSuchHop)?
                        .package_window
                        .take()?,
                    (CircuitKind::Transit(t), None) => t.package_window.take()?,
                    _ => return Err(internal!("stream hop does not match its circuit")),
                }
            }
            // ...and one off the stream window.
            let window = {
                let s = self.stream_mut(sk)?;
                s.package_window.take()?;
                s.package_window.window()
            };
            if window == 0 {
                self.stop_reading(hooks, sk);
                debug!("stream package window reached 0.");
                self.consider_stop_edge_reading(hooks, circ, hop);
                return Ok(());
            }
            debug!("stream package window is now {}.", window);
            // Handle more if there's more.
        }
    }

    /// Called when we've just delivered a DATA cell to a stream: if the
    /// stream's deliver window is low, send back a suitable number of
    /// stream-level SENDMEs.
    pub(crate) fn consider_sending_stream_sendme(
        &mut self,
        hooks: &mut dyn EngineHooks,
        sk: StreamKey,
    ) {
        loop {
            let should = match self.streams.get(sk) {
                Some(s) => s.deliver_window.should_ack(),
                None => return,
            };
            if !should {
                return;
            }
            debug!("Queuing stream sendme.");
            if let Ok(s) = self.stream_mut(sk) {
                s.deliver_window.put();
            }
            if self
                .send_command_from_stream(hooks, sk, RelayCmd::SENDME, &[])
                .is_err()
            {
                warn!("failed to queue a stream sendme. Skipping.");
                // The circuit's closed; don't continue.
                return;
            }
        }
    }

    /// Check if the deliver window for `circ` (at `hop`, at the origin)
    /// is low enough that we should send a circuit-level SENDME back
    /// along the circuit; if so, send enough to fill the window back
    /// up.
    pub(crate) fn consider_sending_circ_sendme(
        &mut self,
        hooks: &mut dyn EngineHooks,
        circ: CircKey,
        hop: Option<HopNum>,
    ) {
        loop {
            let should = {
                let Some(c) = self.circs.get_mut(circ) else {
                    return;
                };
                match (&mut c.kind, hop) {
                    (CircuitKind::Origin(o), Some(h)) => o
                        .hops
                        .get_mut(usize::from(h))
                        .map(|hp| {
                            let s = hp.deliver_window.should_ack();
                            if s {
                                hp.deliver_window.put();
                            }
                            s
                        })
                        .unwrap_or(false),
                    (CircuitKind::Transit(t), None) => {
                        let s = t.deliver_window.should_ack();
                        if s {
                            t.deliver_window.put();
                        }
                        s
                    }
                    _ => false,
                }
            };
            if !should {
                return;
            }
            debug!("Queuing circuit sendme.");
            if self
                .send_relay_command_from_edge(hooks, circ, None, RelayCmd::SENDME, &[], hop)
                .is_err()
            {
                warn!("failed to queue a circuit sendme. Circuit's closed.");
                return;
            }
        }
    }

    /// The circuit has received a circuit-level SENDME (on `hop`, if we
    /// are the origin): let the attached streams resume reading and
    /// packaging, while their windows allow it.
    pub(crate) fn resume_edge_reading(
        &mut self,
        hooks: &mut dyn EngineHooks,
        circ: CircKey,
        hop: Option<HopNum>,
    ) {
        debug!("resuming edge reading");
        let list = match self.circs.get(circ).map(|c| &c.kind) {
            Some(CircuitKind::Origin(o)) => o.streams.clone(),
            Some(CircuitKind::Transit(t)) => t.n_streams.clone(),
            None => return,
        };
        for sk in list {
            let (marked, window, stream_hop) = match self.streams.get(sk) {
                Some(s) => (s.marked_for_close, s.package_window.window(), s.hop),
                None => continue,
            };
            if marked {
                continue;
            }
            if window > 0 && (hop.is_none() || stream_hop == hop) {
                self.start_reading(hooks, sk);
                // Handle whatever might still be on the inbuf.
                if self.package_raw_inbuf(hooks, sk, true).is_err() {
                    self.mark_stream_for_close(hooks, sk, EndReason::INTERNAL, false);
                    continue;
                }
                // If the circuit won't accept any more data, stop
                // here; every stream that had to stop reading already
                // did, inside package_raw_inbuf.
                if self.consider_stop_edge_reading(hooks, circ, hop) {
                    return;
                }
            }
        }
    }

    /// Check if the package window for `circ` (at `hop`, if we are the
    /// origin) is empty.  If so, tell the attached edge streams to stop
    /// reading and return true.
    pub(crate) fn consider_stop_edge_reading(
        &mut self,
        hooks: &mut dyn EngineHooks,
        circ: CircKey,
        hop: Option<HopNum>,
    ) -> bool {
        let (empty, list) = {
            let Some(c) = self.circs.get(circ) else {
                return false;
            };
            match (&c.kind, hop) {
                (CircuitKind::Transit(t), None) => (
                    t.package_window.window() == 0,
                    t.n_streams.clone(),
                ),
                (CircuitKind::Origin(o), Some(h)) => match o.hops.get(usize::from(h)) {
                    Some(hp) => (
                        hp.package_window.window() == 0,
                        o.streams
                            .iter()
                            .copied()
                            .filter(|sk| {
                                self.streams.get(*sk).map(|s| s.hop) == Some(Some(h))
                            })
                            .collect(),
                    ),
                    None => return false,
                },
                _ => return false,
            }
        };
        if !empty {
            return false;
        }
        debug!("package window empty; stopping edge reading.");
        for sk in list {
            self.stop_reading(hooks, sk);
        }
        true
    }

    /// Send an END for a stream, if none has been sent yet, carrying
    /// `reason`.
    pub fn edge_end(&mut self, hooks: &mut dyn EngineHooks, sk: StreamKey, reason: EndReason) {
        let already = match self.streams.get(sk) {
            Some(s) => s.has_sent_end,
            None => return,
        };
        if already {
            return;
        }
        let payload = [u8::from(reason)];
        // Whatever the outcome, we don't try again.
        if let Ok(s) = self.stream_mut(sk) {
            s.has_sent_end = true;
        }
        if self
            .send_command_from_stream(hooks, sk, RelayCmd::END, &payload)
            .is_err()
        {
            debug!("couldn't send an end cell; circuit is gone.");
        }
    }

    /// Close a stream from the edge side: send an END with `reason` and
    /// mark the stream for close.
    pub fn close_stream(&mut self, hooks: &mut dyn EngineHooks, sk: StreamKey, reason: EndReason) {
        self.edge_end(hooks, sk, reason);
        self.mark_stream_for_close(hooks, sk, reason, false);
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::channel::ChanKey;
    use crate::circuit::CircuitKind;
    use crate::crypto::cell::{CryptInit, RelayCrypt};
    use crate::hooks::NoopHooks;
    use crate::reactor::Reactor;
    use crate::sendme::{CIRCWINDOW_START, STREAMWINDOW_START};
    use crate::stream::StreamRequest;
    use onion_cell::chancell::CircId;

    /// Deterministic seed material for one hop.
    fn seed(tweak: u8) -> Vec<u8> {
        let mut s = vec![0_u8; RelayCrypt::seed_len()];
        let mut v = tweak;
        for b in s.iter_mut() {
            v = v.wrapping_mul(167).wrapping_add(41);
            *b = v;
        }
        s
    }

    /// A straight-line network inside one engine: an origin circuit and
    /// one transit circuit per hop, joined by per-direction channels
    /// that the test ferries cells across.
    struct TestNet {
        r: Reactor,
        origin: CircKey,
        /// down[i]: carries cells from node i toward relay i.
        down: Vec<ChanKey>,
        /// up[i]: carries cells from relay i toward node i.
        up: Vec<ChanKey>,
        relays: Vec<CircKey>,
    }

    fn build_net(n_hops: usize) -> TestNet {
        let mut r = Reactor::new(1_000);
        let mut down = Vec::new();
        let mut up = Vec::new();
        let mut relays = Vec::new();
        for i in 0..n_hops {
            down.push(r.add_channel(2));
            up.push(r.add_channel(2));
            let s = seed(i as u8 + 1);
            let circ = r
                .add_transit_circuit(up[i], CircId::new(200 + i as u16).unwrap(), &s)
                .unwrap();
            relays.push(circ);
        }
        let origin = r
            .add_origin_circuit(down[0], CircId::new(100).unwrap(), CircPurpose::General)
            .unwrap();
        for i in 0..n_hops {
            let hop = r.add_origin_hop(origin, &seed(i as u8 + 1)).unwrap();
            r.set_hop_state(origin, hop, HopState::Open).unwrap();
            if i + 1 < n_hops {
                r.set_next_attachment(relays[i], down[i + 1], CircId::new(200 + i as u16 + 1).unwrap())
                    .unwrap();
            }
        }
        TestNet {
            r,
            origin,
            down,
            up,
            relays,
        }
    }

    /// Flush a channel completely and unpack whatever came out.
    fn drain_cells(r: &mut Reactor, chan: ChanKey) -> Vec<Cell> {
        let mut hooks = NoopHooks;
        while r.flush_channel(&mut hooks, chan, 64) > 0 {}
        let bytes = r.take_channel_output(chan).unwrap();
        assert_eq!(bytes.len() % CELL_NETWORK_LEN, 0);
        bytes
            .chunks(CELL_NETWORK_LEN)
            .map(|c| Cell::unpack(c).unwrap())
            .collect()
    }

    /// Circuit-level deliver window of a transit circuit.
    fn transit_deliver_window(r: &Reactor, circ: CircKey) -> u16 {
        match &r.circs[circ].kind {
            CircuitKind::Transit(t) => t.deliver_window.window(),
            CircuitKind::Origin(_) => panic!("not a transit circuit"),
        }
    }

    #[test]
    fn recognition_through_three_hops() {
        let mut net = build_net(3);
        let mut hooks = NoopHooks;

        let sk = net
            .r
            .add_client_stream(
                net.origin,
                HopNum::from(2),
                StreamRequest::new("example.com", 80, RequestKind::Connect),
            )
            .unwrap();
        net.r.set_stream_open(sk).unwrap();
        let sid = net.r.stream(sk).unwrap().id();

        // The exit knows the stream under the same id.
        let exit_sk = net.r.add_exit_stream(net.relays[2], sid, false).unwrap();

        let data = vec![0x5A_u8; RELAY_PAYLOAD_LEN];
        net.r.stream_inbuf_write(sk, &data).unwrap();
        net.r.package_raw_inbuf(&mut hooks, sk, true).unwrap();

        // Hop 1 and hop 2 fail the digest comparison and forward; hop 3
        // recognizes and delivers.
        for i in 0..3 {
            let cells = drain_cells(&mut net.r, net.down[i]);
            assert_eq!(cells.len(), 1);
            let mut cell = cells.into_iter().next().unwrap();
            net.r
                .receive_relay_cell(&mut hooks, net.relays[i], &mut cell, Direction::Outbound)
                .unwrap();
        }

        let delivered = net.r.take_stream_output(exit_sk).unwrap();
        assert_eq!(&delivered[..], &data[..]);
        // Deliver windows at the pass-through relays are untouched; the
        // terminal hop's moved by one.
        assert_eq!(transit_deliver_window(&net.r, net.relays[0]), CIRCWINDOW_START);
        assert_eq!(transit_deliver_window(&net.r, net.relays[1]), CIRCWINDOW_START);
        assert_eq!(
            transit_deliver_window(&net.r, net.relays[2]),
            CIRCWINDOW_START - 1
        );
    }

    #[test]
    fn data_flows_inbound_to_origin() {
        let mut net = build_net(3);
        let mut hooks = NoopHooks;

        let sk = net
            .r
            .add_client_stream(
                net.origin,
                HopNum::from(2),
                StreamRequest::new("example.com", 80, RequestKind::Connect),
            )
            .unwrap();
        net.r.set_stream_open(sk).unwrap();
        let sid = net.r.stream(sk).unwrap().id();
        let exit_sk = net.r.add_exit_stream(net.relays[2], sid, false).unwrap();

        // The exit packages bytes toward the origin.
        let data = vec![0xC3_u8; 100];
        net.r.stream_inbuf_write(exit_sk, &data).unwrap();
        net.r.package_raw_inbuf(&mut hooks, exit_sk, true).unwrap();

        // Ferry through relay 2 -> relay 1 -> relay 0 -> origin.
        let mut cells = drain_cells(&mut net.r, net.up[2]);
        assert_eq!(cells.len(), 1);
        let mut cell = cells.pop().unwrap();
        // Intermediate relays add a layer each and pass it on.
        net.r
            .receive_relay_cell(&mut hooks, net.relays[1], &mut cell, Direction::Inbound)
            .unwrap();
        let mut cells = drain_cells(&mut net.r, net.up[1]);
        assert_eq!(cells.len(), 1);
        let mut cell = cells.pop().unwrap();
        net.r
            .receive_relay_cell(&mut hooks, net.relays[0], &mut cell, Direction::Inbound)
            .unwrap();
        let mut cells = drain_cells(&mut net.r, net.up[0]);
        assert_eq!(cells.len(), 1);
        let mut cell = cells.pop().unwrap();
        assert_eq!(u16::from(cell.circid()), 200);
        net.r
            .receive_relay_cell(&mut hooks, net.origin, &mut cell, Direction::Inbound)
            .unwrap();

        let delivered = net.r.take_stream_output(sk).unwrap();
        assert_eq!(&delivered[..], &data[..]);
        // The hop that originated the cell had its deliver window
        // decremented at the origin; the others are untouched.
        let org = net.r.circs[net.origin].origin().unwrap();
        assert_eq!(org.hops[0].deliver_window.window(), CIRCWINDOW_START);
        assert_eq!(org.hops[1].deliver_window.window(), CIRCWINDOW_START);
        assert_eq!(org.hops[2].deliver_window.window(), CIRCWINDOW_START - 1);
    }

    #[test]
    fn circuit_sendme_after_one_increment() {
        let mut net = build_net(1);
        let mut hooks = NoopHooks;

        let sk = net
            .r
            .add_client_stream(
                net.origin,
                HopNum::from(0),
                StreamRequest::new("example.com", 80, RequestKind::Connect),
            )
            .unwrap();
        net.r.set_stream_open(sk).unwrap();
        let sid = net.r.stream(sk).unwrap().id();
        let exit_sk = net.r.add_exit_stream(net.relays[0], sid, false).unwrap();

        // Package and deliver exactly 100 DATA cells.
        for _ in 0..100 {
            net.r
                .stream_inbuf_write(sk, &[0x11_u8; RELAY_PAYLOAD_LEN])
                .unwrap();
            net.r.package_raw_inbuf(&mut hooks, sk, true).unwrap();
            let mut cells = drain_cells(&mut net.r, net.down[0]);
            assert_eq!(cells.len(), 1);
            let mut cell = cells.pop().unwrap();
            net.r
                .receive_relay_cell(&mut hooks, net.relays[0], &mut cell, Direction::Outbound)
                .unwrap();
        }
        assert_eq!(
            net.r.take_stream_output(exit_sk).unwrap().len(),
            100 * RELAY_PAYLOAD_LEN
        );

        // The terminal's deliver window went 1000 -> 900 and came back
        // to 1000 with exactly one SENDME.
        assert_eq!(transit_deliver_window(&net.r, net.relays[0]), CIRCWINDOW_START);

        // The origin spent 100 circuit window tokens and gets them back
        // from that SENDME; the two stream-level SENDMEs restore the
        // stream window as well.
        {
            let org = net.r.circs[net.origin].origin().unwrap();
            assert_eq!(
                org.hops[0].package_window.window(),
                CIRCWINDOW_START - 100
            );
        }
        let cells = drain_cells(&mut net.r, net.up[0]);
        assert_eq!(cells.len(), 3);
        for mut cell in cells {
            net.r
                .receive_relay_cell(&mut hooks, net.origin, &mut cell, Direction::Inbound)
                .unwrap();
        }
        let org = net.r.circs[net.origin].origin().unwrap();
        assert_eq!(org.hops[0].package_window.window(), CIRCWINDOW_START);
        assert_eq!(
            net.r.streams[sk].package_window.window(),
            STREAMWINDOW_START
        );
    }

    #[test]
    fn relay_early_exhaustion() {
        let mut net = build_net(1);
        let mut hooks = NoopHooks;

        // Eight EXTEND cells spend the eight tokens; the ninth goes out
        // as plain RELAY with an advisory logged.
        for _ in 0..9 {
            net.r
                .send_relay_command_from_edge(
                    &mut hooks,
                    net.origin,
                    None,
                    RelayCmd::EXTEND,
                    &[0_u8; 4],
                    Some(HopNum::from(0)),
                )
                .unwrap();
        }
        let cells = drain_cells(&mut net.r, net.down[0]);
        assert_eq!(cells.len(), 9);
        let cmds: Vec<ChanCmd> = cells.iter().map(Cell::cmd).collect();
        assert_eq!(&cmds[..8], &[ChanCmd::RELAY_EARLY; 8]);
        assert_eq!(cmds[8], ChanCmd::RELAY);

        let org = net.r.circs[net.origin].origin().unwrap();
        assert_eq!(org.remaining_early, 0);
        assert_eq!(org.early_commands.len(), 8);
        assert!(org.early_commands.iter().all(|c| *c == RelayCmd::EXTEND));
    }

    #[test]
    fn rendezvous_splice() {
        let mut r = Reactor::new(0);
        let mut hooks = NoopHooks;
        let chan_a = r.add_channel(2);
        let chan_b = r.add_channel(2);
        let circ_a = r
            .add_transit_circuit(chan_a, CircId::new(11).unwrap(), &seed(70))
            .unwrap();
        let circ_b = r
            .add_transit_circuit(chan_b, CircId::new(22).unwrap(), &seed(71))
            .unwrap();
        r.splice_rendezvous(circ_a, circ_b).unwrap();

        // Predict the bytes: one outbound decryption at A, one inbound
        // encryption at B.
        let mut body = Box::new([0_u8; CELL_DATA_LEN]);
        for (i, b) in body.iter_mut().enumerate() {
            *b = (i % 251) as u8;
        }
        let mut expected = *body;
        {
            use crate::crypto::cell::RelayLayer;
            let (mut a_out, _) = RelayCrypt::initialize(&seed(70)).unwrap().split_relay_layer();
            let (_, mut b_in) = RelayCrypt::initialize(&seed(71)).unwrap().split_relay_layer();
            assert!(!a_out.decrypt_outbound(&mut expected));
            b_in.encrypt_inbound(&mut expected);
        }

        let mut cell = Cell::new(CircId::new(11).unwrap(), ChanCmd::RELAY, body);
        r.receive_relay_cell(&mut hooks, circ_a, &mut cell, Direction::Outbound)
            .unwrap();

        // The cell crossed the splice and was queued toward B's
        // previous channel, under B's previous circuit id.
        let cells = drain_cells(&mut r, chan_b);
        assert_eq!(cells.len(), 1);
        assert_eq!(u16::from(cells[0].circid()), 22);
        assert_eq!(cells[0].body()[..], expected[..]);
        // Neither circuit was torn down.
        assert!(r.circs[circ_a].marked_for_close.is_none());
        assert!(r.circs[circ_b].marked_for_close.is_none());
    }

    #[test]
    fn unrecognized_cell_with_no_next_hop_closes_circuit() {
        let mut r = Reactor::new(0);
        let mut hooks = NoopHooks;
        let chan = r.add_channel(2);
        let circ = r
            .add_transit_circuit(chan, CircId::new(9).unwrap(), &seed(90))
            .unwrap();
        let body = Box::new([0x77_u8; CELL_DATA_LEN]);
        let mut cell = Cell::new(CircId::new(9).unwrap(), ChanCmd::RELAY, body);
        let err = r
            .receive_relay_cell(&mut hooks, circ, &mut cell, Direction::Outbound)
            .unwrap_err();
        assert!(matches!(err, Error::CircProto(_)));
        assert_eq!(
            r.circs[circ].marked_for_close,
            Some(DestroyReason::PROTOCOL)
        );
        // Subsequent cells are dropped without effect.
        let mut cell = Cell::new(CircId::new(9).unwrap(), ChanCmd::RELAY, Box::new([0_u8; CELL_DATA_LEN]));
        assert!(r
            .receive_relay_cell(&mut hooks, circ, &mut cell, Direction::Outbound)
            .is_ok());
    }

    #[test]
    fn deliver_window_violation_tears_down() {
        let mut net = build_net(1);
        let mut hooks = NoopHooks;
        let sk = net
            .r
            .add_client_stream(
                net.origin,
                HopNum::from(0),
                StreamRequest::new("example.com", 80, RequestKind::Connect),
            )
            .unwrap();
        net.r.set_stream_open(sk).unwrap();

        // Exhaust the exit's deliver window behind its back, then
        // deliver one more data cell.
        match &mut net.r.circs[net.relays[0]].kind {
            CircuitKind::Transit(t) => {
                for _ in 0..CIRCWINDOW_START {
                    t.deliver_window.take().unwrap();
                }
            }
            CircuitKind::Origin(_) => unreachable!(),
        }
        net.r.stream_inbuf_write(sk, &[1_u8; 10]).unwrap();
        net.r.package_raw_inbuf(&mut hooks, sk, true).unwrap();
        let mut cells = drain_cells(&mut net.r, net.down[0]);
        let mut cell = cells.pop().unwrap();
        let err = net
            .r
            .receive_relay_cell(&mut hooks, net.relays[0], &mut cell, Direction::Outbound)
            .unwrap_err();
        assert!(matches!(err, Error::CircProto(_)));
        assert_eq!(
            net.r.circs[net.relays[0]].marked_for_close,
            Some(DestroyReason::PROTOCOL)
        );
    }

    #[test]
    fn unknown_relay_command_is_dropped() {
        let mut net = build_net(1);
        let mut hooks = NoopHooks;
        // The exit sends a command from the future.
        net.r
            .send_relay_command_from_edge(
                &mut hooks,
                net.relays[0],
                None,
                RelayCmd::from(77),
                &[1, 2, 3],
                None,
            )
            .unwrap();
        let mut cells = drain_cells(&mut net.r, net.up[0]);
        let mut cell = cells.pop().unwrap();
        net.r
            .receive_relay_cell(&mut hooks, net.origin, &mut cell, Direction::Inbound)
            .unwrap();
        // For forward compatibility the circuit stays up.
        assert!(net.r.circs[net.origin].marked_for_close.is_none());
    }

    /// Hooks that record retry decisions for the END-before-open
    /// policy.
    #[derive(Default)]
    struct RetryHooks {
        failures: u32,
        detach_ok: bool,
        detached: Vec<StreamKey>,
        unattached: Vec<(StreamKey, EndReason)>,
        cleared: Vec<String>,
        penalized: Vec<CircKey>,
    }
    impl EngineHooks for RetryHooks {
        fn detach_retriable(&mut self, stream: StreamKey, _circ: CircKey, _reason: EndReason) -> bool {
            if self.detach_ok {
                self.detached.push(stream);
            }
            self.detach_ok
        }
        fn mark_unattached(&mut self, stream: StreamKey, reason: EndReason) {
            self.unattached.push((stream, reason));
        }
        fn dns_incr_failures(&mut self, _addr: &str) -> u32 {
            self.failures += 1;
            self.failures
        }
        fn dns_clear_failures(&mut self, addr: &str) {
            self.cleared.push(addr.to_owned());
        }
        fn exitpolicy_reject_all(&mut self, circ: CircKey) {
            self.penalized.push(circ);
        }
    }

    /// Deliver an END with `reason` to a client stream still in
    /// connect-wait.
    fn deliver_end(net: &mut TestNet, hooks: &mut dyn EngineHooks, sk: StreamKey, reason: EndReason) {
        let sid = net.r.streams[sk].id;
        net.r
            .send_relay_command_from_edge(
                hooks,
                net.relays[0],
                Some(sid),
                RelayCmd::END,
                &[u8::from(reason)],
                None,
            )
            .unwrap();
        let mut cells = drain_cells(&mut net.r, net.up[0]);
        let mut cell = cells.pop().unwrap();
        net.r
            .receive_relay_cell(hooks, net.origin, &mut cell, Direction::Inbound)
            .unwrap();
    }

    #[test]
    fn end_before_open_retries_when_failures_low() {
        let mut net = build_net(1);
        let mut hooks = RetryHooks {
            detach_ok: true,
            ..Default::default()
        };
        let sk = net
            .r
            .add_client_stream(
                net.origin,
                HopNum::from(0),
                StreamRequest::new("example.com", 80, RequestKind::Connect),
            )
            .unwrap();
        deliver_end(&mut net, &mut hooks, sk, EndReason::RESOLVEFAILED);

        // One failure recorded, below the cap: the stream was detached
        // for reattachment, not closed.
        assert_eq!(hooks.detached, vec![sk]);
        assert!(hooks.unattached.is_empty());
        assert!(net.r.streams[sk].detached);
        assert!(!net.r.streams[sk].marked_for_close);
        assert!(net
            .r
            .circs[net.origin]
            .origin()
            .unwrap()
            .streams
            .is_empty());
    }

    #[test]
    fn end_before_open_gives_up_after_max_failures() {
        let mut net = build_net(1);
        let mut hooks = RetryHooks {
            detach_ok: true,
            failures: MAX_RESOLVE_FAILURES - 1,
            ..Default::default()
        };
        let sk = net
            .r
            .add_client_stream(
                net.origin,
                HopNum::from(0),
                StreamRequest::new("example.com", 80, RequestKind::Connect),
            )
            .unwrap();
        deliver_end(&mut net, &mut hooks, sk, EndReason::TIMEOUT);

        // The counter hit the cap: failures were cleared for next time,
        // and the stream was closed with the remote reason.
        assert_eq!(hooks.cleared, vec!["example.com".to_owned()]);
        assert!(hooks.detached.is_empty());
        assert_eq!(hooks.unattached, vec![(sk, EndReason::TIMEOUT)]);
        let s = &net.r.streams[sk];
        assert!(s.marked_for_close);
        assert_eq!(s.end_reason, Some(EndReason::TIMEOUT));
        assert!(s.end_was_remote);
    }

    #[test]
    fn end_before_open_hibernating_penalizes_exit() {
        let mut net = build_net(1);
        let mut hooks = RetryHooks {
            detach_ok: true,
            ..Default::default()
        };
        let sk = net
            .r
            .add_client_stream(
                net.origin,
                HopNum::from(0),
                StreamRequest::new("example.com", 80, RequestKind::Connect),
            )
            .unwrap();
        deliver_end(&mut net, &mut hooks, sk, EndReason::HIBERNATING);

        assert_eq!(hooks.penalized, vec![net.origin]);
        assert_eq!(hooks.detached, vec![sk]);
    }

    #[test]
    fn end_before_open_other_reason_closes_with_remote_flag() {
        let mut net = build_net(1);
        let mut hooks = RetryHooks {
            detach_ok: true,
            ..Default::default()
        };
        let sk = net
            .r
            .add_client_stream(
                net.origin,
                HopNum::from(0),
                StreamRequest::new("example.com", 80, RequestKind::Connect),
            )
            .unwrap();
        deliver_end(&mut net, &mut hooks, sk, EndReason::CONNRESET);

        assert!(hooks.detached.is_empty());
        let s = &net.r.streams[sk];
        assert!(s.marked_for_close);
        assert_eq!(s.end_reason, Some(EndReason::CONNRESET));
        assert!(s.end_was_remote);
    }

    #[test]
    fn stream_sendme_resumes_reading() {
        let mut net = build_net(1);
        let mut hooks = NoopHooks;
        let sk = net
            .r
            .add_client_stream(
                net.origin,
                HopNum::from(0),
                StreamRequest::new("example.com", 80, RequestKind::Connect),
            )
            .unwrap();
        net.r.set_stream_open(sk).unwrap();
        let sid = net.r.stream(sk).unwrap().id();
        net.r.add_exit_stream(net.relays[0], sid, false).unwrap();
        net.r.start_reading(&mut hooks, sk);

        // Exhaust the stream package window.
        for _ in 0..STREAMWINDOW_START {
            net.r
                .stream_inbuf_write(sk, &[9_u8; RELAY_PAYLOAD_LEN])
                .unwrap();
            net.r.package_raw_inbuf(&mut hooks, sk, true).unwrap();
        }
        assert_eq!(net.r.streams[sk].package_window.window(), 0);
        // The reader was stopped when the window hit zero.
        assert!(!net.r.streams[sk].is_reading());

        // A stream-level SENDME arrives from the exit.
        net.r
            .send_relay_command_from_edge(
                &mut hooks,
                net.relays[0],
                Some(sid),
                RelayCmd::SENDME,
                &[],
                None,
            )
            .unwrap();
        let mut cells = drain_cells(&mut net.r, net.up[0]);
        let mut cell = cells.pop().unwrap();
        net.r
            .receive_relay_cell(&mut hooks, net.origin, &mut cell, Direction::Inbound)
            .unwrap();

        assert_eq!(
            net.r.streams[sk].package_window.window(),
            crate::sendme::STREAMWINDOW_INCREMENT
        );
        assert!(net.r.streams[sk].is_reading());
    }

    #[test]
    fn truncate_at_transit_replies_truncated() {
        let mut net = build_net(2);
        let mut hooks = NoopHooks;

        // Tell relay 0 to truncate its forward link.
        net.r
            .send_relay_command_from_edge(
                &mut hooks,
                net.origin,
                None,
                RelayCmd::TRUNCATE,
                &[u8::from(DestroyReason::REQUESTED)],
                Some(HopNum::from(0)),
            )
            .unwrap();
        let mut cells = drain_cells(&mut net.r, net.down[0]);
        let mut cell = cells.pop().unwrap();
        net.r
            .receive_relay_cell(&mut hooks, net.relays[0], &mut cell, Direction::Outbound)
            .unwrap();

        // The forward link is gone and a TRUNCATED came back.
        assert!(net.r.circs[net.relays[0]].n_chan.is_none());
        let mut cells = drain_cells(&mut net.r, net.up[0]);
        assert_eq!(cells.len(), 1);
        let mut cell = cells.pop().unwrap();
        net.r
            .receive_relay_cell(&mut hooks, net.origin, &mut cell, Direction::Inbound)
            .unwrap();
        // The origin collapsed its hop list down to the answering hop.
        assert_eq!(net.r.circs[net.origin].origin().unwrap().hops.len(), 1);
    }
}

//! An implementation of the current relay cell cryptography.
//!
//! Each layer holds a stream cipher and a running digest.  A sender
//! "originates" a cell by folding its payload into the digest and
//! writing the first four digest bytes into the integrity field; every
//! other relay on the path only applies its cipher.  A receiver
//! recognizes a cell addressed to it by re-deriving the digest over the
//! payload (with the integrity bytes zeroed) and comparing prefixes;
//! the update is committed only when the comparison succeeds, so cells
//! merely passing through leave the digest untouched.

use std::ops::Range;

use crate::util::ct;
use crate::util::err::internal;
use crate::Result;

use cipher::{KeyIvInit, StreamCipher};
use digest::{Digest, Output};
use onion_cell::chancell::RawCellBody;
use typenum::Unsigned;

use super::{
    ClientLayer, CryptInit, InboundClientLayer, InboundRelayLayer, OutboundClientLayer,
    OutboundRelayLayer, RelayLayer,
};

/// Bytes of a relay cell body holding the `recognized` field.
pub(crate) const RECOGNIZED_RANGE: Range<usize> = 1..3;
/// Bytes of a relay cell body holding the `integrity` digest field.
pub(crate) const DIGEST_RANGE: Range<usize> = 5..9;
/// An all-zero integrity field, fed to the digest in place of the real
/// one.
const EMPTY_DIGEST: [u8; 4] = [0_u8; 4];

/// A CryptState represents one layer of shared cryptographic state
/// between a relay and a client for a single hop, in a single
/// direction.
///
/// For example, if a client makes a 3-hop circuit, then it will have 6
/// `CryptState`s, one for each relay, for each direction of
/// communication.
///
/// Note that although `CryptState` implements [`OutboundClientLayer`],
/// [`InboundClientLayer`], [`OutboundRelayLayer`], and
/// [`InboundRelayLayer`], an instance will only be used for one of
/// these roles.
pub(crate) struct CryptState<SC: StreamCipher, D: Digest + Clone> {
    /// Stream cipher for en/decrypting cell bodies.
    ///
    /// This cipher is the one keyed with Kf or Kb.
    cipher: SC,
    /// Digest for authenticating cells to/from this hop.
    ///
    /// This digest is the one seeded with Df or Db.
    digest: D,
    /// Most recent digest value generated by this crypto.
    last_digest_val: Output<D>,
}

/// A pair of CryptStates shared between a client and a relay, one for
/// the outbound (away from the client) direction, and one for the
/// inbound (towards the client) direction.
pub(crate) struct CryptStatePair<SC: StreamCipher, D: Digest + Clone> {
    /// State for en/decrypting cells sent away from the client.
    fwd: CryptState<SC, D>,
    /// State for en/decrypting cells sent towards the client.
    back: CryptState<SC, D>,
}

impl<SC: StreamCipher + KeyIvInit, D: Digest + Clone> CryptInit for CryptStatePair<SC, D> {
    fn seed_len() -> usize {
        SC::KeySize::to_usize() * 2 + D::OutputSize::to_usize() * 2
    }
    fn initialize(mut seed: &[u8]) -> Result<Self> {
        // The seed is Df | Db | Kf | Kb, as produced by the handshake
        // layer's KDF.
        if seed.len() != Self::seed_len() {
            return Err(internal!("seed length {} was invalid", seed.len()));
        }

        // Advances `seed` by `n` bytes, returning the advanced bytes
        let mut take_seed = |n: usize| -> &[u8] {
            let res = &seed[..n];
            seed = &seed[n..];
            res
        };

        let dlen = D::OutputSize::to_usize();
        let keylen = SC::KeySize::to_usize();

        let df = take_seed(dlen);
        let db = take_seed(dlen);
        let kf = take_seed(keylen);
        let kb = take_seed(keylen);

        let fwd = CryptState {
            cipher: SC::new(kf.into(), &Default::default()),
            digest: D::new().chain_update(df),
            last_digest_val: Output::<D>::default(),
        };
        let back = CryptState {
            cipher: SC::new(kb.into(), &Default::default()),
            digest: D::new().chain_update(db),
            last_digest_val: Output::<D>::default(),
        };

        Ok(CryptStatePair { fwd, back })
    }
}

impl<SC, D> ClientLayer<CryptState<SC, D>, CryptState<SC, D>> for CryptStatePair<SC, D>
where
    SC: StreamCipher,
    D: Digest + Clone,
{
    fn split_client_layer(self) -> (CryptState<SC, D>, CryptState<SC, D>) {
        (self.fwd, self.back)
    }
}

impl<SC, D> RelayLayer<CryptState<SC, D>, CryptState<SC, D>> for CryptStatePair<SC, D>
where
    SC: StreamCipher,
    D: Digest + Clone,
{
    fn split_relay_layer(self) -> (CryptState<SC, D>, CryptState<SC, D>) {
        let CryptStatePair { fwd, back } = self;
        (fwd, back)
    }
}

impl<SC: StreamCipher, D: Digest + Clone> OutboundClientLayer for CryptState<SC, D> {
    fn originate_for(&mut self, cell: &mut RawCellBody) {
        set_digest(cell, &mut self.digest, &mut self.last_digest_val);
        self.encrypt_outbound(cell);
    }
    fn encrypt_outbound(&mut self, cell: &mut RawCellBody) {
        // A single iteration of the loop that routes away from the
        // origin: one forward-cipher application per hop.
        self.cipher.apply_keystream(&mut cell[..]);
    }
}

impl<SC: StreamCipher, D: Digest + Clone> InboundClientLayer for CryptState<SC, D> {
    fn decrypt_inbound(&mut self, cell: &mut RawCellBody) -> bool {
        self.cipher.apply_keystream(&mut cell[..]);
        is_recognized(cell, &mut self.digest, &mut self.last_digest_val)
    }
}

impl<SC: StreamCipher, D: Digest + Clone> OutboundRelayLayer for CryptState<SC, D> {
    fn decrypt_outbound(&mut self, cell: &mut RawCellBody) -> bool {
        self.cipher.apply_keystream(&mut cell[..]);
        is_recognized(cell, &mut self.digest, &mut self.last_digest_val)
    }
}

impl<SC: StreamCipher, D: Digest + Clone> InboundRelayLayer for CryptState<SC, D> {
    fn originate(&mut self, cell: &mut RawCellBody) {
        set_digest(cell, &mut self.digest, &mut self.last_digest_val);
        self.encrypt_inbound(cell);
    }
    fn encrypt_inbound(&mut self, cell: &mut RawCellBody) {
        self.cipher.apply_keystream(&mut cell[..]);
    }
}

/// Prepare a cell body by setting its digest and recognized field.
///
/// The digest is fed the whole payload with both fields zeroed, then
/// the first four bytes of the updated digest are written back into the
/// integrity field.  The update is committed: the running digest now
/// covers this cell.
fn set_digest<D: Digest + Clone>(cell: &mut RawCellBody, d: &mut D, used_digest: &mut Output<D>) {
    cell[RECOGNIZED_RANGE].fill(0);
    cell[DIGEST_RANGE].fill(0);

    d.update(&cell[..]);
    *used_digest = d.clone().finalize();
    let used_digest_prefix = &used_digest[0..DIGEST_RANGE.len()];
    cell[DIGEST_RANGE].copy_from_slice(used_digest_prefix);
}

/// Check whether this just-decrypted cell is now an authenticated
/// plaintext.
///
/// This returns true if the `recognized` field is all zeros, and if the
/// `integrity` field is a digest of the correct material.  On success
/// the tentative digest update is committed; on failure the running
/// digest and the cell are left exactly as they were, so that a later
/// layer (or a downstream relay) can still authenticate the cell.
fn is_recognized<D: Digest + Clone>(cell: &RawCellBody, d: &mut D, rcvd: &mut Output<D>) -> bool {
    // Validate the 'recognized' field.
    if !ct::is_zero(&cell[RECOGNIZED_RANGE]) {
        return false;
    }

    // Now also validate the digest field, against a tentative update
    // of the running digest.
    let mut dtmp = d.clone();
    // Add bytes up to the digest field.
    dtmp.update(&cell[..DIGEST_RANGE.start]);
    // Add zeroes where the digest field is.
    dtmp.update(EMPTY_DIGEST);
    // Add the rest of the bytes.
    dtmp.update(&cell[DIGEST_RANGE.end..]);
    // Clone the digest before finalize destroys it; on a match it
    // becomes the committed running digest.
    let dtmp_clone = dtmp.clone();
    let result = dtmp.finalize();

    if ct::bytes_eq(&cell[DIGEST_RANGE], &result[0..DIGEST_RANGE.len()]) {
        // Commit the update.
        *d = dtmp_clone;
        *rcvd = result;
        return true;
    }

    false
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::crypto::cell::RelayCrypt;

    /// Deterministic fill for test seeds and payloads.
    fn fill_bytes(buf: &mut [u8], tweak: u8) {
        let mut v: u8 = tweak;
        for b in buf.iter_mut() {
            v = v.wrapping_mul(167).wrapping_add(41);
            *b = v;
        }
    }

    fn pair(tweak: u8) -> RelayCrypt {
        let mut seed = vec![0_u8; RelayCrypt::seed_len()];
        fill_bytes(&mut seed, tweak);
        RelayCrypt::initialize(&seed).unwrap()
    }

    #[test]
    fn seed_len_is_keys_plus_digests() {
        // Two AES-128 keys and two SHA-1 seeds.
        assert_eq!(RelayCrypt::seed_len(), 16 * 2 + 20 * 2);
        assert!(RelayCrypt::initialize(&[0_u8; 10]).is_err());
    }

    #[test]
    fn roundtrip_one_hop_outbound() {
        let (mut client, _) = pair(1).split_client_layer();
        let (mut relay, _) = pair(1).split_relay_layer();

        for i in 0..5 {
            let mut cell = [0_u8; 509];
            fill_bytes(&mut cell, 100 + i);
            cell[RECOGNIZED_RANGE].fill(0);
            cell[DIGEST_RANGE].fill(0);
            let orig = cell;

            client.originate_for(&mut cell);
            assert_ne!(cell[16..], orig[16..]);
            assert!(relay.decrypt_outbound(&mut cell));
            // Everything but the integrity field is restored.
            assert_eq!(cell[DIGEST_RANGE.end..], orig[DIGEST_RANGE.end..]);
            assert_eq!(cell[..DIGEST_RANGE.start], orig[..DIGEST_RANGE.start]);
        }
    }

    #[test]
    fn roundtrip_one_hop_inbound() {
        let (_, mut client) = pair(2).split_client_layer();
        let (_, mut relay) = pair(2).split_relay_layer();

        for i in 0..5 {
            let mut cell = [0_u8; 509];
            fill_bytes(&mut cell, 200 + i);
            cell[RECOGNIZED_RANGE].fill(0);
            cell[DIGEST_RANGE].fill(0);
            let orig = cell;

            relay.originate(&mut cell);
            assert_ne!(cell[16..], orig[16..]);
            assert!(client.decrypt_inbound(&mut cell));
            assert_eq!(cell[DIGEST_RANGE.end..], orig[DIGEST_RANGE.end..]);
        }
    }

    #[test]
    fn three_hops_recognized_only_at_target() {
        let mut client_fwd = Vec::new();
        let mut relays = Vec::new();
        for hop in 0..3_u8 {
            let (cf, _) = pair(10 + hop).split_client_layer();
            let (rf, _) = pair(10 + hop).split_relay_layer();
            client_fwd.push(cf);
            relays.push(rf);
        }

        // Visiting every target twice means each relay layer sees
        // cells pass through (unrecognized) between the cells that are
        // actually addressed to it; recognition of the later cells
        // proves that failed checks never commit the running digest.
        for (round, target) in [0_usize, 1, 2, 0, 1, 2].iter().copied().enumerate() {
            let mut cell = [0_u8; 509];
            fill_bytes(&mut cell, 50 + round as u8);
            cell[RECOGNIZED_RANGE].fill(0);
            cell[DIGEST_RANGE].fill(0);

            // Originate at the target layer, then apply one forward
            // cipher per hop from the target's predecessor down to hop
            // 0 inclusive.
            client_fwd[target].originate_for(&mut cell);
            for layer in client_fwd[..target].iter_mut().rev() {
                layer.encrypt_outbound(&mut cell);
            }

            for (i, relay) in relays.iter_mut().enumerate().take(target + 1) {
                let recognized = relay.decrypt_outbound(&mut cell);
                assert_eq!(recognized, i == target);
            }
        }
    }

    #[test]
    fn tampered_cell_is_not_recognized() {
        let (mut client, _) = pair(7).split_client_layer();
        let (mut relay, _) = pair(7).split_relay_layer();

        let mut cell = [0_u8; 509];
        fill_bytes(&mut cell, 3);
        cell[RECOGNIZED_RANGE].fill(0);
        cell[DIGEST_RANGE].fill(0);
        client.originate_for(&mut cell);
        cell[100] ^= 0x40;
        // After decryption the recognized field may well be zero, but
        // the digest check is authoritative.
        assert!(!relay.decrypt_outbound(&mut cell));
    }
}

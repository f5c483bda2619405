//! Relay cell cryptography
//!
//! Relay cells are transmitted through the network along circuits.  The
//! client that creates a circuit shares two different sets of keys and
//! state with each of the relays on the circuit: one for "outbound"
//! traffic, and one for "inbound" traffic.
//!
//! So for example, if a client creates a 3-hop circuit with relays R1,
//! R2, and R3, the client has:
//!   * An "inbound" cryptographic state shared with R1, R2, and R3.
//!   * An "outbound" cryptographic state shared with R1, R2, and R3.
//!
//! In this module, we call each of these state objects a "layer" of the
//! circuit's encryption.  Each layer contains:
//!    * A keyed AES-CTR state, keyed with `Kf` (outbound) or `Kb`
//!      (inbound).
//!    * A running digest, initialized with `Df` or `Db`.
//!
//! This module provides traits that should work for future versions of
//! the relay crypto design; the current protocol is instantiated in the
//! [`tor1`] submodule.

pub(crate) mod tor1;

use crate::Result;
use onion_cell::chancell::RawCellBody;

/// A stream cipher and running digest, as instantiated for relay cells.
pub(crate) type RelayCryptState = tor1::CryptState<Aes128Ctr, sha1::Sha1>;

/// A full inbound/outbound state pair for one hop, as instantiated for
/// relay cells: AES-128-CTR with SHA-1 running digests.
pub(crate) type RelayCrypt = tor1::CryptStatePair<Aes128Ctr, sha1::Sha1>;

/// AES-128 in counter mode, big-endian counter.
pub(crate) type Aes128Ctr = ctr::Ctr128BE<aes::Aes128>;

/// Represents the ability for one hop of a circuit's cryptographic
/// state to be initialized from a given seed.
pub(crate) trait CryptInit: Sized {
    /// Return the number of bytes that this state will require.
    fn seed_len() -> usize;
    /// Construct this state from a seed of the appropriate length.
    fn initialize(seed: &[u8]) -> Result<Self>;
}

/// A paired object containing the inbound and outbound cryptographic
/// layers used by a client to communicate with a single hop on one of
/// its circuits.
pub(crate) trait ClientLayer<F, B>
where
    F: OutboundClientLayer,
    B: InboundClientLayer,
{
    /// Consume this layer and return a paired forward and reverse
    /// crypto layer.
    fn split_client_layer(self) -> (F, B);
}

/// A paired object containing the inbound and outbound cryptographic
/// layers used by a relay to implement a client's circuits.
pub(crate) trait RelayLayer<F, B>
where
    F: OutboundRelayLayer,
    B: InboundRelayLayer,
{
    /// Consume this layer and return paired forward and reverse crypto
    /// layers.
    fn split_relay_layer(self) -> (F, B);
}

/// A client's view of the cryptographic state shared with a single
/// relay on a circuit, as used for outbound cells.
pub(crate) trait OutboundClientLayer {
    /// Prepare a cell body to be sent to the relay at this layer, and
    /// encrypt it: set the integrity field from this layer's running
    /// digest, then apply the forward cipher.
    fn originate_for(&mut self, cell: &mut RawCellBody);
    /// Encrypt a cell body that is to be decrypted by this layer.
    fn encrypt_outbound(&mut self, cell: &mut RawCellBody);
}

/// A client's view of the crypto state shared with a single relay on a
/// circuit, as used for inbound cells.
pub(crate) trait InboundClientLayer {
    /// Decrypt a cell body that passed through this layer.
    ///
    /// Return true if this layer was the originator: the recognized
    /// field is zero and the integrity digest authenticates.  The
    /// running digest is committed only on success.
    fn decrypt_inbound(&mut self, cell: &mut RawCellBody) -> bool;
}

/// Represents a relay's view of the outbound crypto state on a given
/// circuit.
pub(crate) trait OutboundRelayLayer {
    /// Decrypt a cell body that is moving away from the client.
    ///
    /// Return true if it is addressed to us.
    fn decrypt_outbound(&mut self, cell: &mut RawCellBody) -> bool;
}

/// Represents a relay's view of the inbound crypto state on a given
/// circuit.
pub(crate) trait InboundRelayLayer {
    /// Prepare a cell body to be sent towards the client, and encrypt
    /// it.
    fn originate(&mut self, cell: &mut RawCellBody);
    /// Encrypt a cell body that is moving towards the client.
    fn encrypt_inbound(&mut self, cell: &mut RawCellBody);
}

/// Type to store hop indices on a circuit.
///
/// Hop indices are zero-based: "0" denotes the first hop on the
/// circuit.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Ord, PartialOrd, Hash)]
pub struct HopNum(u8);

impl HopNum {
    /// Return an object that implements [`Display`](std::fmt::Display)
    /// for printing `HopNum`s.
    ///
    /// This displays the `HopNum` as a 1-indexed value: the string
    /// representation of the first hop is `"#1"`.
    pub fn display(&self) -> HopNumDisplay {
        HopNumDisplay(*self)
    }

    /// Return true if this is the first hop of a circuit.
    pub(crate) fn is_first_hop(&self) -> bool {
        self.0 == 0
    }
}

/// A helper for displaying [`HopNum`]s as 1-based `#n` indices.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct HopNumDisplay(HopNum);

impl std::fmt::Display for HopNumDisplay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::result::Result<(), std::fmt::Error> {
        let hop_num: u8 = self.0.into();

        write!(f, "#{}", hop_num + 1)
    }
}

impl From<HopNum> for u8 {
    fn from(hop: HopNum) -> u8 {
        hop.0
    }
}

impl From<u8> for HopNum {
    fn from(v: u8) -> HopNum {
        HopNum(v)
    }
}

impl From<HopNum> for usize {
    fn from(hop: HopNum) -> usize {
        hop.0 as usize
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn hop_num_display() {
        for i in 0..10 {
            let hop_num = HopNum::from(i);
            let expect = format!("#{}", i + 1);

            assert_eq!(expect, hop_num.display().to_string());
        }
        assert!(HopNum::from(0).is_first_hop());
        assert!(!HopNum::from(1).is_first_hop());
    }
}

#![cfg_attr(docsrs, feature(doc_auto_cfg, doc_cfg))]
//! Encodings for the cells and relay messages of an onion-routed network.
//!
//! # Overview
//!
//! Every unit of transmission between adjacent relays is a fixed-size
//! *cell*: a circuit identifier, a command, and an opaque body.  Cells
//! whose command is RELAY (or its rate-limited variant RELAY_EARLY)
//! carry an end-to-end *relay cell*: an 11-byte relay header followed by
//! a command-specific message body, onion-encrypted once per hop.
//!
//! This crate implements the wire image of both layers: the
//! [`chancell`] module covers the outer 512-byte cell, and the
//! [`relaycell`] module covers the relay header and the typed message
//! bodies that the relay cell engine needs to interpret itself (END,
//! CONNECTED, RESOLVED, TRUNCATED, and the address TLV shared by
//! several of them).  Everything here is pure encoding and decoding:
//! no cryptography, no queueing, no I/O.
#![warn(missing_docs)]
#![warn(noop_method_call)]
#![warn(unreachable_pub)]
#![warn(clippy::all)]
#![deny(clippy::cast_lossless)]
#![deny(clippy::checked_conversions)]
#![warn(clippy::missing_docs_in_private_items)]
#![deny(clippy::unwrap_used)]
#![warn(clippy::needless_borrow)]
#![warn(clippy::semicolon_if_nothing_returned)]
#![allow(clippy::uninlined_format_args)]

pub mod chancell;
pub mod relaycell;

use thiserror::Error;

/// An error produced while encoding or decoding a cell or message.
#[derive(Error, Debug, Clone, Eq, PartialEq)]
#[non_exhaustive]
pub enum Error {
    /// The object we were trying to decode ended before its encoding
    /// said it would.
    #[error("object truncated: wanted {wanted} bytes, had {have}")]
    Truncated {
        /// How many bytes the encoding required.
        wanted: usize,
        /// How many bytes were actually present.
        have: usize,
    },
    /// A relay header's length field exceeded the relay payload size.
    #[error("relay cell length field out of range")]
    BadLength,
    /// A message carried an address whose encoding we rejected.
    #[error("invalid address encoding")]
    BadAddress,
    /// A cell that must carry a circuit identifier carried zero.
    #[error("zero circuit id on a cell that requires one")]
    MissingCircId,
    /// A message body would not fit within a relay payload.
    #[error("message body too long for a relay cell")]
    BodyTooLong,
}

/// A Result whose error type is [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

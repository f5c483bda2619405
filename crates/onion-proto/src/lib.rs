#![cfg_attr(docsrs, feature(doc_auto_cfg, doc_cfg))]
//! The per-circuit relay cell engine of an onion-routed network.
//!
//! # Overview
//!
//! Every node on an onion-routed network — the origin that built a
//! circuit, the relays in the middle, and the exit at the end — runs
//! the same core: a subsystem that encrypts, decrypts, authenticates,
//! routes, queues, and flow-controls the fixed-size relay cells moving
//! along each circuit.  This crate is that core.
//!
//! The [`reactor::Reactor`] owns everything: circuits (origin and
//! transit variants), channels (transport connections, seen as output
//! buffers with a fair-queueing ring of circuits), edge streams, and a
//! process-wide pool of packed cells.  Cells arrive through
//! [`Reactor::receive_relay_cell`](reactor::Reactor), get one layer of
//! cryptography per hop, and are either delivered to a local stream or
//! queued toward the next channel; stream bytes leave through
//! [`Reactor::package_raw_inbuf`](reactor::Reactor), gated by the
//! two-level window scheme that SENDME messages replenish.
//!
//! Everything the engine cannot decide by itself — exit connections,
//! name resolution, circuit building, SOCKS answers, policy — is
//! delegated through the [`hooks::EngineHooks`] trait.
//!
//! # Limitations
//!
//! The engine is strictly single-threaded and never blocks; it is
//! meant to be driven from one event loop by transport readiness
//! callbacks and timers.
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

mod cellpool;
mod cellqueue;
pub mod channel;
pub mod circuit;
mod crypto;
pub mod hooks;
pub mod reactor;
mod relay;
mod scheduler;
pub mod sendme;
pub mod stats;
pub mod stream;
mod util;

pub use crypto::cell::{HopNum, HopNumDisplay};
pub use relay::MAX_RESOLVE_FAILURES;
pub use scheduler::{CELL_QUEUE_HIGHWATER_SIZE, CELL_QUEUE_LOWWATER_SIZE};
pub use util::err::Error;

/// A Result whose error type is [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

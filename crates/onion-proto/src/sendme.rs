//! Management of flow-control windows.
//!
//! Every circuit (or, at the origin, every hop) and every stream
//! carries a pair of windows: a *package* window, counting how many
//! more DATA cells we may send before the far end acknowledges some,
//! and a *deliver* window, counting how many more DATA cells the far
//! end may send us.  SENDME messages move the windows back up, in
//! fixed increments.

use crate::{Error, Result};
use std::marker::PhantomData;

/// Initial value for a circuit-level (or per-hop) window.
pub const CIRCWINDOW_START: u16 = 1000;
/// Amount by which a circuit-level window grows on a SENDME.
pub const CIRCWINDOW_INCREMENT: u16 = 100;
/// Initial value for a stream-level window.
pub const STREAMWINDOW_START: u16 = 500;
/// Amount by which a stream-level window grows on a SENDME.
pub const STREAMWINDOW_INCREMENT: u16 = 50;

/// Tunable parameters for a kind of flow-control window.
pub(crate) trait WindowParams {
    /// The value a window starts at, and may never exceed.
    fn start() -> u16;
    /// The amount one SENDME is worth.
    fn increment() -> u16;
}

/// Parameters for a circuit-level (or per-hop) window.
#[derive(Clone, Debug)]
pub(crate) struct CircParams;
impl WindowParams for CircParams {
    fn start() -> u16 {
        CIRCWINDOW_START
    }
    fn increment() -> u16 {
        CIRCWINDOW_INCREMENT
    }
}

/// Parameters for a stream-level window.
#[derive(Clone, Debug)]
pub(crate) struct StreamParams;
impl WindowParams for StreamParams {
    fn start() -> u16 {
        STREAMWINDOW_START
    }
    fn increment() -> u16 {
        STREAMWINDOW_INCREMENT
    }
}

/// A packaging window: how many more cells we may send.
///
/// The window may never exceed its starting value: a SENDME that would
/// push it above is a protocol violation, as is sending with an empty
/// window.
#[derive(Clone, Debug)]
pub(crate) struct SendWindow<P: WindowParams> {
    /// Current value of the window.
    window: u16,
    /// Marker for the parameter type.
    _params: PhantomData<P>,
}

impl<P: WindowParams> SendWindow<P> {
    /// Return a new window at its starting value.
    pub(crate) fn new() -> Self {
        SendWindow {
            window: P::start(),
            _params: PhantomData,
        }
    }
    /// Return the current value of the window.
    pub(crate) fn window(&self) -> u16 {
        self.window
    }
    /// Record that one cell has been packaged.
    pub(crate) fn take(&mut self) -> Result<()> {
        self.window = self
            .window
            .checked_sub(1)
            .ok_or_else(|| Error::Internal("sent a cell with an empty package window".into()))?;
        Ok(())
    }
    /// Handle an incoming SENDME: grow the window by one increment.
    pub(crate) fn put(&mut self) -> Result<()> {
        let new = self.window + P::increment();
        if new > P::start() {
            return Err(Error::CircProto(
                "Received a SENDME when the window was full".into(),
            ));
        }
        self.window = new;
        Ok(())
    }
}

/// A delivery window: how many more cells the far end may send us.
#[derive(Clone, Debug)]
pub(crate) struct RecvWindow<P: WindowParams> {
    /// Current value of the window.
    window: u16,
    /// Marker for the parameter type.
    _params: PhantomData<P>,
}

impl<P: WindowParams> RecvWindow<P> {
    /// Return a new window at its starting value.
    pub(crate) fn new() -> Self {
        RecvWindow {
            window: P::start(),
            _params: PhantomData,
        }
    }
    /// Return the current value of the window.
    pub(crate) fn window(&self) -> u16 {
        self.window
    }
    /// Record that one cell has been delivered.  Fails if the sender
    /// has overrun the window.
    pub(crate) fn take(&mut self) -> Result<()> {
        self.window = self.window.checked_sub(1).ok_or_else(|| {
            Error::CircProto("Received a data cell in violation of a window".into())
        })?;
        Ok(())
    }
    /// Return true if the window has dropped far enough that a SENDME
    /// should be sent: by at least one increment below its start.
    pub(crate) fn should_ack(&self) -> bool {
        self.window <= P::start() - P::increment()
    }
    /// Record that we queued a SENDME: grow the window by one
    /// increment.
    pub(crate) fn put(&mut self) {
        debug_assert!(self.should_ack());
        self.window += P::increment();
    }
}

/// A circuit-level (or per-hop) packaging window.
pub(crate) type CircSendWindow = SendWindow<CircParams>;
/// A circuit-level (or per-hop) delivery window.
pub(crate) type CircRecvWindow = RecvWindow<CircParams>;
/// A stream-level packaging window.
pub(crate) type StreamSendWindow = SendWindow<StreamParams>;
/// A stream-level delivery window.
pub(crate) type StreamRecvWindow = RecvWindow<StreamParams>;

//! Frame-rate limiting against the engine's transmit queue
//!
//! The engine reports how many frames it still holds for a port (`y`)
//! or for one connection (`Y`). A throttle tracks an in-flight estimate
//! against that report and admits at most [`MAX_FRAMES_IN_FLIGHT`]
//! frames. Exactly one frame may wait in the throttle while it is
//! saturated; callers must check [`Throttle::has_room`] before
//! submitting, so a second waiting frame is a contract violation and
//! comes back as an error.
//!
//! A backlog query is sent when the throttle is created, again half way
//! to capacity so the reply usually arrives before saturation, and then
//! every poll tick while a frame is waiting.

use ax_protocol::{DataKind, Frame};
use tracing::trace;

use crate::error::EngineError;

/// Most frames allowed in the engine's queue before the throttle
/// holds frames back.
pub(crate) const MAX_FRAMES_IN_FLIGHT: u32 = 8;

/// What a throttle regulates: one port or one connection.
#[derive(Debug, Clone)]
pub(crate) enum ThrottleScope {
    Port {
        port: u8,
    },
    Connection {
        port: u8,
        my_call: String,
        their_call: String,
    },
}

impl ThrottleScope {
    /// The backlog query frame for this scope (`y` or `Y`).
    fn query(&self) -> Frame {
        match self {
            ThrottleScope::Port { port } => Frame::control(DataKind::PortBacklog, *port),
            ThrottleScope::Connection {
                port,
                my_call,
                their_call,
            } => Frame::addressed(
                *port,
                DataKind::ConnBacklog,
                my_call,
                their_call,
                Vec::new(),
            ),
        }
    }
}

impl std::fmt::Display for ThrottleScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ThrottleScope::Port { port } => write!(f, "port {port}"),
            ThrottleScope::Connection {
                port,
                my_call,
                their_call,
            } => write!(f, "{my_call}>{their_call} port {port}"),
        }
    }
}

/// Flow control for one port or connection.
#[derive(Debug)]
pub(crate) struct Throttle {
    scope: ThrottleScope,
    in_flight: u32,
    max_in_flight: u32,
    /// The single frame allowed to wait while saturated
    pending: Option<Frame>,
    pending_is_final: bool,
    /// A close was requested; once `pending` drains, the final frame
    /// (if any) goes out and the throttle is done
    flushing: bool,
    final_frame: Option<Frame>,
    done: bool,
}

impl Throttle {
    /// Create a throttle and the initial backlog query that must be
    /// sent to seed the in-flight estimate.
    pub fn new(scope: ThrottleScope) -> (Self, Frame) {
        let query = scope.query();
        let throttle = Self {
            scope,
            in_flight: 0,
            max_in_flight: MAX_FRAMES_IN_FLIGHT,
            pending: None,
            pending_is_final: false,
            flushing: false,
            final_frame: None,
            done: false,
        };
        (throttle, query)
    }

    /// Whether a new frame may be submitted without risking overflow.
    pub fn has_room(&self) -> bool {
        !self.flushing && !self.done && self.pending.is_none()
    }

    /// Submit one frame. Returns the frames to forward downstream now,
    /// possibly including a look-ahead backlog query.
    pub fn submit(&mut self, frame: Frame) -> Result<Vec<Frame>, EngineError> {
        if self.in_flight >= self.max_in_flight {
            if self.pending.is_some() {
                return Err(EngineError::Overflow(format!(
                    "frame submitted to a saturated throttle ({})",
                    self.scope
                )));
            }
            trace!(scope = %self.scope, "throttle saturated, holding frame");
            self.pending = Some(frame);
            self.pending_is_final = false;
            return Ok(Vec::new());
        }
        self.in_flight += 1;
        let mut out = vec![frame];
        // Ask for a backlog report half way to capacity so the answer
        // usually arrives before we saturate.
        if self.in_flight == self.max_in_flight / 2 {
            out.push(self.scope.query());
        }
        Ok(out)
    }

    /// Apply a backlog report from the engine. Returns frames released
    /// by the new estimate.
    pub fn update_in_flight(&mut self, frames_in_queue: u32) -> Vec<Frame> {
        trace!(scope = %self.scope, frames_in_queue, "backlog report");
        self.in_flight = frames_in_queue;
        self.release()
    }

    /// Begin closing: after any held frame drains, send `final_frame`
    /// and finish. Returns frames released immediately.
    pub fn start_flush(&mut self, final_frame: Option<Frame>) -> Vec<Frame> {
        self.flushing = true;
        self.final_frame = final_frame;
        self.release()
    }

    /// The backlog query to send this poll tick, if a frame is stuck
    /// waiting for the engine to drain.
    pub fn poll_query(&self) -> Option<Frame> {
        if !self.done && self.pending.is_some() && self.in_flight >= self.max_in_flight {
            Some(self.scope.query())
        } else {
            None
        }
    }

    /// True once `start_flush` has been called.
    pub fn is_flushing(&self) -> bool {
        self.flushing
    }

    /// True once the close cascade has fully drained this throttle.
    pub fn is_done(&self) -> bool {
        self.done
    }

    fn release(&mut self) -> Vec<Frame> {
        let mut out = Vec::new();
        loop {
            if self.in_flight < self.max_in_flight {
                if let Some(frame) = self.pending.take() {
                    self.in_flight += 1;
                    out.push(frame);
                    if self.pending_is_final {
                        self.pending_is_final = false;
                        self.done = true;
                    }
                    continue;
                }
            }
            if self.flushing && !self.done && self.pending.is_none() {
                match self.final_frame.take() {
                    Some(frame) => {
                        // The final frame is a disconnect; frames still
                        // queued behind it in the engine would be
                        // dropped, so wait for the queue to hit zero.
                        self.max_in_flight = 1;
                        self.pending = Some(frame);
                        self.pending_is_final = true;
                        continue;
                    }
                    None => {
                        self.done = true;
                    }
                }
            }
            break;
        }
        out
    }
}

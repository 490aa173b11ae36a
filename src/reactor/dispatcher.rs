use mio::event::Source;
use mio::Token;

use super::Loop;
use crate::{AppError, AppResult};

/// Readiness of a channel, as reported by the multiplexer or left over
/// after a handler ran.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Ready {
    pub readable: bool,
    pub writable: bool,
}

impl Ready {
    pub const NONE: Ready = Ready {
        readable: false,
        writable: false,
    };

    pub fn is_empty(&self) -> bool {
        !self.readable && !self.writable
    }

    pub fn merge(self, other: Ready) -> Ready {
        Ready {
            readable: self.readable || other.readable,
            writable: self.writable || other.writable,
        }
    }
}

/// Anything the loop polls: listeners and streams.
///
/// The loop asks `readable()`/`writable()` once per cycle to decide which
/// readiness to poll for, then calls `handle` with the readiness it observed,
/// masked by those predicates. `handle` returns the readiness that was not
/// exhausted (no `WouldBlock` seen), which the loop keeps until the next cycle.
pub trait Dispatcher {
    /// Called by `Loop::add` with the token the dispatcher is registered under.
    fn attach(&mut self, token: Token);

    /// The pollable socket, `None` once closed.
    fn source(&mut self) -> Option<&mut dyn Source>;

    fn readable(&self) -> bool;

    fn writable(&self) -> bool;

    fn handle(&mut self, lp: &mut Loop, ready: Ready) -> AppResult<Ready>;

    fn close(&mut self, lp: &mut Loop);

    fn is_closed(&self) -> bool;

    /// Handles anything a handler returned to the loop: by default close.
    /// The error itself was already logged by the loop.
    fn handle_error(&mut self, lp: &mut Loop, error: AppError) {
        let _ = error;
        self.close(lp);
    }
}

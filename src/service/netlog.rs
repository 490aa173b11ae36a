// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::rc::Rc;

use tracing::debug;

use crate::network::{Context, Netstring, NetstringDispatcher, NetstringHandler, Stream};
use crate::reactor::{ExitVote, Loginfo, Loop};
use crate::service::DEFAULT_BUFFER_SIZE;
use crate::{AppError, AppResult};

/// Category under which tracebacks are routed.
pub const TRACEBACK: &str = "TRACEBACK";

/// Client side of a netlog channel, it only ever writes.
#[derive(Debug, Default)]
pub struct NetlogPeer;

impl NetstringHandler for NetlogPeer {
    fn handle_netstring(&mut self, cx: &mut Context<'_>, _netstring: Netstring) -> AppResult<bool> {
        Err(AppError::InvalidOperation(format!(
            "unexpected netstring from log collector {}",
            cx.addr()
        )))
    }
}

pub type NetlogChannel = Rc<RefCell<Stream<NetstringDispatcher<NetlogPeer>>>>;

/// A [`Loginfo`] sink forwarding entries as netstrings to collectors.
///
/// Uncategorized messages, each routed category and tracebacks may go to
/// their own collector. Anything without an open channel, or logged while
/// its channel is busy, falls back to the wrapped sink.
pub struct Netlog {
    wrapped: Box<dyn Loginfo>,
    out: Option<NetlogChannel>,
    categories: HashMap<String, NetlogChannel>,
}

impl Netlog {
    pub fn new(wrapped: Box<dyn Loginfo>) -> Netlog {
        Netlog {
            wrapped,
            out: None,
            categories: HashMap::new(),
        }
    }

    /// Connects a channel to the collector at `addr`.
    pub fn connect(lp: &mut Loop, addr: SocketAddr) -> AppResult<NetlogChannel> {
        Stream::connect(
            lp,
            addr,
            NetstringDispatcher::new(NetlogPeer, DEFAULT_BUFFER_SIZE),
            DEFAULT_BUFFER_SIZE,
            DEFAULT_BUFFER_SIZE,
        )
    }

    /// Routes uncategorized messages to `channel`.
    pub fn route_out(&mut self, channel: NetlogChannel) {
        self.out = Some(channel);
    }

    /// Routes messages of `category` to `channel`, [`TRACEBACK`] routes errors.
    pub fn route(&mut self, category: &str, channel: NetlogChannel) {
        self.categories.insert(category.to_string(), channel);
    }

    /// Every distinct channel this sink routes to.
    pub fn channels(&self) -> Vec<NetlogChannel> {
        let mut channels: Vec<NetlogChannel> = self.out.iter().cloned().collect();
        for channel in self.categories.values() {
            if !channels.iter().any(|c| Rc::ptr_eq(c, channel)) {
                channels.push(channel.clone());
            }
        }
        channels
    }

    /// Closes `channels` once their pending entries are sent.
    pub fn disconnect(lp: &mut Loop, channels: &[NetlogChannel]) {
        for channel in channels {
            if let Ok(mut channel) = channel.try_borrow_mut() {
                channel.close_when_done(lp);
            }
        }
    }

    /// Wraps the loop's current sink and returns the channels it routes to.
    ///
    /// The first exit request is vetoed and disconnects the channels so
    /// they can drain, the loop ends by itself once nothing else is left.
    pub fn install<F>(lp: &mut Loop, configure: F) -> Vec<NetlogChannel>
    where
        F: FnOnce(&mut Netlog),
    {
        let mut channels = Vec::new();
        lp.wrap_logger(|wrapped| {
            let mut netlog = Netlog::new(wrapped);
            configure(&mut netlog);
            channels = netlog.channels();
            Box::new(netlog)
        });
        let draining = Cell::new(false);
        let exiting = channels.clone();
        lp.add_exit(move |lp, reason| {
            if draining.replace(true) {
                return ExitVote::Exit;
            }
            debug!("netlog draining {} channels on exit: {}", exiting.len(), reason);
            Netlog::disconnect(lp, &exiting);
            ExitVote::Continue
        });
        channels
    }

    // false if the entry could not be queued on `channel`
    fn send(channel: Option<&NetlogChannel>, message: &str) -> bool {
        let Some(channel) = channel else {
            return false;
        };
        let Ok(mut stream) = channel.try_borrow_mut() else {
            return false;
        };
        if stream.connection().is_closed() {
            return false;
        }
        stream.push_netstring(message.as_bytes());
        true
    }
}

impl Loginfo for Netlog {
    fn out(&mut self, message: &str) {
        if !Netlog::send(self.out.as_ref(), message) {
            self.wrapped.out(message);
        }
    }

    fn err(&mut self, category: &str, message: &str) {
        if !Netlog::send(self.categories.get(category), message) {
            self.wrapped.err(category, message);
        }
    }

    fn traceback(&mut self, error: &AppError) {
        if !Netlog::send(self.categories.get(TRACEBACK), &error.to_string()) {
            self.wrapped.traceback(error);
        }
    }
}

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

//! Netstring log collector.
//!
//! Every peer writes netstrings, each one is a log entry. Entries are
//! appended to one blocking sink, re-encoded as netstrings, so a consumer
//! reading the sink sees either a complete entry or none. An entry longer
//! than `max_entry_size` is cut down to its tail and the peer stays
//! connected.

use std::cell::{Cell, RefCell};
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::net::SocketAddr;
use std::rc::{Rc, Weak};
use std::time::Duration;

use mio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::network::{encode, Context, Netstring, NetstringDispatcher, NetstringHandler, Stream};
use crate::reactor::{Dispatcher, ExitVote, Listener, Loop};
use crate::service::NetloggerConfig;
use crate::utils::Timeouts;
use crate::{AppError, AppResult};

pub type LogSink = Rc<RefCell<Box<dyn Write>>>;

type EntryStream = Stream<NetstringDispatcher<LogEntryWriter>>;

/// Opens the entry sink, `-` is stdout, anything else a file opened for append.
pub fn open_output(path: &str) -> AppResult<Box<dyn Write>> {
    if path == "-" {
        return Ok(Box::new(io::stdout()));
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| AppError::DetailedIoError(format!("open log output {}: {}", path, e)))?;
    Ok(Box::new(file))
}

/// Writes every complete entry of one peer to the shared sink.
pub struct LogEntryWriter {
    sink: LogSink,
    entries: Rc<Cell<u64>>,
}

impl NetstringHandler for LogEntryWriter {
    fn handle_connect(&mut self, cx: &mut Context<'_>) -> AppResult<()> {
        debug!("log peer {} connected", cx.addr());
        Ok(())
    }

    fn handle_netstring(&mut self, cx: &mut Context<'_>, netstring: Netstring) -> AppResult<bool> {
        if netstring.is_truncated() {
            warn!(
                "entry of {} bytes from {} truncated to {}",
                netstring.declared,
                cx.addr(),
                netstring.payload.len()
            );
        }
        let mut sink = self.sink.borrow_mut();
        sink.write_all(&encode(&netstring.payload))?;
        sink.flush()?;
        self.entries.set(self.entries.get() + 1);
        Ok(false)
    }

    fn handle_close(&mut self, cx: &mut Context<'_>) -> AppResult<()> {
        debug!("log peer {} disconnected", cx.addr());
        Ok(())
    }
}

/// A running collector. Dropping it leaves the server on the loop.
pub struct Netlogger {
    listener: Rc<RefCell<Listener>>,
    entries: Rc<Cell<u64>>,
    peers: Rc<RefCell<Vec<Weak<RefCell<EntryStream>>>>>,
}

impl Netlogger {
    /// Listens on the configured address and writes entries to `sink`.
    ///
    /// An exit request closes the listener and every peer once its pending
    /// output is sent, then lets the loop exit.
    pub fn start(lp: &mut Loop, config: &NetloggerConfig, sink: Box<dyn Write>) -> AppResult<Netlogger> {
        let addr: SocketAddr = format!("{}:{}", config.network.ip, config.network.port)
            .parse()
            .map_err(|e| AppError::InvalidValue(format!("listen address: {}", e)))?;
        let sink: LogSink = Rc::new(RefCell::new(sink));
        let entries = Rc::new(Cell::new(0));
        let peers: Rc<RefCell<Vec<Weak<RefCell<EntryStream>>>>> = Rc::new(RefCell::new(Vec::new()));

        let idle = if config.netlog.idle_timeout_ms > 0 {
            let period = Duration::from_millis(config.netlog.idle_timeout_ms);
            Some(Timeouts::new(
                lp,
                period,
                lp.precision(),
                move |lp, timeouts: &Timeouts<Weak<RefCell<EntryStream>>>, peer| {
                    let Some(stream) = peer.upgrade() else {
                        return Ok(());
                    };
                    let idle_for = {
                        let s = stream.borrow();
                        if s.connection().is_closed() {
                            return Ok(());
                        }
                        lp.now().saturating_duration_since(s.connection().when_in())
                    };
                    if idle_for >= period {
                        let mut s = stream.borrow_mut();
                        info!("closing log peer {} idle for {:?}", s.connection().addr(), idle_for);
                        s.close(lp);
                    } else {
                        timeouts.push(lp, peer);
                    }
                    Ok(())
                },
            ))
        } else {
            None
        };

        let max_entry = config.netlog.max_entry_size;
        let input_size = config.network.input_buffer_size;
        let output_size = config.network.output_buffer_size;
        let accept_entries = entries.clone();
        let accept_peers = peers.clone();
        let listener = Listener::listen(lp, addr, move |lp, socket: TcpStream, peer| {
            let writer = LogEntryWriter {
                sink: sink.clone(),
                entries: accept_entries.clone(),
            };
            let stream = Stream::with_capacity(
                socket,
                peer,
                NetstringDispatcher::new(writer, max_entry),
                input_size,
                output_size,
            );
            let stream = Stream::accept(lp, stream)?;
            let mut tracked = accept_peers.borrow_mut();
            tracked.retain(|p| p.upgrade().is_some_and(|s| !s.borrow().connection().is_closed()));
            tracked.push(Rc::downgrade(&stream));
            if let Some(idle) = idle.as_ref() {
                idle.push(lp, Rc::downgrade(&stream));
            }
            Ok(())
        })?;

        let exit_listener = listener.clone();
        let exit_peers = peers.clone();
        lp.add_exit(move |lp, reason| {
            info!("netlogger shutdown: {}", reason);
            if let Ok(mut listener) = exit_listener.try_borrow_mut() {
                listener.close(lp);
            }
            for peer in exit_peers.borrow().iter().filter_map(Weak::upgrade) {
                if let Ok(mut stream) = peer.try_borrow_mut() {
                    stream.close_when_done(lp);
                }
            }
            ExitVote::Exit
        });

        Ok(Netlogger {
            listener,
            entries,
            peers,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.listener.borrow().local_addr()
    }

    /// Entries written to the sink so far.
    pub fn entries(&self) -> u64 {
        self.entries.get()
    }

    /// Peers currently connected.
    pub fn peers(&self) -> usize {
        self.peers
            .borrow()
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|s| s.try_borrow().map_or(true, |s| !s.connection().is_closed()))
            .count()
    }
}

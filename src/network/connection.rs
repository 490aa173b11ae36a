use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::time::Instant;

use bytes::Bytes;
use mio::net::TcpStream;
use mio::Token;
use tracing::{debug, trace, warn};

use super::{Buffer, OutputQueue, Producer};
use crate::reactor::Loop;
use crate::{AppError, AppResult};

/// Outcome of one non-blocking receive or send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transfer {
    /// Some bytes moved.
    Moved(usize),
    /// The socket would block, readiness is exhausted.
    Blocked,
    /// The peer closed or the socket failed.
    Closed,
}

/// Socket-level state of a stream, shared with protocol handlers through
/// [`Context`].
///
/// Owns the socket, the output buffer and its queue, the connected flag and
/// the traffic meters.
#[derive(Debug)]
pub struct Connection {
    token: Option<Token>,
    socket: Option<TcpStream>,
    addr: SocketAddr,
    output: Buffer,
    queue: OutputQueue,
    connected: bool,
    closed: bool,
    bytes_in: u64,
    bytes_out: u64,
    when_in: Instant,
    when_out: Instant,
}

impl Connection {
    /// A connection over `socket`, `connected` false while a connect is in progress.
    pub fn new(socket: TcpStream, addr: SocketAddr, connected: bool, output_size: usize) -> Connection {
        let now = Instant::now();
        Connection {
            token: None,
            socket: Some(socket),
            addr,
            output: Buffer::new(output_size),
            queue: OutputQueue::new(),
            connected,
            closed: false,
            bytes_in: 0,
            bytes_out: 0,
            when_in: now,
            when_out: now,
        }
    }

    pub(crate) fn attach(&mut self, token: Token) {
        self.token = Some(token);
    }

    pub(crate) fn socket_mut(&mut self) -> Option<&mut TcpStream> {
        self.socket.as_mut()
    }

    pub fn token(&self) -> Option<Token> {
        self.token
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn bytes_in(&self) -> u64 {
        self.bytes_in
    }

    pub fn bytes_out(&self) -> u64 {
        self.bytes_out
    }

    /// Last time bytes were received, or the creation time.
    pub fn when_in(&self) -> Instant {
        self.when_in
    }

    pub fn when_out(&self) -> Instant {
        self.when_out
    }

    /// Queues a chunk of output.
    pub fn push(&mut self, data: Bytes) {
        if !self.closed {
            self.queue.push_chunk(data);
        }
    }

    pub fn push_producer(&mut self, producer: Box<dyn Producer>) {
        if !self.closed {
            self.queue.push_producer(producer);
        }
    }

    /// Output is pending, the head of the queue can make progress, or the
    /// connection is still being established.
    pub fn writable(&self) -> bool {
        if self.closed {
            false
        } else if !self.output.is_empty() {
            true
        } else if self.queue.is_empty() {
            !self.connected
        } else {
            !(self.connected && self.queue.head_stalled())
        }
    }

    /// Closes once everything queued so far is sent, stalled producers
    /// included, or now if nothing is.
    pub fn close_when_done(&mut self, lp: &mut Loop) {
        if self.closed {
            return;
        }
        if !self.output.is_empty() || !self.queue.is_empty() {
            self.queue.push_close();
        } else {
            self.close(lp);
        }
    }

    /// Closes the socket and discards queued output. Idempotent.
    pub fn close(&mut self, lp: &mut Loop) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.connected = false;
        self.queue.clear();
        let mut socket = self.socket.take();
        if let Some(token) = self.token {
            lp.remove(token, socket.as_mut().map(|s| s as &mut dyn mio::event::Source));
        }
        if let Some(socket) = socket {
            let _ = socket.shutdown(std::net::Shutdown::Both);
        }
        debug!(
            "connection {} closed, {} bytes in, {} bytes out",
            self.addr, self.bytes_in, self.bytes_out
        );
    }

    /// Completes a non-blocking connect. `Ok(false)` while still in progress.
    pub(crate) fn finish_connect(&mut self) -> AppResult<bool> {
        let Some(socket) = self.socket.as_ref() else {
            return Ok(false);
        };
        if let Some(e) = socket.take_error()? {
            return Err(e.into());
        }
        match socket.peer_addr() {
            Ok(addr) => {
                self.addr = addr;
                self.connected = true;
                trace!("connected to {}", addr);
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Receives into `input`.
    pub(crate) fn recv(&mut self, input: &mut Buffer, now: Instant) -> Transfer {
        let Some(socket) = self.socket.as_mut() else {
            return Transfer::Closed;
        };
        input.compact();
        match socket.read(input.spare_mut()) {
            Ok(0) => Transfer::Closed,
            Ok(n) => {
                input.advance_write(n);
                self.bytes_in += n as u64;
                self.when_in = now;
                Transfer::Moved(n)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Transfer::Blocked,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Transfer::Moved(0),
            Err(e) => {
                self.failed("recv from", e.into());
                Transfer::Closed
            }
        }
    }

    /// Refills the output buffer from the queue then sends what it holds.
    /// `Ok(None)` when the close item was reached: the caller closes.
    pub(crate) fn send(&mut self, now: Instant) -> AppResult<Option<Transfer>> {
        if !self.queue.produce(&mut self.output)? {
            return Ok(None);
        }
        if self.output.is_empty() {
            return Ok(Some(Transfer::Moved(0)));
        }
        let Some(socket) = self.socket.as_mut() else {
            return Ok(Some(Transfer::Closed));
        };
        let transfer = match socket.write(self.output.unread()) {
            Ok(n) => {
                self.output.skip(n);
                self.output.compact();
                self.bytes_out += n as u64;
                self.when_out = now;
                Transfer::Moved(n)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Transfer::Blocked,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Transfer::Moved(0),
            Err(e) => {
                self.failed("send to", e.into());
                Transfer::Closed
            }
        };
        Ok(Some(transfer))
    }

    fn failed(&self, op: &str, error: AppError) {
        if error.is_disconnect() {
            debug!("{} {} failed: {}", op, self.addr, error);
        } else {
            warn!("{} {} failed: {}", op, self.addr, error);
        }
    }
}

/// What a protocol handler gets: the loop and the connection it serves.
pub struct Context<'a> {
    pub lp: &'a mut Loop,
    pub conn: &'a mut Connection,
}

impl<'a> Context<'a> {
    pub fn new(lp: &'a mut Loop, conn: &'a mut Connection) -> Self {
        Context { lp, conn }
    }

    pub fn push(&mut self, data: Bytes) {
        self.conn.push(data);
    }

    pub fn push_producer(&mut self, producer: Box<dyn Producer>) {
        self.conn.push_producer(producer);
    }

    pub fn close_when_done(&mut self) {
        self.conn.close_when_done(self.lp);
    }

    pub fn close(&mut self) {
        self.conn.close(self.lp);
    }

    pub fn addr(&self) -> SocketAddr {
        self.conn.addr()
    }
}

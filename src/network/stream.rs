use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::Rc;

use bytes::Bytes;
use mio::event::Source;
use mio::net::TcpStream;
use mio::Token;
use tracing::trace;

use super::connection::Transfer;
use super::{Buffer, Connection, Context, Producer};
use crate::reactor::{Dispatcher, Loop, Ready};
use crate::service::DEFAULT_BUFFER_SIZE;
use crate::AppResult;

/// The framing layer of a stream.
pub trait Protocol {
    /// Consumes framed input from the unread region of `input`. Returns
    /// `true` to stall input until [`Stream::pull`].
    fn collect(&mut self, cx: &mut Context<'_>, input: &mut Buffer) -> AppResult<bool>;

    fn handle_connect(&mut self, cx: &mut Context<'_>) -> AppResult<()> {
        let _ = cx;
        Ok(())
    }

    /// The peer closed or the socket failed. The connection is already closed.
    fn handle_close(&mut self, cx: &mut Context<'_>) -> AppResult<()> {
        let _ = cx;
        Ok(())
    }
}

/// A buffered connection driven by the loop, framed by `P`.
#[derive(Debug)]
pub struct Stream<P> {
    conn: Connection,
    input: Buffer,
    stalled_in: bool,
    protocol: P,
}

impl<P: Protocol + 'static> Stream<P> {
    /// Wraps an accepted socket with default buffer sizes.
    pub fn new(socket: TcpStream, addr: SocketAddr, protocol: P) -> Stream<P> {
        Stream::with_capacity(socket, addr, protocol, DEFAULT_BUFFER_SIZE, DEFAULT_BUFFER_SIZE)
    }

    pub fn with_capacity(
        socket: TcpStream,
        addr: SocketAddr,
        protocol: P,
        input_size: usize,
        output_size: usize,
    ) -> Stream<P> {
        Stream {
            conn: Connection::new(socket, addr, true, output_size),
            input: Buffer::new(input_size),
            stalled_in: false,
            protocol,
        }
    }

    /// Adds an accepted stream to the loop and calls `handle_connect`.
    ///
    /// A failing `handle_connect` is logged and closes this stream only.
    pub fn accept(lp: &mut Loop, stream: Stream<P>) -> AppResult<Rc<RefCell<Stream<P>>>> {
        let stream = Rc::new(RefCell::new(stream));
        lp.add(stream.clone())?;
        {
            let mut s = stream.borrow_mut();
            if let Err(e) = s.connected(lp) {
                lp.log_error(&e);
                s.close(lp);
            }
        }
        Ok(stream)
    }

    /// Starts a non-blocking connect to `addr` and adds the stream to the
    /// loop, `handle_connect` is called once the connection is established.
    pub fn connect(
        lp: &mut Loop,
        addr: SocketAddr,
        protocol: P,
        input_size: usize,
        output_size: usize,
    ) -> AppResult<Rc<RefCell<Stream<P>>>> {
        let socket = TcpStream::connect(addr)?;
        let stream = Rc::new(RefCell::new(Stream {
            conn: Connection::new(socket, addr, false, output_size),
            input: Buffer::new(input_size),
            stalled_in: false,
            protocol,
        }));
        lp.add(stream.clone())?;
        trace!("connecting to {}", addr);
        Ok(stream)
    }

    fn connected(&mut self, lp: &mut Loop) -> AppResult<()> {
        let mut cx = Context::new(lp, &mut self.conn);
        self.protocol.handle_connect(&mut cx)
    }
}

impl<P: Protocol> Stream<P> {
    pub fn protocol(&self) -> &P {
        &self.protocol
    }

    pub fn protocol_mut(&mut self) -> &mut P {
        &mut self.protocol
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn push(&mut self, data: Bytes) {
        self.conn.push(data);
    }

    pub fn push_producer(&mut self, producer: Box<dyn Producer>) {
        self.conn.push_producer(producer);
    }

    pub fn close_when_done(&mut self, lp: &mut Loop) {
        self.conn.close_when_done(lp);
    }

    pub fn is_stalled(&self) -> bool {
        self.stalled_in
    }

    /// Resumes a stalled collector on the bytes already buffered.
    pub fn pull(&mut self, lp: &mut Loop) -> AppResult<()> {
        self.stalled_in = false;
        if !self.input.is_empty() && !self.conn.is_closed() {
            self.collect(lp)?;
        }
        Ok(())
    }

    fn collect(&mut self, lp: &mut Loop) -> AppResult<()> {
        let mut cx = Context::new(lp, &mut self.conn);
        self.stalled_in = self.protocol.collect(&mut cx, &mut self.input)?;
        self.input.compact();
        Ok(())
    }

    fn closed_by_peer(&mut self, lp: &mut Loop) -> AppResult<()> {
        self.conn.close(lp);
        let mut cx = Context::new(lp, &mut self.conn);
        self.protocol.handle_close(&mut cx)
    }

    /// One receive then one collect pass. `true` once readiness is exhausted.
    fn handle_read(&mut self, lp: &mut Loop) -> AppResult<bool> {
        match self.conn.recv(&mut self.input, lp.now()) {
            Transfer::Moved(0) => Ok(false),
            Transfer::Moved(_) => {
                self.collect(lp)?;
                Ok(false)
            }
            Transfer::Blocked => Ok(true),
            Transfer::Closed => {
                self.closed_by_peer(lp)?;
                Ok(true)
            }
        }
    }

    fn handle_write(&mut self, lp: &mut Loop) -> AppResult<bool> {
        match self.conn.send(lp.now())? {
            None => {
                self.conn.close(lp);
                Ok(true)
            }
            Some(Transfer::Moved(_)) => Ok(false),
            Some(Transfer::Blocked) => Ok(true),
            Some(Transfer::Closed) => {
                self.closed_by_peer(lp)?;
                Ok(true)
            }
        }
    }
}

impl<P: Protocol + 'static> Dispatcher for Stream<P> {
    fn attach(&mut self, token: Token) {
        self.conn.attach(token);
    }

    fn source(&mut self) -> Option<&mut dyn Source> {
        self.conn.socket_mut().map(|s| s as &mut dyn Source)
    }

    fn readable(&self) -> bool {
        self.conn.is_connected() && !self.stalled_in && self.input.has_space()
    }

    fn writable(&self) -> bool {
        self.conn.writable()
    }

    fn handle(&mut self, lp: &mut Loop, ready: Ready) -> AppResult<Ready> {
        if !self.conn.is_connected() {
            if !self.conn.finish_connect()? {
                return Ok(Ready::NONE);
            }
            self.connected(lp)?;
            // the readiness that completed the connect is not spent yet
            return Ok(ready);
        }

        let mut left = ready;
        if ready.readable && self.readable() {
            left.readable = !self.handle_read(lp)?;
        }
        if self.conn.is_closed() {
            return Ok(Ready::NONE);
        }
        if ready.writable && self.writable() {
            left.writable = !self.handle_write(lp)?;
        }
        Ok(left)
    }

    fn close(&mut self, lp: &mut Loop) {
        self.conn.close(lp);
    }

    fn is_closed(&self) -> bool {
        self.conn.is_closed()
    }
}

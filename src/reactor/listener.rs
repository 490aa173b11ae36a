use std::cell::RefCell;
use std::io;
use std::net::SocketAddr;
use std::rc::Rc;

use mio::event::Source;
use mio::net::{TcpListener, TcpStream};
use mio::Token;
use tracing::{debug, info, trace};

use super::{Dispatcher, Loop, Ready};
use crate::{AppError, AppResult};

/// Called for every accepted connection, with the loop so the callback can
/// wrap the socket in a stream and add it.
pub type AcceptCallback = Box<dyn FnMut(&mut Loop, TcpStream, SocketAddr) -> AppResult<()>>;

/// A listening socket, readable while it accepts connections.
pub struct Listener {
    token: Option<Token>,
    socket: Option<TcpListener>,
    addr: SocketAddr,
    accepting: bool,
    accepted: u64,
    on_accept: AcceptCallback,
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("token", &self.token)
            .field("addr", &self.addr)
            .field("accepting", &self.accepting)
            .field("accepted", &self.accepted)
            .finish()
    }
}

impl Listener {
    /// Binds `addr`. Port 0 picks an ephemeral port, see [`Listener::local_addr`].
    pub fn bind<F>(addr: SocketAddr, on_accept: F) -> AppResult<Listener>
    where
        F: FnMut(&mut Loop, TcpStream, SocketAddr) -> AppResult<()> + 'static,
    {
        let socket = TcpListener::bind(addr)?;
        let addr = socket.local_addr()?;
        info!("listening on {}", addr);
        Ok(Listener {
            token: None,
            socket: Some(socket),
            addr,
            accepting: true,
            accepted: 0,
            on_accept: Box::new(on_accept),
        })
    }

    /// Binds `addr` and adds the listener to the loop.
    pub fn listen<F>(lp: &mut Loop, addr: SocketAddr, on_accept: F) -> AppResult<Rc<RefCell<Listener>>>
    where
        F: FnMut(&mut Loop, TcpStream, SocketAddr) -> AppResult<()> + 'static,
    {
        let listener = Rc::new(RefCell::new(Listener::bind(addr, on_accept)?));
        lp.add(listener.clone())?;
        Ok(listener)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Number of connections accepted so far.
    pub fn accepted(&self) -> u64 {
        self.accepted
    }

    /// Stops or resumes accepting without closing the socket.
    pub fn set_accepting(&mut self, accepting: bool) {
        self.accepting = accepting;
    }

    fn accept(&mut self, lp: &mut Loop) -> AppResult<Ready> {
        loop {
            let Some(socket) = self.socket.as_ref() else {
                return Ok(Ready::NONE);
            };
            match socket.accept() {
                Ok((stream, peer)) => {
                    self.accepted += 1;
                    trace!("accepted {} on {}", peer, self.addr);
                    (self.on_accept)(lp, stream, peer)?;
                    if !self.accepting {
                        // the callback may stop accepting mid-batch
                        return Ok(Ready {
                            readable: true,
                            writable: false,
                        });
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Ready::NONE),
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::Interrupted
                            | io::ErrorKind::ConnectionAborted
                            | io::ErrorKind::ConnectionReset
                    ) =>
                {
                    debug!("transient accept error on {}: {}", self.addr, e);
                }
                Err(e) => return Err(AppError::Accept(format!("{}: {}", self.addr, e))),
            }
        }
    }
}

impl Dispatcher for Listener {
    fn attach(&mut self, token: Token) {
        self.token = Some(token);
    }

    fn source(&mut self) -> Option<&mut dyn Source> {
        self.socket.as_mut().map(|s| s as &mut dyn Source)
    }

    fn readable(&self) -> bool {
        self.accepting && self.socket.is_some()
    }

    fn writable(&self) -> bool {
        false
    }

    fn handle(&mut self, lp: &mut Loop, ready: Ready) -> AppResult<Ready> {
        if ready.readable {
            self.accept(lp)
        } else {
            Ok(Ready::NONE)
        }
    }

    fn close(&mut self, lp: &mut Loop) {
        if let Some(mut socket) = self.socket.take() {
            if let Some(token) = self.token {
                lp.remove(token, Some(&mut socket));
            }
            info!("listener on {} closed after {} accepted", self.addr, self.accepted);
        }
    }

    fn is_closed(&self) -> bool {
        self.socket.is_none()
    }
}

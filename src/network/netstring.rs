use tracing::debug;

use super::frame::{encode, Netstring, NetstringDecoder};
use super::stream::Protocol;
use super::{Buffer, Context, Stream};
use crate::AppResult;

/// Application side of a [`NetstringDispatcher`].
pub trait NetstringHandler {
    fn handle_connect(&mut self, cx: &mut Context<'_>) -> AppResult<()> {
        let _ = cx;
        Ok(())
    }

    /// A complete netstring arrived. Returns `true` to stall input.
    fn handle_netstring(&mut self, cx: &mut Context<'_>, netstring: Netstring) -> AppResult<bool>;

    fn handle_close(&mut self, cx: &mut Context<'_>) -> AppResult<()> {
        let _ = cx;
        Ok(())
    }
}

/// Netstring framing over a [`Stream`]. A malformed prologue or a missing
/// separator fails the connection, an oversized entry only loses its head.
#[derive(Debug)]
pub struct NetstringDispatcher<H> {
    decoder: NetstringDecoder,
    handler: H,
}

impl<H: NetstringHandler> NetstringDispatcher<H> {
    pub fn new(handler: H, max_entry: usize) -> Self {
        NetstringDispatcher {
            decoder: NetstringDecoder::new(max_entry),
            handler,
        }
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }
}

impl<H: NetstringHandler> Protocol for NetstringDispatcher<H> {
    fn collect(&mut self, cx: &mut Context<'_>, input: &mut Buffer) -> AppResult<bool> {
        while !input.is_empty() {
            let (consumed, netstring) = self.decoder.feed(input.unread())?;
            input.skip(consumed);
            if let Some(netstring) = netstring {
                if netstring.is_truncated() {
                    debug!(
                        "netstring from {} truncated from {} to {} bytes",
                        cx.addr(),
                        netstring.declared,
                        netstring.payload.len()
                    );
                }
                if self.handler.handle_netstring(cx, netstring)? || cx.conn.is_closed() {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    fn handle_connect(&mut self, cx: &mut Context<'_>) -> AppResult<()> {
        self.handler.handle_connect(cx)
    }

    fn handle_close(&mut self, cx: &mut Context<'_>) -> AppResult<()> {
        self.handler.handle_close(cx)
    }
}

impl<H: NetstringHandler> Stream<NetstringDispatcher<H>> {
    /// Queues `payload` encoded as a netstring.
    pub fn push_netstring(&mut self, payload: &[u8]) {
        self.push(encode(payload));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::Loop;
    use crate::network::Connection;
    use bytes::Bytes;
    use mio::net::{TcpListener, TcpStream};

    #[derive(Default)]
    struct Entries(Vec<Netstring>);

    impl NetstringHandler for Entries {
        fn handle_netstring(&mut self, _cx: &mut Context<'_>, netstring: Netstring) -> AppResult<bool> {
            self.0.push(netstring);
            Ok(false)
        }
    }

    // a connection over a loopback socket nobody reads from
    fn connection() -> (Loop, Connection, TcpListener) {
        let listener = TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();
        let socket = TcpStream::connect(addr).unwrap();
        (Loop::new().unwrap(), Connection::new(socket, addr, true, 64), listener)
    }

    #[test]
    fn netstrings_split_across_receives_surface_once_complete() {
        let (mut lp, mut conn, _listener) = connection();
        let mut dispatcher = NetstringDispatcher::new(Entries::default(), 1024);
        let mut input = Buffer::new(64);

        for chunk in [&b"5:hel"[..], &b"lo,3:abc,"[..]] {
            input.fill(Bytes::copy_from_slice(chunk));
            let mut cx = Context::new(&mut lp, &mut conn);
            assert!(!dispatcher.collect(&mut cx, &mut input).unwrap());
            input.compact();
            if chunk == b"5:hel" {
                assert!(dispatcher.handler().0.is_empty());
            }
        }

        let payloads: Vec<Bytes> = dispatcher.handler().0.iter().map(|n| n.payload.clone()).collect();
        assert_eq!(payloads, vec![Bytes::from_static(b"hello"), Bytes::from_static(b"abc")]);
        assert!(input.is_empty());
    }

    #[test]
    fn missing_separator_fails_the_collect() {
        let (mut lp, mut conn, _listener) = connection();
        let mut dispatcher = NetstringDispatcher::new(Entries::default(), 1024);
        let mut input = Buffer::new(64);
        input.fill(Bytes::from_static(b"3:abcd"));
        let mut cx = Context::new(&mut lp, &mut conn);
        assert!(dispatcher.collect(&mut cx, &mut input).is_err());
        assert!(dispatcher.handler().0.is_empty());
    }
}

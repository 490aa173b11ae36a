//! Terminator Collector
//!
//! Frames input by one of three rules:
//!
//! - [`Terminator::None`]: every received byte is data, nothing terminates.
//! - [`Terminator::ByteCount`]: the next `n` bytes are data, then terminate.
//! - [`Terminator::Delimiter`]: data up to the delimiter, which is skipped.
//!
//! A delimiter may straddle two receives. The longest suffix of the unread
//! bytes that is a prefix of the delimiter stays buffered until more input
//! arrives, so no byte that could belong to a delimiter is ever delivered
//! as data.

use bytes::Bytes;

use super::stream::Protocol;
use super::{Buffer, Collector, Context, Stream};
use crate::{AppError, AppResult};

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Terminator {
    #[default]
    None,
    ByteCount(usize),
    Delimiter(Bytes),
}

impl Terminator {
    /// A delimiter terminator, empty delimiters are rejected.
    pub fn delimiter(delimiter: impl Into<Bytes>) -> AppResult<Terminator> {
        let delimiter = delimiter.into();
        if delimiter.is_empty() {
            return Err(AppError::InvalidValue("empty delimiter".into()));
        }
        Ok(Terminator::Delimiter(delimiter))
    }
}

/// A collector that carries its own terminator.
pub trait Channel: Collector {
    fn terminator(&mut self) -> &mut Terminator;
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|window| window == needle)
}

/// Length of the longest proper prefix of `needle` that ends `haystack`.
fn prefix_at_end(haystack: &[u8], needle: &[u8]) -> usize {
    let longest = needle.len().saturating_sub(1).min(haystack.len());
    (1..=longest)
        .rev()
        .find(|&l| haystack.ends_with(&needle[..l]))
        .unwrap_or(0)
}

/// Delivers the unread region of `input` to `channel`. Returns `true` when
/// the channel stalled, the undelivered bytes stay in `input`.
pub fn collect<C: Channel + ?Sized>(channel: &mut C, input: &mut Buffer) -> AppResult<bool> {
    // a byte count left at zero by its own callback would terminate forever
    let mut counted = false;
    while !input.is_empty() {
        let available = input.len();
        match channel.terminator().clone() {
            Terminator::None => {
                counted = false;
                channel.handle_data(input.consume(available))?;
            }
            Terminator::ByteCount(0) if counted => {
                return Err(AppError::IllegalStateError(
                    "byte count terminator left at 0 with input pending".into(),
                ));
            }
            Terminator::ByteCount(n) if available < n => {
                counted = false;
                *channel.terminator() = Terminator::ByteCount(n - available);
                channel.handle_data(input.consume(available))?;
            }
            Terminator::ByteCount(n) => {
                *channel.terminator() = Terminator::ByteCount(0);
                if n > 0 {
                    channel.handle_data(input.consume(n))?;
                }
                if channel.handle_terminator()? {
                    return Ok(true);
                }
                counted = true;
            }
            Terminator::Delimiter(delimiter) => {
                counted = false;
                match find(input.unread(), &delimiter) {
                    Some(found) => {
                        if found > 0 {
                            channel.handle_data(input.consume(found))?;
                        }
                        input.skip(delimiter.len());
                        if channel.handle_terminator()? {
                            return Ok(true);
                        }
                    }
                    None => {
                        let kept = prefix_at_end(input.unread(), &delimiter);
                        if available > kept {
                            channel.handle_data(input.consume(available - kept))?;
                        }
                        break;
                    }
                }
            }
        }
    }
    Ok(false)
}

/// Application side of a [`ChatDispatcher`].
pub trait ChatHandler {
    fn handle_connect(&mut self, cx: &mut Context<'_>) -> AppResult<()> {
        let _ = cx;
        Ok(())
    }

    fn handle_data(&mut self, cx: &mut Context<'_>, data: Bytes) -> AppResult<()>;

    /// The terminator was reached. `terminator` may be switched here, the
    /// new one applies to the rest of the buffered input. Returns `true` to
    /// stall input.
    fn handle_terminator(&mut self, cx: &mut Context<'_>, terminator: &mut Terminator) -> AppResult<bool>;

    fn handle_close(&mut self, cx: &mut Context<'_>) -> AppResult<()> {
        let _ = cx;
        Ok(())
    }
}

/// Terminator framing over a [`Stream`].
#[derive(Debug)]
pub struct ChatDispatcher<H> {
    terminator: Terminator,
    handler: H,
}

impl<H: ChatHandler> ChatDispatcher<H> {
    pub fn new(handler: H, terminator: Terminator) -> Self {
        ChatDispatcher { terminator, handler }
    }

    pub fn terminator(&self) -> &Terminator {
        &self.terminator
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }
}

struct Bound<'a, 'b, H> {
    cx: &'a mut Context<'b>,
    terminator: &'a mut Terminator,
    handler: &'a mut H,
}

impl<H: ChatHandler> Collector for Bound<'_, '_, H> {
    fn handle_data(&mut self, data: Bytes) -> AppResult<()> {
        self.handler.handle_data(&mut *self.cx, data)
    }

    fn handle_terminator(&mut self) -> AppResult<bool> {
        let stalled = self
            .handler
            .handle_terminator(&mut *self.cx, &mut *self.terminator)?;
        Ok(stalled || self.cx.conn.is_closed())
    }
}

impl<H: ChatHandler> Channel for Bound<'_, '_, H> {
    fn terminator(&mut self) -> &mut Terminator {
        &mut *self.terminator
    }
}

impl<H: ChatHandler> Protocol for ChatDispatcher<H> {
    fn collect(&mut self, cx: &mut Context<'_>, input: &mut Buffer) -> AppResult<bool> {
        let mut bound = Bound {
            cx,
            terminator: &mut self.terminator,
            handler: &mut self.handler,
        };
        collect(&mut bound, input)
    }

    fn handle_connect(&mut self, cx: &mut Context<'_>) -> AppResult<()> {
        self.handler.handle_connect(cx)
    }

    fn handle_close(&mut self, cx: &mut Context<'_>) -> AppResult<()> {
        self.handler.handle_close(cx)
    }
}

impl<H: ChatHandler> Stream<ChatDispatcher<H>> {
    /// Switches the terminator, only before the first receive: afterwards
    /// switch it from `handle_terminator`.
    pub fn set_terminator(&mut self, terminator: Terminator) -> AppResult<()> {
        if self.connection().bytes_in() > 0 {
            return Err(AppError::InvalidOperation(
                "terminator switched after input was received".into(),
            ));
        }
        self.protocol_mut().terminator = terminator;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use rstest::rstest;

    #[derive(Debug, PartialEq, Eq, Clone)]
    enum Event {
        Data(Vec<u8>),
        Terminator,
    }

    /// Records events, switching terminators from a script on each terminator.
    struct Script {
        terminator: Terminator,
        next: Vec<Terminator>,
        events: Vec<Event>,
        stall: bool,
    }

    impl Script {
        fn new(terminator: Terminator) -> Self {
            Script {
                terminator,
                next: Vec::new(),
                events: Vec::new(),
                stall: false,
            }
        }

        // adjacent data events merged, receive boundaries must not show
        fn merged(&self) -> Vec<Event> {
            let mut merged: Vec<Event> = Vec::new();
            for event in &self.events {
                match (merged.last_mut(), event) {
                    (Some(Event::Data(previous)), Event::Data(data)) => {
                        previous.extend_from_slice(data)
                    }
                    _ => merged.push(event.clone()),
                }
            }
            merged
        }
    }

    impl Collector for Script {
        fn handle_data(&mut self, data: Bytes) -> AppResult<()> {
            assert!(!data.is_empty());
            self.events.push(Event::Data(data.to_vec()));
            Ok(())
        }

        fn handle_terminator(&mut self) -> AppResult<bool> {
            self.events.push(Event::Terminator);
            if !self.next.is_empty() {
                self.terminator = self.next.remove(0);
            }
            Ok(self.stall)
        }
    }

    impl Channel for Script {
        fn terminator(&mut self) -> &mut Terminator {
            &mut self.terminator
        }
    }

    fn receive(script: &mut Script, input: &mut Buffer, chunk: &[u8]) {
        let rest = input.fill(Bytes::copy_from_slice(chunk));
        assert!(rest.is_none(), "test buffer too small");
        collect(script, input).unwrap();
        input.compact();
    }

    fn crlf2() -> Terminator {
        Terminator::delimiter(&b"\r\n\r\n"[..]).unwrap()
    }

    #[test]
    fn delimiter_split_across_receives() {
        let mut script = Script::new(crlf2());
        let mut input = Buffer::new(64);

        receive(&mut script, &mut input, b"GET / HTTP/1.0\r\n");
        assert_eq!(script.events, vec![Event::Data(b"GET / HTTP/1.0".to_vec())]);
        assert_eq!(input.unread(), b"\r\n");

        receive(&mut script, &mut input, b"\r\n");
        assert_eq!(
            script.merged(),
            vec![Event::Data(b"GET / HTTP/1.0".to_vec()), Event::Terminator]
        );
        assert!(input.is_empty());
    }

    #[test]
    fn data_before_a_straddling_delimiter_includes_partial_matches() {
        let mut script = Script::new(crlf2());
        let mut input = Buffer::new(64);
        receive(&mut script, &mut input, b"GET / HTTP/1.0\r\n");
        receive(&mut script, &mut input, b"Host: x\r\n\r\n");
        assert_eq!(
            script.merged(),
            vec![
                Event::Data(b"GET / HTTP/1.0\r\nHost: x".to_vec()),
                Event::Terminator
            ]
        );
    }

    #[rstest]
    #[case(0)]
    #[case(1)]
    #[case(5)]
    #[case(17)]
    fn byte_count_delivers_exactly_n_bytes(#[case] n: usize) {
        let mut script = Script::new(Terminator::ByteCount(n));
        script.next = vec![Terminator::None];
        let mut input = Buffer::new(64);
        let payload: Vec<u8> = (0..n as u8).collect();
        let mut wire = payload.clone();
        wire.extend_from_slice(b"tail");

        for chunk in wire.chunks(3) {
            receive(&mut script, &mut input, chunk);
        }

        let mut expected = Vec::new();
        if n > 0 {
            expected.push(Event::Data(payload));
        }
        expected.push(Event::Terminator);
        expected.push(Event::Data(b"tail".to_vec()));
        assert_eq!(script.merged(), expected);
    }

    #[test]
    fn switching_terminator_drains_buffered_frames_in_one_pass() {
        let mut script = Script::new(Terminator::delimiter(&b"\n"[..]).unwrap());
        script.next = vec![
            Terminator::ByteCount(3),
            Terminator::delimiter(&b"\n"[..]).unwrap(),
        ];
        let mut input = Buffer::new(64);
        receive(&mut script, &mut input, b"3\nabcline\n");
        assert_eq!(
            script.events,
            vec![
                Event::Data(b"3".to_vec()),
                Event::Terminator,
                Event::Data(b"abc".to_vec()),
                Event::Terminator,
                Event::Data(b"line".to_vec()),
                Event::Terminator,
            ]
        );
    }

    #[test]
    fn stalled_collector_leaves_input_buffered() {
        let mut script = Script::new(Terminator::delimiter(&b";"[..]).unwrap());
        script.stall = true;
        let mut input = Buffer::new(64);
        input.fill(Bytes::from_static(b"a;b;c"));
        assert!(collect(&mut script, &mut input).unwrap());
        assert_eq!(input.unread(), b"b;c");

        script.stall = false;
        assert!(!collect(&mut script, &mut input).unwrap());
        assert_eq!(
            script.merged(),
            vec![
                Event::Data(b"a".to_vec()),
                Event::Terminator,
                Event::Data(b"b".to_vec()),
                Event::Terminator,
                Event::Data(b"c".to_vec()),
            ]
        );
    }

    #[test]
    fn exhausted_byte_count_is_an_error() {
        let mut script = Script::new(Terminator::ByteCount(1));
        let mut input = Buffer::new(8);
        input.fill(Bytes::from_static(b"ab"));
        assert!(matches!(
            collect(&mut script, &mut input),
            Err(AppError::IllegalStateError(_))
        ));
    }

    #[test]
    fn empty_delimiter_is_rejected() {
        assert!(matches!(
            Terminator::delimiter(Bytes::new()),
            Err(AppError::InvalidValue(_))
        ));
    }

    #[rstest]
    #[case(1)]
    #[case(7)]
    #[case(42)]
    fn delimiter_framing_ignores_receive_boundaries(#[case] seed: u64) {
        let wire: &[u8] = b"alpha\r\n\r\nbeta\r\n\r\n\r\r\n\r\ngamma\r\n\r\r\n\r\n\r\ntrailing\r";

        let mut whole = Script::new(crlf2());
        let mut input = Buffer::new(128);
        receive(&mut whole, &mut input, wire);

        let mut rng = StdRng::seed_from_u64(seed);
        let mut split = Script::new(crlf2());
        let mut input = Buffer::new(128);
        let mut rest = wire;
        while !rest.is_empty() {
            let n = rng.gen_range(1..=rest.len().min(6));
            receive(&mut split, &mut input, &rest[..n]);
            rest = &rest[n..];
        }

        assert_eq!(split.merged(), whole.merged());
        assert_eq!(input.unread(), b"\r");
    }

    #[test]
    fn prefix_at_end_finds_the_longest_partial_delimiter() {
        assert_eq!(prefix_at_end(b"abc\r\n\r", b"\r\n\r\n"), 3);
        assert_eq!(prefix_at_end(b"abc\r", b"\r\n\r\n"), 1);
        assert_eq!(prefix_at_end(b"abc", b"\r\n\r\n"), 0);
        assert_eq!(prefix_at_end(b"\r", b"\r\n\r\n"), 1);
    }
}

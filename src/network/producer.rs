//! Producer and Collector contracts and the output queue.
//!
//! A [`Producer`] yields output lazily and may stall, a [`Collector`]
//! receives input chunks then one terminal event. The [`OutputQueue`] drains
//! raw chunks and producers into a connection's output buffer in FIFO order.

use std::collections::VecDeque;
use std::fmt;

use bytes::Bytes;

use super::Buffer;
use crate::AppResult;

/// Lazy source of output bytes.
pub trait Producer {
    /// True while the producer cannot yield, `more` is not called then.
    fn stalled(&self) -> bool;

    /// Next chunk, `None` once exhausted. Never called again after `None`.
    fn more(&mut self) -> AppResult<Option<Bytes>>;
}

/// Sink of framed input.
pub trait Collector {
    fn handle_data(&mut self, data: Bytes) -> AppResult<()>;

    /// Called once the terminator is reached. Returning `true` stalls input
    /// until the stream is pulled.
    fn handle_terminator(&mut self) -> AppResult<bool>;
}

pub enum OutputItem {
    Chunk(Bytes),
    Producer(Box<dyn Producer>),
    Close,
}

impl fmt::Debug for OutputItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputItem::Chunk(chunk) => write!(f, "Chunk({} bytes)", chunk.len()),
            OutputItem::Producer(producer) => {
                write!(f, "Producer(stalled: {})", producer.stalled())
            }
            OutputItem::Close => write!(f, "Close"),
        }
    }
}

#[derive(Debug, Default)]
pub struct OutputQueue {
    items: VecDeque<OutputItem>,
}

impl OutputQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Empty chunks are dropped.
    pub fn push_chunk(&mut self, chunk: Bytes) {
        if !chunk.is_empty() {
            self.items.push_back(OutputItem::Chunk(chunk));
        }
    }

    pub fn push_producer(&mut self, producer: Box<dyn Producer>) {
        self.items.push_back(OutputItem::Producer(producer));
    }

    pub fn push_close(&mut self) {
        self.items.push_back(OutputItem::Close);
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    /// True if the head of the queue is a stalled producer.
    pub fn head_stalled(&self) -> bool {
        matches!(self.items.front(), Some(OutputItem::Producer(p)) if p.stalled())
    }

    /// Moves queued output into `buffer` until it is full, the queue is
    /// empty or its head is a stalled producer. Returns `false` when a close
    /// item is reached with nothing left in `buffer`: the connection is done.
    pub fn produce(&mut self, buffer: &mut Buffer) -> AppResult<bool> {
        while let Some(item) = self.items.pop_front() {
            match item {
                OutputItem::Close => {
                    if buffer.is_empty() {
                        return Ok(false);
                    }
                    self.items.push_front(OutputItem::Close);
                    break;
                }
                OutputItem::Producer(mut producer) => {
                    if producer.stalled() {
                        self.items.push_front(OutputItem::Producer(producer));
                        break;
                    }
                    if let Some(data) = producer.more()? {
                        self.items.push_front(OutputItem::Producer(producer));
                        if self.spill(buffer, data) {
                            break;
                        }
                    }
                }
                OutputItem::Chunk(chunk) => {
                    if self.spill(buffer, chunk) {
                        break;
                    }
                }
            }
        }
        Ok(true)
    }

    // what does not fit goes back to the front of the queue
    fn spill(&mut self, buffer: &mut Buffer, chunk: Bytes) -> bool {
        match buffer.fill(chunk) {
            Some(rest) => {
                self.items.push_front(OutputItem::Chunk(rest));
                true
            }
            None => false,
        }
    }
}

/// Yields a fixed sequence of chunks.
#[derive(Debug, Default)]
pub struct BytesProducer {
    chunks: VecDeque<Bytes>,
}

impl BytesProducer {
    pub fn new<I: IntoIterator<Item = Bytes>>(chunks: I) -> Self {
        BytesProducer {
            chunks: chunks.into_iter().collect(),
        }
    }
}

impl Producer for BytesProducer {
    fn stalled(&self) -> bool {
        false
    }

    fn more(&mut self) -> AppResult<Option<Bytes>> {
        Ok(self.chunks.pop_front())
    }
}

/// Yields strings encoded as UTF-8, one chunk per string.
#[derive(Debug, Default)]
pub struct StringsProducer {
    strings: VecDeque<String>,
}

impl StringsProducer {
    pub fn new<I, S>(strings: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        StringsProducer {
            strings: strings.into_iter().map(Into::into).collect(),
        }
    }
}

impl Producer for StringsProducer {
    fn stalled(&self) -> bool {
        false
    }

    fn more(&mut self) -> AppResult<Option<Bytes>> {
        Ok(self.strings.pop_front().map(Bytes::from))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    struct Gated {
        open: Rc<Cell<bool>>,
        chunks: VecDeque<Bytes>,
    }

    impl Producer for Gated {
        fn stalled(&self) -> bool {
            !self.open.get()
        }
        fn more(&mut self) -> AppResult<Option<Bytes>> {
            assert!(self.open.get(), "more called while stalled");
            Ok(self.chunks.pop_front())
        }
    }

    fn drain(queue: &mut OutputQueue, buffer: &mut Buffer, out: &mut Vec<u8>) -> bool {
        let open = queue.produce(buffer).unwrap();
        out.extend_from_slice(buffer.unread());
        let n = buffer.len();
        buffer.skip(n);
        open
    }

    #[test]
    fn stalled_producer_holds_back_later_chunks() {
        let open = Rc::new(Cell::new(false));
        let mut queue = OutputQueue::new();
        queue.push_chunk(Bytes::from_static(b"A"));
        queue.push_producer(Box::new(Gated {
            open: open.clone(),
            chunks: VecDeque::from(vec![Bytes::from_static(b"B1"), Bytes::from_static(b"B2")]),
        }));
        queue.push_chunk(Bytes::from_static(b"C"));

        let mut buffer = Buffer::new(16);
        let mut out = Vec::new();
        assert!(drain(&mut queue, &mut buffer, &mut out));
        assert_eq!(out, b"A");
        assert!(queue.head_stalled());

        assert!(drain(&mut queue, &mut buffer, &mut out));
        assert_eq!(out, b"A");

        open.set(true);
        assert!(drain(&mut queue, &mut buffer, &mut out));
        assert_eq!(out, b"AB1B2C");
        assert!(queue.is_empty());
    }

    #[test]
    fn partial_fill_spills_back_to_the_front() {
        let mut queue = OutputQueue::new();
        queue.push_chunk(Bytes::from_static(b"0123456789"));
        queue.push_producer(Box::new(StringsProducer::new(["abc", "def"])));
        let mut buffer = Buffer::new(4);
        let mut out = Vec::new();
        while !queue.is_empty() {
            assert!(drain(&mut queue, &mut buffer, &mut out));
        }
        assert_eq!(out, b"0123456789abcdef");
    }

    #[test]
    fn close_waits_for_the_buffer_to_drain() {
        let mut queue = OutputQueue::new();
        queue.push_chunk(Bytes::from_static(b"bye"));
        queue.push_close();
        let mut buffer = Buffer::new(16);

        assert!(queue.produce(&mut buffer).unwrap());
        assert_eq!(buffer.unread(), b"bye");
        assert!(queue.produce(&mut buffer).unwrap());
        buffer.skip(3);
        assert!(!queue.produce(&mut buffer).unwrap());
    }

    #[test]
    fn empty_chunks_are_not_queued() {
        let mut queue = OutputQueue::new();
        queue.push_chunk(Bytes::new());
        assert!(queue.is_empty());
        queue.push_producer(Box::new(BytesProducer::new(vec![])));
        let mut buffer = Buffer::new(4);
        assert!(queue.produce(&mut buffer).unwrap());
        assert!(queue.is_empty());
    }
}

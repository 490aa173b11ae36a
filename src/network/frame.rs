//! Netstring codec: `<decimal length>:<payload>,`.

use bytes::{BufMut, Bytes, BytesMut};

use crate::{AppError, AppResult};

/// Longest accepted length prologue, enough for any `usize`.
const MAX_DIGITS: usize = 20;

/// A complete netstring as received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Netstring {
    /// The payload, or its tail when the declared length was too large.
    pub payload: Bytes,
    /// Length declared on the wire.
    pub declared: usize,
}

impl Netstring {
    pub fn is_truncated(&self) -> bool {
        self.payload.len() < self.declared
    }
}

pub fn encode(payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(payload.len() + MAX_DIGITS + 2);
    encode_into(payload, &mut buf);
    buf.freeze()
}

pub fn encode_into(payload: &[u8], buf: &mut BytesMut) {
    buf.put_slice(payload.len().to_string().as_bytes());
    buf.put_u8(b':');
    buf.put_slice(payload);
    buf.put_u8(b',');
}

/// All netstrings of a complete buffer, without size limit.
pub fn decode(mut data: &[u8]) -> AppResult<Vec<Bytes>> {
    let mut decoder = NetstringDecoder::new(usize::MAX);
    let mut decoded = Vec::new();
    while !data.is_empty() {
        let (consumed, netstring) = decoder.feed(data)?;
        if let Some(netstring) = netstring {
            decoded.push(netstring.payload);
        }
        data = &data[consumed..];
    }
    if !decoder.is_idle() {
        return Err(AppError::Incomplete);
    }
    Ok(decoded)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Length,
    Payload,
    Separator,
}

/// Incremental netstring decoder, fed with whatever bytes have arrived.
///
/// Payloads declaring more than `max_entry` bytes are still consumed in
/// full, only their last `max_entry` bytes are kept.
#[derive(Debug)]
pub struct NetstringDecoder {
    max_entry: usize,
    state: State,
    digits: usize,
    declared: usize,
    remaining: usize,
    payload: BytesMut,
}

impl NetstringDecoder {
    pub fn new(max_entry: usize) -> Self {
        NetstringDecoder {
            max_entry,
            state: State::Length,
            digits: 0,
            declared: 0,
            remaining: 0,
            payload: BytesMut::new(),
        }
    }

    /// True between two netstrings.
    pub fn is_idle(&self) -> bool {
        self.state == State::Length && self.digits == 0
    }

    /// Consumes a prefix of `data` and returns its length, with the
    /// netstring it completed if any. Stops right after a complete one.
    pub fn feed(&mut self, data: &[u8]) -> AppResult<(usize, Option<Netstring>)> {
        let mut consumed = 0;
        while consumed < data.len() {
            let rest = &data[consumed..];
            match self.state {
                State::Length => {
                    let byte = rest[0];
                    consumed += 1;
                    match byte {
                        b'0'..=b'9' => {
                            self.digits += 1;
                            self.declared = self
                                .declared
                                .checked_mul(10)
                                .and_then(|n| n.checked_add((byte - b'0') as usize))
                                .filter(|_| self.digits <= MAX_DIGITS)
                                .ok_or_else(|| {
                                    AppError::MalformedProtocol("netstring length overflow".into())
                                })?;
                        }
                        b':' if self.digits > 0 => {
                            self.remaining = self.declared;
                            // grown as bytes arrive, the declared length is untrusted
                            self.payload = BytesMut::new();
                            self.state = State::Payload;
                        }
                        b':' => {
                            return Err(AppError::MalformedProtocol("empty netstring length".into()));
                        }
                        other => {
                            return Err(AppError::MalformedProtocol(format!(
                                "invalid netstring length byte 0x{:02x}",
                                other
                            )));
                        }
                    }
                }
                State::Payload => {
                    let n = self.remaining.min(rest.len());
                    let offset = self.declared - self.remaining;
                    // bytes before the tail window are dropped
                    let window = self.declared.saturating_sub(self.max_entry);
                    let skip = window.saturating_sub(offset).min(n);
                    self.payload.reserve(n - skip);
                    self.payload.extend_from_slice(&rest[skip..n]);
                    self.remaining -= n;
                    consumed += n;
                    if self.remaining == 0 {
                        self.state = State::Separator;
                    }
                }
                State::Separator => {
                    if rest[0] != b',' {
                        return Err(AppError::MalformedProtocol(format!(
                            "netstring of {} bytes not followed by ','",
                            self.declared
                        )));
                    }
                    consumed += 1;
                    let netstring = Netstring {
                        payload: std::mem::take(&mut self.payload).freeze(),
                        declared: self.declared,
                    };
                    self.state = State::Length;
                    self.digits = 0;
                    self.declared = 0;
                    return Ok((consumed, Some(netstring)));
                }
            }
        }
        Ok((consumed, None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0)]
    #[case(1)]
    #[case(9)]
    #[case(10)]
    #[case(4096)]
    fn encode_then_decode_yields_the_payload(#[case] len: usize) {
        let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        let wire = encode(&payload);
        assert!(wire.starts_with(format!("{}:", len).as_bytes()));
        assert_eq!(decode(&wire).unwrap(), vec![Bytes::from(payload)]);
    }

    #[test]
    fn partial_netstrings_are_never_delivered() {
        let mut decoder = NetstringDecoder::new(1024);
        let (consumed, netstring) = decoder.feed(b"5:hel").unwrap();
        assert_eq!(consumed, 5);
        assert!(netstring.is_none());

        let wire = b"lo,3:abc,";
        let (consumed, netstring) = decoder.feed(wire).unwrap();
        assert_eq!(consumed, 3);
        assert_eq!(netstring.unwrap().payload, Bytes::from_static(b"hello"));

        let (consumed, netstring) = decoder.feed(&wire[3..]).unwrap();
        assert_eq!(consumed, 6);
        assert_eq!(netstring.unwrap().payload, Bytes::from_static(b"abc"));
        assert!(decoder.is_idle());
    }

    #[test]
    fn oversized_entries_keep_their_tail() {
        let mut decoder = NetstringDecoder::new(4);
        let mut received = None;
        for chunk in b"10:0123456789,".chunks(3) {
            let (consumed, netstring) = decoder.feed(chunk).unwrap();
            assert_eq!(consumed, chunk.len());
            if netstring.is_some() {
                received = netstring;
            }
        }
        let netstring = received.unwrap();
        assert_eq!(netstring.payload, Bytes::from_static(b"6789"));
        assert_eq!(netstring.declared, 10);
        assert!(netstring.is_truncated());
    }

    #[rstest]
    #[case(&b"x:abc,"[..])]
    #[case(&b":abc,"[..])]
    #[case(&b"3:abc;"[..])]
    #[case(&b"99999999999999999999999:"[..])]
    fn malformed_netstrings_are_rejected(#[case] wire: &[u8]) {
        assert!(matches!(
            decode(wire),
            Err(AppError::MalformedProtocol(_))
        ));
    }

    #[test]
    fn decode_reports_a_trailing_partial_netstring() {
        assert!(matches!(decode(b"3:abc,2:x"), Err(AppError::Incomplete)));
        assert_eq!(
            decode(b"0:,1:a,").unwrap(),
            vec![Bytes::new(), Bytes::from_static(b"a")]
        );
    }

    #[rstest]
    #[case(&b"9999999999999999999:"[..])]
    #[case(&b"1000000000000000:abc"[..])]
    fn huge_declared_lengths_are_not_preallocated(#[case] wire: &[u8]) {
        assert!(matches!(decode(wire), Err(AppError::Incomplete)));

        let mut decoder = NetstringDecoder::new(64);
        let (consumed, netstring) = decoder.feed(wire).unwrap();
        assert_eq!(consumed, wire.len());
        assert!(netstring.is_none());
        assert!(!decoder.is_idle());
    }
}

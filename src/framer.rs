//! A `Framer` turns the byte stream from one client connection into
//! discrete messages.  Every message on the wire is an 8-byte
//! big-endian length prefix followed by that many payload bytes.
//!
//! The framer never asks its caller to guess how much data to read:
//! [`Framer::buffer_mut`] always exposes a sink of exactly
//! [`Framer::missing`] bytes, first for the remainder of the header,
//! then for the remainder of the payload.  Reading into that sink
//! can never consume bytes that belong to the next message.
use thiserror::Error;

/// Length of the big-endian message length prefix.
pub const HEADER_LEN: usize = 8;

/// Payloads declared larger than this are rejected unless the framer
/// is built with [`Framer::with_limit`].
pub const DEFAULT_MAX_MESSAGE_LEN: u64 = 64 << 20;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    /// The length prefix declares a payload over the framer's bound.
    /// The stream can't be resynchronised after that, so the
    /// connection must be dropped.
    #[error("declared message length {declared} exceeds the limit of {limit} bytes")]
    TooLarge { declared: u64, limit: u64 },
}

/// What the framer knows after absorbing new bytes.
#[derive(Debug, PartialEq, Eq)]
pub enum Feed {
    /// The current message needs exactly this many more bytes (or,
    /// while the header is incomplete, at least that many).
    Incomplete(usize),
    /// The message is complete; here's its payload.  The framer has
    /// already re-armed itself for the next message.
    Complete(Box<[u8]>),
}

#[derive(Debug)]
enum State {
    Header { buf: [u8; HEADER_LEN], filled: usize },
    Payload { buf: Vec<u8>, filled: usize },
}

impl State {
    fn empty() -> State {
        State::Header {
            buf: [0; HEADER_LEN],
            filled: 0,
        }
    }
}

#[derive(Debug)]
pub struct Framer {
    state: State,
    limit: u64,
}

impl Default for Framer {
    fn default() -> Self {
        Framer::new()
    }
}

impl Framer {
    /// Returns a framer that accepts payloads of up to
    /// [`DEFAULT_MAX_MESSAGE_LEN`] bytes.
    pub fn new() -> Framer {
        Framer::with_limit(DEFAULT_MAX_MESSAGE_LEN)
    }

    /// Returns a framer that rejects payloads over `limit` bytes.
    pub fn with_limit(limit: u64) -> Framer {
        Framer {
            state: State::empty(),
            limit,
        }
    }

    /// Returns the number of bytes the framer wants next.  Always
    /// positive.
    pub fn missing(&self) -> usize {
        match &self.state {
            State::Header { filled, .. } => HEADER_LEN - filled,
            State::Payload { buf, filled } => buf.len() - filled,
        }
    }

    /// Returns whether the framer is between messages.
    pub fn is_empty(&self) -> bool {
        matches!(self.state, State::Header { filled: 0, .. })
    }

    /// Returns a sink for incoming bytes, exactly `missing()` long.
    /// Write into it, then report how many bytes landed with `feed`.
    pub fn buffer_mut(&mut self) -> &mut [u8] {
        match &mut self.state {
            State::Header { buf, filled } => &mut buf[*filled..],
            State::Payload { buf, filled } => &mut buf[*filled..],
        }
    }

    /// Accounts for `count` new bytes written to the start of
    /// `buffer_mut()`.
    ///
    /// # Panics
    ///
    /// Panics if `count > self.missing()`.
    pub fn feed(&mut self, count: usize) -> Result<Feed, FrameError> {
        assert!(
            count <= self.missing(),
            "fed {} bytes, but only {} were requested",
            count,
            self.missing()
        );

        match &mut self.state {
            State::Header { buf, filled } => {
                *filled += count;
                if *filled < HEADER_LEN {
                    return Ok(Feed::Incomplete(HEADER_LEN - *filled));
                }

                let declared = u64::from_be_bytes(*buf);
                if declared > self.limit {
                    return Err(FrameError::TooLarge {
                        declared,
                        limit: self.limit,
                    });
                }

                if declared == 0 {
                    self.state = State::empty();
                    return Ok(Feed::Complete(Box::default()));
                }

                // `declared <= limit`, and the limit is meant to fit
                // in memory.
                let len = declared as usize;
                self.state = State::Payload {
                    buf: vec![0; len],
                    filled: 0,
                };
                Ok(Feed::Incomplete(len))
            }
            State::Payload { buf, filled } => {
                *filled += count;
                if *filled < buf.len() {
                    return Ok(Feed::Incomplete(buf.len() - *filled));
                }

                // Detach the payload and re-arm in the same step, so
                // no byte can land between two messages.
                match std::mem::replace(&mut self.state, State::empty()) {
                    State::Payload { buf, .. } => Ok(Feed::Complete(buf.into_boxed_slice())),
                    State::Header { .. } => unreachable!("state was just matched as a payload"),
                }
            }
        }
    }

    /// Copies as much of `src` as the framer currently wants, and
    /// feeds it.  Returns the number of bytes consumed along with the
    /// feed result; callers should loop on the remainder.
    pub fn fill(&mut self, src: &[u8]) -> Result<(usize, Feed), FrameError> {
        let count = src.len().min(self.missing());

        self.buffer_mut()[..count].copy_from_slice(&src[..count]);
        Ok((count, self.feed(count)?))
    }
}

/// Prepends the length prefix to `payload`.
pub fn encode(payload: &[u8]) -> Vec<u8> {
    let mut ret = Vec::with_capacity(HEADER_LEN + payload.len());

    ret.extend_from_slice(&(payload.len() as u64).to_be_bytes());
    ret.extend_from_slice(payload);
    ret
}

#[cfg(test)]
mod test {
    use crate::framer::*;
    use proptest::collection::vec;
    use proptest::prelude::*;

    /// Feeds all of `bytes` in chunks of `chunk` bytes, and returns
    /// every completed payload.
    fn feed_chunked(framer: &mut Framer, mut bytes: &[u8], chunk: usize) -> Vec<Box<[u8]>> {
        let mut ret = Vec::new();

        while !bytes.is_empty() {
            let (consumed, feed) = framer
                .fill(&bytes[..chunk.min(bytes.len())])
                .expect("fill must succeed");
            bytes = &bytes[consumed..];
            if let Feed::Complete(payload) = feed {
                ret.push(payload);
            }
        }

        ret
    }

    /// The framer first asks for the header, then for exactly the
    /// payload.
    #[test]
    fn smoke_test() {
        let mut framer = Framer::new();

        assert_eq!(framer.missing(), 8);
        assert!(framer.is_empty());

        let wire = encode(b"hello");
        let (consumed, feed) = framer.fill(&wire[..3]).expect("must succeed");
        assert_eq!(consumed, 3);
        assert_eq!(feed, Feed::Incomplete(5));
        assert!(!framer.is_empty());

        let (consumed, feed) = framer.fill(&wire[3..]).expect("must succeed");
        // Only the rest of the header: the framer doesn't know the
        // payload size yet.
        assert_eq!(consumed, 5);
        assert_eq!(feed, Feed::Incomplete(5));
        assert_eq!(framer.missing(), 5);

        let (consumed, feed) = framer.fill(&wire[8..]).expect("must succeed");
        assert_eq!(consumed, 5);
        assert_eq!(feed, Feed::Complete(b"hello".to_vec().into_boxed_slice()));
        assert!(framer.is_empty());
        assert_eq!(framer.missing(), 8);
    }

    /// A zero-length payload is a legal, empty, message.
    #[test]
    fn test_empty_message() {
        let mut framer = Framer::new();
        let wire = encode(b"");

        assert_eq!(wire.len(), 8);
        let (consumed, feed) = framer.fill(&wire).expect("must succeed");
        assert_eq!(consumed, 8);
        assert_eq!(feed, Feed::Complete(Box::default()));
        assert!(framer.is_empty());
    }

    /// Two back-to-back messages come out separately, and in order.
    #[test]
    fn test_back_to_back() {
        let mut framer = Framer::new();
        let mut wire = encode(b"first");
        wire.extend(encode(b""));
        wire.extend(encode(b"third message"));

        let payloads = feed_chunked(&mut framer, &wire, wire.len());
        assert_eq!(
            payloads,
            vec![
                b"first".to_vec().into_boxed_slice(),
                Box::default(),
                b"third message".to_vec().into_boxed_slice()
            ]
        );
    }

    /// Oversized length prefixes are rejected as soon as the header
    /// is complete, before allocating anything.
    #[test]
    fn test_too_large() {
        let mut framer = Framer::with_limit(16);

        let header = 17u64.to_be_bytes();
        assert_eq!(
            framer.fill(&header),
            Err(FrameError::TooLarge {
                declared: 17,
                limit: 16
            })
        );

        let mut framer = Framer::new();
        let header = u64::MAX.to_be_bytes();
        assert!(matches!(
            framer.fill(&header),
            Err(FrameError::TooLarge { .. })
        ));
    }

    /// A payload exactly at the limit is fine.
    #[test]
    fn test_at_limit() {
        let mut framer = Framer::with_limit(4);
        let wire = encode(b"abcd");

        let payloads = feed_chunked(&mut framer, &wire, 1);
        assert_eq!(payloads, vec![b"abcd".to_vec().into_boxed_slice()]);
    }

    #[test]
    #[should_panic]
    fn test_overfeed() {
        let mut framer = Framer::new();
        let _ = framer.feed(9);
    }

    proptest! {
        /// However we split the encoded bytes, we get exactly one
        /// completion, and it matches the payload.
        #[test]
        fn test_chunked_round_trip(payload in vec(any::<u8>(), 0..300usize),
                                   chunk in 1..40usize) {
            let mut framer = Framer::new();
            let wire = encode(&payload);

            let payloads = feed_chunked(&mut framer, &wire, chunk);
            assert_eq!(payloads.len(), 1);
            assert_eq!(&payloads[0][..], &payload[..]);
            assert!(framer.is_empty());
        }

        /// Once the header is in, `missing` is exact: feeding that
        /// many bytes always completes the message.
        #[test]
        fn test_missing_is_exact(payload in vec(any::<u8>(), 1..100usize)) {
            let mut framer = Framer::new();
            let wire = encode(&payload);

            let (_, feed) = framer.fill(&wire[..8]).expect("header must be accepted");
            assert_eq!(feed, Feed::Incomplete(payload.len()));
            assert_eq!(framer.missing(), payload.len());

            let (consumed, feed) = framer.fill(&wire[8..]).expect("payload must be accepted");
            assert_eq!(consumed, payload.len());
            assert!(matches!(feed, Feed::Complete(_)));
        }
    }
}

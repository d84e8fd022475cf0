//! Incremental decoder for `Transfer-Encoding: chunked`.
//!
//! The decoder owns only its state; callers hand it whatever bytes are
//! buffered and get back the payload ranges plus how much input was
//! consumed. A partial size line or CRLF is left in the caller's buffer
//! for the next read.

use std::ops::Range;

use thiserror::Error;

/// Size lines or trailer lines longer than this are rejected.
const MAX_LINE: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ChunkError {
    #[error("invalid chunk size line")]
    InvalidSize,
    #[error("chunk size line too long")]
    SizeLineTooLong,
    #[error("missing CRLF after chunk data")]
    MissingCrlf,
    #[error("trailer line too long")]
    TrailerTooLong,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkState {
    AwaitingSize,
    /// Payload bytes left in the current chunk.
    InBody(u64),
    /// CRLF closing a chunk's payload.
    AwaitingTrailer,
    /// Trailer lines after the zero-size chunk, up to the empty line.
    InTrailers,
    Done,
}

/// Outcome of one decode pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decoded {
    /// Input bytes fully processed.
    pub consumed: usize,
    /// The terminal chunk and its trailers have been seen.
    pub done: bool,
}

#[derive(Debug, Clone)]
pub struct ChunkedDecoder {
    state: ChunkState,
}

impl Default for ChunkedDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkedDecoder {
    pub fn new() -> Self {
        Self {
            state: ChunkState::AwaitingSize,
        }
    }

    pub fn state(&self) -> ChunkState {
        self.state
    }

    pub fn is_done(&self) -> bool {
        self.state == ChunkState::Done
    }

    /// Payload bytes still expected in the current chunk.
    pub fn remaining(&self) -> u64 {
        match self.state {
            ChunkState::InBody(n) => n,
            _ => 0,
        }
    }

    /// Account for payload bytes that bypassed `decode` (direct reads).
    pub fn consume_direct(&mut self, n: u64) {
        if let ChunkState::InBody(rem) = self.state {
            let rem = rem.saturating_sub(n);
            self.state = if rem == 0 {
                ChunkState::AwaitingTrailer
            } else {
                ChunkState::InBody(rem)
            };
        }
    }

    /// Decode as much of `buf` as possible, pushing payload ranges into `out`.
    pub fn decode(
        &mut self,
        buf: &[u8],
        out: &mut Vec<Range<usize>>,
    ) -> Result<Decoded, ChunkError> {
        let mut pos = 0;
        loop {
            let rest = &buf[pos..];
            match self.state {
                ChunkState::AwaitingSize => match httparse::parse_chunk_size(rest) {
                    Ok(httparse::Status::Complete((n, size))) => {
                        pos += n;
                        self.state = if size == 0 {
                            ChunkState::InTrailers
                        } else {
                            ChunkState::InBody(size)
                        };
                    }
                    Ok(httparse::Status::Partial) => {
                        if rest.len() > MAX_LINE {
                            return Err(ChunkError::SizeLineTooLong);
                        }
                        break;
                    }
                    Err(_) => return Err(ChunkError::InvalidSize),
                },
                ChunkState::InBody(remaining) => {
                    if rest.is_empty() {
                        break;
                    }
                    let take = remaining.min(rest.len() as u64) as usize;
                    out.push(pos..pos + take);
                    pos += take;
                    self.consume_direct(take as u64);
                }
                ChunkState::AwaitingTrailer => {
                    match rest {
                        [b'\r', b'\n', ..] => {
                            pos += 2;
                            self.state = ChunkState::AwaitingSize;
                        }
                        [] | [b'\r'] => break,
                        _ => return Err(ChunkError::MissingCrlf),
                    }
                }
                ChunkState::InTrailers => {
                    let Some(end) = rest.windows(2).position(|w| w == b"\r\n") else {
                        if rest.len() > MAX_LINE {
                            return Err(ChunkError::TrailerTooLong);
                        }
                        break;
                    };
                    pos += end + 2;
                    if end == 0 {
                        self.state = ChunkState::Done;
                    }
                }
                ChunkState::Done => break,
            }
        }
        Ok(Decoded {
            consumed: pos,
            done: self.state == ChunkState::Done,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Feed `input` in pieces split at `cuts`, keeping unconsumed bytes
    /// buffered like a connection would.
    fn decode_split(input: &[u8], cuts: &[usize]) -> (Vec<u8>, bool) {
        let mut decoder = ChunkedDecoder::new();
        let mut buffered = Vec::new();
        let mut payload = Vec::new();
        let mut done = false;
        let mut last = 0;
        for &cut in cuts.iter().chain(std::iter::once(&input.len())) {
            buffered.extend_from_slice(&input[last..cut]);
            last = cut;
            let mut ranges = Vec::new();
            let result = decoder.decode(&buffered, &mut ranges).unwrap();
            for r in ranges {
                payload.extend_from_slice(&buffered[r]);
            }
            buffered.drain(..result.consumed);
            done = result.done;
        }
        (payload, done)
    }

    #[test]
    fn decodes_across_every_three_way_split() {
        let input = b"4\r\nabcd\r\n0\r\n\r\n";
        for a in 0..=input.len() {
            for b in a..=input.len() {
                let (payload, done) = decode_split(input, &[a, b]);
                assert_eq!(payload, b"abcd", "split at {} and {}", a, b);
                assert!(done, "split at {} and {}", a, b);
            }
        }
    }

    #[test]
    fn partial_size_line_is_left_buffered() {
        let mut decoder = ChunkedDecoder::new();
        let mut ranges = Vec::new();
        let result = decoder.decode(b"1", &mut ranges).unwrap();
        assert_eq!(result.consumed, 0);
        assert!(ranges.is_empty());
        assert_eq!(decoder.state(), ChunkState::AwaitingSize);
    }

    #[test]
    fn extensions_and_trailers_are_tolerated() {
        let input = b"3;name=value\r\nxyz\r\n0\r\nX-Checksum: 1\r\n\r\n";
        let (payload, done) = decode_split(input, &[]);
        assert_eq!(payload, b"xyz");
        assert!(done);
    }

    #[test]
    fn stops_at_terminal_chunk() {
        let mut decoder = ChunkedDecoder::new();
        let mut ranges = Vec::new();
        let input = b"2\r\nhi\r\n0\r\n\r\nHTTP/1.1 200 OK\r\n";
        let result = decoder.decode(input, &mut ranges).unwrap();
        assert!(result.done);
        assert_eq!(&input[result.consumed..], b"HTTP/1.1 200 OK\r\n");
    }

    #[test]
    fn rejects_bad_framing() {
        let mut ranges = Vec::new();
        assert_eq!(
            ChunkedDecoder::new().decode(b"zz\r\n", &mut ranges),
            Err(ChunkError::InvalidSize)
        );
        assert_eq!(
            ChunkedDecoder::new().decode(b"2\r\nabXX", &mut ranges),
            Err(ChunkError::MissingCrlf)
        );
        let mut trailers = b"0\r\nX-Long: ".to_vec();
        trailers.extend(std::iter::repeat(b'a').take(MAX_LINE + 1));
        assert_eq!(
            ChunkedDecoder::new().decode(&trailers, &mut ranges),
            Err(ChunkError::TrailerTooLong)
        );
    }

    #[test]
    fn direct_consumption_tracks_remaining() {
        let mut decoder = ChunkedDecoder::new();
        let mut ranges = Vec::new();
        decoder.decode(b"a\r\n", &mut ranges).unwrap();
        assert_eq!(decoder.remaining(), 10);
        decoder.consume_direct(4);
        assert_eq!(decoder.remaining(), 6);
        decoder.consume_direct(6);
        assert_eq!(decoder.state(), ChunkState::AwaitingTrailer);
        let result = decoder.decode(b"\r\n0\r\n\r\n", &mut ranges).unwrap();
        assert!(result.done);
        assert!(ranges.is_empty());
    }
}

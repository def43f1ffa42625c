use std::collections::VecDeque;

use flate2::{Decompress, FlushDecompress, Status};

use crate::common::errors::InflateError;

/// Trailer of every sync-flushed zlib-stream message.
pub const ZLIB_SUFFIX: [u8; 4] = [0x00, 0x00, 0xFF, 0xFF];

const SCRATCH_SIZE: usize = 32 * 1024;

/// Streaming inflate for `compress=zlib-stream` connections.
///
/// One inflate context lives for the whole connection. Chunks are fed in
/// arrival order; whenever a chunk ends with [`ZLIB_SUFFIX`] everything
/// inflated since the previous boundary is released as one message.
pub struct Decompressor {
    inflate: Decompress,
    pending: VecDeque<Vec<u8>>,
    output: Vec<u8>,
    scratch: Box<[u8]>,
}

impl Default for Decompressor {
    fn default() -> Self {
        Self::new()
    }
}

impl Decompressor {
    pub fn new() -> Self {
        Self {
            inflate: Decompress::new(true),
            pending: VecDeque::new(),
            output: Vec::new(),
            scratch: vec![0u8; SCRATCH_SIZE].into_boxed_slice(),
        }
    }

    /// Queues a chunk and drains the queue, returning every message completed
    /// along the way.
    ///
    /// On error the context is unusable until [`Decompressor::reset`].
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<Vec<u8>>, InflateError> {
        self.pending.push_back(chunk.to_vec());

        let mut messages = Vec::new();
        while let Some(chunk) = self.pending.pop_front() {
            let flush = chunk.ends_with(&ZLIB_SUFFIX);
            if let Err(e) = self.inflate_chunk(&chunk, flush) {
                self.pending.clear();
                return Err(e);
            }
            if flush {
                messages.push(std::mem::take(&mut self.output));
            }
        }
        Ok(messages)
    }

    /// Discards the inflate context and any partial output. Required before a
    /// new connection starts a fresh zlib stream.
    pub fn reset(&mut self) {
        self.inflate = Decompress::new(true);
        self.pending.clear();
        self.output.clear();
    }

    fn inflate_chunk(&mut self, chunk: &[u8], flush: bool) -> Result<(), InflateError> {
        let mode = if flush {
            FlushDecompress::Sync
        } else {
            FlushDecompress::None
        };

        let mut input = chunk;
        loop {
            let before_in = self.inflate.total_in();
            let before_out = self.inflate.total_out();
            let status = self.inflate.decompress(input, &mut self.scratch, mode)?;
            let consumed = (self.inflate.total_in() - before_in) as usize;
            let produced = (self.inflate.total_out() - before_out) as usize;

            self.output.extend_from_slice(&self.scratch[..produced]);
            input = &input[consumed..];

            match status {
                Status::StreamEnd => break,
                _ if consumed == 0 && produced == 0 => break,
                // A full scratch buffer may hide more pending output.
                _ if input.is_empty() && produced < self.scratch.len() => break,
                _ => {}
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::{Compress, Compression, FlushCompress};

    fn compress_message(compress: &mut Compress, data: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(data.len() + 1024);
        compress
            .compress_vec(data, &mut out, FlushCompress::Sync)
            .unwrap();
        assert!(out.ends_with(&ZLIB_SUFFIX));
        out
    }

    #[test]
    fn whole_message_round_trip() {
        let mut compress = Compress::new(Compression::default(), true);
        let mut decompressor = Decompressor::new();

        let payload = br#"{"op":10,"d":{"heartbeat_interval":41250}}"#;
        let wire = compress_message(&mut compress, payload);

        let messages = decompressor.feed(&wire).unwrap();
        assert_eq!(messages, vec![payload.to_vec()]);
    }

    #[test]
    fn reassembles_arbitrarily_chunked_stream() {
        let mut compress = Compress::new(Compression::default(), true);
        let mut decompressor = Decompressor::new();

        let first = br#"{"op":0,"s":1,"t":"READY","d":{"session_id":"abc","user":{"id":"1"}}}"#;
        let second = br#"{"op":11,"d":null}"#;

        let mut received = Vec::new();
        for payload in [&first[..], &second[..]] {
            let wire = compress_message(&mut compress, payload);
            let (body, tail) = wire.split_at(wire.len() - ZLIB_SUFFIX.len());
            for chunk in body.chunks(3) {
                assert!(decompressor.feed(chunk).unwrap().is_empty());
            }
            received.extend(decompressor.feed(tail).unwrap());
        }

        assert_eq!(received, vec![first.to_vec(), second.to_vec()]);
    }

    #[test]
    fn large_messages_overflow_the_scratch_buffer() {
        let mut compress = Compress::new(Compression::fast(), true);
        let mut decompressor = Decompressor::new();

        let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let mut wire = Vec::with_capacity(payload.len() * 2);
        compress
            .compress_vec(&payload, &mut wire, FlushCompress::Sync)
            .unwrap();

        let messages = decompressor.feed(&wire).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0], payload);
    }

    #[test]
    fn reset_starts_a_new_stream() {
        let mut decompressor = Decompressor::new();

        let mut first_stream = Compress::new(Compression::default(), true);
        let wire = compress_message(&mut first_stream, b"hello");
        // Half a message, then the connection drops.
        decompressor.feed(&wire[..wire.len() / 2]).unwrap();
        decompressor.reset();

        let mut second_stream = Compress::new(Compression::default(), true);
        let wire = compress_message(&mut second_stream, b"world");
        assert_eq!(decompressor.feed(&wire).unwrap(), vec![b"world".to_vec()]);
    }

    #[test]
    fn garbage_is_an_error() {
        let mut decompressor = Decompressor::new();
        let mut garbage = vec![0x13, 0x37, 0xde, 0xad, 0xbe, 0xef];
        garbage.extend_from_slice(&ZLIB_SUFFIX);
        assert!(decompressor.feed(&garbage).is_err());
    }
}

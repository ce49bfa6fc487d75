//! Byte-stream chunk framing: 4 bytes big-endian length + chunk.

const LEN_SIZE: usize = 4;

/// Default upper bound for a single streamed chunk.
pub const DEFAULT_MAX_CHUNK: usize = 4 * 1024 * 1024; // 4 MiB

/// Prefix `data` with its length for writing to a stream.
pub fn encode_chunk(data: &[u8]) -> Result<Vec<u8>, StreamError> {
    let len = u32::try_from(data.len()).map_err(|_| StreamError::TooLarge(data.len()))?;
    let mut out = Vec::with_capacity(LEN_SIZE + data.len());
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(data);
    Ok(out)
}

/// Decode one chunk from the front of `bytes`. Returns the chunk and the number of bytes consumed.
pub fn decode_chunk(bytes: &[u8], max_chunk: usize) -> Result<(&[u8], usize), StreamError> {
    if bytes.len() < LEN_SIZE {
        return Err(StreamError::NeedMore);
    }
    let len = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    if len > max_chunk {
        return Err(StreamError::TooLarge(len));
    }
    if bytes.len() < LEN_SIZE + len {
        return Err(StreamError::NeedMore);
    }
    Ok((&bytes[LEN_SIZE..LEN_SIZE + len], LEN_SIZE + len))
}

/// Incremental reader: accepts arbitrary reads, yields whole chunks.
#[derive(Debug)]
pub struct StreamDecoder {
    buf: Vec<u8>,
    max_chunk: usize,
    received: usize,
}

impl StreamDecoder {
    pub fn new(max_chunk: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_chunk,
            received: 0,
        }
    }

    /// Append a read and drain every complete chunk. On error the buffered bytes are
    /// unusable and the stream should be closed.
    pub fn push(&mut self, bytes: &[u8]) -> Result<Vec<Vec<u8>>, StreamError> {
        self.received = self.received.saturating_add(bytes.len());
        self.buf.extend_from_slice(bytes);
        let mut chunks = Vec::new();
        let mut offset = 0usize;
        loop {
            match decode_chunk(&self.buf[offset..], self.max_chunk) {
                Ok((chunk, n)) => {
                    chunks.push(chunk.to_vec());
                    offset += n;
                }
                Err(StreamError::NeedMore) => break,
                Err(e) => {
                    self.buf.clear();
                    return Err(e);
                }
            }
        }
        self.buf.drain(..offset);
        Ok(chunks)
    }

    /// Bytes waiting for the rest of their chunk.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Total bytes pushed since creation.
    pub fn total_received(&self) -> usize {
        self.received
    }
}

impl Default for StreamDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CHUNK)
    }
}

/// Failure on an open byte stream. Only the stream is affected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    #[error("need more bytes")]
    NeedMore,
    #[error("chunk of {0} bytes exceeds limit")]
    TooLarge(usize),
    #[error("no open stream")]
    Closed,
    #[error("stream transport failed: {0}")]
    Transport(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_layout() {
        let bytes = encode_chunk(b"abc").unwrap();
        assert_eq!(bytes, vec![0, 0, 0, 3, b'a', b'b', b'c']);
        let (chunk, n) = decode_chunk(&bytes, DEFAULT_MAX_CHUNK).unwrap();
        assert_eq!(chunk, b"abc");
        assert_eq!(n, 7);
    }

    #[test]
    fn partial_read_need_more() {
        let bytes = encode_chunk(b"hello").unwrap();
        assert_eq!(decode_chunk(&bytes[..2], 64), Err(StreamError::NeedMore));
        assert_eq!(decode_chunk(&bytes[..6], 64), Err(StreamError::NeedMore));
    }

    #[test]
    fn decoder_handles_split_reads() {
        let mut wire = encode_chunk(b"first").unwrap();
        wire.extend(encode_chunk(b"second").unwrap());
        wire.extend(encode_chunk(b"").unwrap());

        let mut decoder = StreamDecoder::new(64);
        let mut out = Vec::new();
        for piece in wire.chunks(3) {
            out.extend(decoder.push(piece).unwrap());
        }
        assert_eq!(out, vec![b"first".to_vec(), b"second".to_vec(), Vec::new()]);
        assert_eq!(decoder.pending(), 0);
        assert_eq!(decoder.total_received(), wire.len());
    }

    #[test]
    fn oversized_chunk_rejected() {
        let mut decoder = StreamDecoder::new(4);
        let wire = encode_chunk(b"too long").unwrap();
        assert_eq!(decoder.push(&wire), Err(StreamError::TooLarge(8)));
        assert_eq!(decoder.pending(), 0);
    }
}

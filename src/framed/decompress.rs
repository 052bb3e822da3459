use std::cmp;
use std::fmt;
use std::hash::Hasher;
use std::io::{self, BufRead, ErrorKind, Read};
use thiserror::Error;
use fehler::{throw, throws};
use tracing::{debug, trace};
use twox_hash::XxHash32;

use super::header::{BlockHeader, FormatError, HeaderReadError, StreamHeader};
use super::{xxh32, MAX_BLOCK_SIZE};
use crate::codec::{BlockCodec, Lz4};

/// The part of the stream that was cut short.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Section {
    StreamHeader,
    BlockHeader,
    Payload,
    Footer,
}

impl fmt::Display for Section {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            Section::StreamHeader => "stream header",
            Section::BlockHeader => "block header",
            Section::Payload => "block payload",
            Section::Footer => "stream footer",
        })
    }
}

/// Errors when reading an LZ4S stream.
///
/// All of them are final: a reader that returned one refuses to continue, because
/// without a resynchronization marker nothing after a damaged spot can be trusted.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("malformed stream: {0}")]
    Format(#[from] FormatError),
    #[error("the stream ended in the middle of a {0}")]
    TruncatedStream(Section),
    #[error("checksum mismatch in {}: stored {expected:08x}, computed {actual:08x}", checksum_scope(.block))]
    ChecksumMismatch { block: Option<u64>, expected: u32, actual: u32 },
    #[error("error reading from the input you gave me")]
    Io(#[from] io::Error),
    #[error("the stream already failed to decode")]
    Poisoned,
}
type Error = DecodeError; // do it this way for better docs

fn checksum_scope(block: &Option<u64>) -> String {
    match block {
        Some(i) => format!("block {}", i),
        None => "content".to_string(),
    }
}

impl From<Error> for io::Error {
    fn from(e: Error) -> io::Error {
        match e {
            DecodeError::Io(e) => e,
            e @ DecodeError::TruncatedStream(_) => io::Error::new(ErrorKind::UnexpectedEof, e),
            e => io::Error::new(ErrorKind::InvalidData, e),
        }
    }
}

impl From<HeaderReadError> for Error {
    fn from(e: HeaderReadError) -> Error {
        match e {
            HeaderReadError::Format(e) => DecodeError::Format(e),
            HeaderReadError::Io(e) if e.kind() == ErrorKind::UnexpectedEof => {
                DecodeError::TruncatedStream(Section::StreamHeader)
            }
            HeaderReadError::Io(e) => DecodeError::Io(e),
        }
    }
}

/// A builder-style struct that configures how streams are read.
#[derive(Debug, Clone)]
pub struct DecodeSettings {
    max_block_size: usize,
    require_end_mark: bool,
    verify_content_checksum: bool,
}

impl Default for DecodeSettings {
    fn default() -> Self {
        Self {
            max_block_size: MAX_BLOCK_SIZE,
            require_end_mark: true,
            verify_content_checksum: true,
        }
    }
}

impl DecodeSettings {
    /// Refuse blocks larger than this, even if the stream header allows them.
    /// This caps how much memory a hostile stream can make us allocate per block.
    ///
    /// Defaults to 64 MiB, the largest block size a stream can declare.
    pub fn max_block_size(&mut self, v: usize) -> &mut Self {
        self.max_block_size = v;
        self
    }

    /// By default a stream must end with its end marker, so a stream that was cut
    /// exactly between two blocks is still reported as truncated.
    /// Turning this off accepts running out of input on a block boundary as the end
    /// (the content checksum can't be verified then, since it sits behind the end marker).
    pub fn require_end_mark(&mut self, v: bool) -> &mut Self {
        self.require_end_mark = v;
        self
    }

    /// Whether to check the content checksum, if the stream has one.
    /// Block checksums are always checked.
    pub fn verify_content_checksum(&mut self, v: bool) -> &mut Self {
        self.verify_content_checksum = v;
        self
    }

    #[throws]
    pub fn reader<R: Read>(&self, reader: R) -> FrameReader<R> {
        FrameReader::with_codec(reader, Lz4::default(), self)?
    }

    #[throws]
    pub fn reader_with_codec<R: Read, C: BlockCodec>(&self, reader: R, codec: C) -> FrameReader<R, C> {
        FrameReader::with_codec(reader, codec, self)?
    }

    /// Decode a complete stream held in memory.
    ///
    /// Either the whole content comes back or an error does; there are no partial results.
    #[throws]
    pub fn decode(&self, input: &[u8]) -> Vec<u8> {
        self.decode_with_codec(input, Lz4::default())?
    }

    #[throws]
    pub fn decode_with_codec<C: BlockCodec>(&self, input: &[u8], codec: C) -> Vec<u8> {
        let mut rest = input;
        let mut frame = FrameReader::with_codec(&mut rest, codec, self)?;

        let capacity = frame.content_size().map_or(input.len(), |size| cmp::min(size, MAX_BLOCK_SIZE as u64) as usize);
        let mut plaintext = Vec::with_capacity(capacity);
        while frame.decode_block(&mut plaintext)? != 0 {}

        if !frame.into_inner().is_empty() {
            throw!(FormatError::TrailingData);
        }
        plaintext
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    ExpectBlockHeader,
    Done,
    Failed,
}

/// Read an LZ4S stream.
///
/// The stream header is parsed when the reader is created; blocks are then read,
/// decompressed and verified one at a time with [`decode_block`](Self::decode_block).
pub struct FrameReader<R: Read, C: BlockCodec = Lz4> {
    reader: R,
    codec: C,
    header: StreamHeader,
    limit: usize,
    require_end_mark: bool,
    verify_content_checksum: bool,
    read_buf: Vec<u8>,
    content_hasher: Option<XxHash32>,
    content_len: u64,
    blocks: u64,
    state: State,
}

impl<R: Read> FrameReader<R> {
    /// Parse the stream header with default settings and the built-in LZ4 primitive.
    #[throws]
    pub fn new(reader: R) -> Self {
        FrameReader::with_codec(reader, Lz4::default(), &DecodeSettings::default())?
    }
}

impl<R: Read, C: BlockCodec> FrameReader<R, C> {
    #[throws]
    pub fn with_codec(mut reader: R, codec: C, settings: &DecodeSettings) -> Self {
        let header = match StreamHeader::read(&mut reader) {
            Ok(header) => header,
            Err(e) => {
                let e = Error::from(e);
                debug!(error = %e, "rejected stream header");
                throw!(e);
            }
        };
        debug!(
            block_size = header.block_size,
            content_checksum = header.flags.content_checksum(),
            content_size = ?header.content_size,
            "reading stream"
        );

        FrameReader {
            reader,
            codec,
            limit: cmp::min(header.block_size as usize, settings.max_block_size),
            require_end_mark: settings.require_end_mark,
            verify_content_checksum: settings.verify_content_checksum,
            read_buf: Vec::new(),
            content_hasher: if header.flags.content_checksum() { Some(XxHash32::with_seed(0)) } else { None },
            content_len: 0,
            blocks: 0,
            state: State::ExpectBlockHeader,
            header,
        }
    }

    pub fn header(&self) -> &StreamHeader { &self.header }
    pub fn block_size(&self) -> usize { self.header.block_size as usize }
    pub fn content_size(&self) -> Option<u64> { self.header.content_size }
    pub fn is_finished(&self) -> bool { self.state == State::Done }
    pub fn into_inner(self) -> R { self.reader }

    pub fn into_read(self) -> FrameIoReader<R, C> {
        FrameIoReader {
            buffer: Vec::new(),
            bytes_taken: 0,
            frame_reader: self,
        }
    }

    /// Decode the next block, appending its content to `output`.
    ///
    /// Returns the number of bytes appended; zero means the stream has ended (blocks are
    /// never empty). On error nothing is appended, and every later call fails with
    /// [`DecodeError::Poisoned`].
    #[throws]
    pub fn decode_block(&mut self, output: &mut Vec<u8>) -> usize {
        match self.state {
            State::Done => return 0,
            State::Failed => throw!(Error::Poisoned),
            State::ExpectBlockHeader => {}
        }

        match self.next_block(output) {
            Ok(n) => n,
            Err(e) => {
                self.state = State::Failed;
                debug!(block = self.blocks, error = %e, "stream failed");
                throw!(e);
            }
        }
    }

    #[throws]
    fn next_block(&mut self, output: &mut Vec<u8>) -> usize {
        let mut first = [0u8; 4];
        let got = fill(&mut self.reader, &mut first)?;
        if got == 0 && !self.require_end_mark {
            self.finish(false)?;
            return 0;
        }
        if got < first.len() {
            throw!(Error::TruncatedStream(Section::BlockHeader));
        }

        let uncompressed_length = u32::from_le_bytes(first);
        if uncompressed_length == 0 {
            self.finish(true)?;
            return 0;
        }

        let mut rest = [0u8; 8];
        read_section(&mut self.reader, &mut rest, Section::BlockHeader)?;
        let header = BlockHeader::from_fields(uncompressed_length, rest);
        header.validate(self.limit)?;

        let after = self.content_len + uncompressed_length as u64;
        if let Some(declared) = self.header.content_size {
            if after > declared {
                throw!(FormatError::ContentSizeMismatch { declared, actual: after });
            }
        }

        // ExpectBlockPayload
        self.read_buf.resize(header.payload_len(), 0);
        read_section(&mut self.reader, &mut self.read_buf, Section::Payload)?;

        let start = output.len();
        if header.stored {
            output.extend_from_slice(&self.read_buf);
        } else if let Err(e) = self.codec.decompress_into(&self.read_buf, uncompressed_length as usize, output) {
            output.truncate(start);
            debug!(block = self.blocks, error = %e, "block primitive rejected payload");
            throw!(FormatError::CorruptPayload);
        }

        let block = &output[start..];
        let actual = xxh32(block);
        if actual != header.checksum {
            output.truncate(start);
            throw!(Error::ChecksumMismatch { block: Some(self.blocks), expected: header.checksum, actual });
        }

        if let Some(hasher) = self.content_hasher.as_mut() {
            hasher.write(block);
        }
        trace!(
            block = self.blocks,
            uncompressed = header.uncompressed_length,
            compressed = header.compressed_length,
            stored = header.stored,
            "read block"
        );
        self.content_len = after;
        self.blocks += 1;
        block.len()
    }

    /// Past the last block: check the footer and the declared size.
    #[throws]
    fn finish(&mut self, saw_end_mark: bool) {
        if saw_end_mark {
            if let Some(hasher) = self.content_hasher.take() {
                let mut footer = [0u8; 4];
                read_section(&mut self.reader, &mut footer, Section::Footer)?;
                let expected = u32::from_le_bytes(footer);
                let actual = hasher.finish() as u32;
                if self.verify_content_checksum && expected != actual {
                    throw!(Error::ChecksumMismatch { block: None, expected, actual });
                }
            }
        }

        if let Some(declared) = self.header.content_size {
            if self.content_len != declared {
                throw!(FormatError::ContentSizeMismatch { declared, actual: self.content_len });
            }
        }

        self.state = State::Done;
        debug!(blocks = self.blocks, content_len = self.content_len, "finished stream");
    }
}

/// Read into `buf` until it is full or the input ends. Returns how much was read.
fn fill<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

#[throws]
fn read_section<R: Read>(reader: &mut R, buf: &mut [u8], section: Section) {
    if fill(reader, buf)? < buf.len() {
        throw!(Error::TruncatedStream(section));
    }
}

/// Wrapper around `FrameReader` that implements `Read` and `BufRead`.
pub struct FrameIoReader<R: Read, C: BlockCodec = Lz4> {
    frame_reader: FrameReader<R, C>,
    bytes_taken: usize,
    buffer: Vec<u8>,
}

impl<R: Read, C: BlockCodec> FrameIoReader<R, C> {
    pub fn get_ref(&self) -> &FrameReader<R, C> {
        &self.frame_reader
    }
}

impl<R: Read, C: BlockCodec> Read for FrameIoReader<R, C> {
    #[throws(io::Error)]
    fn read(&mut self, buf: &mut [u8]) -> usize {
        let mybuf = self.fill_buf()?;
        let bytes_to_take = cmp::min(mybuf.len(), buf.len());
        buf[..bytes_to_take].copy_from_slice(&mybuf[..bytes_to_take]);
        self.consume(bytes_to_take);
        bytes_to_take
    }
}

impl<R: Read, C: BlockCodec> BufRead for FrameIoReader<R, C> {
    #[throws(io::Error)]
    fn fill_buf(&mut self) -> &[u8] {
        if self.bytes_taken == self.buffer.len() {
            self.buffer.clear();
            self.frame_reader.decode_block(&mut self.buffer)?;
            self.bytes_taken = 0;
        }
        &self.buffer[self.bytes_taken..]
    }

    fn consume(&mut self, amt: usize) {
        self.bytes_taken = cmp::min(self.bytes_taken + amt, self.buffer.len());
    }
}

/// Decode a complete in-memory stream with the default settings.
#[throws]
pub fn decode(input: &[u8]) -> Vec<u8> {
    DecodeSettings::default().decode(input)?
}

#[throws]
pub fn decode_with(input: &[u8], settings: &DecodeSettings) -> Vec<u8> {
    settings.decode(input)?
}

/// Read a stream to its end, for callers that already have a `Read`.
#[throws]
pub fn decompress<R: Read>(reader: R) -> Vec<u8> {
    let mut frame = FrameReader::new(reader)?;
    let mut plaintext = Vec::new();
    while frame.decode_block(&mut plaintext)? != 0 {}
    plaintext
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framed::{encode_with_block_size, EncodeSettings};

    fn stream(data: &[u8], block_size: usize) -> Vec<u8> {
        encode_with_block_size(data, block_size).unwrap()
    }

    #[test]
    fn hello_world() {
        let encoded = stream(b"hello world", 1024);
        assert_eq!(decode(&encoded).unwrap(), b"hello world");
    }

    #[test]
    fn blocks_one_at_a_time() {
        let data: Vec<u8> = (0..5000u32).map(|i| (i / 7) as u8).collect();
        let encoded = stream(&data, 1024);

        let mut frame = FrameReader::new(&encoded[..]).unwrap();
        assert_eq!(frame.block_size(), 1024);
        assert_eq!(frame.content_size(), Some(5000));

        let mut sizes = Vec::new();
        let mut out = Vec::new();
        loop {
            let mut block = Vec::new();
            let n = frame.decode_block(&mut block).unwrap();
            if n == 0 {
                break;
            }
            sizes.push(n);
            out.extend(block);
        }
        assert_eq!(sizes, vec![1024, 1024, 1024, 1024, 904]);
        assert_eq!(out, data);
        assert!(frame.is_finished());
        assert_eq!(frame.decode_block(&mut Vec::new()).unwrap(), 0);
    }

    #[test]
    fn failure_poisons_the_reader() {
        let mut encoded = stream(&[3u8; 3000], 1024);
        let len = encoded.len();
        encoded.truncate(len - 10);

        let mut frame = FrameReader::new(&encoded[..]).unwrap();
        let mut out = Vec::new();
        let err = loop {
            match frame.decode_block(&mut out) {
                Ok(0) => panic!("truncated stream decoded"),
                Ok(_) => continue,
                Err(e) => break e,
            }
        };
        assert!(matches!(err, DecodeError::TruncatedStream(_)));
        assert!(matches!(frame.decode_block(&mut out), Err(DecodeError::Poisoned)));
    }

    #[test]
    fn trailing_data_is_rejected() {
        let mut encoded = stream(b"abc", 1024);
        encoded.push(0);
        assert!(matches!(decode(&encoded), Err(DecodeError::Format(FormatError::TrailingData))));
    }

    #[test]
    fn missing_end_mark_can_be_tolerated() {
        let mut settings = EncodeSettings::default();
        settings.block_size(100).content_checksum(false);
        let mut encoded = settings.compress(&[7u8; 250][..], Vec::new()).unwrap();
        encoded.truncate(encoded.len() - 4);

        assert!(matches!(decode(&encoded), Err(DecodeError::TruncatedStream(Section::BlockHeader))));
        let mut lenient = DecodeSettings::default();
        lenient.require_end_mark(false);
        assert_eq!(lenient.decode(&encoded).unwrap(), vec![7u8; 250]);
    }

    #[test]
    fn content_checksum_is_checked() {
        let mut encoded = stream(b"some content", 1024);
        let len = encoded.len();
        encoded[len - 1] ^= 0x40;
        assert!(matches!(decode(&encoded), Err(DecodeError::ChecksumMismatch { block: None, .. })));

        let mut relaxed = DecodeSettings::default();
        relaxed.verify_content_checksum(false);
        assert_eq!(relaxed.decode(&encoded).unwrap(), b"some content");
    }

    #[test]
    fn max_block_size_caps_allocation() {
        let encoded = stream(&[1u8; 4096], 4096);
        let mut strict = DecodeSettings::default();
        strict.max_block_size(1024);
        assert!(matches!(
            strict.decode(&encoded),
            Err(DecodeError::Format(FormatError::BlockTooLarge { length: 4096, limit: 1024 }))
        ));
    }

    #[test]
    fn io_reader_reads_everything() {
        let data: Vec<u8> = (0..100_000u32).map(|i| (i.wrapping_mul(i) >> 5) as u8).collect();
        let encoded = stream(&data, 4096);
        let mut out = Vec::new();
        FrameReader::new(&encoded[..]).unwrap().into_read().read_to_end(&mut out).unwrap();
        assert_eq!(out, data);
        assert_eq!(decompress(&encoded[..]).unwrap(), data);
    }

    #[test]
    fn io_reader_allocates_per_block() {
        // a header that allows the largest blocks, followed by a tiny one
        let mut settings = EncodeSettings::default();
        settings.block_size(MAX_BLOCK_SIZE);
        let encoded = settings.encode(b"tiny").unwrap();

        let mut reader = FrameReader::new(&encoded[..]).unwrap().into_read();
        assert_eq!(reader.buffer.capacity(), 0);
        assert_eq!(reader.fill_buf().unwrap(), b"tiny");
        assert!(reader.buffer.capacity() < 1024);
    }

    #[test]
    fn io_reader_maps_errors() {
        let mut encoded = stream(&[5u8; 100], 1024);
        encoded.truncate(encoded.len() - 6);
        let mut out = Vec::new();
        let err = FrameReader::new(&encoded[..]).unwrap().into_read().read_to_end(&mut out).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnexpectedEof);
    }
}

use std::error::Error as StdError;
use std::hash::Hasher;
use std::io::{self, ErrorKind, Read, Write};
use thiserror::Error;
use fehler::{throw, throws};
use tracing::{debug, trace};
use twox_hash::XxHash32;

use super::header::{BlockHeader, StreamHeader};
use super::{xxh32, DEFAULT_BLOCK_SIZE, MAX_BLOCK_SIZE};
use crate::codec::{BlockCodec, Lz4};

/// Errors when writing an LZ4S stream.
#[derive(Error, Debug)]
pub enum EncodeError {
    #[error("the block compression primitive failed")]
    Codec(#[source] Box<dyn StdError + Send + Sync>),
    #[error("error reading from the input you gave me")]
    Read(#[source] io::Error),
    #[error("error writing to the output you gave me")]
    Io(#[from] io::Error),
    #[error("block size {0} is not supported")]
    InvalidBlockSize(usize),
    #[error("declared a content size of {declared} bytes but got {actual}")]
    ContentSizeMismatch { declared: u64, actual: u64 },
    #[error("the stream already failed to encode")]
    Poisoned,
}
type Error = EncodeError;

impl From<Error> for io::Error {
    fn from(e: Error) -> io::Error {
        match e {
            EncodeError::Io(e) => e,
            e => io::Error::new(ErrorKind::Other, e),
        }
    }
}

/// A builder-style struct that configures how streams are written.
///
/// Create it using `Default::default()`.
#[derive(Debug, Clone)]
pub struct EncodeSettings {
    block_size: usize,
    content_checksum: bool,
    content_size: Option<u64>,
}

impl Default for EncodeSettings {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            content_checksum: true,
            content_size: None,
        }
    }
}

impl EncodeSettings {
    /// The largest number of uncompressed bytes in one block, anywhere from 1 byte to 64 MiB.
    ///
    /// Larger blocks compress better and cost the decoder more memory.
    /// The default block size is 8 MiB.
    pub fn block_size(&mut self, v: usize) -> &mut Self {
        self.block_size = v;
        self
    }

    /// The content checksum is an XXH32 over the entire content, written after the end marker.
    /// Each block has its own checksum regardless, so this mostly guards against blocks
    /// being dropped or reordered.
    ///
    /// Enabled by default.
    pub fn content_checksum(&mut self, v: bool) -> &mut Self {
        self.content_checksum = v;
        self
    }

    /// Declare the total number of content bytes in the header. The writer refuses to
    /// produce a stream that disagrees with the declaration.
    ///
    /// [`encode`](Self::encode) always declares the size; other entry points don't by default.
    pub fn content_size(&mut self, v: Option<u64>) -> &mut Self {
        self.content_size = v;
        self
    }

    pub fn get_block_size(&self) -> usize {
        self.block_size
    }

    /// Start a stream on `writer` using the built-in LZ4 primitive.
    #[throws]
    pub fn writer<W: Write>(&self, writer: W) -> FrameWriter<W> {
        FrameWriter::new(writer, Lz4::default(), self)?
    }

    /// Start a stream on `writer` using a caller-supplied primitive.
    #[throws]
    pub fn writer_with_codec<W: Write, C: BlockCodec>(&self, writer: W, codec: C) -> FrameWriter<W, C> {
        FrameWriter::new(writer, codec, self)?
    }

    /// Compress everything `reader` produces into a stream on `writer`.
    #[throws]
    pub fn compress<R: Read, W: Write>(&self, reader: R, writer: W) -> W {
        let mut frame = self.writer(writer)?;
        frame.write_from(reader)?;
        frame.finish()?
    }

    /// Encode a buffer in one go. The content size is always declared.
    #[throws]
    pub fn encode(&self, input: &[u8]) -> Vec<u8> {
        self.encode_with_codec(input, Lz4::default())?
    }

    #[throws]
    pub fn encode_with_codec<C: BlockCodec>(&self, input: &[u8], codec: C) -> Vec<u8> {
        let mut settings = self.clone();
        settings.content_size(Some(input.len() as u64));

        let blocks = input.len() / self.block_size.max(1) + 1;
        let output = Vec::with_capacity(input.len() + blocks * BlockHeader::LEN + 32);
        let mut frame = settings.writer_with_codec(output, codec)?;
        frame.write_content(input)?;
        frame.finish()?
    }
}

/// Writes an LZ4S stream.
///
/// Bytes are collected until a full block is available, then the block is checksummed,
/// compressed (or stored, if compression doesn't shrink it) and written out.
/// Call [`finish`](Self::finish) at the end: dropping the writer leaves the stream
/// without its end marker, and readers will treat it as truncated.
///
/// Once any call fails the stream is unusable: every later call returns
/// [`EncodeError::Poisoned`].
pub struct FrameWriter<W: Write, C: BlockCodec = Lz4> {
    writer: W,
    codec: C,
    block_size: usize,
    declared_size: Option<u64>,
    content_hasher: Option<XxHash32>,
    in_buffer: Vec<u8>,
    out_buffer: Vec<u8>,
    content_len: u64,
    blocks: u64,
    failed: bool,
}

impl<W: Write, C: BlockCodec> FrameWriter<W, C> {
    /// Write the stream header and return a writer ready for content.
    #[throws]
    pub fn new(mut writer: W, codec: C, settings: &EncodeSettings) -> Self {
        let block_size = settings.block_size;
        if block_size == 0 || block_size > MAX_BLOCK_SIZE {
            throw!(Error::InvalidBlockSize(block_size));
        }

        let header = StreamHeader::new(block_size, settings.content_checksum, settings.content_size);
        header.write(&mut writer)?;
        debug!(
            block_size,
            content_checksum = settings.content_checksum,
            content_size = ?settings.content_size,
            "started stream"
        );

        FrameWriter {
            writer,
            codec,
            block_size,
            declared_size: settings.content_size,
            content_hasher: if settings.content_checksum { Some(XxHash32::with_seed(0)) } else { None },
            in_buffer: Vec::with_capacity(block_size),
            out_buffer: Vec::new(),
            content_len: 0,
            blocks: 0,
            failed: false,
        }
    }

    /// Content bytes accepted so far.
    pub fn content_len(&self) -> u64 {
        self.content_len
    }

    /// Blocks written so far.
    pub fn blocks_written(&self) -> u64 {
        self.blocks
    }

    pub fn get_ref(&self) -> &W {
        &self.writer
    }

    /// Append content, writing out every block that fills up along the way.
    #[throws]
    pub fn write_content(&mut self, mut data: &[u8]) {
        while !data.is_empty() {
            let taken = self.absorb(data)?;
            data = &data[taken..];
        }
    }

    /// Run `op` unless the stream already failed, and mark it failed if `op` does.
    #[throws]
    fn guarded<T>(&mut self, op: impl FnOnce(&mut Self) -> Result<T, Error>) -> T {
        if self.failed {
            throw!(Error::Poisoned);
        }
        match op(self) {
            Ok(v) => v,
            Err(e) => {
                self.failed = true;
                debug!(block = self.blocks, error = %e, "stream failed");
                throw!(e);
            }
        }
    }

    #[throws]
    fn absorb(&mut self, buf: &[u8]) -> usize {
        self.guarded(|frame| frame.absorb_unguarded(buf))?
    }

    /// Take as much of `buf` as fits into the current block.
    #[throws]
    fn absorb_unguarded(&mut self, buf: &[u8]) -> usize {
        let start = self.in_buffer.len();
        let take = buf.len().min(self.block_size - start);
        self.in_buffer.extend_from_slice(&buf[..take]);
        if let Err(e) = self.account(start) {
            self.in_buffer.truncate(start);
            throw!(e);
        }
        if self.in_buffer.len() == self.block_size {
            self.write_block()?;
        }
        take
    }

    /// Pull everything from `reader` into the stream, returning the number of bytes read.
    #[throws]
    pub fn write_from<R: Read>(&mut self, reader: R) -> u64 {
        self.guarded(|frame| frame.write_from_unguarded(reader))?
    }

    #[throws]
    fn write_from_unguarded<R: Read>(&mut self, mut reader: R) -> u64 {
        let mut total = 0;
        loop {
            let start = self.in_buffer.len();
            let room = (self.block_size - start) as u64;

            // read_exact semantics except at the end; read_exact leaves the buffer
            // unspecified on error, so take + read_to_end it is
            reader.by_ref().take(room).read_to_end(&mut self.in_buffer).map_err(Error::Read)?;
            let read = self.in_buffer.len() - start;
            if read == 0 {
                break;
            }
            if let Err(e) = self.account(start) {
                self.in_buffer.truncate(start);
                throw!(e);
            }
            total += read as u64;

            if self.in_buffer.len() == self.block_size {
                self.write_block()?;
            }
        }
        total
    }

    /// Hash and count `in_buffer[start..]`, which was just appended.
    #[throws]
    fn account(&mut self, start: usize) {
        let fresh = &self.in_buffer[start..];
        let content_len = self.content_len + fresh.len() as u64;
        if let Some(declared) = self.declared_size {
            if content_len > declared {
                throw!(Error::ContentSizeMismatch { declared, actual: content_len });
            }
        }
        self.content_len = content_len;
        if let Some(hasher) = self.content_hasher.as_mut() {
            hasher.write(fresh);
        }
    }

    /// Emit whatever sits in the input buffer as one block.
    #[throws]
    fn write_block(&mut self) {
        let chunk = &self.in_buffer[..];
        if chunk.is_empty() {
            return;
        }

        let checksum = xxh32(chunk);
        // anything that isn't strictly smaller gets stored
        let bound = chunk.len() - 1;
        self.out_buffer.resize(bound, 0);
        let compressed = self
            .codec
            .compress_into(chunk, &mut self.out_buffer[..bound])
            .map_err(|e| Error::Codec(Box::new(e)))?;

        let (payload, stored) = match compressed {
            Some(n) if n > 0 && n < chunk.len() => (&self.out_buffer[..n], false),
            _ => (chunk, true),
        };
        let header = BlockHeader {
            uncompressed_length: chunk.len() as u32,
            compressed_length: payload.len() as u32,
            stored,
            checksum,
        };
        self.writer.write_all(&header.to_bytes())?;
        self.writer.write_all(payload)?;

        trace!(
            block = self.blocks,
            uncompressed = header.uncompressed_length,
            compressed = header.compressed_length,
            stored,
            "wrote block"
        );
        self.blocks += 1;
        self.in_buffer.clear();
    }

    /// Write the last block, the end marker and the footer, and hand back the inner writer.
    #[throws]
    pub fn finish(mut self) -> W {
        self.guarded(|frame| frame.finish_unguarded())?;
        debug!(blocks = self.blocks, content_len = self.content_len, "finished stream");
        self.writer
    }

    #[throws]
    fn finish_unguarded(&mut self) {
        self.write_block()?;

        if let Some(declared) = self.declared_size {
            if self.content_len != declared {
                throw!(Error::ContentSizeMismatch { declared, actual: self.content_len });
            }
        }

        self.writer.write_all(&0u32.to_le_bytes())?;
        if let Some(hasher) = self.content_hasher.take() {
            self.writer.write_all(&(hasher.finish() as u32).to_le_bytes())?;
        }
        self.writer.flush()?;
    }
}

impl<W: Write, C: BlockCodec> Write for FrameWriter<W, C> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Ok(self.absorb(buf)?)
    }

    /// Emits the pending partial block, so everything written so far can be decoded
    /// once the stream is finished. Frequent flushes mean small blocks.
    fn flush(&mut self) -> io::Result<()> {
        self.guarded(|frame| {
            frame.write_block()?;
            Ok(frame.writer.flush()?)
        })?;
        Ok(())
    }
}

/// Encode `input` with the default settings (8 MiB blocks, content checksum).
#[throws]
pub fn encode(input: &[u8]) -> Vec<u8> {
    EncodeSettings::default().encode(input)?
}

/// Encode `input`, splitting it into blocks of at most `block_size` bytes.
#[throws]
pub fn encode_with_block_size(input: &[u8], block_size: usize) -> Vec<u8> {
    EncodeSettings::default().block_size(block_size).encode(input)?
}

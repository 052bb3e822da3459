#![allow(non_upper_case_globals)]

use bitflags::bitflags;
use byteorder::{ByteOrder, WriteBytesExt, LE};
use fehler::{throw, throws};
use std::io::{self, Read, Write};
use thiserror::Error;

use super::{xxh32, MAGIC, MAX_BLOCK_SIZE, STORED, VERSION};

bitflags! {
    pub struct Flags: u8 {
        const ContentChecksum = 0b00000001;
        const ContentSize     = 0b00000010;
    }
}

impl Flags {
    pub fn content_checksum(&self) -> bool { self.contains(Flags::ContentChecksum) }
    pub fn content_size(&self)     -> bool { self.contains(Flags::ContentSize) }
}

/// The ways a stream can be malformed, as opposed to merely cut short or corrupted.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FormatError {
    #[error("wrong magic bytes in stream header: {0:02x?}")]
    WrongMagic([u8; 4]),
    #[error("stream version {0} not supported")]
    UnsupportedVersion(u8),
    #[error("reserved bits in flags set: {0:08b}")]
    ReservedFlags(u8),
    #[error("block size {0} is zero or larger than the supported maximum")]
    InvalidBlockSize(u32),
    #[error("the header checksum was invalid")]
    HeaderChecksum,
    #[error("block claims {length} bytes but at most {limit} are allowed")]
    BlockTooLarge { length: u32, limit: usize },
    #[error("compressed length {compressed} is not smaller than uncompressed length {uncompressed}")]
    InvalidCompressedLength { compressed: u32, uncompressed: u32 },
    #[error("stored block of {stored} bytes declares {uncompressed} uncompressed bytes")]
    StoredLengthMismatch { stored: u32, uncompressed: u32 },
    #[error("block payload does not decompress to its declared length (data corruption?)")]
    CorruptPayload,
    #[error("stream declared {declared} bytes of content but holds at least {actual}")]
    ContentSizeMismatch { declared: u64, actual: u64 },
    #[error("unexpected data after the end of the stream")]
    TrailingData,
}

/// Everything before the first block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamHeader {
    pub flags: Flags,
    pub block_size: u32,
    pub content_size: Option<u64>,
}

/// Reading a header either fails on the bytes themselves or on the source.
#[derive(Error, Debug)]
pub enum HeaderReadError {
    #[error(transparent)]
    Format(#[from] FormatError),
    #[error("error reading the stream header")]
    Io(#[from] io::Error),
}

impl StreamHeader {
    /// Magic, version, flags and block size.
    const FIXED_LEN: usize = 4 + 1 + 1 + 4;

    pub fn new(block_size: usize, content_checksum: bool, content_size: Option<u64>) -> Self {
        let mut flags = Flags::empty();
        if content_checksum {
            flags |= Flags::ContentChecksum;
        }
        if content_size.is_some() {
            flags |= Flags::ContentSize;
        }
        StreamHeader { flags, block_size: block_size as u32, content_size }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut header = Vec::with_capacity(Self::FIXED_LEN + 8 + 1);
        header.extend_from_slice(&MAGIC);
        header.push(VERSION);
        header.push(self.flags.bits());
        // writing into a Vec cannot fail
        let _ = header.write_u32::<LE>(self.block_size);
        if let Some(size) = self.content_size {
            let _ = header.write_u64::<LE>(size);
        }
        let checksum = header_checksum(&header[MAGIC.len()..]);
        header.push(checksum);
        header
    }

    #[throws(io::Error)]
    pub fn write<W: Write>(&self, writer: &mut W) {
        writer.write_all(&self.to_bytes())?;
    }

    /// Parse and validate a header. End of input surfaces as an `UnexpectedEof` I/O error.
    #[throws(HeaderReadError)]
    pub fn read<R: Read>(reader: &mut R) -> Self {
        let mut fixed = [0u8; Self::FIXED_LEN];
        reader.read_exact(&mut fixed)?;

        let mut magic = [0u8; 4];
        magic.copy_from_slice(&fixed[..4]);
        if magic != MAGIC {
            throw!(FormatError::WrongMagic(magic));
        }
        if fixed[4] != VERSION {
            throw!(FormatError::UnsupportedVersion(fixed[4]));
        }
        let flags = Flags::from_bits(fixed[5]).ok_or(FormatError::ReservedFlags(fixed[5]))?;
        let block_size = LE::read_u32(&fixed[6..10]);
        if block_size == 0 || block_size as usize > MAX_BLOCK_SIZE {
            throw!(FormatError::InvalidBlockSize(block_size));
        }

        let mut covered = fixed[4..].to_vec();
        let content_size = if flags.content_size() {
            let mut size = [0u8; 8];
            reader.read_exact(&mut size)?;
            covered.extend_from_slice(&size);
            Some(LE::read_u64(&size))
        } else {
            None
        };

        let mut checksum = [0u8; 1];
        reader.read_exact(&mut checksum)?;
        if checksum[0] != header_checksum(&covered) {
            throw!(FormatError::HeaderChecksum);
        }

        StreamHeader { flags, block_size, content_size }
    }
}

/// Second byte of the XXH32 of everything after the magic.
fn header_checksum(covered: &[u8]) -> u8 {
    (xxh32(covered) >> 8) as u8
}

/// Per-block header. The end marker is only the (zero) first field and never
/// represented as a `BlockHeader`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    pub uncompressed_length: u32,
    /// Length of the payload on the wire, without the stored flag.
    pub compressed_length: u32,
    pub stored: bool,
    pub checksum: u32,
}

impl BlockHeader {
    pub const LEN: usize = 12;

    pub fn to_bytes(&self) -> [u8; Self::LEN] {
        let mut bytes = [0u8; Self::LEN];
        let compressed = if self.stored { self.compressed_length | STORED } else { self.compressed_length };
        LE::write_u32(&mut bytes[0..4], self.uncompressed_length);
        LE::write_u32(&mut bytes[4..8], compressed);
        LE::write_u32(&mut bytes[8..12], self.checksum);
        bytes
    }

    /// Split the wire fields, given the already consumed first one. No validation happens here.
    pub fn from_fields(uncompressed_length: u32, rest: [u8; 8]) -> Self {
        let compressed = LE::read_u32(&rest[0..4]);
        BlockHeader {
            uncompressed_length,
            compressed_length: compressed & !STORED,
            stored: compressed & STORED != 0,
            checksum: LE::read_u32(&rest[4..8]),
        }
    }

    /// Check the lengths against each other and against `limit`, before anything gets allocated.
    #[throws(FormatError)]
    pub fn validate(&self, limit: usize) {
        for &length in &[self.uncompressed_length, self.compressed_length] {
            if length as usize > limit {
                throw!(FormatError::BlockTooLarge { length, limit });
            }
        }
        if self.stored {
            if self.compressed_length != self.uncompressed_length {
                throw!(FormatError::StoredLengthMismatch {
                    stored: self.compressed_length,
                    uncompressed: self.uncompressed_length,
                });
            }
        } else if self.compressed_length == 0 || self.compressed_length >= self.uncompressed_length {
            throw!(FormatError::InvalidCompressedLength {
                compressed: self.compressed_length,
                uncompressed: self.uncompressed_length,
            });
        }
    }

    pub fn payload_len(&self) -> usize {
        self.compressed_length as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn parse(bytes: &[u8]) -> Result<StreamHeader, FormatError> {
        match StreamHeader::read(&mut Cursor::new(bytes)) {
            Ok(h) => Ok(h),
            Err(HeaderReadError::Format(e)) => Err(e),
            Err(HeaderReadError::Io(e)) => panic!("unexpected io error {}", e),
        }
    }

    #[test]
    fn header_roundtrip() {
        for &(checksum, size) in &[(true, Some(11u64)), (false, None), (true, None), (false, Some(0))] {
            let header = StreamHeader::new(1024, checksum, size);
            let bytes = header.to_bytes();
            assert_eq!(&bytes[..4], b"LZ4S");
            assert_eq!(bytes.len(), 11 + if size.is_some() { 8 } else { 0 });
            assert_eq!(parse(&bytes).unwrap(), header);
        }
    }

    #[test]
    fn header_rejects_garbage() {
        let good = StreamHeader::new(1024, true, Some(5)).to_bytes();

        let mut bad = good.clone();
        bad[0] = b'X';
        assert_eq!(parse(&bad), Err(FormatError::WrongMagic(*b"XZ4S")));

        let mut bad = good.clone();
        bad[4] = 2;
        assert_eq!(parse(&bad), Err(FormatError::UnsupportedVersion(2)));

        let mut bad = good.clone();
        bad[5] |= 0x80;
        assert_eq!(parse(&bad), Err(FormatError::ReservedFlags(0x83)));

        let mut bad = good.clone();
        *bad.last_mut().unwrap() ^= 1;
        assert_eq!(parse(&bad), Err(FormatError::HeaderChecksum));

        let mut bad = good.clone();
        bad[9] = 0x10; // block size 256 MiB + 1024
        assert_eq!(parse(&bad), Err(FormatError::InvalidBlockSize(0x1000_0400)));

        let bad = StreamHeader::new(0, false, None).to_bytes();
        assert_eq!(parse(&bad), Err(FormatError::InvalidBlockSize(0)));
    }

    #[test]
    fn short_header_is_eof() {
        let good = StreamHeader::new(1024, true, Some(5)).to_bytes();
        for len in 0..good.len() {
            match StreamHeader::read(&mut Cursor::new(&good[..len])) {
                Err(HeaderReadError::Io(e)) => assert_eq!(e.kind(), io::ErrorKind::UnexpectedEof),
                other => panic!("{} bytes: {:?}", len, other),
            }
        }
    }

    #[test]
    fn read_errors_describe_themselves() {
        use std::error::Error as _;

        let err = StreamHeader::read(&mut Cursor::new(&b"LZ4"[..])).unwrap_err();
        assert_eq!(err.to_string(), "error reading the stream header");
        assert!(err.source().is_some());

        let err = StreamHeader::read(&mut Cursor::new(&b"nope, not a header"[..])).unwrap_err();
        assert_eq!(err.to_string(), FormatError::WrongMagic(*b"nope").to_string());
    }

    #[test]
    fn block_header_fields() {
        let header = BlockHeader { uncompressed_length: 11, compressed_length: 11, stored: true, checksum: 0xDEADBEEF };
        let bytes = header.to_bytes();
        assert_eq!(&bytes[..8], &[11, 0, 0, 0, 11, 0, 0, 0x80]);

        let mut rest = [0u8; 8];
        rest.copy_from_slice(&bytes[4..]);
        assert_eq!(BlockHeader::from_fields(11, rest), header);
        header.validate(1024).unwrap();
    }

    #[test]
    fn block_header_validation() {
        let block = |u, c, stored| BlockHeader { uncompressed_length: u, compressed_length: c, stored, checksum: 0 };

        block(100, 50, false).validate(100).unwrap();
        assert!(matches!(block(101, 50, false).validate(100), Err(FormatError::BlockTooLarge { length: 101, .. })));
        assert!(matches!(block(50, 50, false).validate(100), Err(FormatError::InvalidCompressedLength { .. })));
        assert!(matches!(block(50, 0, false).validate(100), Err(FormatError::InvalidCompressedLength { .. })));
        assert!(matches!(block(50, 49, true).validate(100), Err(FormatError::StoredLengthMismatch { .. })));
        assert!(matches!(block(u32::MAX >> 1, 10, false).validate(100), Err(FormatError::BlockTooLarge { .. })));
    }
}

//! The LZ4S stream format.
//!
//! ```text
//! stream  := header block* end-marker footer?
//! header  := "LZ4S" version:u8 flags:u8 block-size:u32 [content-size:u64] header-checksum:u8
//! block   := uncompressed-length:u32 compressed-length:u32 checksum:u32 payload
//! end     := 0u32
//! footer  := content-checksum:u32
//! ```
//!
//! All integers are little-endian. Every block is compressed independently and carries
//! the XXH32 of its uncompressed bytes, so corruption is caught block by block.

mod compress;
mod decompress;
mod header;

/// The four magic bytes at the start of every stream.
const MAGIC: [u8; 4] = *b"LZ4S";
/// The only layout there is.
const VERSION: u8 = 1;
/// The high bit of the compressed length marks a block stored without compression.
const STORED: u32 = 1 << 31;

/// Largest block size a stream may declare. Also the default allocation cap of the decoder.
pub const MAX_BLOCK_SIZE: usize = 64 * 1024 * 1024;
pub const DEFAULT_BLOCK_SIZE: usize = 8 * 1024 * 1024;

pub use compress::*;
pub use decompress::*;
pub use header::{BlockHeader, Flags, FormatError, HeaderReadError, StreamHeader};

use std::hash::Hasher;
use twox_hash::XxHash32;

/// XXH32 with seed 0, the checksum used for blocks, content and header.
pub fn xxh32(data: &[u8]) -> u32 {
    let mut hasher = XxHash32::with_seed(0);
    hasher.write(data);
    hasher.finish() as u32
}

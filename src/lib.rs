//! Streaming LZ4 block framing.
//!
//! An LZ4S stream chops its content into blocks of a bounded size. Every block is
//! compressed on its own (or stored verbatim when LZ4 can't shrink it) and carries
//! the XXH32 checksum of its uncompressed bytes, so a damaged stream is always reported
//! instead of silently producing wrong output.
//!
//! ```
//! let encoded = lz4s::encode(b"hello world").unwrap();
//! assert_eq!(lz4s::decode(&encoded).unwrap(), b"hello world");
//! ```
//!
//! For data that doesn't fit in memory use [`FrameWriter`] and [`FrameReader`], which
//! work on any `Write`/`Read`. The compression itself sits behind the [`BlockCodec`]
//! trait; the pure Rust [`Lz4`] primitive is used unless another one is supplied.

#![forbid(unsafe_code)]

pub mod codec;
pub mod framed;
pub mod raw;

pub use codec::{BlockCodec, Lz4};
#[cfg(feature = "lz4_flex")]
pub use codec::Lz4Flex;
pub use framed::*;

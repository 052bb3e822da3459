//! The seam between the framing layer and whatever does the actual (de)compression.
//!
//! The frame codec never touches LZ4 sequences itself. It hands each chunk to a
//! [`BlockCodec`], which lets the primitive be swapped for another implementation or
//! replaced by a mock in tests.

use std::error::Error as StdError;

use crate::raw;

/// A block compression primitive.
///
/// Methods take `&mut self` so that implementations may keep working memory around
/// between blocks. A value is never shared: every [`FrameWriter`](crate::FrameWriter) and
/// [`FrameReader`](crate::FrameReader) owns its own primitive.
pub trait BlockCodec {
    type Error: StdError + Send + Sync + 'static;

    /// Compress `input` into `output`, returning the number of bytes written.
    ///
    /// `Ok(None)` means the compressed form did not fit into `output`. The frame writer
    /// sizes `output` one byte shorter than the input, so `None` is the signal to store
    /// the chunk uncompressed.
    fn compress_into(&mut self, input: &[u8], output: &mut [u8]) -> Result<Option<usize>, Self::Error>;

    /// Decompress `input`, appending exactly `expected_len` bytes to `output`.
    ///
    /// Producing any other number of bytes is an error.
    fn decompress_into(&mut self, input: &[u8], expected_len: usize, output: &mut Vec<u8>) -> Result<(), Self::Error>;
}

impl<'a, C: BlockCodec + ?Sized> BlockCodec for &'a mut C {
    type Error = C::Error;

    fn compress_into(&mut self, input: &[u8], output: &mut [u8]) -> Result<Option<usize>, Self::Error> {
        (**self).compress_into(input, output)
    }

    fn decompress_into(&mut self, input: &[u8], expected_len: usize, output: &mut Vec<u8>) -> Result<(), Self::Error> {
        (**self).decompress_into(input, expected_len, output)
    }
}

/// The built-in pure Rust LZ4 block primitive.
#[derive(Clone, Default)]
pub struct Lz4 {
    table: raw::HashTable,
}

impl BlockCodec for Lz4 {
    type Error = raw::DecodeError;

    fn compress_into(&mut self, input: &[u8], output: &mut [u8]) -> Result<Option<usize>, Self::Error> {
        self.table.reset();
        Ok(raw::compress_into(input, &mut self.table, output))
    }

    fn decompress_into(&mut self, input: &[u8], expected_len: usize, output: &mut Vec<u8>) -> Result<(), Self::Error> {
        let start = output.len();
        let result = match raw::decompress_block(input, output, expected_len) {
            Ok(()) if output.len() - start == expected_len => return Ok(()),
            Ok(()) => Err(raw::DecodeError::UnexpectedEnd),
            Err(e) => Err(e),
        };
        output.truncate(start);
        result
    }
}

#[cfg(feature = "lz4_flex")]
pub use self::flex::Lz4Flex;

#[cfg(feature = "lz4_flex")]
mod flex {
    use lz4_flex_crate::block::{self, CompressError, DecompressError};
    use thiserror::Error;

    use super::BlockCodec;

    #[derive(Error, Debug)]
    pub enum Lz4FlexError {
        #[error("lz4_flex failed to compress: {0}")]
        Compress(#[from] CompressError),
        #[error("lz4_flex failed to decompress: {0}")]
        Decompress(#[from] DecompressError),
        #[error("block decompressed to {actual} bytes, expected {expected}")]
        LengthMismatch { expected: usize, actual: usize },
    }

    /// A [`BlockCodec`] backed by the `lz4_flex` crate.
    #[derive(Default)]
    pub struct Lz4Flex {
        scratch: Vec<u8>,
    }

    impl BlockCodec for Lz4Flex {
        type Error = Lz4FlexError;

        fn compress_into(&mut self, input: &[u8], output: &mut [u8]) -> Result<Option<usize>, Self::Error> {
            // lz4_flex wants worst-case room up front, so compress into scratch and copy
            self.scratch.resize(block::get_maximum_output_size(input.len()), 0);
            let written = block::compress_into(input, &mut self.scratch)?;
            if written > output.len() {
                return Ok(None);
            }
            output[..written].copy_from_slice(&self.scratch[..written]);
            Ok(Some(written))
        }

        fn decompress_into(&mut self, input: &[u8], expected_len: usize, output: &mut Vec<u8>) -> Result<(), Self::Error> {
            let start = output.len();
            output.resize(start + expected_len, 0);
            let result = block::decompress_into(input, &mut output[start..]);
            match result {
                Ok(actual) if actual == expected_len => Ok(()),
                Ok(actual) => {
                    output.truncate(start);
                    Err(Lz4FlexError::LengthMismatch { expected: expected_len, actual })
                }
                Err(e) => {
                    output.truncate(start);
                    Err(e.into())
                }
            }
        }
    }
}

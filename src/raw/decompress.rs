//! LZ4 block decompression.

use byteorder::{ReadBytesExt, LE};
use fehler::{throw, throws};
use std::cmp;
use std::io::{Cursor, Read};
use thiserror::Error;

/// Errors produced by the raw block decoder.
///
/// None of these can happen on data produced by [`compress_block`](super::compress_block);
/// they indicate a corrupted or hostile payload.
#[derive(Error, Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum DecodeError {
    /// Expected more bytes, but found none.
    /// Either your input was truncated or you're trying to decompress garbage.
    #[error("the compressed block ended in the middle of a sequence")]
    UnexpectedEnd,
    /// A back-reference points before the start of the block (or is zero).
    #[error("back-reference offset {0} is out of bounds")]
    InvalidOffset(usize),
    /// The last sequence has a nonzero match length but no match follows.
    #[error("the last sequence announces a match that never comes")]
    DanglingMatch,
    /// The block expands to more bytes than the caller allowed.
    #[error("block decompresses to more than {0} bytes")]
    OutputOverflow(usize),
}
type Error = DecodeError;

/// Reads the extension bytes of an LSIC-encoded length.
/// A nibble of 0xF means "keep adding bytes until one of them is not 0xFF".
#[throws]
fn read_lsic(initial: u8, cursor: &mut Cursor<&[u8]>) -> usize {
    let mut value = initial as usize;
    if value == 0xF {
        loop {
            let more = cursor.read_u8().map_err(|_| Error::UnexpectedEnd)?;
            value = value.saturating_add(more as usize);
            if more != 0xFF {
                break;
            }
        }
    }
    value
}

/// Decompress one LZ4 block, appending the result to `output`.
///
/// Back-references may only point into bytes produced by this call; whatever `output`
/// held before is not part of the lookback window. At most `limit` bytes are appended,
/// so a hostile length field cannot make us allocate more than the caller planned for.
#[throws]
pub fn decompress_block(input: &[u8], output: &mut Vec<u8>, limit: usize) {
    let base = output.len();
    let mut reader = Cursor::new(input);
    loop {
        let token = match reader.read_u8() {
            Ok(x) => x,
            Err(_) => break,
        };

        let literal_length = read_lsic(token >> 4, &mut reader)?;
        let literal_start = output.len();
        // output.len() - base never exceeds limit, so these subtractions can't wrap
        if literal_length > limit - (literal_start - base) {
            throw!(Error::OutputOverflow(limit));
        }
        output.resize(literal_start + literal_length, 0);
        reader.read_exact(&mut output[literal_start..]).map_err(|_| Error::UnexpectedEnd)?;

        // the last sequence of a block carries literals only, with a zero match nibble
        if reader.position() as usize == input.len() {
            if token & 0xF != 0 {
                throw!(Error::DanglingMatch);
            }
            break;
        }

        let offset = reader.read_u16::<LE>().map_err(|_| Error::UnexpectedEnd)? as usize;
        let match_len = read_lsic(token & 0xF, &mut reader)?.saturating_add(4);
        if offset == 0 || offset > output.len() - base {
            throw!(Error::InvalidOffset(offset));
        }
        if match_len > limit - (output.len() - base) {
            throw!(Error::OutputOverflow(limit));
        }
        copy_overlapping(offset, match_len, output);
    }
}

/// Appends `match_len` bytes copied from `offset` bytes back. The source and destination
/// may overlap, which is how LZ4 encodes runs.
fn copy_overlapping(offset: usize, match_len: usize, output: &mut Vec<u8>) {
    let old_len = output.len();
    match offset {
        // a single repeated byte
        1 => output.resize(old_len + match_len, output[old_len - 1]),

        o if match_len <= o => {
            output.resize(old_len + match_len, 0);
            let (head, tail) = output.split_at_mut(old_len);
            tail.copy_from_slice(&head[old_len - offset..][..match_len]);
        }
        2 | 4 | 8 => {
            // short periods divide 16, so fill a 16 byte pattern and stamp it out
            let mut pattern = [0u8; 16];
            for chunk in pattern.chunks_mut(offset) {
                chunk.copy_from_slice(&output[old_len - offset..][..offset]);
            }
            output.resize(old_len + match_len, 0);
            for target in output[old_len..].chunks_mut(pattern.len()) {
                target.copy_from_slice(&pattern[..target.len()]);
            }
        }
        _ => {
            output.reserve(match_len);
            for i in 0..match_len {
                let b = output[old_len - offset + i];
                output.push(b);
            }
        }
    }
}

/// Decompress a whole block into a fresh vector, allowing at most `limit` output bytes.
#[throws]
pub fn decompress(input: &[u8], limit: usize) -> Vec<u8> {
    let mut vec = Vec::with_capacity(cmp::min(limit, input.len().saturating_mul(4)));
    decompress_block(input, &mut vec, limit)?;
    vec
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIMIT: usize = 1 << 20;

    #[test]
    fn run_of_a() {
        assert_eq!(decompress(&[0x11, b'a', 1, 0], LIMIT).unwrap(), b"aaaaaa");
    }

    #[test]
    fn multiple_repeated_sequences() {
        assert_eq!(
            decompress(&[0x11, b'a', 1, 0, 0x22, b'b', b'c', 2, 0], LIMIT).unwrap(),
            b"aaaaaabcbcbcbc"
        );
    }

    #[test]
    fn all_literal() {
        assert_eq!(decompress(&[0x30, b'a', b'4', b'9'], LIMIT).unwrap(), b"a49");
    }

    #[test]
    fn empty_block() {
        assert_eq!(decompress(&[], LIMIT).unwrap(), b"");
    }

    #[test]
    fn offset_out_of_bounds() {
        assert_eq!(decompress(&[0x10, b'a', 2, 0], LIMIT), Err(DecodeError::InvalidOffset(2)));
        assert_eq!(decompress(&[0x10, b'a', 0, 0], LIMIT), Err(DecodeError::InvalidOffset(0)));
    }

    #[test]
    fn truncated_sequences() {
        assert_eq!(decompress(&[0x40, b'a'], LIMIT), Err(DecodeError::UnexpectedEnd));
        assert_eq!(decompress(&[0x11, b'a', 1], LIMIT), Err(DecodeError::UnexpectedEnd));
        assert_eq!(decompress(&[0xF0], LIMIT), Err(DecodeError::UnexpectedEnd));
    }

    #[test]
    fn last_sequence_has_no_match_length() {
        assert_eq!(decompress(&[0x50, b'a', b'b', b'c', b'd', b'e'], LIMIT).unwrap(), b"abcde");
        assert_eq!(decompress(&[0x51, b'a', b'b', b'c', b'd', b'e'], LIMIT), Err(DecodeError::DanglingMatch));
        assert_eq!(decompress(&[0x0F], LIMIT), Err(DecodeError::DanglingMatch));
    }

    #[test]
    fn limit_is_enforced() {
        assert_eq!(decompress(&[0x30, b'a', b'b', b'c'], 2), Err(DecodeError::OutputOverflow(2)));
        assert_eq!(decompress(&[0x1F, b'a', 1, 0, 0xFF, 0xFF, 0x00], 100), Err(DecodeError::OutputOverflow(100)));
    }

    #[test]
    fn prior_output_is_not_a_window() {
        let mut out = b"xyz".to_vec();
        assert_eq!(decompress_block(&[0x00, 3, 0], &mut out, LIMIT), Err(DecodeError::InvalidOffset(3)));
    }
}

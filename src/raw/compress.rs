//! LZ4 block compression.
//!
//! Duplicates are found through a hash table indexed by the next few input bytes.
//! Memory use is fixed (16 KiB of table) no matter how large the block is.

use byteorder::{ByteOrder, NativeEndian, WriteBytesExt, LE};
use cfg_if::cfg_if;
use fehler::throws;
use std::cmp;
use std::io::{self, ErrorKind, Write};
use std::mem;

type Error = io::Error;

const HASHLOG: usize = 12;
const TABLE_SIZE: usize = 1 << HASHLOG;
const MINMATCH: usize = 4;
/// The format requires the last five bytes of a block to be literals
/// and the last match to start at least twelve bytes before the end.
const LAST_LITERALS: usize = 5;
const MFLIMIT: usize = 12;
const MAX_DISTANCE: usize = 0xFFFF;

const ACCELERATION: usize = 1;
/// For each 64 failed probes, the probe step grows by one.
const SKIP_TRIGGER: usize = 6;

/// Working memory of the compressor.
///
/// A table maps hashes of input positions to the most recent position with that hash.
/// Positions are stored as `u32`, so a single block may be at most 4 GiB.
#[derive(Clone)]
pub struct HashTable {
    slots: Box<[u32; TABLE_SIZE]>,
}

impl Default for HashTable {
    fn default() -> Self {
        HashTable { slots: Box::new([0; TABLE_SIZE]) }
    }
}

impl HashTable {
    /// Forget every position, so the table can be reused for an unrelated block.
    pub fn reset(&mut self) {
        for slot in self.slots.iter_mut() {
            *slot = 0;
        }
    }

    /// Record `position` and return the position previously stored under the same hash.
    fn replace(&mut self, input: &[u8], position: usize) -> usize {
        let mut value = position as u32;
        mem::swap(&mut self.slots[hash_at(&input[position..])], &mut value);
        value as usize
    }
}

cfg_if! {
    if #[cfg(target_pointer_width = "64")] {
        // hash five bytes out of a 64 bit read; zero only happens near the very end,
        // where matches are not allowed anyway
        fn hash_at(input: &[u8]) -> usize {
            let v = input.get(..8).map(NativeEndian::read_u64).unwrap_or(0);
            #[cfg(target_endian = "little")] fn mix(v: u64) -> u64 { (v << 24).wrapping_mul(889523592379) }
            #[cfg(target_endian = "big")] fn mix(v: u64) -> u64 { (v >> 24).wrapping_mul(11400714785074694791) }
            (mix(v) >> (64 - HASHLOG)) as usize
        }
    } else {
        fn hash_at(input: &[u8]) -> usize {
            let v = input.get(..4).map(NativeEndian::read_u32).unwrap_or(0);
            (v.wrapping_mul(2654435761) >> (32 - HASHLOG)) as usize
        }
    }
}

/// A back-reference, as it ends up on the wire.
#[derive(Copy, Clone, Debug)]
struct Duplicate {
    /// How many bytes before the cursor the duplicate starts.
    offset: u16,
    /// Match length beyond the mandatory `MINMATCH` bytes.
    extra_bytes: usize,
}

fn count_matching_bytes(a: &[u8], b: &[u8]) -> usize {
    const REGSIZE: usize = mem::size_of::<usize>();
    fn read_usize(b: &[u8]) -> usize {
        let mut buf = [0u8; REGSIZE];
        buf.copy_from_slice(&b[..REGSIZE]);
        usize::from_le_bytes(buf)
    }

    let mut matching = 0;
    for (a, b) in a.chunks_exact(REGSIZE).zip(b.chunks_exact(REGSIZE)) {
        let xor = read_usize(a) ^ read_usize(b);
        if xor != 0 {
            // little-endian reads, so the first differing byte is in the low bits
            return matching + (xor.trailing_zeros() / 8) as usize;
        }
        matching += REGSIZE;
    }

    matching + a[matching..].iter().zip(&b[matching.min(b.len())..]).take_while(|&(a, b)| a == b).count()
}

fn lsic_nibble(value: usize) -> u8 {
    cmp::min(value, 0xF) as u8
}

#[throws]
fn write_lsic_tail<W: Write>(writer: &mut W, mut value: usize) {
    if value < 0xF {
        return;
    }
    value -= 0xF;
    while value >= 0xFF {
        writer.write_u8(0xFF)?;
        value -= 0xFF;
    }
    writer.write_u8(value as u8)?;
}

#[throws]
fn write_sequence<W: Write>(writer: &mut W, literal: &[u8], duplicate: Option<Duplicate>) {
    let extra = duplicate.map_or(0, |d| d.extra_bytes);
    writer.write_u8(lsic_nibble(literal.len()) << 4 | lsic_nibble(extra))?;
    write_lsic_tail(writer, literal.len())?;
    writer.write_all(literal)?;
    if let Some(duplicate) = duplicate {
        writer.write_u16::<LE>(duplicate.offset)?;
        write_lsic_tail(writer, duplicate.extra_bytes)?;
    }
}

/// Compress `input` as one independent LZ4 block.
///
/// The table must be fresh (or [`reset`](HashTable::reset)) since positions from a previous
/// block would point at unrelated data.
#[throws]
pub fn compress_block<W: Write>(input: &[u8], table: &mut HashTable, mut writer: W) {
    assert!(input.len() <= u32::MAX as usize, "LZ4 blocks are limited to 4 GiB");

    let mut cursor = 0;
    while cursor < input.len() {
        let literal_start = cursor;
        let mut step_counter = ACCELERATION << SKIP_TRIGGER;
        let mut step = 1;

        let duplicate = loop {
            if input.len().saturating_sub(cursor) < MFLIMIT {
                write_sequence(&mut writer, &input[literal_start..], None)?;
                return;
            }

            let current = &input[cursor..input.len() - LAST_LITERALS];
            let candidate = table.replace(input, cursor);

            // position zero is also what an empty slot reads as, so it can't match itself
            if cursor != 0 && cursor - candidate <= MAX_DISTANCE {
                let matching = count_matching_bytes(current, &input[candidate..]);
                if let Some(mut extra_bytes) = matching.checked_sub(MINMATCH) {
                    let offset = (cursor - candidate) as u16;

                    // grow the match backwards into the pending literals
                    let backtrack = input[literal_start..cursor]
                        .iter()
                        .rev()
                        .zip(input[..candidate].iter().rev())
                        .take_while(|&(a, b)| a == b)
                        .count();
                    extra_bytes += backtrack;
                    cursor += matching;

                    table.replace(input, cursor - 2);
                    break Duplicate { offset, extra_bytes };
                }
            }

            cursor += step;
            step = step_counter >> SKIP_TRIGGER;
            if literal_start + 1 != cursor {
                step_counter += 1;
            }
        };

        let literal_end = cursor - duplicate.extra_bytes - MINMATCH;
        write_sequence(&mut writer, &input[literal_start..literal_end], Some(duplicate))?;
    }
}

/// Compress into a fixed buffer. Returns `None` if the block does not fit,
/// which is how callers detect incompressible data.
pub fn compress_into(input: &[u8], table: &mut HashTable, output: &mut [u8]) -> Option<usize> {
    let capacity = output.len();
    let mut sink = BoundedSink(output);
    match compress_block(input, table, &mut sink) {
        Ok(()) => Some(capacity - sink.0.len()),
        Err(e) => {
            debug_assert_eq!(e.kind(), ErrorKind::WriteZero);
            None
        }
    }
}

/// Compress into a new vector with a throwaway table.
pub fn compress(input: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(max_compressed_size(input.len()));
    let mut table = HashTable::default();
    // writing into a Vec cannot fail
    let _ = compress_block(input, &mut table, &mut out);
    out
}

/// Upper bound of the compressed size of `input_len` bytes.
pub fn max_compressed_size(input_len: usize) -> usize {
    input_len + input_len / 255 + 16
}

/// A `Write` over a byte slice that refuses partial writes.
///
/// `Write for &mut [u8]` writes as many bytes as fit before failing, which forces every
/// multi-byte write into byte-sized range checks. We throw the whole buffer away when it
/// overflows, so all-or-nothing is enough.
struct BoundedSink<'a>(&'a mut [u8]);

impl<'a> Write for BoundedSink<'a> {
    #[inline]
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if self.0.len() < data.len() {
            return Err(ErrorKind::WriteZero.into());
        }
        let (head, tail) = mem::replace(&mut self.0, &mut []).split_at_mut(data.len());
        head.copy_from_slice(data);
        self.0 = tail;
        Ok(data.len())
    }

    #[inline]
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raw::decompress;
    use std::str;

    fn inverse(s: &str) {
        let compressed = compress(s.as_bytes());
        let decompressed = decompress(&compressed, s.len()).unwrap();
        assert_eq!(str::from_utf8(&decompressed).unwrap(), s);
    }

    #[test]
    fn shakespeare() {
        inverse("to live or not to live");
        inverse("Love is a wonderful terrible thing");
        inverse("There is nothing either good or bad, but thinking makes it so.");
        inverse("I burn, I pine, I perish.");
    }

    #[test]
    fn short() {
        inverse("");
        inverse("x");
        inverse("ahd");
        inverse("ahhd");
        inverse("ajsdh");
        inverse("hello world");
    }

    #[test]
    fn nulls() {
        inverse("\0\0\0\0\0\0\0\0\0\0\0\0\0");
        inverse(&"\0".repeat(100_000));
    }

    #[test]
    fn compression_works() {
        let s = "The Read trait allows for reading bytes from a source. Implementors of the Read trait are called 'readers'. Readers are defined by one required method, read().";
        inverse(s);
        assert!(compress(s.as_bytes()).len() < s.len());
    }

    #[test]
    fn long_literal_and_match_lengths() {
        let mut s = String::new();
        for i in 0..300 {
            s.push((b'!' + (i * 7 % 90) as u8) as char);
        }
        s.push_str(&"abcd".repeat(1000));
        inverse(&s);
    }

    #[test]
    fn large_periodic_input() {
        let s: Vec<u8> = (0..2_000_000u32).map(|n| (n as u8).wrapping_mul(0xA).wrapping_add(33) ^ 0xA2).collect();
        let compressed = compress(&s);
        assert!(compressed.len() < s.len() / 10);
        assert_eq!(decompress(&compressed, s.len()).unwrap(), s);
    }

    #[test]
    fn bounded_output_reports_overflow() {
        let input = b"as6yhol.;jrew5tyuikbfewedfyjltre22459ba";
        let mut table = HashTable::default();
        let mut out = vec![0u8; input.len() - 1];
        assert_eq!(compress_into(input, &mut table, &mut out), None);

        table.reset();
        let input = [7u8; 4096];
        let mut out = vec![0u8; input.len() - 1];
        let n = compress_into(&input, &mut table, &mut out).unwrap();
        assert_eq!(decompress(&out[..n], input.len()).unwrap(), &input[..]);
    }
}

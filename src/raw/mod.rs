//! The raw LZ4 block format.
//!
//! A raw block is nothing but LZ4 sequences: no length, no checksum and no way to tell
//! how large the output is going to be. The framing in [`crate::framed`] adds all of that,
//! plus the fallback to storing incompressible data verbatim.

mod compress;
mod decompress;

pub use compress::*;
pub use decompress::*;

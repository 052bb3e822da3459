use fehler::{throw, throws};
use lz4s::EncodeSettings;
use std::fs::File;
use std::{env, io};
use tracing_subscriber::EnvFilter;

/// Usage: pack <input> <output> [block size in KiB]
///
/// Set `RUST_LOG=lz4s=trace` to watch every block go by.
#[throws(io::Error)]
fn main() {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).with_writer(io::stderr).init();

    let mut args = env::args().skip(1);
    let (filename_in, filename_out) = match (args.next(), args.next()) {
        (Some(i), Some(o)) => (i, o),
        _ => throw!(io::Error::new(io::ErrorKind::InvalidInput, "usage: pack <input> <output> [block KiB]")),
    };
    let block_size = match args.next() {
        Some(s) => block_size_from_kib(&s)?,
        None => 4096 * 1024,
    };

    let file_in = File::open(filename_in)?;
    let size = file_in.metadata()?.len();
    let file_out = File::create(filename_out)?;

    EncodeSettings::default()
        .block_size(block_size)
        .content_checksum(true)
        .content_size(Some(size))
        .compress(file_in, file_out)?;
}

/// Parse a block size given in KiB. Overflow is reported, the settings check the range.
#[throws(io::Error)]
fn block_size_from_kib(arg: &str) -> usize {
    let kib = arg.parse::<usize>().map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    match kib.checked_mul(1024) {
        Some(bytes) => bytes,
        None => throw!(io::Error::new(io::ErrorKind::InvalidInput, "block size is too large")),
    }
}

use lz4s::DecodeSettings;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};
use std::env;
use tracing_subscriber::EnvFilter;

fn main() -> io::Result<()> {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).with_writer(io::stderr).init();

    let mut args = env::args().skip(1);
    let (filename_in, filename_out) = match (args.next(), args.next()) {
        (Some(i), Some(o)) => (i, o),
        _ => return Err(io::Error::new(io::ErrorKind::InvalidInput, "usage: unpack <input> <output>")),
    };
    let file_in = BufReader::new(File::open(filename_in)?);
    let file_out = File::create(filename_out)?;

    let mut reader = DecodeSettings::default().reader(file_in)?.into_read();
    let mut buf_writer = BufWriter::with_capacity(32 * 1024, file_out);
    io::copy(&mut reader, &mut buf_writer)?;
    buf_writer.flush()?;

    Ok(())
}

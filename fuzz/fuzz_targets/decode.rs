#![no_main]
use libfuzzer_sys::fuzz_target;
use lz4s::{DecodeSettings, FrameReader};
use std::io::Read;

fuzz_target!(|data: &[u8]| {
    // random bytes are almost never a valid stream, errors are expected.
    // what we care about is that nothing panics or allocates without bound
    let _ = lz4s::decode(data);

    let mut settings = DecodeSettings::default();
    settings.max_block_size(1 << 16).require_end_mark(false);
    if let Ok(reader) = FrameReader::with_codec(data, lz4s::Lz4::default(), &settings) {
        let mut output = Vec::new();
        let _ = reader.into_read().read_to_end(&mut output);
    }
});

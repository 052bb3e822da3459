#![no_main]
use libfuzzer_sys::fuzz_target;
use lz4s::EncodeSettings;
use std::io::{Read, Write};

fuzz_target!(|data: &[u8]| {
    // first byte picks the block size so short blocks get exercised as well
    let block_size = data.first().map_or(1, |&b| b as usize * 16 + 1);

    let mut settings = EncodeSettings::default();
    settings.block_size(block_size).content_checksum(true);
    let encoded = settings.encode(data).expect("Could not compress input data");
    assert_eq!(lz4s::decode(&encoded).expect("Could not decode stream"), data);

    let mut writer = settings.writer(Vec::new()).expect("Could not create frame writer");
    for chunk in data.chunks(block_size / 2 + 1) {
        writer.write_all(chunk).expect("Could not write chunk");
    }
    let streamed = writer.finish().expect("Could not finish stream");

    let mut roundtripped = Vec::new();
    lz4s::FrameReader::new(&streamed[..])
        .expect("Could not create frame reader")
        .into_read()
        .read_to_end(&mut roundtripped)
        .expect("Could not read decompressed data");
    assert!(roundtripped.iter().eq(data));
});

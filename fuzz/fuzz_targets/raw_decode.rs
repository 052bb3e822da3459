#![no_main]
use libfuzzer_sys::fuzz_target;
use lz4s::raw;

fuzz_target!(|data: &[u8]| {
    if let Ok(output) = raw::decompress(data, 1 << 20) {
        assert!(output.len() <= 1 << 20);
    }
});

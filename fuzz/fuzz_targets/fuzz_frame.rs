//! Fuzz target for frame decoding.
//!
//! Arbitrary client text must never panic the decoder, and anything it
//! accepts must survive a re-encode.

#![no_main]

use libfuzzer_sys::fuzz_target;
use termbridge::Frame;

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    if let Ok(frame) = Frame::decode(text) {
        let encoded = frame.encode().expect("decoded frame must encode");
        assert_eq!(Frame::decode(&encoded).ok(), Some(frame));
    }
});

#![no_main]

use libfuzzer_sys::fuzz_target;
use popp::definitions::Message;

fuzz_target!(|data: &[u8]| {
    if let Ok(frame) = std::str::from_utf8(data) {
        let _ = Message::from_json(frame);
    }
});

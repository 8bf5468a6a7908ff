#![no_main]

use libfuzzer_sys::fuzz_target;
use popp::definitions::apdu::{Command, Response};

fuzz_target!(|data: &[u8]| {
    if let Ok(command) = Command::try_from(data) {
        assert_eq!(Command::try_from(command.to_bytes().as_slice()), Ok(command));
    }
    let _ = Response::try_from(data);
});

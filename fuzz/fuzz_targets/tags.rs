#![no_main]

use empath_core::tags::TagStore;
use libfuzzer_sys::fuzz_target;

// The tag store is the one value that crosses the privilege boundary raw
// (§6 wire framing); a malformed buffer must decode to an error, never panic.
fuzz_target!(|data: &[u8]| {
    let _ = TagStore::decode(data);
});

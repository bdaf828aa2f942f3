#![no_main]

use empath_core::mail::Mail;
use libfuzzer_sys::fuzz_target;

// Unfold/fold must stay idempotent and never panic regardless of how a
// message happens to be wrapped (§4.1 "unfold"/"fold" normalization).
fuzz_target!(|data: &[u8]| {
    let body = String::from_utf8_lossy(data).into_owned();
    let mut mail = Mail::new(body);
    mail.unfold();
    mail.unfold();
    mail.fold();
    mail.fold();
});

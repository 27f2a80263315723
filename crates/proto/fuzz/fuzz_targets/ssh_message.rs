//! Fuzz target for SSH message decoding.
//!
//! Reads every wire type out of random payloads and runs the KEXINIT
//! parser over them. Nothing may panic; malformed input must surface as
//! `Truncated` or `Protocol` errors.
//!
//! Run with:
//! ```bash
//! cd crates/proto
//! cargo +nightly fuzz run ssh_message -- -max_total_time=300
//! ```

#![no_main]
use kestrel_proto::ssh::kex::KexInit;
use kestrel_proto::ssh::message::Message;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let mut m = Message::from_bytes(data);
    let _ = m.get_byte();
    let _ = KexInit::from_message(&mut m);

    let mut m = Message::from_bytes(data);
    while m.get_text().is_ok() {}
    let _ = m.get_mpint();
    let _ = m.get_list();
    let _ = m.get_int64();
    let _ = m.get_boolean();
    let _ = m.get_remainder();
});

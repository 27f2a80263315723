//! Fuzz target for SSH packet parsing.
//!
//! Feeds random input to both the frame parser and a packetizer reading
//! plaintext, looking for panics, runaway allocation and infinite loops.
//!
//! Run with:
//! ```bash
//! cd crates/proto
//! cargo +nightly fuzz run ssh_packet -- -max_total_time=300
//! ```

#![no_main]
use kestrel_proto::ssh::packet::{BufferedStream, Packet, Packetizer};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // A frame that parses must serialize back to the same payload
    if let Ok(packet) = Packet::from_bytes(data) {
        let serialized = packet.to_bytes();
        let reparsed = Packet::from_bytes(&serialized).expect("Round-trip parsing should never fail");
        assert_eq!(packet.payload(), reparsed.payload());
    }

    let mut stream = BufferedStream::new();
    stream.feed(data);
    stream.set_eof();
    let mut packetizer = Packetizer::new(stream);
    // every read consumes input or fails, so this terminates
    for _ in 0..data.len() + 1 {
        if packetizer.read_message().is_err() {
            break;
        }
    }
});

#![no_main]

use libfuzzer_sys::fuzz_target;
use packet_protocol::core::packet::Packet;
use packet_protocol::packet;
use packet_protocol::protocol::{Dispatcher, PacketRegistry};
use std::collections::BTreeMap;
use std::io::Cursor;

packet! {
    #[derive(Debug, Default)]
    pub struct Probe {
        #[max_length(12)]
        pub label: String,
        #[max_length(6)]
        pub values: Vec<u32>,
        #[max_length(3)]
        pub flags: BTreeMap<char, bool>,
    }
}

fuzz_target!(|data: &[u8]| {
    // Arbitrary bodies must end in an error or a clean close, never a panic
    let mut dispatcher = Dispatcher::new(PacketRegistry::shared());
    if dispatcher.register_handler::<Probe, _>(|_| {}).is_err() {
        return;
    }
    let mut stream = Probe::packet_id().as_bytes().to_vec();
    stream.extend_from_slice(data);
    let _ = dispatcher.run(&mut Cursor::new(stream));
});

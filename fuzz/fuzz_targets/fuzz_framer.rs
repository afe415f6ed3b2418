#![no_main]

use bytes::BytesMut;
use libfuzzer_sys::fuzz_target;
use takstream::{CotCodec, CotEvent, Framer};
use tokio_util::codec::Decoder;

fuzz_target!(|data: &[u8]| {
    // Text framer: never panics and never grows the input
    if let Ok(text) = std::str::from_utf8(data) {
        let (messages, rest) = Framer::default().extract(text);
        for message in &messages {
            assert!(message.len() <= text.len());
            let _ = CotEvent::parse(message);
        }
        assert!(rest.len() <= text.len());
    }

    // Byte codec: must never panic or loop on arbitrary input
    let mut codec = CotCodec::default();
    let mut buf = BytesMut::from(data);
    while let Ok(Some(_)) = codec.decode(&mut buf) {}
    let _ = codec.decode_eof(&mut buf);
});

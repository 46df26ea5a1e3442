#![no_main]

use bytes::BytesMut;
use fraiseql_tunnel::protocol::next_reply;
use libfuzzer_sys::fuzz_target;

// Startup-phase backend traffic, possibly several messages per segment.
fuzz_target!(|data: &[u8]| {
    let mut buf = BytesMut::from(data);

    loop {
        let before = buf.len();
        match next_reply(&mut buf) {
            Ok(Some(_)) => assert!(buf.len() < before, "reply consumed nothing"),
            Ok(None) => {
                assert_eq!(buf.len(), before, "partial reply consumed bytes");
                break;
            }
            Err(_) => break,
        }
    }
});

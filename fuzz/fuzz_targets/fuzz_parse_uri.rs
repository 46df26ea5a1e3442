#![no_main]

use fraiseql_tunnel::client::{sanitize_uri, ConnectionUri};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|input: &str| {
    let sanitized = sanitize_uri(input);
    assert_eq!(sanitize_uri(&sanitized), sanitized);

    let Ok(uri) = ConnectionUri::parse(input) else {
        return;
    };
    let _ = uri.ssl_mode();

    if uri.password().is_some() {
        assert!(uri.sanitize().contains("**sanitizedPassword**"));
    }

    let moved = uri.change_host_and_port("127.0.0.1", 4242);
    assert_eq!(moved.user(), uri.user());
    assert_eq!(moved.password(), uri.password());
    assert_eq!(moved.database(), uri.database());
    assert_eq!(moved.port(), Some(4242));
});

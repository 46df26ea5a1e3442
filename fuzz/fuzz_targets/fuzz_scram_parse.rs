#![no_main]

use fraiseql_tunnel::auth::ScramClient;
use libfuzzer_sys::arbitrary::{Arbitrary, Unstructured};
use libfuzzer_sys::fuzz_target;

#[derive(Debug)]
struct Exchange {
    user: String,
    password: String,
    server_first: String,
    server_final: String,
}

impl<'a> Arbitrary<'a> for Exchange {
    fn arbitrary(u: &mut Unstructured<'a>) -> libfuzzer_sys::arbitrary::Result<Self> {
        Ok(Self {
            user: u.arbitrary()?,
            password: u.arbitrary()?,
            server_first: u.arbitrary()?,
            server_final: u.arbitrary()?,
        })
    }
}

fuzz_target!(|exchange: Exchange| {
    let client = ScramClient::new(exchange.user, exchange.password);
    assert!(client.client_first().starts_with("n,,n="));

    if let Ok((_, state)) = client.client_final(&exchange.server_first) {
        let _ = client.verify_server_final(&exchange.server_final, &state);
    }
});

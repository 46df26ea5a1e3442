//! Client packets sent before `ReadyForQuery`

use bytes::{BufMut, BytesMut};

/// Protocol 3.0
pub const PROTOCOL_3_0: i32 = 196_608;

/// `1234 << 16 | 5679`
pub const SSL_REQUEST: i32 = 80_877_103;

/// Write `tag`, a length placeholder, the body, then patch the length in.
///
/// Untagged packets (startup, SSLRequest) pass `None`.
fn packet(out: &mut BytesMut, tag: Option<u8>, body: impl FnOnce(&mut BytesMut)) {
    if let Some(tag) = tag {
        out.put_u8(tag);
    }
    let at = out.len();
    out.put_i32(0);
    body(out);
    let len = (out.len() - at) as i32;
    out[at..at + 4].copy_from_slice(&len.to_be_bytes());
}

fn put_cstr(out: &mut BytesMut, s: &str) {
    out.put_slice(s.as_bytes());
    out.put_u8(0);
}

/// SSLRequest
pub fn ssl_request(out: &mut BytesMut) {
    packet(out, None, |b| b.put_i32(SSL_REQUEST));
}

/// StartupMessage with `name`/`value` parameters
pub fn startup<'a>(out: &mut BytesMut, params: impl IntoIterator<Item = (&'a str, &'a str)>) {
    packet(out, None, |b| {
        b.put_i32(PROTOCOL_3_0);
        for (name, value) in params {
            put_cstr(b, name);
            put_cstr(b, value);
        }
        b.put_u8(0);
    });
}

/// PasswordMessage carrying a cleartext password
pub fn password(out: &mut BytesMut, password: &str) {
    packet(out, Some(b'p'), |b| put_cstr(b, password));
}

/// SASLInitialResponse
pub fn sasl_initial(out: &mut BytesMut, mechanism: &str, data: &[u8]) {
    packet(out, Some(b'p'), |b| {
        put_cstr(b, mechanism);
        b.put_i32(data.len() as i32);
        b.put_slice(data);
    });
}

/// SASLResponse
pub fn sasl_response(out: &mut BytesMut, data: &[u8]) {
    packet(out, Some(b'p'), |b| b.put_slice(data));
}

/// Terminate
pub fn terminate(out: &mut BytesMut) {
    packet(out, Some(b'X'), |_| {});
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ssl_request_bytes() {
        let mut out = BytesMut::new();
        ssl_request(&mut out);
        assert_eq!(&out[..], &[0, 0, 0, 8, 0x04, 0xD2, 0x16, 0x2F]);
    }

    #[test]
    fn test_startup_layout() {
        let mut out = BytesMut::new();
        startup(&mut out, [("user", "app"), ("database", "app")]);

        assert_eq!(&out[..4], &(out.len() as i32).to_be_bytes());
        assert_eq!(&out[4..8], &[0, 3, 0, 0]);
        assert_eq!(&out[8..], b"user\0app\0database\0app\0\0");
    }

    #[test]
    fn test_tagged_length_excludes_tag() {
        let mut out = BytesMut::new();
        password(&mut out, "secret");
        assert_eq!(out[0], b'p');
        assert_eq!(&out[1..5], &11i32.to_be_bytes());
        assert_eq!(&out[5..], b"secret\0");
    }

    #[test]
    fn test_sasl_initial_prefixes_data_length() {
        let mut out = BytesMut::new();
        sasl_initial(&mut out, "SCRAM-SHA-256", b"n,,n=,r=abc");
        let body = &out[5..];
        assert!(body.starts_with(b"SCRAM-SHA-256\0"));
        assert_eq!(&body[14..18], &11i32.to_be_bytes());
        assert_eq!(&body[18..], b"n,,n=,r=abc");
    }

    #[test]
    fn test_packets_append() {
        let mut out = BytesMut::new();
        sasl_response(&mut out, b"c=biws");
        terminate(&mut out);
        assert_eq!(out.len(), 11 + 5);
        assert_eq!(&out[11..], &[b'X', 0, 0, 0, 4]);
    }
}

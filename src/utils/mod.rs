pub mod config;
pub mod ip;
pub mod notify;
pub mod peer_id;

/// Lowercase hex rendering of raw bytes, the conventional display form of
/// 20-byte hashes.
pub fn hex(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut ret = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        write!(ret, "{byte:02x}").unwrap();
    }
    ret
}

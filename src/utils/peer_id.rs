use rand::distr::Alphanumeric;
use rand::Rng;
use std::fmt;

/// Client tag in the conventional `-XXnnnn-` form, derived from the crate
/// version.
const CLIENT_TAG: &str = concat!(
    "-LT",
    env!("CARGO_PKG_VERSION_MAJOR"),
    env!("CARGO_PKG_VERSION_MINOR"),
    env!("CARGO_PKG_VERSION_PATCH"),
    "-",
);

/// 20-byte identity presented to trackers: the client tag followed by a
/// random alphanumeric tail.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PeerId([u8; 20]);

impl PeerId {
    pub fn generate() -> Self {
        let mut rng = rand::rng();
        let mut id = [0u8; 20];
        id[..CLIENT_TAG.len()].copy_from_slice(CLIENT_TAG.as_bytes());
        for byte in &mut id[CLIENT_TAG.len()..] {
            *byte = rng.sample(Alphanumeric);
        }
        Self(id)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl From<[u8; 20]> for PeerId {
    fn from(raw: [u8; 20]) -> Self {
        Self(raw)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // foreign peer ids may contain arbitrary bytes, mask the unprintable ones
        for &byte in &self.0 {
            let shown = if byte.is_ascii_graphic() { byte as char } else { '.' };
            fmt::Write::write_char(f, shown)?;
        }
        Ok(())
    }
}

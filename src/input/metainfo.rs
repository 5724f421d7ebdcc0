use crate::benc;
use sha1_smol::Sha1;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::{io, str};

/// Low-level representation of a parsed metainfo file.
pub struct Metainfo {
    root: BTreeMap<String, benc::Element>,
    info: BTreeMap<String, benc::Element>,
    info_hash: [u8; 20],
}

impl Metainfo {
    /// Read and parse a metainfo file.
    pub fn from_file(metainfo_file: impl AsRef<Path>) -> io::Result<Self> {
        let bencode = benc::Element::from_file(metainfo_file)?;
        if log::log_enabled!(log::Level::Debug) {
            log::debug!("Metainfo file content:\n{bencode}");
        }
        Self::from_bencode(bencode).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidData, "unexpected metainfo bencode")
        })
    }

    /// Create metainfo from parsed bencode. A bare `info` dictionary without
    /// the usual root is accepted too.
    pub fn from_bencode(parsed: benc::Element) -> Option<Self> {
        let (root, info) = match parsed {
            benc::Element::Dictionary(mut d) => match d.remove(&"info".into()) {
                Some(info) => (Some(d), info),
                None => (None, benc::Element::Dictionary(d)),
            },
            other => (None, other),
        };

        let info_hash = {
            let mut hasher = DigestWriter(Sha1::new());
            info.encode_into(&mut hasher).unwrap();
            hasher.0.digest().bytes()
        };

        let info = match info {
            benc::Element::Dictionary(d) => benc::convert_dictionary(d),
            _ => return None,
        };

        let root = match root {
            Some(d) => benc::convert_dictionary(d),
            None => BTreeMap::new(),
        };

        Some(Self {
            root,
            info,
            info_hash,
        })
    }

    /// The announce URL of the tracker.
    pub fn announce(&self) -> Option<&str> {
        if let Some(benc::Element::ByteString(data)) = self.root.get("announce") {
            str::from_utf8(data).ok()
        } else {
            None
        }
    }

    /// Tracker URLs from the `announce-list` extension, flattened across tiers.
    pub fn announce_list(&self) -> Option<impl Iterator<Item = &str>> {
        if let Some(benc::Element::List(list)) = self.root.get("announce-list") {
            Some(list.iter().flat_map(strings_of))
        } else {
            None
        }
    }

    /// Display name, and top-level directory name for multifile torrents.
    pub fn name(&self) -> Option<&str> {
        if let Some(benc::Element::ByteString(data)) = self.info.get("name") {
            str::from_utf8(data).ok()
        } else {
            None
        }
    }

    /// SHA-1 hash of the canonically re-encoded `info` dictionary.
    pub fn info_hash(&self) -> &[u8; 20] {
        &self.info_hash
    }

    /// Number of bytes in each piece.
    pub fn piece_length(&self) -> Option<usize> {
        if let Some(benc::Element::Integer(data)) = self.info.get("piece length") {
            usize::try_from(*data).ok()
        } else {
            None
        }
    }

    /// 20-byte SHA-1 hash values, one per piece. `None` also when the
    /// `pieces` string is not a multiple of 20 bytes.
    pub fn pieces(&self) -> Option<impl Iterator<Item = &[u8]>> {
        if let Some(benc::Element::ByteString(data)) = self.info.get("pieces") {
            if data.len() % 20 == 0 {
                return Some(data.chunks_exact(20));
            }
        }
        None
    }

    /// Length of the file in bytes for single file torrents.
    pub fn length(&self) -> Option<usize> {
        if let Some(benc::Element::Integer(data)) = self.info.get("length") {
            usize::try_from(*data).ok()
        } else {
            None
        }
    }

    /// Length-path pairs for each file in multifile torrents.
    pub fn files(&self) -> Option<impl Iterator<Item = (usize, PathBuf)> + '_> {
        if let Some(benc::Element::List(data)) = self.info.get("files") {
            Some(data.iter().filter_map(try_get_length_path_pair))
        } else {
            None
        }
    }

    /// The `private` flag, preserving absent vs present.
    pub fn private(&self) -> Option<bool> {
        if let Some(benc::Element::Integer(data)) = self.info.get("private") {
            Some(*data != 0)
        } else {
            None
        }
    }

    pub fn comment(&self) -> Option<&str> {
        self.root_string("comment")
    }

    pub fn created_by(&self) -> Option<&str> {
        self.root_string("created by")
    }

    /// Creation time in seconds since the Unix epoch.
    pub fn creation_date(&self) -> Option<i64> {
        if let Some(benc::Element::Integer(data)) = self.root.get("creation date") {
            Some(*data)
        } else {
            None
        }
    }

    pub fn encoding(&self) -> Option<&str> {
        self.root_string("encoding")
    }

    fn root_string(&self, key: &str) -> Option<&str> {
        if let Some(benc::Element::ByteString(data)) = self.root.get(key) {
            str::from_utf8(data).ok()
        } else {
            None
        }
    }
}

/// Feeds everything written into a SHA-1, so the canonical encoding of the
/// info dictionary never needs to be materialized alongside its digest.
struct DigestWriter(Sha1);

impl io::Write for DigestWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn try_get_length_path_pair(e: &benc::Element) -> Option<(usize, PathBuf)> {
    fn path_from_list(list: &[benc::Element]) -> PathBuf {
        let mut ret = PathBuf::new();
        for e in list {
            if let benc::Element::ByteString(data) = e {
                if let Ok(text) = str::from_utf8(data) {
                    ret.push(text);
                }
            }
        }
        ret
    }

    if let benc::Element::Dictionary(dict) = e {
        let length_key = benc::Element::from("length");
        let path_key = benc::Element::from("path");

        match (dict.get(&length_key), dict.get(&path_key)) {
            (Some(benc::Element::Integer(length)), Some(benc::Element::List(list))) => {
                Some((*length as usize, path_from_list(list)))
            }
            _ => None,
        }
    } else {
        None
    }
}

fn strings_of(e: &benc::Element) -> Vec<&str> {
    match e {
        benc::Element::List(list) => list
            .iter()
            .filter_map(|item| match item {
                benc::Element::ByteString(data) => str::from_utf8(data).ok(),
                _ => None,
            })
            .collect(),
        benc::Element::ByteString(data) => str::from_utf8(data).into_iter().collect(),
        _ => Vec::new(),
    }
}

//! Persistent client state in a configuration directory.
//!
//! Tracker addresses are kept in JSON, in announce order:
//! ```text
//! { "announce": [ <url>, ... ] }
//! ```
//!
//! Download progress is a bencoded dictionary with one record per torrent:
//! ```text
//! { <info hash>: { "piece count": <n>, "pieces": <verified bitfield> } }
//! ```
use crate::benc::Element;
use crate::data::Bitfield;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::{fs, io};

const TRACKERS_FILENAME: &str = "trackers.json";
const RESUME_FILENAME: &str = "resume.benc";

#[derive(Default, Serialize, Deserialize)]
struct TrackerList {
    announce: Vec<String>,
}

/// Tracker URLs from the trackers file, in stored order.
pub fn load_trackers(config_dir: impl AsRef<Path>) -> io::Result<Vec<String>> {
    let text = fs::read_to_string(config_dir.as_ref().join(TRACKERS_FILENAME))?;
    let list: TrackerList = serde_json::from_str(&text)?;
    Ok(list.announce)
}

/// Append tracker URLs to the trackers file, skipping ones already stored.
pub fn save_trackers<T: Into<String>>(
    config_dir: impl AsRef<Path>,
    trackers: impl IntoIterator<Item = T>,
) -> io::Result<()> {
    let path = config_dir.as_ref().join(TRACKERS_FILENAME);
    let mut list: TrackerList = match fs::read_to_string(&path) {
        Ok(text) => serde_json::from_str(&text).unwrap_or_default(),
        Err(e) if e.kind() == io::ErrorKind::NotFound => TrackerList::default(),
        Err(e) => return Err(e),
    };
    for tracker in trackers {
        let tracker = tracker.into();
        if !list.announce.contains(&tracker) {
            list.announce.push(tracker);
        }
    }
    fs::write(path, serde_json::to_string_pretty(&list)?)
}

/// Verified-piece bitfield of `info_hash` from the resume file, sized to the
/// piece count it was saved with.
pub fn load_resume(config_dir: impl AsRef<Path>, info_hash: &[u8; 20]) -> io::Result<Bitfield> {
    let mut records = read_resume_records(config_dir.as_ref())?;
    let record = records.remove(&Element::ByteString(info_hash.to_vec())).ok_or_else(|| {
        io::Error::new(io::ErrorKind::NotFound, "no resume record for this torrent")
    })?;

    let Element::Dictionary(mut record) = record else {
        return Err(invalid_resume());
    };
    let piece_count = match record.remove(&Element::from("piece count")) {
        Some(Element::Integer(count)) if count >= 0 => count as usize,
        _ => return Err(invalid_resume()),
    };
    let Some(Element::ByteString(bits)) = record.remove(&Element::from("pieces")) else {
        return Err(invalid_resume());
    };

    let mut bitfield = Bitfield::from_vec(bits);
    if bitfield.len() < piece_count {
        return Err(invalid_resume());
    }
    bitfield.truncate(piece_count);
    Ok(bitfield)
}

/// Store the verified-piece bitfield of `info_hash`, keeping the records of
/// other torrents intact.
pub fn save_resume(
    config_dir: impl AsRef<Path>,
    info_hash: &[u8; 20],
    state: &Bitfield,
) -> io::Result<()> {
    let mut records = match read_resume_records(config_dir.as_ref()) {
        Ok(records) => records,
        Err(e) if e.kind() == io::ErrorKind::NotFound => BTreeMap::new(),
        Err(e) => return Err(e),
    };

    let mut record = BTreeMap::new();
    record.insert(Element::from("piece count"), Element::from(state.len() as i64));
    record.insert(Element::from("pieces"), Element::ByteString(state.clone().into_vec()));
    records.insert(Element::ByteString(info_hash.to_vec()), Element::Dictionary(record));

    fs::write(
        config_dir.as_ref().join(RESUME_FILENAME),
        Element::Dictionary(records).to_bytes(),
    )
}

fn read_resume_records(config_dir: &Path) -> io::Result<BTreeMap<Element, Element>> {
    let content = fs::read(config_dir.join(RESUME_FILENAME))?;
    match Element::from_bytes(&content)? {
        Element::Dictionary(records) => Ok(records),
        _ => Err(invalid_resume()),
    }
}

fn invalid_resume() -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, "malformed resume file")
}

use crate::benc::Element;
use crate::data::{self, Bitfield, FileEntry, FileMap, PieceInfo, PieceLedger, PieceState};
use crate::input::Metainfo;
use sha1_smol::Sha1;
use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};
use std::{cmp, fs, io};
use thiserror::Error;

/// Sub-piece I/O unit.
pub const DEFAULT_BLOCK_LENGTH: usize = 16 * 1024;

/// Piece length used by [`Torrent::create`] unless overridden.
pub const DEFAULT_PIECE_LENGTH: usize = 32 * 1024;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Data(#[from] data::Error),
    #[error("invalid torrent file: {0}")]
    InvalidTorrentFile(String),
    #[error("missing info section")]
    MissingInfoSection,
    #[error("no trackers specified")]
    MissingTrackers,
    #[error("invalid parameter: {0}")]
    InvalidParameter(&'static str),
    #[error("piece {0} is already verified")]
    AlreadyVerified(usize),
}

impl From<Error> for io::Error {
    fn from(e: Error) -> Self {
        match e {
            Error::Data(inner) => inner.into(),
            Error::InvalidTorrentFile(_)
            | Error::MissingInfoSection
            | Error::MissingTrackers => io::Error::new(io::ErrorKind::InvalidData, e),
            Error::InvalidParameter(_) | Error::AlreadyVerified(_) => {
                io::Error::new(io::ErrorKind::InvalidInput, e)
            }
        }
    }
}

pub type PieceVerifiedCallback = Arc<dyn Fn(usize, bool) + Send + Sync>;

/// A single torrent: immutable descriptor, file-backed byte space and the
/// per-piece acquisition/verification state.
///
/// All operations are safe to call from multiple threads. Conflicting writes
/// to the same piece are serialized by a per-piece guard; the verification
/// callback runs outside that guard and must not write to the piece index it
/// was invoked for.
pub struct Torrent {
    name: String,
    content_root: PathBuf,
    trackers: Vec<String>,
    private: Option<bool>,
    comment: Option<String>,
    created_by: Option<String>,
    creation_date: Option<i64>,
    encoding: Option<String>,
    info_hash: [u8; 20],
    pieces: PieceInfo,
    files: FileMap,
    ledgers: Vec<Mutex<PieceLedger>>,
    verified_pieces: AtomicUsize,
    downloaded_bytes: AtomicUsize,
    uploaded_bytes: AtomicUsize,
    verified_cb: RwLock<Option<PieceVerifiedCallback>>,
}

impl Torrent {
    /// Load a torrent from a metainfo file. Content is mapped under
    /// `download_dir` as described in [`Torrent::from_bencode`].
    pub fn load_file(
        metainfo_path: impl AsRef<Path>,
        download_dir: impl AsRef<Path>,
    ) -> Result<Self, Error> {
        let path = metainfo_path.as_ref();
        let content = fs::read(path).map_err(|source| match source.kind() {
            io::ErrorKind::NotFound => data::Error::FileNotFound {
                path: path.to_path_buf(),
            },
            io::ErrorKind::PermissionDenied => data::Error::FileAccessDenied {
                path: path.to_path_buf(),
            },
            _ => data::Error::FileRead {
                path: path.to_path_buf(),
                source,
            },
        })?;
        let bencode = Element::from_bytes(&content)
            .map_err(|e| Error::InvalidTorrentFile(e.to_string()))?;
        Self::from_bencode(bencode, download_dir, DEFAULT_BLOCK_LENGTH)
    }

    /// Build a torrent from decoded metainfo. Single-file content is mapped
    /// to `<download_dir>/<name>`, multifile content under the
    /// `<download_dir>/<name>/` directory. An empty `download_dir` means the
    /// current directory.
    pub fn from_bencode(
        bencode: Element,
        download_dir: impl AsRef<Path>,
        block_length: usize,
    ) -> Result<Self, Error> {
        if block_length == 0 {
            return Err(Error::InvalidParameter("block length must be positive"));
        }
        match &bencode {
            Element::Dictionary(root) => {
                if !root.contains_key(&"info".into()) {
                    return Err(Error::MissingInfoSection);
                }
            }
            _ => {
                return Err(Error::InvalidTorrentFile("root element is not a dictionary".into()));
            }
        }
        let metainfo = Metainfo::from_bencode(bencode)
            .ok_or_else(|| Error::InvalidTorrentFile("info is not a dictionary".into()))?;

        let mut trackers = Vec::new();
        if let Some(urls) = metainfo.announce_list() {
            for url in urls {
                if !trackers.iter().any(|t| t == url) {
                    trackers.push(url.to_string());
                }
            }
        } else if let Some(url) = metainfo.announce() {
            trackers.push(url.to_string());
        }
        if trackers.is_empty() {
            return Err(Error::MissingTrackers);
        }

        let name = metainfo
            .name()
            .ok_or_else(|| Error::InvalidTorrentFile("missing name".into()))?
            .to_string();
        let piece_length = metainfo
            .piece_length()
            .ok_or_else(|| Error::InvalidTorrentFile("missing piece length".into()))?;
        if piece_length == 0 {
            return Err(Error::InvalidTorrentFile("piece length is zero".into()));
        }
        let piece_hashes: Vec<&[u8]> = metainfo
            .pieces()
            .ok_or_else(|| Error::InvalidTorrentFile("missing or malformed pieces".into()))?
            .collect();
        if piece_hashes.is_empty() {
            return Err(Error::InvalidTorrentFile("empty piece list".into()));
        }

        let (content_root, file_entries) = if let Some(length) = metainfo.length() {
            // single file mode
            (
                download_dir.as_ref().to_path_buf(),
                vec![(length, PathBuf::from(&name))],
            )
        } else if let Some(files) = metainfo.files() {
            // multifile mode
            let mut entries = Vec::new();
            for (length, path) in files {
                if path.as_os_str().is_empty() {
                    return Err(Error::InvalidTorrentFile("file entry without path".into()));
                }
                entries.push((length, path));
            }
            if entries.is_empty() {
                return Err(Error::InvalidTorrentFile("empty file list".into()));
            }
            (download_dir.as_ref().join(&name), entries)
        } else {
            return Err(Error::InvalidTorrentFile(
                "no files specified (missing 'length' and 'files')".into(),
            ));
        };

        let total_length: usize = file_entries.iter().map(|(length, _)| *length).sum();
        if piece_hashes.len() != total_length.div_ceil(piece_length) {
            return Err(Error::InvalidTorrentFile("piece count does not match total length".into()));
        }

        let pieces = PieceInfo::new(
            piece_hashes.into_iter(),
            piece_length,
            block_length,
            total_length,
        );
        let files = FileMap::new(content_root.clone(), file_entries.into_iter());

        Ok(Self::assemble(
            name,
            content_root,
            trackers,
            pieces,
            files,
            *metainfo.info_hash(),
            metainfo.private(),
            metainfo.comment().map(str::to_string),
            metainfo.created_by().map(str::to_string),
            metainfo.creation_date(),
            metainfo.encoding().map(str::to_string),
        ))
    }

    /// Make a torrent out of a local file or directory, hashing its content.
    /// Directories are walked recursively in lexicographic order so that the
    /// resulting info hash is reproducible.
    pub fn create(
        content_path: impl AsRef<Path>,
        trackers: Vec<String>,
        piece_length: usize,
        comment: Option<String>,
    ) -> Result<Self, Error> {
        let content_path = content_path.as_ref();
        if piece_length == 0 {
            return Err(Error::InvalidParameter("piece length must be positive"));
        }
        let metadata = fs::metadata(content_path).map_err(|_| data::Error::FileNotFound {
            path: content_path.to_path_buf(),
        })?;

        let (name, content_root, file_entries) = if metadata.is_file() {
            let name = content_path
                .file_name()
                .ok_or(Error::InvalidParameter("path has no file name"))?
                .to_string_lossy()
                .into_owned();
            let parent = content_path.parent().unwrap_or(Path::new("")).to_path_buf();
            let entries = vec![(metadata.len() as usize, PathBuf::from(&name))];
            (name, parent, entries)
        } else if metadata.is_dir() {
            let name = content_path
                .file_name()
                .ok_or(Error::InvalidParameter("path has no file name"))?
                .to_string_lossy()
                .into_owned();
            let mut entries = Vec::new();
            collect_files_sorted(content_path, Path::new(""), &mut entries)?;
            if entries.is_empty() {
                return Err(Error::InvalidParameter("directory contains no files"));
            }
            (name, content_path.to_path_buf(), entries)
        } else {
            return Err(Error::InvalidParameter("path is neither a file nor a directory"));
        };

        let total_length: usize = file_entries.iter().map(|(length, _)| *length).sum();
        let files = FileMap::new(content_root.clone(), file_entries.into_iter());

        let piece_count = total_length.div_ceil(piece_length);
        let mut piece_hashes = Vec::with_capacity(piece_count * 20);
        for piece_index in 0..piece_count {
            let offset = piece_index * piece_length;
            let length = cmp::min(piece_length, total_length - offset);
            let data = files.read(offset, length)?;
            piece_hashes.extend_from_slice(&Sha1::from(&data).digest().bytes());
        }

        let pieces = PieceInfo::new(
            piece_hashes.chunks_exact(20),
            piece_length,
            DEFAULT_BLOCK_LENGTH,
            total_length,
        );

        let creation_date = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs() as i64)
            .ok();

        let mut torrent = Self::assemble(
            name,
            content_root,
            trackers,
            pieces,
            files,
            [0u8; 20],
            None,
            comment,
            Some(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")).to_string()),
            creation_date,
            Some("UTF-8".to_string()),
        );
        torrent.info_hash = {
            let mut hasher = Sha1::new();
            hasher.update(&torrent.info_to_bencode().to_bytes());
            hasher.digest().bytes()
        };
        Ok(torrent)
    }

    #[allow(clippy::too_many_arguments)]
    fn assemble(
        name: String,
        content_root: PathBuf,
        trackers: Vec<String>,
        pieces: PieceInfo,
        files: FileMap,
        info_hash: [u8; 20],
        private: Option<bool>,
        comment: Option<String>,
        created_by: Option<String>,
        creation_date: Option<i64>,
        encoding: Option<String>,
    ) -> Self {
        let ledgers = (0..pieces.piece_count())
            .map(|piece_index| {
                let block_count = pieces.block_count(piece_index).unwrap();
                Mutex::new(PieceLedger::new(block_count))
            })
            .collect();
        Torrent {
            name,
            content_root,
            trackers,
            private,
            comment,
            created_by,
            creation_date,
            encoding,
            info_hash,
            pieces,
            files,
            ledgers,
            verified_pieces: AtomicUsize::new(0),
            downloaded_bytes: AtomicUsize::new(0),
            uploaded_bytes: AtomicUsize::new(0),
            verified_cb: RwLock::new(None),
        }
    }

    // ------ descriptor access ------

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn trackers(&self) -> &[String] {
        &self.trackers
    }

    pub fn info_hash(&self) -> &[u8; 20] {
        &self.info_hash
    }

    pub fn info_hash_hex(&self) -> String {
        crate::utils::hex(&self.info_hash)
    }

    pub fn is_private(&self) -> Option<bool> {
        self.private
    }

    pub fn comment(&self) -> Option<&str> {
        self.comment.as_deref()
    }

    pub fn created_by(&self) -> Option<&str> {
        self.created_by.as_deref()
    }

    pub fn creation_date(&self) -> Option<i64> {
        self.creation_date
    }

    pub fn encoding(&self) -> Option<&str> {
        self.encoding.as_deref()
    }

    pub fn files(&self) -> &[FileEntry] {
        self.files.entries()
    }

    pub fn total_length(&self) -> usize {
        self.pieces.total_len()
    }

    pub fn piece_count(&self) -> usize {
        self.pieces.piece_count()
    }

    pub fn piece_length(&self, piece_index: usize) -> Result<usize, Error> {
        Ok(self.pieces.piece_len(piece_index)?)
    }

    pub fn block_count(&self, piece_index: usize) -> Result<usize, Error> {
        Ok(self.pieces.block_count(piece_index)?)
    }

    pub fn block_length(&self, piece_index: usize, block_index: usize) -> Result<usize, Error> {
        Ok(self.pieces.block_len(piece_index, block_index)?)
    }

    pub fn piece_hash(&self, piece_index: usize) -> Result<&[u8; 20], Error> {
        Ok(self.pieces.hash_of_piece(piece_index)?)
    }

    // ------ piece and block I/O ------

    pub fn read_piece(&self, piece_index: usize) -> Result<Vec<u8>, Error> {
        let offset = self.pieces.piece_offset(piece_index)?;
        let length = self.pieces.piece_len(piece_index)?;
        Ok(self.files.read(offset, length)?)
    }

    pub fn read_block(&self, piece_index: usize, block_index: usize) -> Result<Vec<u8>, Error> {
        let offset = self.pieces.block_offset(piece_index, block_index)?;
        let length = self.pieces.block_len(piece_index, block_index)?;
        Ok(self.files.read(offset, length)?)
    }

    /// Write one block. When this completes the last missing block of the
    /// piece, the piece is re-read from disk, hashed and either marked
    /// verified or fully reset; the outcome is reported through the
    /// registered callback, never as an error. Rewriting an already acquired
    /// block is a no-op.
    pub fn write_block(
        &self,
        piece_index: usize,
        block_index: usize,
        data: &[u8],
    ) -> Result<(), Error> {
        let offset = self.pieces.block_offset(piece_index, block_index)?;
        let expected_length = self.pieces.block_len(piece_index, block_index)?;
        if data.len() != expected_length {
            return Err(Error::InvalidParameter("block data has wrong length"));
        }

        let verdict = {
            let mut ledger = self.ledgers[piece_index].lock().unwrap();
            if ledger.is_verified() {
                return Err(Error::AlreadyVerified(piece_index));
            }
            if ledger.is_block_acquired(block_index) {
                return Ok(());
            }
            self.files.write(offset, data)?;
            ledger.acquire_block(block_index);
            if ledger.all_blocks_acquired() {
                Some(self.verify_piece_locked(piece_index, &mut ledger, None)?)
            } else {
                None
            }
        };
        if let Some(success) = verdict {
            self.notify_verified(piece_index, success);
        }
        Ok(())
    }

    /// Write a whole piece and verify it directly from the supplied buffer.
    /// The outcome is reported through the registered callback.
    pub fn write_piece(&self, piece_index: usize, data: &[u8]) -> Result<(), Error> {
        let offset = self.pieces.piece_offset(piece_index)?;
        let expected_length = self.pieces.piece_len(piece_index)?;
        if data.len() != expected_length {
            return Err(Error::InvalidParameter("piece data has wrong length"));
        }

        let success = {
            let mut ledger = self.ledgers[piece_index].lock().unwrap();
            if ledger.is_verified() {
                return Err(Error::AlreadyVerified(piece_index));
            }
            self.files.write(offset, data)?;
            self.verify_piece_locked(piece_index, &mut ledger, Some(data))?
        };
        self.notify_verified(piece_index, success);
        Ok(())
    }

    /// Hash the piece as currently stored on disk and compare against the
    /// expected value, updating the piece state accordingly. No callback is
    /// invoked.
    pub fn check_piece(&self, piece_index: usize) -> Result<bool, Error> {
        self.pieces.piece_len(piece_index)?;
        let mut ledger = self.ledgers[piece_index].lock().unwrap();
        self.verify_piece_locked(piece_index, &mut ledger, None)
    }

    /// Discard all progress on a piece, including a `Verified` mark. This is
    /// the only way to make a verified piece writable again.
    pub fn reset_piece(&self, piece_index: usize) -> Result<(), Error> {
        let piece_length = self.pieces.piece_len(piece_index)?;
        let mut ledger = self.ledgers[piece_index].lock().unwrap();
        if ledger.is_verified() {
            self.verified_pieces.fetch_sub(1, Ordering::Relaxed);
            self.downloaded_bytes.fetch_sub(piece_length, Ordering::Relaxed);
        }
        ledger.reset();
        Ok(())
    }

    /// Re-verify from disk every piece marked in a previously saved
    /// bitfield. Returns the number of pieces that passed.
    pub fn restore_state(&self, verified: &Bitfield) -> Result<usize, Error> {
        let mut restored = 0usize;
        for piece_index in verified.iter_ones() {
            if piece_index >= self.piece_count() {
                break;
            }
            if self.check_piece(piece_index)? {
                restored += 1;
            }
        }
        Ok(restored)
    }

    // must be called with the ledger of `piece_index` locked
    fn verify_piece_locked(
        &self,
        piece_index: usize,
        ledger: &mut PieceLedger,
        supplied_data: Option<&[u8]>,
    ) -> Result<bool, Error> {
        let digest = match supplied_data {
            Some(data) => Sha1::from(data).digest().bytes(),
            None => {
                let offset = self.pieces.piece_offset(piece_index)?;
                let end = offset + self.pieces.piece_len(piece_index)?;
                let mut sha1 = Sha1::new();
                let step = self.pieces.nominal_block_len();
                let mut position = offset;
                while position < end {
                    let length = cmp::min(step, end - position);
                    sha1.update(&self.files.read(position, length)?);
                    position += length;
                }
                sha1.digest().bytes()
            }
        };

        let matches = digest == *self.pieces.hash_of_piece(piece_index)?;
        if matches {
            if !ledger.is_verified() {
                ledger.mark_verified();
                self.verified_pieces.fetch_add(1, Ordering::Relaxed);
                self.downloaded_bytes
                    .fetch_add(self.pieces.piece_len(piece_index)?, Ordering::Relaxed);
            }
        } else {
            log::warn!("Hash of piece {piece_index} does not match, discarding the piece");
            ledger.reset();
        }
        Ok(matches)
    }

    fn notify_verified(&self, piece_index: usize, success: bool) {
        let callback = self.verified_cb.read().unwrap().clone();
        if let Some(callback) = callback {
            let result = panic::catch_unwind(AssertUnwindSafe(|| callback(piece_index, success)));
            if result.is_err() {
                log::warn!("Piece verification callback panicked, ignoring");
            }
        }
    }

    // ------ state observation ------

    pub fn piece_state(&self, piece_index: usize) -> Result<PieceState, Error> {
        self.pieces.piece_len(piece_index)?;
        Ok(self.ledgers[piece_index].lock().unwrap().state())
    }

    pub fn is_piece_verified(&self, piece_index: usize) -> Result<bool, Error> {
        self.pieces.piece_len(piece_index)?;
        Ok(self.ledgers[piece_index].lock().unwrap().is_verified())
    }

    pub fn is_block_acquired(
        &self,
        piece_index: usize,
        block_index: usize,
    ) -> Result<bool, Error> {
        self.pieces.block_len(piece_index, block_index)?;
        Ok(self.ledgers[piece_index].lock().unwrap().is_block_acquired(block_index))
    }

    /// Snapshot of the verified flags, one bit per piece.
    pub fn verified_bitfield(&self) -> Bitfield {
        let mut bitfield = Bitfield::repeat(false, self.piece_count());
        for (piece_index, mut bit) in bitfield.iter_mut().enumerate() {
            if self.ledgers[piece_index].lock().unwrap().is_verified() {
                bit.set(true);
            }
        }
        bitfield
    }

    pub fn verified_piece_count(&self) -> usize {
        self.verified_pieces.load(Ordering::Relaxed)
    }

    /// Sum of the lengths of all verified pieces.
    pub fn downloaded_bytes(&self) -> usize {
        self.downloaded_bytes.load(Ordering::Relaxed)
    }

    pub fn left_bytes(&self) -> usize {
        self.total_length() - self.downloaded_bytes()
    }

    pub fn progress(&self) -> f64 {
        self.verified_piece_count() as f64 / self.piece_count() as f64
    }

    pub fn uploaded_bytes(&self) -> usize {
        self.uploaded_bytes.load(Ordering::Relaxed)
    }

    pub fn add_uploaded(&self, byte_count: usize) {
        self.uploaded_bytes.fetch_add(byte_count, Ordering::Relaxed);
    }

    /// Register the single per-torrent verification callback, replacing any
    /// previous one. It is invoked synchronously with `(piece_index,
    /// success)` from the thread that completed the verification and must
    /// not write to the reported piece.
    pub fn set_piece_verified_callback(
        &self,
        callback: impl Fn(usize, bool) + Send + Sync + 'static,
    ) {
        *self.verified_cb.write().unwrap() = Some(Arc::new(callback));
    }

    // ------ file management ------

    /// Create pre-sized backing files for every entry that does not exist
    /// yet. Idempotent.
    pub fn ensure_files_exist(&self) -> Result<(), Error> {
        Ok(self.files.ensure_files_exist()?)
    }

    /// Drop all cached file handles. They reopen lazily on next access.
    pub fn close_files(&self) {
        self.files.close_files();
    }

    // ------ serialization ------

    /// Canonically encode the torrent back into metainfo form.
    pub fn to_bencode(&self) -> Element {
        let mut root = BTreeMap::new();
        if let Some(first) = self.trackers.first() {
            root.insert(Element::from("announce"), Element::from(first.as_str()));
        }
        if self.trackers.len() > 1 {
            let list = self.trackers.iter().map(|url| Element::from(url.as_str())).collect();
            root.insert(Element::from("announce-list"), Element::List(list));
        }
        if let Some(comment) = &self.comment {
            root.insert(Element::from("comment"), Element::from(comment.as_str()));
        }
        if let Some(created_by) = &self.created_by {
            root.insert(Element::from("created by"), Element::from(created_by.as_str()));
        }
        if let Some(creation_date) = self.creation_date {
            root.insert(Element::from("creation date"), Element::from(creation_date));
        }
        if let Some(encoding) = &self.encoding {
            root.insert(Element::from("encoding"), Element::from(encoding.as_str()));
        }
        root.insert(Element::from("info"), self.info_to_bencode());
        Element::Dictionary(root)
    }

    /// Write the metainfo file for this torrent.
    pub fn save_file(&self, output_path: impl AsRef<Path>) -> Result<(), Error> {
        let path = output_path.as_ref();
        fs::write(path, self.to_bencode().to_bytes()).map_err(|source| {
            Error::Data(data::Error::FileWrite {
                path: path.to_path_buf(),
                source,
            })
        })
    }

    fn info_to_bencode(&self) -> Element {
        let mut info = BTreeMap::new();
        info.insert(
            Element::from("piece length"),
            Element::from(self.pieces.nominal_piece_len() as i64),
        );
        let mut all_hashes = Vec::with_capacity(self.piece_count() * 20);
        for hash in self.pieces.hashes() {
            all_hashes.extend_from_slice(hash);
        }
        info.insert(Element::from("pieces"), Element::from(all_hashes));
        if let Some(private) = self.private {
            info.insert(Element::from("private"), Element::from(private as i64));
        }

        let entries = self.files.entries();
        if entries.len() == 1 {
            info.insert(Element::from("name"), Element::from(self.name.as_str()));
            info.insert(Element::from("length"), Element::from(entries[0].length() as i64));
        } else {
            let files = entries
                .iter()
                .map(|entry| {
                    let relative =
                        entry.path().strip_prefix(&self.content_root).unwrap_or(entry.path());
                    let path_list = relative
                        .components()
                        .map(|component| {
                            Element::from(component.as_os_str().to_string_lossy().into_owned())
                        })
                        .collect();
                    let mut file_dict = BTreeMap::new();
                    file_dict.insert(Element::from("length"), Element::from(entry.length() as i64));
                    file_dict.insert(Element::from("path"), Element::List(path_list));
                    Element::Dictionary(file_dict)
                })
                .collect();
            info.insert(Element::from("files"), Element::List(files));
            info.insert(Element::from("name"), Element::from(self.name.as_str()));
        }
        Element::Dictionary(info)
    }
}

fn collect_files_sorted(
    root: &Path,
    relative: &Path,
    out: &mut Vec<(usize, PathBuf)>,
) -> Result<(), Error> {
    let dir = root.join(relative);
    let mut children: Vec<_> = fs::read_dir(&dir)
        .map_err(|source| data::Error::FileRead {
            path: dir.clone(),
            source,
        })?
        .collect::<io::Result<_>>()
        .map_err(|source| data::Error::FileRead {
            path: dir.clone(),
            source,
        })?;
    children.sort_by_key(|entry| entry.file_name());

    for child in children {
        let child_relative = relative.join(child.file_name());
        let metadata = child.metadata().map_err(|source| data::Error::FileRead {
            path: root.join(&child_relative),
            source,
        })?;
        if metadata.is_dir() {
            collect_files_sorted(root, &child_relative, out)?;
        } else if metadata.is_file() {
            out.push((metadata.len() as usize, child_relative));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const TRACKER: &str = "http://tracker.example.com/announce";

    fn seed_content() -> Vec<u8> {
        (0u8..22).map(|i| i.wrapping_mul(7).wrapping_add(3)).collect()
    }

    /// 22 bytes of content in `<dir>/seed/payload.bin`, piece length 8, and
    /// a download-side torrent over `<dir>/out` with 4-byte blocks.
    fn make_seed_and_torrent(test_dir: &str) -> Torrent {
        let seed_dir = Path::new(test_dir).join("seed");
        fs::create_dir_all(&seed_dir).unwrap();
        fs::write(seed_dir.join("payload.bin"), seed_content()).unwrap();

        let source =
            Torrent::create(seed_dir.join("payload.bin"), vec![TRACKER.to_string()], 8, None)
                .unwrap();
        let torrent =
            Torrent::from_bencode(source.to_bencode(), Path::new(test_dir).join("out"), 4).unwrap();
        torrent.ensure_files_exist().unwrap();
        torrent
    }

    #[test]
    fn test_create_torrent_from_single_file() {
        let dir = "test_create_torrent_from_single_file";
        fs::create_dir_all(dir).unwrap();
        let content = seed_content();
        let file_path = Path::new(dir).join("payload.bin");
        fs::write(&file_path, &content).unwrap();

        let torrent =
            Torrent::create(&file_path, vec![TRACKER.to_string()], 8, Some("hi".into())).unwrap();

        assert_eq!("payload.bin", torrent.name());
        assert_eq!(22, torrent.total_length());
        assert_eq!(3, torrent.piece_count());
        assert_eq!(8, torrent.piece_length(0).unwrap());
        assert_eq!(8, torrent.piece_length(1).unwrap());
        assert_eq!(6, torrent.piece_length(2).unwrap());
        assert_eq!(1, torrent.block_count(0).unwrap());
        assert_eq!(6, torrent.block_length(2, 0).unwrap());
        assert_eq!(Some("hi"), torrent.comment());
        assert_eq!(
            Some(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"))),
            torrent.created_by()
        );
        assert_eq!([TRACKER.to_string()].as_slice(), torrent.trackers());
        assert_eq!(file_path, torrent.files()[0].path());

        for piece_index in 0..3 {
            let begin = piece_index * 8;
            let end = cmp::min(begin + 8, content.len());
            let expected = Sha1::from(&content[begin..end]).digest().bytes();
            assert_eq!(&expected, torrent.piece_hash(piece_index).unwrap());
        }
        assert_eq!(40, torrent.info_hash_hex().len());

        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_create_torrent_with_default_piece_length() {
        let dir = "test_create_torrent_with_default_piece_length";
        fs::create_dir_all(dir).unwrap();
        let file_path = Path::new(dir).join("small.bin");
        fs::write(&file_path, seed_content()).unwrap();

        let torrent =
            Torrent::create(&file_path, vec![TRACKER.to_string()], DEFAULT_PIECE_LENGTH, None)
                .unwrap();

        assert_eq!(1, torrent.piece_count());
        assert_eq!(22, torrent.piece_length(0).unwrap());
        assert_eq!(1, torrent.block_count(0).unwrap());

        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_create_torrent_from_directory_is_deterministic() {
        let dir = "test_create_torrent_from_directory_is_deterministic";
        let content_dir = Path::new(dir).join("album");
        fs::create_dir_all(content_dir.join("sub")).unwrap();
        fs::write(content_dir.join("b.bin"), [2u8; 5]).unwrap();
        fs::write(content_dir.join("a.bin"), [1u8; 10]).unwrap();
        fs::write(content_dir.join("sub").join("c.bin"), [3u8; 7]).unwrap();

        let first = Torrent::create(&content_dir, vec![TRACKER.to_string()], 8, None).unwrap();
        let second = Torrent::create(&content_dir, vec![TRACKER.to_string()], 8, None).unwrap();

        assert_eq!(first.info_hash(), second.info_hash());
        assert_eq!("album", first.name());
        assert_eq!(22, first.total_length());
        assert_eq!(
            vec![
                content_dir.join("a.bin"),
                content_dir.join("b.bin"),
                content_dir.join("sub").join("c.bin"),
            ],
            first.files().iter().map(|e| e.path().to_path_buf()).collect::<Vec<_>>()
        );
        assert_eq!(vec![0, 10, 15], first.files().iter().map(FileEntry::offset).collect::<Vec<_>>());

        // second piece spans all three files: bytes 8..16
        let mut expected = Vec::new();
        expected.extend_from_slice(&[1u8; 2]);
        expected.extend_from_slice(&[2u8; 5]);
        expected.extend_from_slice(&[3u8; 1]);
        assert_eq!(expected, first.read_piece(1).unwrap());

        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_save_and_reload_preserves_info_hash() {
        let dir = "test_save_and_reload_preserves_info_hash";
        let content_dir = Path::new(dir).join("album");
        fs::create_dir_all(content_dir.join("sub")).unwrap();
        fs::write(content_dir.join("a.bin"), [1u8; 10]).unwrap();
        fs::write(content_dir.join("b.bin"), [2u8; 5]).unwrap();
        fs::write(content_dir.join("sub").join("c.bin"), [3u8; 7]).unwrap();

        let source = Torrent::create(&content_dir, vec![TRACKER.to_string()], 8, None).unwrap();
        let metainfo_path = Path::new(dir).join("album.torrent");
        source.save_file(&metainfo_path).unwrap();

        let reloaded = Torrent::load_file(&metainfo_path, dir).unwrap();

        assert_eq!(source.info_hash(), reloaded.info_hash());
        assert_eq!(source.name(), reloaded.name());
        assert_eq!(source.trackers(), reloaded.trackers());
        assert_eq!(None, reloaded.is_private());
        assert_eq!(
            source.files().iter().map(|e| e.path().to_path_buf()).collect::<Vec<_>>(),
            reloaded.files().iter().map(|e| e.path().to_path_buf()).collect::<Vec<_>>()
        );

        // the reloaded torrent points at the same content, so a re-check
        // verifies everything
        let all_pieces = Bitfield::repeat(true, reloaded.piece_count());
        let restored = reloaded.restore_state(&all_pieces).unwrap();
        assert_eq!(reloaded.piece_count(), restored);
        assert_eq!(reloaded.total_length(), reloaded.downloaded_bytes());
        assert_eq!(0, reloaded.left_bytes());
        assert_eq!(1.0, reloaded.progress());

        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_block_download_lifecycle() {
        let dir = "test_block_download_lifecycle";
        let torrent = make_seed_and_torrent(dir);
        let content = seed_content();

        let events = Arc::new(Mutex::new(Vec::new()));
        let events_clone = events.clone();
        torrent.set_piece_verified_callback(move |piece_index, success| {
            events_clone.lock().unwrap().push((piece_index, success));
        });

        assert_eq!(PieceState::Pending, torrent.piece_state(0).unwrap());
        assert_eq!(2, torrent.block_count(0).unwrap());

        torrent.write_block(0, 0, &content[0..4]).unwrap();
        assert_eq!(PieceState::Partial, torrent.piece_state(0).unwrap());
        assert!(torrent.is_block_acquired(0, 0).unwrap());
        assert!(!torrent.is_block_acquired(0, 1).unwrap());
        assert!(events.lock().unwrap().is_empty());

        // rewriting an acquired block is a no-op
        torrent.write_block(0, 0, &content[0..4]).unwrap();
        assert_eq!(PieceState::Partial, torrent.piece_state(0).unwrap());

        torrent.write_block(0, 1, &content[4..8]).unwrap();
        assert_eq!(PieceState::Verified, torrent.piece_state(0).unwrap());
        assert!(torrent.is_piece_verified(0).unwrap());
        assert_eq!(vec![(0, true)], *events.lock().unwrap());
        assert_eq!(1, torrent.verified_piece_count());
        assert_eq!(8, torrent.downloaded_bytes());
        assert_eq!(14, torrent.left_bytes());

        // a verified piece rejects further writes
        assert!(matches!(
            torrent.write_block(0, 0, &content[0..4]),
            Err(Error::AlreadyVerified(0))
        ));

        // validation failures
        assert!(matches!(
            torrent.write_block(1, 0, &content[8..11]),
            Err(Error::InvalidParameter(_))
        ));
        assert!(matches!(
            torrent.write_block(1, 2, &content[8..12]),
            Err(Error::Data(data::Error::InvalidBlockIndex(1, 2)))
        ));
        assert!(matches!(
            torrent.write_block(3, 0, &content[0..4]),
            Err(Error::Data(data::Error::InvalidPieceIndex(3)))
        ));

        // finish the remaining pieces; the last piece has a 2-byte tail block
        torrent.write_block(1, 0, &content[8..12]).unwrap();
        torrent.write_block(1, 1, &content[12..16]).unwrap();
        torrent.write_block(2, 0, &content[16..20]).unwrap();
        assert_eq!(2, torrent.block_length(2, 1).unwrap());
        torrent.write_block(2, 1, &content[20..22]).unwrap();

        assert_eq!(vec![(0, true), (1, true), (2, true)], *events.lock().unwrap());
        assert_eq!(3, torrent.verified_piece_count());
        assert_eq!(1.0, torrent.progress());
        assert_eq!(0, torrent.left_bytes());
        assert_eq!(content, torrent.read_piece(0).unwrap().iter().chain(torrent.read_piece(1).unwrap().iter()).chain(torrent.read_piece(2).unwrap().iter()).copied().collect::<Vec<_>>());
        assert_eq!(content[8..12].to_vec(), torrent.read_block(1, 0).unwrap());

        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_hash_mismatch_resets_whole_piece() {
        let dir = "test_hash_mismatch_resets_whole_piece";
        let torrent = make_seed_and_torrent(dir);
        let content = seed_content();

        let events = Arc::new(Mutex::new(Vec::new()));
        let events_clone = events.clone();
        torrent.set_piece_verified_callback(move |piece_index, success| {
            events_clone.lock().unwrap().push((piece_index, success));
        });

        torrent.write_block(0, 0, &[0xau8; 4]).unwrap();
        torrent.write_block(0, 1, &[0xbu8; 4]).unwrap();

        assert_eq!(vec![(0, false)], *events.lock().unwrap());
        assert_eq!(PieceState::Pending, torrent.piece_state(0).unwrap());
        assert!(!torrent.is_block_acquired(0, 0).unwrap());
        assert!(!torrent.is_block_acquired(0, 1).unwrap());
        assert_eq!(0, torrent.verified_piece_count());

        // the piece is writable again and verifies with the right data
        torrent.write_block(0, 0, &content[0..4]).unwrap();
        torrent.write_block(0, 1, &content[4..8]).unwrap();
        assert_eq!(vec![(0, false), (0, true)], *events.lock().unwrap());
        assert!(torrent.is_piece_verified(0).unwrap());

        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_verification_detects_on_disk_corruption() {
        let dir = "test_verification_detects_on_disk_corruption";
        let torrent = make_seed_and_torrent(dir);
        let content = seed_content();

        torrent.write_block(0, 0, &content[0..4]).unwrap();

        // corrupt the already written block behind the torrent's back
        torrent.close_files();
        let backing_file = Path::new(dir).join("out").join("payload.bin");
        let mut on_disk = fs::read(&backing_file).unwrap();
        on_disk[0] ^= 0xff;
        fs::write(&backing_file, on_disk).unwrap();

        // the final block triggers verification, which reads from disk and
        // must notice the corruption
        torrent.write_block(0, 1, &content[4..8]).unwrap();
        assert_eq!(PieceState::Pending, torrent.piece_state(0).unwrap());
        assert!(!torrent.is_piece_verified(0).unwrap());

        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_write_piece_verifies_from_the_buffer() {
        let dir = "test_write_piece_verifies_from_the_buffer";
        let torrent = make_seed_and_torrent(dir);
        let content = seed_content();

        torrent.write_piece(0, &content[0..8]).unwrap();
        assert_eq!(PieceState::Verified, torrent.piece_state(0).unwrap());
        assert!(torrent.is_block_acquired(0, 0).unwrap());
        assert!(torrent.is_block_acquired(0, 1).unwrap());

        assert!(matches!(
            torrent.write_piece(0, &content[0..8]),
            Err(Error::AlreadyVerified(0))
        ));
        assert!(matches!(
            torrent.write_piece(1, &content[8..12]),
            Err(Error::InvalidParameter(_))
        ));

        // a wrong buffer resets the piece instead of failing
        torrent.write_piece(1, &[0u8; 8]).unwrap();
        assert_eq!(PieceState::Pending, torrent.piece_state(1).unwrap());

        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_reset_piece_reopens_the_state_machine() {
        let dir = "test_reset_piece_reopens_the_state_machine";
        let torrent = make_seed_and_torrent(dir);
        let content = seed_content();

        torrent.write_piece(0, &content[0..8]).unwrap();
        assert_eq!(1, torrent.verified_piece_count());
        assert_eq!(8, torrent.downloaded_bytes());

        torrent.reset_piece(0).unwrap();
        assert_eq!(PieceState::Pending, torrent.piece_state(0).unwrap());
        assert_eq!(0, torrent.verified_piece_count());
        assert_eq!(0, torrent.downloaded_bytes());

        torrent.write_piece(0, &content[0..8]).unwrap();
        assert!(torrent.is_piece_verified(0).unwrap());

        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_verified_bitfield_round_trip() {
        let dir = "test_verified_bitfield_round_trip";
        let torrent = make_seed_and_torrent(dir);
        let content = seed_content();

        torrent.write_piece(0, &content[0..8]).unwrap();
        torrent.write_piece(2, &content[16..22]).unwrap();

        let bitfield = torrent.verified_bitfield();
        assert_eq!(vec![0, 2], bitfield.iter_ones().collect::<Vec<_>>());

        // a fresh torrent over the same files restores from the bitfield
        let fresh = Torrent::from_bencode(
            torrent.to_bencode(),
            Path::new(dir).join("out"),
            4,
        )
        .unwrap();
        assert_eq!(2, fresh.restore_state(&bitfield).unwrap());
        assert!(fresh.is_piece_verified(0).unwrap());
        assert!(!fresh.is_piece_verified(1).unwrap());
        assert!(fresh.is_piece_verified(2).unwrap());
        assert_eq!(14, fresh.downloaded_bytes());

        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_panicking_callback_does_not_poison_the_torrent() {
        let dir = "test_panicking_callback_does_not_poison_the_torrent";
        let torrent = make_seed_and_torrent(dir);
        let content = seed_content();

        torrent.set_piece_verified_callback(|_piece_index, _success| panic!("misbehaving"));

        torrent.write_piece(0, &content[0..8]).unwrap();
        assert!(torrent.is_piece_verified(0).unwrap());

        torrent.write_piece(1, &content[8..16]).unwrap();
        assert_eq!(2, torrent.verified_piece_count());

        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_loading_rejects_broken_metainfo() {
        let no_info = Element::from_bytes(b"d8:announce13:http://a/annce").unwrap();
        assert!(matches!(
            Torrent::from_bencode(no_info, "x", DEFAULT_BLOCK_LENGTH),
            Err(Error::MissingInfoSection)
        ));

        let no_trackers = Element::from_bytes(
            b"d4:infod6:lengthi25e4:name8:file.bin12:piece lengthi16e6:pieces40:aaaaaaaaaaaaaaaaaaaabbbbbbbbbbbbbbbbbbbbee",
        )
        .unwrap();
        assert!(matches!(
            Torrent::from_bencode(no_trackers, "x", DEFAULT_BLOCK_LENGTH),
            Err(Error::MissingTrackers)
        ));

        let not_a_dictionary = Element::from_bytes(b"i42e").unwrap();
        assert!(matches!(
            Torrent::from_bencode(not_a_dictionary, "x", DEFAULT_BLOCK_LENGTH),
            Err(Error::InvalidTorrentFile(_))
        ));

        // one piece hash declared, but 25 bytes at piece length 16 need two
        let bad_piece_count = Element::from_bytes(
            b"d8:announce8:http://a4:infod6:lengthi25e4:name8:file.bin12:piece lengthi16e6:pieces20:aaaaaaaaaaaaaaaaaaaaee",
        )
        .unwrap();
        assert!(matches!(
            Torrent::from_bencode(bad_piece_count, "x", DEFAULT_BLOCK_LENGTH),
            Err(Error::InvalidTorrentFile(_))
        ));
    }

    #[test]
    fn test_loading_missing_or_malformed_file() {
        assert!(matches!(
            Torrent::load_file("does_not_exist.torrent", "x"),
            Err(Error::Data(data::Error::FileNotFound { .. }))
        ));

        let dir = "test_loading_missing_or_malformed_file";
        fs::create_dir_all(dir).unwrap();
        let path = Path::new(dir).join("bad.torrent");
        fs::write(&path, b"this is not bencode").unwrap();
        assert!(matches!(
            Torrent::load_file(&path, "x"),
            Err(Error::InvalidTorrentFile(_))
        ));

        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_private_flag_round_trip_keeps_info_hash() {
        let with_private = Element::from_bytes(
            b"d8:announce8:http://a4:infod6:lengthi25e4:name8:file.bin12:piece lengthi16e6:pieces40:aaaaaaaaaaaaaaaaaaaabbbbbbbbbbbbbbbbbbbb7:privatei1eee",
        )
        .unwrap();
        let torrent = Torrent::from_bencode(with_private, "x", DEFAULT_BLOCK_LENGTH).unwrap();
        assert_eq!(Some(true), torrent.is_private());

        let reloaded =
            Torrent::from_bencode(torrent.to_bencode(), "x", DEFAULT_BLOCK_LENGTH).unwrap();
        assert_eq!(torrent.info_hash(), reloaded.info_hash());
        assert_eq!(Some(true), reloaded.is_private());

        let without_private = Element::from_bytes(
            b"d8:announce8:http://a4:infod6:lengthi25e4:name8:file.bin12:piece lengthi16e6:pieces40:aaaaaaaaaaaaaaaaaaaabbbbbbbbbbbbbbbbbbbbee",
        )
        .unwrap();
        let torrent = Torrent::from_bencode(without_private, "x", DEFAULT_BLOCK_LENGTH).unwrap();
        assert_eq!(None, torrent.is_private());

        let reloaded =
            Torrent::from_bencode(torrent.to_bencode(), "x", DEFAULT_BLOCK_LENGTH).unwrap();
        assert_eq!(torrent.info_hash(), reloaded.info_hash());
        assert_eq!(None, reloaded.is_private());
    }
}

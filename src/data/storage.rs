use crate::data::Error;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::{cmp, fs, io};

/// One backing file of the torrent's contiguous byte space.
#[derive(Debug, Clone)]
pub struct FileEntry {
    path: PathBuf,
    length: usize,
    offset: usize,
}

impl FileEntry {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn length(&self) -> usize {
        self.length
    }

    /// Offset of the file's first byte within the torrent's byte space.
    pub fn offset(&self) -> usize {
        self.offset
    }

    fn end(&self) -> usize {
        self.offset + self.length
    }
}

/// Maps a contiguous byte space onto an ordered list of files on disk.
///
/// Handles are opened on first access and cached; missing files are created
/// and pre-sized to their declared length on first write. Handle acquisition
/// is serialized by a single mutex, positional I/O happens after the lock is
/// released. Conflicting accesses to the same byte range must be serialized
/// by the caller.
pub struct FileMap {
    entries: Vec<FileEntry>,
    total_length: usize,
    handles: Mutex<HashMap<PathBuf, Arc<fs::File>>>,
}

impl FileMap {
    pub fn new<I: Iterator<Item = (usize, PathBuf)>>(
        parent_dir: impl AsRef<Path>,
        length_path_it: I,
    ) -> Self {
        let mut entries = Vec::new();
        let mut offset = 0usize;
        for (length, path) in length_path_it {
            entries.push(FileEntry {
                path: parent_dir.as_ref().join(path),
                length,
                offset,
            });
            offset += length;
        }
        FileMap {
            entries,
            total_length: offset,
            handles: Mutex::new(HashMap::new()),
        }
    }

    pub fn entries(&self) -> &[FileEntry] {
        &self.entries
    }

    pub fn total_length(&self) -> usize {
        self.total_length
    }

    /// Read `count` bytes starting at `start`. Regions not backed by any
    /// file, including everything past the last file, read as zeros.
    pub fn read(&self, start: usize, count: usize) -> Result<Vec<u8>, Error> {
        let mut dest = vec![0u8; count];
        let end = start + count;

        for entry in self.overlapping(start, end) {
            let file = self.acquire_handle(entry, false)?;

            let in_file_offset = start.saturating_sub(entry.offset);
            let in_buffer_offset = entry.offset.saturating_sub(start);
            let length = cmp::min(end, entry.end()) - cmp::max(start, entry.offset);

            file.read_all_at_offset(
                &mut dest[in_buffer_offset..in_buffer_offset + length],
                in_file_offset as u64,
            )
            .map_err(|source| Error::FileRead {
                path: entry.path.clone(),
                source,
            })?;
        }
        Ok(dest)
    }

    /// Write `data` starting at `start`, fanning out across all overlapping
    /// files. Bytes falling outside every file are silently dropped,
    /// mirroring the zero fill on the read path.
    pub fn write(&self, start: usize, data: &[u8]) -> Result<(), Error> {
        let end = start + data.len();

        for entry in self.overlapping(start, end) {
            let file = self.acquire_handle(entry, true)?;

            let in_file_offset = start.saturating_sub(entry.offset);
            let in_buffer_offset = entry.offset.saturating_sub(start);
            let length = cmp::min(end, entry.end()) - cmp::max(start, entry.offset);

            file.write_all_at_offset(
                &data[in_buffer_offset..in_buffer_offset + length],
                in_file_offset as u64,
            )
            .map_err(|source| Error::FileWrite {
                path: entry.path.clone(),
                source,
            })?;
        }
        Ok(())
    }

    /// Create parent directories and pre-sized empty files for every entry
    /// that does not yet exist on disk. Idempotent.
    pub fn ensure_files_exist(&self) -> Result<(), Error> {
        for entry in &self.entries {
            create_pre_sized(&entry.path, entry.length)?;
        }
        Ok(())
    }

    /// Drop all cached handles. Later accesses reopen lazily.
    pub fn close_files(&self) {
        self.handles.lock().unwrap().clear();
    }

    fn overlapping(&self, start: usize, end: usize) -> impl Iterator<Item = &FileEntry> {
        self.entries.iter().filter(move |e| e.offset < end && e.end() > start)
    }

    fn acquire_handle(&self, entry: &FileEntry, writable: bool) -> Result<Arc<fs::File>, Error> {
        let mut handles = self.handles.lock().unwrap();
        if let Some(file) = handles.get(&entry.path) {
            return Ok(file.clone());
        }
        if writable {
            create_pre_sized(&entry.path, entry.length)?;
        }
        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&entry.path)
            .map_err(|e| open_error(&entry.path, e))?;
        let file = Arc::new(file);
        handles.insert(entry.path.clone(), file.clone());
        Ok(file)
    }
}

fn create_pre_sized(path: &Path, length: usize) -> Result<(), Error> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|source| Error::DirectoryCreate {
                path: parent.to_path_buf(),
                source,
            })?;
        }
    }
    if !path.exists() {
        let file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| open_error(path, e))?;
        file.set_len(length as u64).map_err(|source| Error::Resize {
            path: path.to_path_buf(),
            source,
        })?;
    }
    Ok(())
}

fn open_error(path: &Path, e: io::Error) -> Error {
    match e.kind() {
        io::ErrorKind::NotFound => Error::FileNotFound {
            path: path.to_path_buf(),
        },
        io::ErrorKind::PermissionDenied => Error::FileAccessDenied {
            path: path.to_path_buf(),
        },
        _ => Error::FileRead {
            path: path.to_path_buf(),
            source: e,
        },
    }
}

/// Positional I/O over an open file, without moving any cursor.
pub trait RandomAccessReadWrite {
    fn read_at_offset(&self, dest: &mut [u8], offset: u64) -> io::Result<usize>;
    fn write_at_offset(&self, src: &[u8], offset: u64) -> io::Result<usize>;

    fn read_all_at_offset(&self, mut dest: &mut [u8], mut offset: u64) -> io::Result<()> {
        while !dest.is_empty() {
            let bytes_read = self.read_at_offset(dest, offset)?;
            if bytes_read == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "failed to fill whole buffer",
                ));
            }
            dest = &mut dest[bytes_read..];
            offset += bytes_read as u64;
        }
        Ok(())
    }

    fn write_all_at_offset(&self, mut src: &[u8], mut offset: u64) -> io::Result<()> {
        while !src.is_empty() {
            let bytes_written = self.write_at_offset(src, offset)?;
            if bytes_written == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "failed to write whole buffer",
                ));
            }
            src = &src[bytes_written..];
            offset += bytes_written as u64;
        }
        Ok(())
    }
}

#[cfg(target_family = "unix")]
impl RandomAccessReadWrite for fs::File {
    fn read_at_offset(&self, dest: &mut [u8], offset: u64) -> io::Result<usize> {
        use std::os::unix::prelude::*;
        self.read_at(dest, offset)
    }

    fn write_at_offset(&self, src: &[u8], offset: u64) -> io::Result<usize> {
        use std::os::unix::prelude::*;
        self.write_at(src, offset)
    }
}

#[cfg(target_family = "windows")]
impl RandomAccessReadWrite for fs::File {
    fn read_at_offset(&self, dest: &mut [u8], offset: u64) -> io::Result<usize> {
        use std::os::windows::prelude::*;
        self.seek_read(dest, offset)
    }

    fn write_at_offset(&self, src: &[u8], offset: u64) -> io::Result<usize> {
        use std::os::windows::prelude::*;
        self.seek_write(src, offset)
    }
}

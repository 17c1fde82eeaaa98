//! Appending compressed payloads to the tail of an existing binary.
//!
//! An [`Appender`] owns one host file for the duration of an append session.
//! Payloads are streamed onto the end of the payload data, never over it, and
//! recorded in an [`AppendIndex`] that is written as a trailer when the
//! session is closed. [`extract`] reads a payload back by name.
//!
//! # Examples
//!
//! ```no_run
//! use provisioner::appender::{extract, Appender};
//! use provisioner::compression::Compression;
//!
//! let appender = Appender::open("client-linux-amd64", Compression::gzip_if(true))?;
//! appender.append_file("client.crt", "client.crt")?;
//! appender.close()?;
//!
//! let cert = extract("client-linux-amd64", "client.crt")?.into_bytes()?;
//! # Ok::<(), provisioner::Error>(())
//! ```

pub mod index;

pub use index::{AppendIndex, AppendedFile, INDEX_VERSION};

use crate::compression::{Compression, PayloadReader};
use crate::{Error, Result};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Take, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Size of the copy buffer used when streaming payloads in and out.
pub const COPY_BUFFER_SIZE: usize = 64 * 1024;

struct OpenState {
    file: File,
    index: AppendIndex,
    /// End of payload data; the next payload starts here.
    data_end: u64,
    /// Set once anything past `data_end` may have changed.
    dirty: bool,
}

/// Exclusive append session on one host file.
///
/// All appends go through a single lock because each one starts at the
/// end offset left by the previous one. The handle may be shared between
/// threads by reference.
///
/// Closing is idempotent: a second [`close`](Appender::close) does nothing.
/// Appending after close returns [`Error::AlreadyClosed`]. Dropping an open
/// appender closes it and logs any failure.
pub struct Appender {
    path: PathBuf,
    compression: Compression,
    state: Mutex<Option<OpenState>>,
}

impl Appender {
    /// Opens `path` for reading and writing without truncating it.
    ///
    /// If the file already carries an index trailer, that index is loaded
    /// and new payloads continue after the existing ones.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Open`] if the file cannot be opened read/write, or
    /// [`Error::CorruptData`] if it ends with a damaged index trailer.
    pub fn open(path: impl AsRef<Path>, compression: Compression) -> Result<Self> {
        let path = path.as_ref();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|source| Error::Open {
                path: path.to_path_buf(),
                source,
            })?;

        let (index, data_end) = match AppendIndex::read_trailer(&mut file)? {
            Some(found) => found,
            None => (AppendIndex::new(), file.seek(SeekFrom::End(0))?),
        };

        debug!(
            path = %path.display(),
            existing = index.len(),
            data_end,
            "opened appender"
        );

        Ok(Self {
            path: path.to_path_buf(),
            compression,
            state: Mutex::new(Some(OpenState {
                file,
                index,
                data_end,
                dirty: false,
            })),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn compression(&self) -> Compression {
        self.compression
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().is_none()
    }

    /// Snapshot of the current index.
    pub fn index(&self) -> Result<AppendIndex> {
        self.state
            .lock()
            .as_ref()
            .map(|s| s.index.clone())
            .ok_or(Error::AlreadyClosed)
    }

    /// Streams the file at `source` onto the host file under `name`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SourceRead`] if `source` cannot be opened or read, and
    /// [`Error::SinkWrite`] if the host file cannot be written.
    pub fn append_file(&self, source: impl AsRef<Path>, name: &str) -> Result<AppendedFile> {
        let file = File::open(source.as_ref()).map_err(Error::SourceRead)?;
        self.append_reader(file, name)
    }

    /// Streams everything `reader` yields onto the host file under `name`.
    ///
    /// On failure the host file is cut back to where the payload started, so
    /// earlier payloads and the original content stay intact and the index is
    /// unchanged.
    pub fn append_reader<R: Read>(&self, reader: R, name: &str) -> Result<AppendedFile> {
        let mut guard = self.state.lock();
        let state = guard.as_mut().ok_or(Error::AlreadyClosed)?;

        let start = state.data_end;
        state.dirty = true;

        match write_payload(&mut state.file, start, reader, self.compression) {
            Ok(end) => {
                let entry = AppendedFile {
                    name: name.to_string(),
                    codec: self.compression.codec(),
                    offset: start,
                    length: end - start,
                };
                state.data_end = end;
                if let Some(old) = state.index.insert(entry.clone()) {
                    debug!(name, old_offset = old.offset, "replaced appended payload");
                }
                debug!(
                    path = %self.path.display(),
                    name,
                    offset = entry.offset,
                    length = entry.length,
                    "appended payload"
                );
                Ok(entry)
            }
            Err(e) => {
                if let Err(truncate) = state.file.set_len(start) {
                    warn!(
                        path = %self.path.display(),
                        error = %truncate,
                        "failed to roll back partial payload"
                    );
                }
                Err(e)
            }
        }
    }

    /// Writes the index trailer and releases the file.
    ///
    /// A session that never appended leaves the host file byte-for-byte
    /// untouched.
    pub fn close(&self) -> Result<()> {
        let Some(mut state) = self.state.lock().take() else {
            return Ok(());
        };

        if !state.dirty {
            return Ok(());
        }

        let trailer = state.index.encode_trailer()?;
        state
            .file
            .seek(SeekFrom::Start(state.data_end))
            .map_err(Error::SinkWrite)?;
        state.file.write_all(&trailer).map_err(Error::SinkWrite)?;
        state
            .file
            .set_len(state.data_end + trailer.len() as u64)
            .map_err(Error::SinkWrite)?;
        state.file.sync_all().map_err(Error::SinkWrite)?;

        debug!(
            path = %self.path.display(),
            payloads = state.index.len(),
            "closed appender"
        );
        Ok(())
    }
}

impl Drop for Appender {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(path = %self.path.display(), error = %e, "failed to close appender");
        }
    }
}

/// Copies `reader` through the compressor to `file` at `start`, returning
/// the end offset of what was written.
fn write_payload<R: Read>(
    file: &mut File,
    start: u64,
    mut reader: R,
    compression: Compression,
) -> Result<u64> {
    file.seek(SeekFrom::Start(start)).map_err(Error::SinkWrite)?;

    let mut writer = compression.writer(BufWriter::with_capacity(COPY_BUFFER_SIZE, &mut *file));
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(Error::SourceRead(e)),
        };
        writer.write_all(&buf[..n]).map_err(Error::SinkWrite)?;
    }

    let buffered = writer.finish().map_err(Error::SinkWrite)?;
    buffered
        .into_inner()
        .map_err(|e| Error::SinkWrite(e.into_error()))?;

    file.stream_position().map_err(Error::SinkWrite)
}

/// Lists the payloads recorded in a host file.
///
/// A file without an index trailer yields an empty index.
pub fn list(path: impl AsRef<Path>) -> Result<AppendIndex> {
    let path = path.as_ref();
    let mut file = open_for_read(path)?;
    Ok(AppendIndex::read_trailer(&mut file)?
        .map(|(index, _)| index)
        .unwrap_or_default())
}

/// Opens the payload `name` of the host file at `path` for reading.
///
/// # Errors
///
/// Returns [`Error::PayloadNotFound`] if the index has no such entry and
/// [`Error::CorruptData`] if the index trailer is damaged. Decoding errors in
/// the payload itself surface from [`Extracted::copy_to`] and
/// [`Extracted::into_bytes`].
pub fn extract(path: impl AsRef<Path>, name: &str) -> Result<Extracted> {
    let path = path.as_ref();
    let mut file = open_for_read(path)?;

    let (index, _) = AppendIndex::read_trailer(&mut file)?
        .ok_or_else(|| Error::PayloadNotFound(name.to_string()))?;
    let entry = index
        .get(name)
        .cloned()
        .ok_or_else(|| Error::PayloadNotFound(name.to_string()))?;

    file.seek(SeekFrom::Start(entry.offset))?;
    let limited = BufReader::new(file).take(entry.length);

    Ok(Extracted {
        reader: entry.codec.reader(limited),
        entry,
    })
}

fn open_for_read(path: &Path) -> Result<File> {
    File::open(path).map_err(|source| Error::Open {
        path: path.to_path_buf(),
        source,
    })
}

/// Decoded byte stream of one appended payload.
///
/// Reads are limited to the payload's recorded range and pass through the
/// recorded codec.
pub struct Extracted {
    entry: AppendedFile,
    reader: PayloadReader<Take<BufReader<File>>>,
}

impl Extracted {
    /// The index entry being read.
    pub fn entry(&self) -> &AppendedFile {
        &self.entry
    }

    /// Decodes the whole payload into `writer`, returning the decoded size.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CorruptData`] if the stored range does not decode or
    /// is shorter than recorded, and [`Error::Io`] if `writer` fails.
    pub fn copy_to<W: Write>(mut self, writer: &mut W) -> Result<u64> {
        let mut buf = vec![0u8; COPY_BUFFER_SIZE];
        let mut total = 0u64;
        loop {
            let n = match self.reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    return Err(Error::CorruptData(format!(
                        "payload {:?}: {}",
                        self.entry.name, e
                    )))
                }
            };
            writer.write_all(&buf[..n])?;
            total += n as u64;
        }

        if let PayloadReader::Plain(limited) = &self.reader {
            if limited.limit() != 0 {
                return Err(Error::CorruptData(format!(
                    "payload {:?} is truncated",
                    self.entry.name
                )));
            }
        }

        Ok(total)
    }

    /// Decodes the whole payload into memory.
    pub fn into_bytes(self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.copy_to(&mut out)?;
        Ok(out)
    }
}

impl Read for Extracted {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.reader.read(buf)
    }
}

use std::io::{Read, Seek, SeekFrom, Write};

use bytes::Bytes;

use super::StorageClient;
use crate::{Error, Result};

/// How an object is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Fetch the body and read/seek over it.
    Read,
    /// Buffer writes locally and publish them on close.
    Write,
}

enum Inner {
    Read(std::io::Cursor<Bytes>),
    Write {
        buffer: std::io::Cursor<Vec<u8>>,
        committed: bool,
    },
}

/// An open object handle with standard read/seek/write semantics.
///
/// Reads operate over the fetched body. Writes are buffered in memory and
/// published as one object when the handle is closed; a failing commit
/// surfaces on [`close`], never on `write`. A write handle dropped without
/// `close` discards its buffer.
///
/// [`close`]: ObjectFile::close
pub struct ObjectFile {
    client: StorageClient,
    key: String,
    inner: Inner,
}

impl std::fmt::Debug for ObjectFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectFile")
            .field("key", &self.key)
            .field(
                "mode",
                &match self.inner {
                    Inner::Read(_) => OpenMode::Read,
                    Inner::Write { .. } => OpenMode::Write,
                },
            )
            .finish()
    }
}

impl ObjectFile {
    pub(super) fn for_reading(client: StorageClient, key: String, body: Bytes) -> Self {
        ObjectFile {
            client,
            key,
            inner: Inner::Read(std::io::Cursor::new(body)),
        }
    }

    pub(super) fn for_writing(client: StorageClient, key: String) -> Self {
        ObjectFile {
            client,
            key,
            inner: Inner::Write {
                buffer: std::io::Cursor::new(Vec::new()),
                committed: false,
            },
        }
    }

    /// The key this handle addresses.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Body length: the fetched size for reads, the buffered size for writes.
    pub fn len(&self) -> u64 {
        match &self.inner {
            Inner::Read(cursor) => cursor.get_ref().len() as u64,
            Inner::Write { buffer, .. } => buffer.get_ref().len() as u64,
        }
    }

    /// Whether the body is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Publishes buffered writes (write mode) and consumes the handle. Any
    /// commit failure surfaces here.
    pub async fn close(mut self) -> Result<()> {
        match &mut self.inner {
            Inner::Read(_) => Ok(()),
            Inner::Write { buffer, committed } => {
                let body = Bytes::from(std::mem::take(buffer.get_mut()));
                *committed = true;
                self.client.write(&self.key, body).await
            }
        }
    }
}

impl Read for ObjectFile {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match &mut self.inner {
            Inner::Read(cursor) => cursor.read(buf),
            Inner::Write { .. } => Err(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "handle is open for writing",
            )),
        }
    }
}

impl Write for ObjectFile {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match &mut self.inner {
            Inner::Write { buffer, .. } => buffer.write(buf),
            Inner::Read(_) => Err(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "handle is open for reading",
            )),
        }
    }

    // Flushing publishes nothing; the object is committed on close.
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl Seek for ObjectFile {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        match &mut self.inner {
            Inner::Read(cursor) => cursor.seek(pos),
            Inner::Write { buffer, .. } => buffer.seek(pos),
        }
    }
}

impl Drop for ObjectFile {
    fn drop(&mut self) {
        if let Inner::Write { buffer, committed } = &self.inner {
            if !*committed && !buffer.get_ref().is_empty() {
                tracing::warn!(
                    key = %self.key,
                    buffered = buffer.get_ref().len(),
                    "write handle dropped without close, buffered bytes discarded"
                );
            }
        }
    }
}

impl From<Error> for std::io::Error {
    fn from(err: Error) -> Self {
        let kind = match &err {
            Error::NotFound { .. } => std::io::ErrorKind::NotFound,
            Error::Unauthorized { .. } => std::io::ErrorKind::PermissionDenied,
            Error::Unavailable { .. } => std::io::ErrorKind::TimedOut,
            Error::InvalidArgument { .. } => std::io::ErrorKind::InvalidInput,
            _ => std::io::ErrorKind::Other,
        };
        std::io::Error::new(kind, err.to_string())
    }
}

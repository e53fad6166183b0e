//! Temporary files used as guest stdio conduits.

use std::fs::File;
use std::io;
use std::path::Path;

use tempfile::NamedTempFile;
use tracing::trace;

/// A named temporary file, deleted when dropped.
///
/// Deletion is best-effort: a failure to remove the file is ignored. Handles
/// obtained from [`TempResource::reopen`] stay readable after the file is
/// unlinked on Unix, but callers that stream from the file should keep the
/// `TempResource` alive until they are done.
#[derive(Debug)]
pub struct TempResource {
    file: NamedTempFile,
}

impl TempResource {
    /// Create an empty temporary file.
    pub fn new() -> io::Result<Self> {
        let file = tempfile::Builder::new().prefix("wagi-").tempfile()?;
        trace!(path = %file.path().display(), "Temp file created");
        Ok(Self { file })
    }

    /// Path of the file on disk.
    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// A second handle to the file, sharing its write position.
    pub fn handle(&self) -> io::Result<File> {
        self.file.as_file().try_clone()
    }

    /// Open an independent handle positioned at the start of the file.
    pub fn reopen(&self) -> io::Result<File> {
        self.file.reopen()
    }

    /// Current size of the file in bytes.
    pub fn len(&self) -> io::Result<u64> {
        Ok(self.file.as_file().metadata()?.len())
    }

    /// Returns `true` if nothing has been written.
    pub fn is_empty(&self) -> io::Result<bool> {
        Ok(self.len()? == 0)
    }
}

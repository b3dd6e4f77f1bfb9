//! Filesystem adapter: translates open/read/write/readdir/release from the
//! external FUSE shim into engine calls.
//!
//! Read-only opens start a read session against the nodes; write-only opens
//! create a local backing file under the client root (the striped write
//! begins on the first `write` at offset 0, anything else passes through to
//! the backing file). Directory listing and metadata are served from the
//! local root.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::FsError;
use crate::session::Session;

/// File descriptor handle.
pub type Fd = u32;

enum FdEntry {
    Read {
        /// Logical byte span readable through the session.
        span: u64,
    },
    Write {
        path: String,
        file: File,
    },
}

/// Client surface over one mounted session.
pub struct FsClient {
    root: PathBuf,
    session: Session,
    fd_table: Vec<Option<FdEntry>>,
}

impl FsClient {
    /// Connect to the configured nodes and wrap the local root directory.
    ///
    /// `servers` order defines the lane index; the last entry is the parity
    /// lane. Mount fails if the root is not a directory or any lane is
    /// unreachable.
    pub fn new(root: impl Into<PathBuf>, servers: &[String], chunk_size: usize) -> Result<Self, FsError> {
        let root = root.into();
        if !root.is_dir() {
            return Err(FsError::Config(format!(
                "client root is not a directory: {}",
                root.display()
            )));
        }
        let session = Session::connect(servers, chunk_size)?;
        Ok(Self {
            root,
            session,
            fd_table: Vec::new(),
        })
    }

    /// Open a file. `O_RDONLY` starts a read session against the nodes;
    /// `O_WRONLY` creates/truncates the local backing file; `O_RDWR` is
    /// denied.
    pub fn open(&mut self, path: &str, flags: i32) -> Result<Fd, FsError> {
        let entry = match flags & libc::O_ACCMODE {
            libc::O_RDONLY => {
                let span = self.session.open_read(path)?;
                FdEntry::Read { span }
            }
            libc::O_WRONLY => {
                debug!(path, "opening in write-only mode");
                let file = OpenOptions::new()
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(self.local_path(path))?;
                FdEntry::Write {
                    path: path.to_string(),
                    file,
                }
            }
            _ => return Err(FsError::AccessDenied),
        };
        Ok(self.alloc_fd(entry))
    }

    /// Read from an `O_RDONLY` fd at `offset` through the striped engine.
    pub fn read(&mut self, fd: Fd, buf: &mut [u8], offset: u64) -> Result<usize, FsError> {
        match self.fd_table.get(fd as usize).and_then(Option::as_ref) {
            Some(FdEntry::Read { .. }) => self.session.read_at(buf, offset),
            Some(FdEntry::Write { .. }) => Err(FsError::AccessDenied),
            None => Err(FsError::NoSuchFd),
        }
    }

    /// Write to an `O_WRONLY` fd.
    ///
    /// Only whole-file writes at offset 0 hit the striped pipeline; any
    /// other offset falls through to the local backing file.
    pub fn write(&mut self, fd: Fd, data: &[u8], offset: u64) -> Result<usize, FsError> {
        match self.fd_table.get(fd as usize).and_then(Option::as_ref) {
            Some(FdEntry::Read { .. }) => Err(FsError::AccessDenied),
            Some(FdEntry::Write { path, file }) => {
                if offset != 0 {
                    warn!(offset, "only offset-0 writes are striped, falling back to local write");
                    return Ok(file.write_at(data, offset)?);
                }
                self.session.write_file(path, data)
            }
            None => Err(FsError::NoSuchFd),
        }
    }

    /// Close an fd, ending the read session if it owned one.
    pub fn release(&mut self, fd: Fd) -> Result<(), FsError> {
        let idx = fd as usize;
        let entry = self
            .fd_table
            .get_mut(idx)
            .and_then(Option::take)
            .ok_or(FsError::NoSuchFd)?;
        if let FdEntry::Read { .. } = entry {
            self.session.end_read()?;
        }
        Ok(())
    }

    /// Logical byte length visible through an open fd.
    pub fn len(&self, fd: Fd) -> Result<u64, FsError> {
        match self.fd_table.get(fd as usize).and_then(Option::as_ref) {
            Some(FdEntry::Read { span }) => Ok(*span),
            Some(FdEntry::Write { file, .. }) => Ok(file.metadata()?.len()),
            None => Err(FsError::NoSuchFd),
        }
    }

    /// List the mount root. Metadata lives locally, so this is a plain
    /// directory scan of the client root; subdirectories are not supported.
    pub fn readdir(&self) -> Result<Vec<String>, FsError> {
        let mut names = Vec::new();
        for dent in std::fs::read_dir(&self.root)? {
            names.push(dent?.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }

    /// Echo a heartbeat off one lane (external liveness probing).
    pub fn heartbeat(&self, lane: usize, id: u64) -> Result<u64, FsError> {
        self.session.heartbeat(lane, id)
    }

    fn alloc_fd(&mut self, entry: FdEntry) -> Fd {
        if let Some(pos) = self.fd_table.iter().position(Option::is_none) {
            self.fd_table[pos] = Some(entry);
            pos as Fd
        } else {
            let fd = self.fd_table.len() as Fd;
            self.fd_table.push(Some(entry));
            fd
        }
    }

    fn local_path(&self, path: &str) -> PathBuf {
        self.root.join(Path::new(path.trim_start_matches('/')))
    }
}

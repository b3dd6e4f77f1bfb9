//! Node daemon core: serve `READ`/`WRITE_PATH`/`WRITE`/`HEARTBEAT` against a
//! local root directory.
//!
//! One handler thread per accepted connection. Each handler owns its write
//! state (the open file and its cursor), so interleaved `WRITE`s on one
//! connection advance the cursor in header-arrival order and writes to a
//! single file cannot tear. Unknown or malformed frames are protocol faults
//! and close the connection.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::protocol::{self, MessageHeader, MessageType};

/// A bound node server, ready to accept client connections.
pub struct NodeServer {
    listener: TcpListener,
    root: PathBuf,
    chunk_size: usize,
    conns: Arc<Mutex<HashMap<u64, TcpStream>>>,
    next_conn: AtomicU64,
}

impl NodeServer {
    /// Bind the listener and create the storage root.
    pub fn bind(addr: impl ToSocketAddrs, root: impl Into<PathBuf>, chunk_size: usize) -> io::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        let listener = TcpListener::bind(addr)?;
        Ok(Self {
            listener,
            root,
            chunk_size,
            conns: Arc::new(Mutex::new(HashMap::new())),
            next_conn: AtomicU64::new(0),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept and serve connections forever.
    pub fn run(self) -> io::Result<()> {
        let stop = AtomicBool::new(false);
        self.serve_until(&stop)
    }

    /// Accept and serve connections until `stop` is raised, then shut down
    /// the remaining connections so their handlers exit.
    pub fn serve_until(&self, stop: &AtomicBool) -> io::Result<()> {
        self.listener.set_nonblocking(true)?;
        info!(root = %self.root.display(), "node server accepting connections");

        while !stop.load(Ordering::Relaxed) {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    if let Err(e) = self.spawn_handler(stream, peer) {
                        warn!(%peer, error = %e, "failed to start handler");
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(1));
                }
                Err(e) => {
                    warn!(error = %e, "accept failed");
                }
            }
        }

        for (_, conn) in self.conns.lock().unwrap().drain() {
            let _ = conn.shutdown(Shutdown::Both);
        }
        Ok(())
    }

    fn spawn_handler(&self, stream: TcpStream, peer: SocketAddr) -> io::Result<()> {
        // accepted sockets do not inherit the listener's non-blocking mode on
        // every platform, so pin it
        stream.set_nonblocking(false)?;

        let id = self.next_conn.fetch_add(1, Ordering::Relaxed);
        self.conns.lock().unwrap().insert(id, stream.try_clone()?);

        let conns = Arc::clone(&self.conns);
        let root = self.root.clone();
        let chunk_size = self.chunk_size;
        thread::spawn(move || {
            debug!(%peer, "client connected");
            let mut stream = stream;
            match connection_loop(&mut stream, &root, chunk_size) {
                Ok(()) => debug!(%peer, "client disconnected"),
                Err(e) => debug!(%peer, error = %e, "connection closed"),
            }
            let _ = stream.shutdown(Shutdown::Both);
            conns.lock().unwrap().remove(&id);
        });
        Ok(())
    }
}

/// Write state a connection builds up with `WRITE_PATH` and advances with
/// each `WRITE`.
struct WriteFile {
    file: File,
    cursor: u64,
}

fn connection_loop(stream: &mut TcpStream, root: &Path, chunk_size: usize) -> io::Result<()> {
    let mut buf = vec![0u8; chunk_size];
    let mut write_file: Option<WriteFile> = None;

    loop {
        let header = match protocol::read_header_opt(stream)? {
            Some(h) => h,
            None => return Ok(()),
        };

        match header.kind {
            MessageType::Read => serve_read(stream, root, &header, chunk_size, &mut buf)?,
            MessageType::WritePath => {
                let path = recv_path(stream, &header, chunk_size, &mut buf)?;
                write_file = open_for_write(root, &path);
            }
            MessageType::Write => {
                let len = header.length as usize;
                if header.length > chunk_size as u64 {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("oversized write payload: {len}"),
                    ));
                }
                stream.read_exact(&mut buf[..len])?;
                match write_file.as_mut() {
                    Some(wf) => {
                        wf.file.seek(SeekFrom::Start(wf.cursor))?;
                        wf.file.write_all(&buf[..len])?;
                        wf.cursor += len as u64;
                    }
                    None => warn!("write without a preceding write-path, dropping payload"),
                }
            }
            MessageType::Heartbeat => {
                debug!(id = header.length, "heartbeat");
                protocol::write_header(stream, &header)?;
            }
        }
    }
}

fn recv_path(
    stream: &mut TcpStream,
    header: &MessageHeader,
    chunk_size: usize,
    buf: &mut [u8],
) -> io::Result<Vec<u8>> {
    if header.length >= chunk_size as u64 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("path length too large: {}", header.length),
        ));
    }
    let len = header.length as usize;
    stream.read_exact(&mut buf[..len])?;
    Ok(buf[..len].to_vec())
}

fn serve_read(
    stream: &mut TcpStream,
    root: &Path,
    header: &MessageHeader,
    chunk_size: usize,
    buf: &mut [u8],
) -> io::Result<()> {
    let raw = recv_path(stream, header, chunk_size, buf)?;
    let path = resolve_path(root, &raw)?;

    let mut file = match File::open(&path) {
        Ok(f) => f,
        Err(e) => {
            debug!(path = %path.display(), error = %e, "read of unopenable file");
            protocol::write_header(stream, &MessageHeader::new(MessageType::Read, 0))?;
            return Ok(());
        }
    };

    let len = file.metadata()?.len();
    protocol::write_header(stream, &MessageHeader::new(MessageType::Read, len))?;

    loop {
        let n = file.read(buf)?;
        if n == 0 {
            break;
        }
        stream.write_all(&buf[..n])?;
    }
    debug!(path = %path.display(), len, "served read");
    Ok(())
}

fn open_for_write(root: &Path, raw: &[u8]) -> Option<WriteFile> {
    let path = match resolve_path(root, raw) {
        Ok(p) => p,
        Err(e) => {
            warn!(error = %e, "rejected write path");
            return None;
        }
    };
    match OpenOptions::new().write(true).create(true).truncate(true).open(&path) {
        Ok(file) => {
            debug!(path = %path.display(), "opened for writing");
            Some(WriteFile { file, cursor: 0 })
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to open for writing");
            None
        }
    }
}

/// Resolve a client-supplied path under the storage root.
///
/// Paths arrive mount-absolute (`/a.bin`); the leading separator is stripped
/// and anything that would escape the root is rejected.
fn resolve_path(root: &Path, raw: &[u8]) -> io::Result<PathBuf> {
    let s = std::str::from_utf8(raw)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "path is not utf-8"))?;
    let rel = s.trim_start_matches('/');
    let rel = Path::new(rel);
    for component in rel.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("path escapes the root: {s}"),
                ));
            }
        }
    }
    Ok(root.join(rel))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_strips_leading_slash() {
        let root = Path::new("/srv/node0");
        assert_eq!(resolve_path(root, b"/a.bin").unwrap(), root.join("a.bin"));
        assert_eq!(resolve_path(root, b"a.bin").unwrap(), root.join("a.bin"));
    }

    #[test]
    fn resolve_rejects_escapes() {
        let root = Path::new("/srv/node0");
        assert!(resolve_path(root, b"/../etc/passwd").is_err());
        assert!(resolve_path(root, b"a/../../b").is_err());
        assert!(resolve_path(root, b"\xff\xfe").is_err());
    }
}

//! stripefs: a striped distributed filesystem with XOR parity.
//!
//! # Architecture
//!
//! ```text
//! FUSE shim (external)  ──C ABI──▶  FsClient (adapter)
//!                                      │
//!                                      ├── local root: O_WRONLY backing files, readdir
//!                                      └── Session (engine)
//!                                            │ striping + XOR parity
//!                                            └── framed TCP ──▶ stripefsd (node daemon)
//!                                                                 │
//!                                                                 └── flat chunk files under --root
//! ```
//!
//! A file written through the client is sliced into fixed-size chunks and
//! striped across N lanes: N-1 data lanes plus one XOR parity lane (the last
//! endpoint in the configured order). Reads survive any single unreachable
//! lane by reconstructing the missing chunks from parity on the fly.
//!
//! - Writes are whole-file, offset 0, and require every lane up
//! - Reads accept arbitrary (offset, size) windows
//! - Node files are flat concatenations of a lane's chunks, padded to whole
//!   strides; there is no per-chunk metadata and no manifest

pub mod client;
pub mod error;
pub mod ffi;
pub mod layout;
pub mod protocol;
pub mod ring;
pub mod server;
pub mod session;

pub use client::{Fd, FsClient};
pub use error::FsError;
pub use layout::StripeLayout;
pub use protocol::{CHUNK_SIZE, MessageHeader, MessageType};
pub use server::NodeServer;
pub use session::Session;

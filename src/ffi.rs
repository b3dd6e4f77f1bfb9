//! C FFI for libstripefs — consumed by the external FUSE shim.
//!
//! The shim owns option parsing and the mount loop; this surface carries the
//! client-mode configuration (local root, `ip:port` server list, optional
//! log file) and the per-callback operations. Errors come back as negative
//! errno values.

use std::ffi::CStr;
use std::os::raw::{c_char, c_int};
use std::sync::Arc;

use crate::client::FsClient;
use crate::protocol::CHUNK_SIZE;

fn init_logging(log_file: Option<&str>) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "stripefs=info".into());
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let res = match log_file {
        Some(path) => match std::fs::OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => builder.with_ansi(false).with_writer(Arc::new(file)).try_init(),
            Err(e) => {
                eprintln!("stripefs: cannot open log file {path}: {e}");
                builder.try_init()
            }
        },
        None => builder.try_init(),
    };
    // a second init in the same process is fine, keep the first subscriber
    let _ = res;
}

/// Connect to the configured nodes and return an opaque client handle, or
/// null on failure.
///
/// `servers` is a comma-separated `ip:port` list; its order defines the lane
/// index and the last entry is the parity lane. `log_file` may be null.
///
/// # Safety
/// `root` and `servers` must be valid NUL-terminated strings; `log_file`
/// must be null or a valid NUL-terminated string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn stripefs_init(
    root: *const c_char,
    servers: *const c_char,
    chunk_size: usize,
    log_file: *const c_char,
) -> *mut FsClient {
    let log = if log_file.is_null() {
        None
    } else {
        unsafe { CStr::from_ptr(log_file) }.to_str().ok()
    };
    init_logging(log);

    let Ok(root) = unsafe { CStr::from_ptr(root) }.to_str() else {
        return std::ptr::null_mut();
    };
    let Ok(servers) = unsafe { CStr::from_ptr(servers) }.to_str() else {
        return std::ptr::null_mut();
    };
    let servers: Vec<String> = servers
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    let chunk_size = if chunk_size == 0 { CHUNK_SIZE } else { chunk_size };

    match FsClient::new(root, &servers, chunk_size) {
        Ok(client) => Box::into_raw(Box::new(client)),
        Err(e) => {
            eprintln!("stripefs_init: {e}");
            std::ptr::null_mut()
        }
    }
}

/// Disconnect and free the client.
///
/// # Safety
/// `client` must be a valid pointer returned by `stripefs_init`, and must
/// not be used after this call.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn stripefs_destroy(client: *mut FsClient) {
    if !client.is_null() {
        drop(unsafe { Box::from_raw(client) });
    }
}

/// Open a file. Returns a file descriptor, or a negative errno.
///
/// # Safety
/// `client` must be a valid pointer. `path` must be NUL-terminated.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn stripefs_open(
    client: *mut FsClient,
    path: *const c_char,
    flags: c_int,
) -> i64 {
    let client = unsafe { &mut *client };
    let path = unsafe { CStr::from_ptr(path) };
    let Ok(path_str) = path.to_str() else {
        return -(libc::EINVAL as i64);
    };
    match client.open(path_str, flags) {
        Ok(fd) => fd as i64,
        Err(e) => -(e.errno() as i64),
    }
}

/// Read at `offset` (pread semantics). Returns bytes read, or a negative
/// errno.
///
/// # Safety
/// `client` must be valid. `buf` must point to at least `len` writable bytes.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn stripefs_read(
    client: *mut FsClient,
    fd: u32,
    buf: *mut u8,
    len: usize,
    offset: u64,
) -> i64 {
    let client = unsafe { &mut *client };
    let data = unsafe { std::slice::from_raw_parts_mut(buf, len) };
    match client.read(fd, data, offset) {
        Ok(n) => n as i64,
        Err(e) => -(e.errno() as i64),
    }
}

/// Write at `offset` (pwrite semantics; only offset 0 is striped). Returns
/// bytes written, or a negative errno.
///
/// # Safety
/// `client` must be valid. `buf` must point to at least `len` readable bytes.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn stripefs_write(
    client: *mut FsClient,
    fd: u32,
    buf: *const u8,
    len: usize,
    offset: u64,
) -> i64 {
    let client = unsafe { &mut *client };
    let data = unsafe { std::slice::from_raw_parts(buf, len) };
    match client.write(fd, data, offset) {
        Ok(n) => n as i64,
        Err(e) => -(e.errno() as i64),
    }
}

/// Close a file descriptor. Returns 0 on success, negative errno on error.
///
/// # Safety
/// `client` must be a valid pointer.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn stripefs_release(client: *mut FsClient, fd: u32) -> c_int {
    let client = unsafe { &mut *client };
    match client.release(fd) {
        Ok(()) => 0,
        Err(e) => -e.errno(),
    }
}

/// Logical byte length visible through an open fd, written to `len_out`.
/// Returns 0 on success, negative errno on error.
///
/// # Safety
/// `client` and `len_out` must be valid pointers.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn stripefs_len(client: *mut FsClient, fd: u32, len_out: *mut u64) -> c_int {
    let client = unsafe { &mut *client };
    match client.len(fd) {
        Ok(len) => {
            unsafe { *len_out = len };
            0
        }
        Err(e) => -e.errno(),
    }
}

/// List the mount root, invoking `filler(ctx, name)` once per entry. Stops
/// early if the filler returns nonzero. Returns 0 on success, negative errno
/// on error.
///
/// # Safety
/// `client` must be valid; `filler` must be a valid callback for the
/// duration of the call.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn stripefs_readdir(
    client: *mut FsClient,
    ctx: *mut std::ffi::c_void,
    filler: unsafe extern "C" fn(*mut std::ffi::c_void, *const c_char) -> c_int,
) -> c_int {
    let client = unsafe { &mut *client };
    let names = match client.readdir() {
        Ok(names) => names,
        Err(e) => return -e.errno(),
    };
    for name in names {
        let Ok(cname) = std::ffi::CString::new(name) else {
            continue;
        };
        if unsafe { filler(ctx, cname.as_ptr()) } != 0 {
            break;
        }
    }
    0
}

/// Echo a heartbeat off one lane; the echoed id is written to `id_out`.
/// Returns 0 on success, negative errno on error. For an external liveness
/// prober; the engine never sends heartbeats on its own.
///
/// # Safety
/// `client` and `id_out` must be valid pointers.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn stripefs_heartbeat(
    client: *mut FsClient,
    lane: u32,
    id: u64,
    id_out: *mut u64,
) -> c_int {
    let client = unsafe { &mut *client };
    match client.heartbeat(lane as usize, id) {
        Ok(echoed) => {
            unsafe { *id_out = echoed };
            0
        }
        Err(e) => -e.errno(),
    }
}

//! Client engine: lane connections, the striped write fan-out, and the
//! concurrent read pipeline.
//!
//! One TCP connection per configured endpoint; endpoint order defines the
//! lane index and the last lane carries parity. Each lane has a long-lived
//! receive worker fed by a command queue; a fetch command makes the worker
//! drain exactly one chunk from its socket into the lane's ring slot,
//! publishing progress through the lane's `written` watermark. Lane faults
//! flip a one-way dead flag; a dead lane is never resurrected within the
//! session.

use std::io::{self, Read};
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{Receiver, Sender, channel};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use tracing::{debug, info, warn};

use crate::error::FsError;
use crate::layout::{self, StripeLayout};
use crate::protocol::{self, MessageHeader, MessageType};
use crate::ring::Ring;

/// One node connection and its receive-side bookkeeping.
struct Lane {
    index: usize,
    stream: TcpStream,
    dead: AtomicBool,
    /// `length` of the most recent response header (the server-reported node
    /// file size on open).
    header_len: AtomicU64,
    state: Mutex<LaneState>,
    state_cv: Condvar,
    /// Bytes delivered into the current ring slot.
    written: Mutex<u64>,
    written_cv: Condvar,
}

struct LaneState {
    /// File offset of the most recently requested chunk; starts at `-S` so
    /// the first fetch advances to stride 0.
    offset: i64,
    /// Stride index of the most recently requested chunk; `-1` before the
    /// first fetch.
    stride: i64,
    /// A fetch command is in flight for the slot.
    active: bool,
}

impl Lane {
    fn new(index: usize, stream: TcpStream, stride_size: usize) -> Self {
        Self {
            index,
            stream,
            dead: AtomicBool::new(false),
            header_len: AtomicU64::new(0),
            state: Mutex::new(LaneState {
                offset: -(stride_size as i64),
                stride: -1,
                active: false,
            }),
            state_cv: Condvar::new(),
            written: Mutex::new(0),
            written_cv: Condvar::new(),
        }
    }

    fn is_dead(&self) -> bool {
        self.dead.load(Ordering::SeqCst)
    }

    /// One-way transition to dead: shut the socket down and wake every
    /// waiter. The lock-then-notify dance keeps a concurrent predicate check
    /// from slipping between the flag store and the wakeup.
    fn mark_dead(&self) {
        if !self.dead.swap(true, Ordering::SeqCst) {
            let _ = self.stream.shutdown(Shutdown::Both);
            drop(self.state.lock().unwrap());
            self.state_cv.notify_all();
            drop(self.written.lock().unwrap());
            self.written_cv.notify_all();
            warn!(lane = self.index, "lane marked dead");
        }
    }

    fn send_frame(&self, kind: MessageType, payload: &[u8]) -> Result<(), FsError> {
        if self.is_dead() {
            return Err(FsError::LaneFault(self.index));
        }
        let mut stream = &self.stream;
        if let Err(e) = protocol::send_frame(&mut stream, kind, payload) {
            debug!(lane = self.index, error = %e, "send failed");
            self.mark_dead();
            return Err(FsError::LaneFault(self.index));
        }
        Ok(())
    }

    fn recv_header(&self) -> Result<MessageHeader, FsError> {
        if self.is_dead() {
            return Err(FsError::LaneFault(self.index));
        }
        let mut stream = &self.stream;
        match protocol::read_header(&mut stream) {
            Ok(header) => Ok(header),
            Err(e) => {
                debug!(lane = self.index, error = %e, "recv failed");
                self.mark_dead();
                Err(FsError::LaneFault(self.index))
            }
        }
    }

    /// READ handshake: ask for `path` and record the server-reported length.
    /// Failures are recorded in the dead flag; the open policy inspects it.
    fn request_read(&self, path: &str) {
        if self.is_dead() {
            return;
        }
        if self.stream.set_nonblocking(false).is_err() {
            self.mark_dead();
            return;
        }
        if self.send_frame(MessageType::Read, path.as_bytes()).is_err() {
            return;
        }
        if let Ok(header) = self.recv_header() {
            self.header_len.store(header.length, Ordering::SeqCst);
            debug!(lane = self.index, len = header.length, "read handshake");
        }
    }

    /// Consume and discard `bytes` from the stream, blocking. Brings the
    /// connection back to a frame boundary after an unread file body.
    fn drain(&self, mut bytes: u64, scratch: &mut [u8]) {
        if bytes == 0 || self.is_dead() {
            return;
        }
        debug!(lane = self.index, bytes, "draining unread stream");
        if self.stream.set_nonblocking(false).is_err() {
            self.mark_dead();
            return;
        }
        let mut stream = &self.stream;
        while bytes > 0 {
            let take = scratch.len().min(bytes as usize);
            match stream.read(&mut scratch[..take]) {
                Ok(0) => {
                    self.mark_dead();
                    return;
                }
                Ok(n) => bytes -= n as u64,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    debug!(lane = self.index, error = %e, "drain failed");
                    self.mark_dead();
                    return;
                }
            }
        }
    }
}

/// Fetch order for a lane worker: drain the chunk of `stride` into the slot.
struct FetchCmd {
    stride: u64,
    /// Hold until the parity lane has been asked to receive through `stride`.
    wait_parity: bool,
}

struct SessionInner {
    layout: StripeLayout,
    lanes: Vec<Lane>,
    ring: Ring,
}

#[derive(Default)]
struct ReadState {
    active: bool,
    parity_streaming: bool,
    /// Stride count learned from the open handshake; reads are clamped to it.
    strides: u64,
    /// Lanes whose node answered `length=0` while peers reported data: the
    /// socket is fine but the file is gone there, so reads treat the lane as
    /// failed for this session.
    absent: Vec<bool>,
}

/// Per-mount client session: N lane connections, the ring, and the receive
/// workers.
pub struct Session {
    inner: Arc<SessionInner>,
    cmd_txs: Vec<Sender<FetchCmd>>,
    workers: Vec<JoinHandle<()>>,
    read: Mutex<ReadState>,
}

impl Session {
    /// Connect one lane per `ip:port` endpoint, in order. Any connect
    /// failure fails the mount; write-side fault tolerance is a non-goal.
    pub fn connect(servers: &[String], chunk_size: usize) -> Result<Self, FsError> {
        if servers.is_empty() {
            return Err(FsError::Config("at least one server endpoint is required".into()));
        }
        if chunk_size == 0 {
            return Err(FsError::Config("chunk size must be positive".into()));
        }
        let layout = StripeLayout::new(servers.len(), chunk_size);
        let stride_size = layout.stride_size();

        let mut lanes = Vec::with_capacity(servers.len());
        for (index, addr) in servers.iter().enumerate() {
            let stream = TcpStream::connect(addr.as_str()).map_err(|source| FsError::Connect {
                addr: addr.clone(),
                source,
            })?;
            debug!(lane = index, addr = %addr, "lane connected");
            lanes.push(Lane::new(index, stream, stride_size));
        }

        let inner = Arc::new(SessionInner {
            layout,
            lanes,
            ring: Ring::new(layout.lanes, chunk_size),
        });

        let mut cmd_txs = Vec::with_capacity(layout.lanes);
        let mut workers = Vec::with_capacity(layout.lanes);
        for index in 0..layout.lanes {
            let (tx, rx) = channel();
            let inner = Arc::clone(&inner);
            workers.push(thread::spawn(move || lane_worker(inner, index, rx)));
            cmd_txs.push(tx);
        }

        info!(lanes = layout.lanes, chunk_size, "session connected");
        Ok(Self {
            inner,
            cmd_txs,
            workers,
            read: Mutex::new(ReadState::default()),
        })
    }

    /// Start a read session for `path`.
    ///
    /// Sends `READ` to the first N-1 lanes in parallel, then applies the
    /// failure policy: no failures means parity stays out of play; exactly
    /// one failure (or a single-lane layout) pulls the parity lane in; more
    /// is unrecoverable. Returns the logical byte span readable through the
    /// session (`strides * S`).
    pub fn open_read(&self, path: &str) -> Result<u64, FsError> {
        let mut rs = self.read.lock().unwrap();
        if rs.active {
            return Err(FsError::Busy);
        }
        let layout = self.inner.layout;
        let n = layout.lanes;
        let stride_size = layout.stride_size() as i64;

        // settle the workers and rewind every lane to "before stride 0"
        for lane in &self.inner.lanes {
            let mut st = lane.state.lock().unwrap();
            while st.active {
                st = lane.state_cv.wait(st).unwrap();
            }
            st.offset = -stride_size;
            st.stride = -1;
            drop(st);
            *lane.written.lock().unwrap() = 0;
        }

        thread::scope(|s| {
            for lane in &self.inner.lanes[..n - 1] {
                if !lane.is_dead() {
                    s.spawn(move || lane.request_read(path));
                }
            }
        });

        let parity = &self.inner.lanes[layout.parity_lane()];
        let mut failed = 0usize;
        let mut parity_requested = n == 1;
        for i in 0..n {
            let lane = &self.inner.lanes[i];
            // first failure (or the only lane there is): bring parity in
            if (lane.is_dead() && failed == 0) || n == 1 {
                parity.request_read(path);
                parity_requested = true;
            }
            if lane.is_dead() {
                failed += 1;
                lane.header_len.store(0, Ordering::SeqCst);
                debug!(lane = i, "lane down at open");
            }
        }
        if failed > 1 || failed == n {
            self.flush_open(parity_requested);
            return Err(FsError::Unrecoverable(failed));
        }

        // node files of one path all have the same length; take the first
        // contacted lane that reported one
        let mut node_len = 0u64;
        for i in 0..n {
            let contacted = i < n - 1 || parity_requested;
            if contacted && !self.inner.lanes[i].is_dead() {
                let len = self.inner.lanes[i].header_len.load(Ordering::SeqCst);
                if len > 0 {
                    node_len = len;
                    break;
                }
            }
        }
        if node_len == 0 {
            return Err(FsError::NotFound);
        }

        // a live data lane that answered zero while a peer reported data has
        // lost the file; treat it like a failed lane and recover from parity
        let mut absent = vec![false; n];
        if n > 1 {
            for i in 0..n - 1 {
                let lane = &self.inner.lanes[i];
                if !lane.is_dead() && lane.header_len.load(Ordering::SeqCst) == 0 {
                    absent[i] = true;
                    failed += 1;
                    warn!(lane = i, "node lost the file, reading through parity");
                    if !parity_requested {
                        parity.request_read(path);
                        parity_requested = true;
                    }
                }
            }
            // recovery needs the parity stream to actually carry the file
            if failed == 1
                && parity_requested
                && !parity.is_dead()
                && parity.header_len.load(Ordering::SeqCst) == 0
            {
                failed += 1;
            }
        }
        if failed > 1 || failed == n {
            self.flush_open(parity_requested);
            return Err(FsError::Unrecoverable(failed));
        }
        let parity_streaming = n > 1 && failed == 1 && !parity.is_dead();
        if n > 1 && !parity_streaming {
            // no need for parity
            parity.header_len.store(0, Ordering::SeqCst);
        }

        rs.strides = node_len / layout.chunk_size as u64;
        rs.parity_streaming = parity_streaming;
        rs.absent = absent;
        rs.active = true;
        debug!(path, strides = rs.strides, parity_streaming, failed, "read session opened");
        Ok(rs.strides * layout.stride_size() as u64)
    }

    /// Read `buf.len()` bytes at `offset` through the ring.
    ///
    /// Covers strides `[offset/S, (end-1)/S]`; within each stride the engine
    /// materializes the overlapping chunks (all of them, plus parity, when a
    /// dead lane forces reconstruction), recovers the missing chunk in place
    /// if needed, and copies the requested ranges out. Clamped to the stride
    /// span learned at open.
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize, FsError> {
        let rs = self.read.lock().unwrap();
        if !rs.active {
            return Err(FsError::Io(io::Error::new(
                io::ErrorKind::NotConnected,
                "no read session",
            )));
        }
        let layout = self.inner.layout;
        let chunk = layout.chunk_size as u64;
        let stride_size = layout.stride_size() as u64;
        let span = rs.strides * stride_size;
        if offset >= span || buf.is_empty() {
            return Ok(0);
        }
        let end = span.min(offset + buf.len() as u64);
        let d = layout.data_lanes();
        let parity_idx = layout.parity_lane();

        let unusable =
            |lane: usize| self.inner.lanes[lane].is_dead() || rs.absent.get(lane) == Some(&true);

        for k in layout.stride_of(offset)..=layout.stride_of(end - 1) {
            let down: Vec<usize> = (0..d).filter(|&i| unusable(i)).collect();
            if down.len() >= 2 || (!down.is_empty() && !rs.parity_streaming) {
                return Err(FsError::Unrecoverable(down.len()));
            }
            let recovering = !down.is_empty();

            // parity leads: its fetch is issued before any data fetch of the
            // stride, and the data workers gate on its request offset
            if rs.parity_streaming {
                self.ensure_stride(parity_idx, k, false)?;
            }
            for lane in 0..d {
                if unusable(lane) {
                    continue;
                }
                let (cs, ce) = layout.chunk_file_range(k, lane);
                let overlaps = cs < end && ce > offset;
                if overlaps || recovering {
                    self.ensure_stride(lane, k, rs.parity_streaming)?;
                }
            }

            if recovering {
                let missing = down[0];
                self.wait_written(parity_idx, chunk)?;
                for lane in (0..d).filter(|&l| l != missing) {
                    self.wait_written(lane, chunk)?;
                }
                // SAFETY: every involved slot is fully written and its worker
                // idle below the watermark; the missing lane has no worker
                // traffic at all
                unsafe {
                    self.inner.ring.copy_slot(parity_idx, missing);
                    for lane in (0..d).filter(|&l| l != missing) {
                        self.inner.ring.xor_slot(lane, missing);
                    }
                }
                debug!(stride = k, lane = missing, "reconstructed chunk from parity");
            }

            for lane in 0..d {
                let (cs, ce) = layout.chunk_file_range(k, lane);
                let lo = cs.max(offset);
                let hi = ce.min(end);
                if lo >= hi {
                    continue;
                }
                let in_chunk = (lo - cs) as usize;
                let len = (hi - lo) as usize;
                if !unusable(lane) {
                    self.wait_written(lane, (in_chunk + len) as u64)?;
                }
                let dst = &mut buf[(lo - offset) as usize..(hi - offset) as usize];
                // SAFETY: the watermark covers the range (or the slot was
                // reconstructed above); the worker only writes beyond it
                unsafe { self.inner.ring.read_slot(lane, in_chunk, dst) };
            }
        }

        Ok((end - offset) as usize)
    }

    /// Close the read session.
    ///
    /// Node streams are sequential and carry the whole file, so whatever the
    /// read windows did not consume is drained here; the next handshake then
    /// starts at a frame boundary.
    pub fn end_read(&self) -> Result<(), FsError> {
        let mut rs = self.read.lock().unwrap();
        if !rs.active {
            return Ok(());
        }
        let chunk = self.inner.layout.chunk_size as u64;
        let mut scratch = vec![0u8; self.inner.layout.chunk_size];

        for lane in &self.inner.lanes {
            if lane.is_dead() {
                continue;
            }
            let consumed = {
                let mut st = lane.state.lock().unwrap();
                while st.active && !lane.is_dead() {
                    st = lane.state_cv.wait(st).unwrap();
                }
                (st.stride + 1).max(0) as u64 * chunk
            };
            let remaining = lane.header_len.load(Ordering::SeqCst).saturating_sub(consumed);
            lane.drain(remaining, &mut scratch);
        }

        rs.active = false;
        Ok(())
    }

    /// Whole-file striped write starting at offset 0.
    ///
    /// `WRITE_PATH` goes to every live lane, then each stride is zero-padded,
    /// its parity computed, and all N chunks sent on parallel threads joined
    /// before the next stride starts. A send failure kills the lane but not
    /// the write; the resulting file is simply no longer recoverable.
    pub fn write_file(&self, path: &str, data: &[u8]) -> Result<usize, FsError> {
        {
            let rs = self.read.lock().unwrap();
            if rs.active {
                return Err(FsError::Busy);
            }
        }
        let layout = self.inner.layout;
        let chunk = layout.chunk_size;
        let stride_size = layout.stride_size();

        for lane in &self.inner.lanes {
            if lane.is_dead() {
                continue;
            }
            let mut st = lane.state.lock().unwrap();
            while st.active && !lane.is_dead() {
                st = lane.state_cv.wait(st).unwrap();
            }
            drop(st);
            if lane.stream.set_nonblocking(false).is_err() {
                lane.mark_dead();
            }
        }

        for lane in &self.inner.lanes {
            if !lane.is_dead() {
                let _ = lane.send_frame(MessageType::WritePath, path.as_bytes());
            }
        }

        let strides = layout.stride_count(data.len() as u64);
        let mut stride_buf = vec![0u8; stride_size];
        let mut parity = vec![0u8; chunk];
        for k in 0..strides {
            let lo = (k * stride_size as u64) as usize;
            let hi = data.len().min(lo + stride_size);
            stride_buf.fill(0);
            stride_buf[..hi - lo].copy_from_slice(&data[lo..hi]);
            if layout.has_parity() {
                layout::compute_parity(&stride_buf, &mut parity);
            }

            let parity_chunk = &parity;
            let stride_chunks = &stride_buf;
            thread::scope(|s| {
                for (i, lane) in self.inner.lanes.iter().enumerate() {
                    if lane.is_dead() {
                        continue;
                    }
                    let payload: &[u8] = if layout.has_parity() && i == layout.parity_lane() {
                        parity_chunk
                    } else {
                        &stride_chunks[i * chunk..(i + 1) * chunk]
                    };
                    s.spawn(move || {
                        let _ = lane.send_frame(MessageType::Write, payload);
                    });
                }
            });
        }

        info!(path, size = data.len(), strides, "striped write complete");
        Ok(data.len())
    }

    /// Echo a heartbeat off one lane. For an external liveness prober; the
    /// read and write engines never send this themselves.
    pub fn heartbeat(&self, lane_idx: usize, id: u64) -> Result<u64, FsError> {
        let rs = self.read.lock().unwrap();
        if rs.active {
            return Err(FsError::Busy);
        }
        let lane = self
            .inner
            .lanes
            .get(lane_idx)
            .ok_or_else(|| FsError::Config(format!("no such lane: {lane_idx}")))?;
        if lane.is_dead() {
            return Err(FsError::LaneFault(lane_idx));
        }
        if lane.stream.set_nonblocking(false).is_err() {
            lane.mark_dead();
            return Err(FsError::LaneFault(lane_idx));
        }
        let mut stream = &lane.stream;
        if let Err(e) =
            protocol::write_header(&mut stream, &MessageHeader::new(MessageType::Heartbeat, id))
        {
            debug!(lane = lane_idx, error = %e, "heartbeat send failed");
            lane.mark_dead();
            return Err(FsError::LaneFault(lane_idx));
        }
        let header = lane.recv_header()?;
        Ok(header.length)
    }

    /// Flush the file bodies of an aborted open: the lanes that answered are
    /// already streaming, and the connections must stay frame-aligned.
    fn flush_open(&self, parity_requested: bool) {
        let n = self.inner.layout.lanes;
        let mut scratch = vec![0u8; self.inner.layout.chunk_size];
        for i in 0..n {
            if i < n - 1 || parity_requested {
                let lane = &self.inner.lanes[i];
                lane.drain(lane.header_len.load(Ordering::SeqCst), &mut scratch);
            }
        }
    }

    /// Request the next chunks on a lane until `stride` has been asked for.
    ///
    /// Node streams are sequential, so a lane advances one stride at a time;
    /// a window that starts deeper into the file drains the strides before
    /// it. At most one fetch is in flight per lane.
    fn ensure_stride(&self, lane_idx: usize, stride: u64, wait_parity: bool) -> Result<(), FsError> {
        let lane = &self.inner.lanes[lane_idx];
        loop {
            let mut st = lane.state.lock().unwrap();
            if st.stride > stride as i64 {
                return Err(FsError::Io(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "read window behind the stream position",
                )));
            }
            if st.stride == stride as i64 {
                return Ok(());
            }
            while st.active {
                if lane.is_dead() {
                    return Err(FsError::LaneFault(lane_idx));
                }
                st = lane.state_cv.wait(st).unwrap();
            }
            if lane.is_dead() {
                return Err(FsError::LaneFault(lane_idx));
            }
            let next = st.stride + 1;
            st.stride = next;
            st.offset = self.inner.layout.request_offset(next as u64, lane_idx);
            st.active = true;
            // offset advanced: parity waiters watch this
            lane.state_cv.notify_all();
            drop(st);
            *lane.written.lock().unwrap() = 0;
            self.cmd_txs[lane_idx]
                .send(FetchCmd {
                    stride: next as u64,
                    wait_parity,
                })
                .map_err(|_| FsError::LaneFault(lane_idx))?;
        }
    }

    /// Block until the lane's current slot holds at least `need` bytes.
    fn wait_written(&self, lane_idx: usize, need: u64) -> Result<(), FsError> {
        let lane = &self.inner.lanes[lane_idx];
        let mut w = lane.written.lock().unwrap();
        while *w < need {
            if lane.is_dead() {
                return Err(FsError::LaneFault(lane_idx));
            }
            w = lane.written_cv.wait(w).unwrap();
        }
        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        for lane in &self.inner.lanes {
            let _ = lane.stream.shutdown(Shutdown::Both);
        }
        self.cmd_txs.clear();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

/// Long-lived receive worker for one lane.
///
/// Consumes fetch commands and drains exactly one chunk per command into the
/// lane's ring slot with non-blocking reads, spinning benignly on
/// `WouldBlock`. EOF or any other recv error is a protocol violation that
/// kills the lane.
fn lane_worker(inner: Arc<SessionInner>, index: usize, rx: Receiver<FetchCmd>) {
    let chunk = inner.layout.chunk_size;
    let stride_size = inner.layout.stride_size() as i64;
    let parity_idx = inner.layout.parity_lane();
    let lane = &inner.lanes[index];

    while let Ok(cmd) = rx.recv() {
        if cmd.wait_parity {
            // parity must lead: hold until the parity lane has been asked to
            // receive through this stride
            let parity = &inner.lanes[parity_idx];
            let mut st = parity.state.lock().unwrap();
            while !parity.is_dead() && st.offset / stride_size < cmd.stride as i64 {
                st = parity.state_cv.wait(st).unwrap();
            }
        }

        if !lane.is_dead() && lane.stream.set_nonblocking(true).is_err() {
            lane.mark_dead();
        }

        // SAFETY: this worker is the slot's only writer while the fetch is
        // active, and the engine reads only below the published watermark
        let slot = unsafe { inner.ring.slot_mut(index) };
        let mut filled = 0usize;
        while filled < chunk && !lane.is_dead() {
            match (&lane.stream).read(&mut slot[filled..chunk]) {
                Ok(0) => lane.mark_dead(),
                Ok(n) => {
                    filled += n;
                    let mut w = lane.written.lock().unwrap();
                    *w += n as u64;
                    lane.written_cv.notify_all();
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => thread::yield_now(),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    debug!(lane = index, error = %e, "recv failed");
                    lane.mark_dead();
                }
            }
        }

        let mut st = lane.state.lock().unwrap();
        st.active = false;
        lane.state_cv.notify_all();
    }
}

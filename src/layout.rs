//! Stripe geometry and XOR coding.
//!
//! A stride is one horizontal row across all lanes: `N-1` data chunks on
//! lanes `0..N-2` plus one XOR parity chunk on the last lane. With a single
//! lane there is no parity and a stride is one chunk. The trailing partial
//! stride of a file is zero-padded to a full stride before parity is
//! computed, so node files always hold whole chunks.

/// Geometry of a striped file: lane count and chunk size.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StripeLayout {
    pub lanes: usize,
    pub chunk_size: usize,
}

impl StripeLayout {
    pub fn new(lanes: usize, chunk_size: usize) -> Self {
        assert!(lanes >= 1, "at least one lane");
        assert!(chunk_size >= 1, "chunk size must be positive");
        Self { lanes, chunk_size }
    }

    /// Number of data lanes: `max(N-1, 1)`.
    pub fn data_lanes(&self) -> usize {
        self.lanes.saturating_sub(1).max(1)
    }

    /// Index of the parity lane (the last endpoint by convention).
    pub fn parity_lane(&self) -> usize {
        self.lanes - 1
    }

    /// Whether the layout carries parity at all (`N > 1`).
    pub fn has_parity(&self) -> bool {
        self.lanes > 1
    }

    /// Bytes per stride: `data_lanes * chunk_size`.
    pub fn stride_size(&self) -> usize {
        self.data_lanes() * self.chunk_size
    }

    /// Stride index covering a file offset.
    pub fn stride_of(&self, offset: u64) -> u64 {
        offset / self.stride_size() as u64
    }

    /// Number of strides needed for a file of `len` bytes.
    pub fn stride_count(&self, len: u64) -> u64 {
        len.div_ceil(self.stride_size() as u64)
    }

    /// Node-side file length after a full write of `len` bytes.
    pub fn node_len(&self, len: u64) -> u64 {
        self.stride_count(len) * self.chunk_size as u64
    }

    /// File byte range `[start, end)` covered by data chunk `lane` of `stride`.
    pub fn chunk_file_range(&self, stride: u64, lane: usize) -> (u64, u64) {
        debug_assert!(lane < self.data_lanes());
        let start = stride * self.stride_size() as u64 + (lane * self.chunk_size) as u64;
        (start, start + self.chunk_size as u64)
    }

    /// The lane-local offset a lane's request cursor lands on when asked for
    /// its chunk of `stride`: data chunk `d` sits at `stride*S + d*C`, the
    /// parity chunk at `stride*S + D*C`.
    pub fn request_offset(&self, stride: u64, lane: usize) -> i64 {
        let within = if self.has_parity() && lane == self.parity_lane() {
            self.data_lanes() * self.chunk_size
        } else {
            lane * self.chunk_size
        };
        (stride * self.stride_size() as u64 + within as u64) as i64
    }
}

/// XOR `src` into `acc`, byte by byte. Slices must have equal length.
pub fn xor_into(acc: &mut [u8], src: &[u8]) {
    debug_assert_eq!(acc.len(), src.len());
    for (a, s) in acc.iter_mut().zip(src) {
        *a ^= s;
    }
}

/// Compute the parity chunk of a full stride buffer.
///
/// `stride` must hold `data_lanes` chunks of `parity.len()` bytes each.
pub fn compute_parity(stride: &[u8], parity: &mut [u8]) {
    let chunk = parity.len();
    debug_assert_eq!(stride.len() % chunk, 0);
    parity.fill(0);
    for data in stride.chunks_exact(chunk) {
        xor_into(parity, data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::CHUNK_SIZE;

    #[test]
    fn geometry_three_lanes() {
        let layout = StripeLayout::new(3, CHUNK_SIZE);
        assert_eq!(layout.data_lanes(), 2);
        assert_eq!(layout.parity_lane(), 2);
        assert_eq!(layout.stride_size(), 2 * CHUNK_SIZE);
        assert_eq!(layout.stride_of(0), 0);
        assert_eq!(layout.stride_of(2 * CHUNK_SIZE as u64), 1);
        assert_eq!(layout.chunk_file_range(1, 1).0, 3 * CHUNK_SIZE as u64);
    }

    #[test]
    fn geometry_single_lane() {
        let layout = StripeLayout::new(1, 4096);
        assert_eq!(layout.data_lanes(), 1);
        assert!(!layout.has_parity());
        assert_eq!(layout.stride_size(), 4096);
    }

    #[test]
    fn node_len_rounds_up_to_whole_strides() {
        let layout = StripeLayout::new(3, 4096);
        assert_eq!(layout.node_len(0), 0);
        assert_eq!(layout.node_len(1), 4096);
        assert_eq!(layout.node_len(8192), 4096);
        assert_eq!(layout.node_len(8193), 8192);
    }

    #[test]
    fn request_offset_per_lane() {
        let layout = StripeLayout::new(3, 4096);
        assert_eq!(layout.request_offset(0, 0), 0);
        assert_eq!(layout.request_offset(0, 1), 4096);
        assert_eq!(layout.request_offset(0, 2), 8192);
        assert_eq!(layout.request_offset(2, 1), 2 * 8192 + 4096);
    }

    #[test]
    fn parity_recovers_any_data_chunk() {
        let chunk = 64;
        let stride: Vec<u8> = (0..3 * chunk).map(|i| (i * 31 % 251) as u8).collect();
        let mut parity = vec![0u8; chunk];
        compute_parity(&stride, &mut parity);

        for missing in 0..3 {
            let mut recovered = parity.clone();
            for j in 0..3 {
                if j != missing {
                    xor_into(&mut recovered, &stride[j * chunk..(j + 1) * chunk]);
                }
            }
            assert_eq!(recovered, &stride[missing * chunk..(missing + 1) * chunk]);
        }
    }
}

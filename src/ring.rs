//! Per-lane chunk slots for the read pipeline.
//!
//! One contiguous buffer of `lanes * chunk_size` bytes, partitioned into one
//! slot per lane. A lane's receive worker is the only writer of its slot
//! while a fetch is in flight; the engine reads a slot only below the lane's
//! published `written` watermark, or after the worker has gone idle. That
//! protocol, not the type system, is what keeps accesses disjoint, so slot
//! access goes through raw pointers.

use std::cell::UnsafeCell;

pub struct Ring {
    buf: Box<[UnsafeCell<u8>]>,
    slot_size: usize,
}

// SAFETY: all slot access is through raw pointers under the lane protocol
// described above; the engine and the workers never touch the same bytes
// concurrently, and the per-lane progress mutex orders their accesses.
unsafe impl Send for Ring {}
unsafe impl Sync for Ring {}

impl Ring {
    pub fn new(slots: usize, slot_size: usize) -> Self {
        let buf: Box<[UnsafeCell<u8>]> =
            (0..slots * slot_size).map(|_| UnsafeCell::new(0)).collect();
        Self { buf, slot_size }
    }

    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    pub fn slots(&self) -> usize {
        self.buf.len() / self.slot_size
    }

    fn base(&self) -> *mut u8 {
        self.buf.as_ptr() as *mut u8
    }

    fn slot_ptr(&self, lane: usize) -> *mut u8 {
        debug_assert!(lane < self.slots());
        // SAFETY: lane is in bounds, so the offset stays inside the buffer.
        unsafe { self.base().add(lane * self.slot_size) }
    }

    /// Exclusive view of a lane's slot.
    ///
    /// # Safety
    /// The caller must be the slot's only writer for the lifetime of the
    /// returned slice, and readers must stay below the lane's published
    /// watermark.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn slot_mut(&self, lane: usize) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.slot_ptr(lane), self.slot_size) }
    }

    /// Copy `dst.len()` bytes out of a lane's slot starting at `offset`.
    ///
    /// # Safety
    /// The range `[offset, offset + dst.len())` must be fully written and no
    /// longer owned by a worker.
    pub unsafe fn read_slot(&self, lane: usize, offset: usize, dst: &mut [u8]) {
        debug_assert!(offset + dst.len() <= self.slot_size);
        // SAFETY: range checked above; caller guarantees the bytes are settled.
        unsafe {
            std::ptr::copy_nonoverlapping(self.slot_ptr(lane).add(offset), dst.as_mut_ptr(), dst.len());
        }
    }

    /// Overwrite slot `dst` with the contents of slot `src`.
    ///
    /// # Safety
    /// Both slots must be settled (no worker in flight).
    pub unsafe fn copy_slot(&self, src: usize, dst: usize) {
        debug_assert_ne!(src, dst);
        // SAFETY: distinct in-bounds slots, settled per the caller's contract.
        unsafe {
            std::ptr::copy_nonoverlapping(self.slot_ptr(src), self.slot_ptr(dst), self.slot_size);
        }
    }

    /// XOR slot `src` into slot `dst`, byte by byte.
    ///
    /// # Safety
    /// Both slots must be settled (no worker in flight).
    pub unsafe fn xor_slot(&self, src: usize, dst: usize) {
        debug_assert_ne!(src, dst);
        let s = self.slot_ptr(src);
        let d = self.slot_ptr(dst);
        for i in 0..self.slot_size {
            // SAFETY: i < slot_size keeps both pointers in bounds.
            unsafe { *d.add(i) ^= *s.add(i) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_are_disjoint() {
        let ring = Ring::new(3, 8);
        unsafe {
            ring.slot_mut(0).fill(1);
            ring.slot_mut(1).fill(2);
            ring.slot_mut(2).fill(3);
            let mut out = [0u8; 8];
            ring.read_slot(1, 0, &mut out);
            assert_eq!(out, [2u8; 8]);
        }
    }

    #[test]
    fn copy_and_xor_recover_a_slot() {
        let ring = Ring::new(3, 16);
        unsafe {
            for (i, b) in ring.slot_mut(0).iter_mut().enumerate() {
                *b = i as u8;
            }
            for (i, b) in ring.slot_mut(2).iter_mut().enumerate() {
                *b = (i as u8).wrapping_mul(7);
            }
            // parity of slots 0 and 2 into slot 1
            ring.copy_slot(0, 1);
            ring.xor_slot(2, 1);
            // recover slot 0 from parity and slot 2
            let mut want = [0u8; 16];
            ring.read_slot(0, 0, &mut want);
            ring.copy_slot(1, 0);
            ring.xor_slot(2, 0);
            let mut got = [0u8; 16];
            ring.read_slot(0, 0, &mut got);
            assert_eq!(got, want);
        }
    }
}

// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use std::io;
use std::sync::atomic::{AtomicU16, Ordering};

use io_uring::{types, IoUring};

/// Default slot size for a provided buffer group: large enough for a full
/// TCP segment or UDP datagram without excessive waste. Matches the
/// `MaxBufferSize` constant in the source this design was distilled from.
pub const DEFAULT_SLOT_SIZE: u32 = 20 * 1024;

/// A kernel-provided buffer ring: `num_slots` equally-sized anonymous-mapped
/// buffers, registered with the kernel so that read/recv completions can be
/// satisfied without the caller pre-specifying a buffer per operation.
///
/// Owns the mmap'd region backing both the `io_uring_buf` headers and the
/// buffer bytes, plus one boxed slice per slot so Rust-side ownership of a
/// slot's payload can be taken out (via [`BufferGroup::take`]) for the
/// duration of one completion and handed back (via [`BufferGroup::give`])
/// once the dispatcher has copied the payload out.
pub struct BufferGroup {
    /// Pointer to the shared-memory region holding the `io_uring_buf`
    /// descriptors. Size is `sizeof(io_uring_buf) * num_slots`.
    ring_addr: *mut libc::c_void,
    num_slots: u16,
    slot_size: u32,
    /// Tail of the ring, including slots not yet published to the kernel.
    private_tail: u16,
    group_id: u16,
    slots: Vec<Box<[u8]>>,
}

impl BufferGroup {
    /// Registers a new buffer group with `ring`, using `group_id` as the
    /// caller-chosen group id carried in read/recv submissions.
    ///
    /// `num_slots` must be a power of two.
    pub fn new(
        ring: &mut IoUring,
        group_id: u16,
        num_slots: u16,
        slot_size: u32,
    ) -> io::Result<Self> {
        assert!(
            num_slots.is_power_of_two(),
            "buffer group slot count must be a power of two"
        );

        let len = (num_slots as usize) * std::mem::size_of::<types::BufRingEntry>();
        let ring_addr = unsafe {
            match libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_ANONYMOUS | libc::MAP_SHARED | libc::MAP_POPULATE,
                -1,
                0,
            ) {
                libc::MAP_FAILED => return Err(io::Error::last_os_error()),
                addr => addr,
            }
        };

        let mut group = Self {
            ring_addr,
            num_slots,
            slot_size,
            private_tail: 0,
            group_id,
            slots: Vec::with_capacity(num_slots as usize),
        };

        unsafe {
            ring.submitter()
                .register_buf_ring(group.ring_addr as u64, num_slots, group.group_id)?;
        };

        for bid in 0..num_slots {
            group.slots.push(vec![0u8; slot_size as usize].into_boxed_slice());
            let addr = group.slots[bid as usize].as_ptr() as *mut u8;
            group.push_slot(addr, slot_size, bid);
        }

        group.publish();

        Ok(group)
    }

    pub fn group_id(&self) -> u16 {
        self.group_id
    }

    fn mask(&self) -> u16 {
        self.num_slots - 1
    }

    /// Writes `addr`/`len`/`bid` into the next unpublished slot descriptor.
    fn push_slot(&mut self, addr: *mut u8, len: u32, bid: u16) {
        let entries = self.ring_addr as *mut types::BufRingEntry;
        let index = self.private_tail & self.mask();

        // SAFETY: index is masked into range, entries was sized for
        // num_slots descriptors by the mmap above.
        let entry = unsafe { &mut *entries.add(index as usize) };
        entry.set_addr(addr as u64);
        entry.set_len(len);
        entry.set_bid(bid);

        self.private_tail = self.private_tail.wrapping_add(1);
    }

    /// Publishes the unpublished slots by advancing the shared tail counter
    /// the kernel reads, with release ordering so the slot writes above are
    /// visible before the kernel observes the new tail.
    fn publish(&mut self) {
        let base = self.ring_addr as *const types::BufRingEntry;
        // SAFETY: the tail counter lives in the head cell of the mmap'd
        // region per the kernel's io_uring_buf_ring layout.
        let shared_tail = unsafe { types::BufRingEntry::tail(base) } as *const AtomicU16;
        unsafe { (*shared_tail).store(self.private_tail, Ordering::Release) };
    }

    /// Takes ownership of slot `id`'s backing bytes out of the group.
    ///
    /// # Safety
    /// `id` must come from a completion that set the buffer-selected flag,
    /// and must not already have been taken without a matching [`give`].
    pub unsafe fn take(&mut self, id: u16) -> Box<[u8]> {
        std::mem::take(&mut self.slots[id as usize])
    }

    /// Reinstalls `buf` at slot `id` and republishes it to the kernel,
    /// making the slot available to satisfy a future completion.
    ///
    /// # Safety
    /// `buf` must be the box previously returned by `take(id)`.
    pub unsafe fn give(&mut self, buf: Box<[u8]>, id: u16) {
        let addr = buf.as_ptr() as *mut u8;
        self.slots[id as usize] = buf;
        self.push_slot(addr, self.slot_size, id);
        self.publish();
    }
}

// The mmap'd region is owned exclusively by this BufferGroup and is never
// shared across threads; Drop unmaps it so a long-running process doesn't
// leak address space across driver restarts (e.g. in tests).
impl Drop for BufferGroup {
    fn drop(&mut self) {
        let len = (self.num_slots as usize) * std::mem::size_of::<types::BufRingEntry>();
        unsafe {
            libc::munmap(self.ring_addr, len);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_then_give_cycles_a_slot_back_to_kernel_ownership() {
        let mut ring = IoUring::new(8).unwrap();
        let mut group = BufferGroup::new(&mut ring, 1, 4, 256).unwrap();

        let slot = unsafe { group.take(0) };
        assert_eq!(slot.len(), 256);
        unsafe { group.give(slot, 0) };

        assert_eq!(group.slots[0].len(), 256);
    }

    #[test]
    fn group_id_and_mask_reflect_construction_parameters() {
        let mut ring = IoUring::new(8).unwrap();
        let group = BufferGroup::new(&mut ring, 42, 8, 512).unwrap();
        assert_eq!(group.group_id(), 42);
        assert_eq!(group.mask(), 7);
    }
}

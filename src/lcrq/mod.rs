//! LCRQ — Linked Concurrent Ring Queue.
//!
//! A singly-linked chain of fixed-size ring segments. Within a segment,
//! producers and consumers race on a 128-bit per-cell CAS; when a segment
//! fills up or becomes congested it is closed and a fresh one is linked.
//!
//! This queue does not scale much beyond ~20 threads, but within a single
//! segment it is considerably faster than [`crate::msq::Msq`] under
//! contention.
//!
//! Reference: A. Morrison and Y. Afek, "Fast Concurrent Queues for x86
//! Processors", PPoPP 2013.
//!
//! Elements are restricted to `u64` (with one reserved sentinel value, see
//! `EMPTY`), matching the original this is ported from: packing an
//! arbitrary `T` into a ring cell would need either a side table or
//! shrinking `T` to 56 bits, and the source never does either.

use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};

use crossbeam_utils::CachePadded;
use portable_atomic::AtomicU128;

use crate::queue::{Backend, Queue};

const TAG_MASK: u64 = 1u64 << 63;
const INDEX_MASK: u64 = !TAG_MASK;

#[inline]
fn get_index(index: u64) -> u64 {
    index & INDEX_MASK
}

#[inline]
fn get_tag(index: u64) -> u64 {
    index & TAG_MASK
}

#[inline]
fn set_tag(index: u64, tag: u64) -> u64 {
    index | tag
}

#[inline]
fn pack(index: u64, value: u64) -> u128 {
    ((index as u128) << 64) | value as u128
}

#[inline]
fn unpack(raw: u128) -> (u64, u64) {
    ((raw >> 64) as u64, raw as u64)
}

/// Flips the closed bit of `target` with a CAS loop. Returns `true` iff this
/// call is the one that set a previously-clear bit (a portable stand-in for
/// the original's `lock bts` fast path, per spec design notes §9).
fn test_and_set_tag(target: &AtomicU64) -> bool {
    loop {
        let current = target.load(Ordering::Relaxed);
        if get_tag(current) != 0 {
            return false;
        }
        let desired = current | TAG_MASK;
        if target
            .compare_exchange_weak(current, desired, Ordering::Release, Ordering::Relaxed)
            .is_ok()
        {
            return true;
        }
    }
}

struct RingSegment<const RING_SIZE_POWER: u32> {
    head: CachePadded<AtomicU64>,
    tail: CachePadded<AtomicU64>,
    next: CachePadded<AtomicPtr<RingSegment<RING_SIZE_POWER>>>,
    cells: Box<[CachePadded<AtomicU128>]>,
}

impl<const RING_SIZE_POWER: u32> RingSegment<RING_SIZE_POWER> {
    const RING_SIZE: u64 = 1u64 << RING_SIZE_POWER;

    fn new(empty: u64) -> Self {
        let cells = (0..Self::RING_SIZE)
            .map(|i| CachePadded::new(AtomicU128::new(pack(i, empty))))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            head: CachePadded::new(AtomicU64::new(0)),
            tail: CachePadded::new(AtomicU64::new(0)),
            next: CachePadded::new(AtomicPtr::new(ptr::null_mut())),
            cells,
        }
    }

    fn cell(&self, index: u64) -> &AtomicU128 {
        &self.cells[(index & (Self::RING_SIZE - 1)) as usize]
    }

    /// Repairs `tail`/`head` drift left by failed push attempts that bumped
    /// `tail` without ever producing a value.
    fn fix_state(&self) {
        loop {
            let t = self.tail.load(Ordering::Relaxed);
            let h = self.head.load(Ordering::Relaxed);
            if self.tail.load(Ordering::Relaxed) != t {
                continue;
            }
            if t >= h
                || self
                    .tail
                    .compare_exchange_weak(t, h, Ordering::Release, Ordering::Relaxed)
                    .is_ok()
            {
                return;
            }
        }
    }
}

/// A chain of ring segments forming one linked concurrent ring queue.
///
/// `EMPTY` is the reserved sentinel distinguishing "no element" from a
/// stored value; callers must never push it. `RING_SIZE_POWER` is the
/// base-2 log of each segment's capacity (default 1024 slots).
pub struct Lcrq<const EMPTY: u64 = 0, const RING_SIZE_POWER: u32 = 10> {
    head: CachePadded<AtomicPtr<RingSegment<RING_SIZE_POWER>>>,
    tail: CachePadded<AtomicPtr<RingSegment<RING_SIZE_POWER>>>,
}

// SAFETY: all shared state is reached only through atomics and CAS-guarded
// ownership transfer of segments; `u64` payloads need no per-thread affinity.
unsafe impl<const EMPTY: u64, const RING_SIZE_POWER: u32> Send for Lcrq<EMPTY, RING_SIZE_POWER> {}
unsafe impl<const EMPTY: u64, const RING_SIZE_POWER: u32> Sync for Lcrq<EMPTY, RING_SIZE_POWER> {}

impl<const EMPTY: u64, const RING_SIZE_POWER: u32> Default for Lcrq<EMPTY, RING_SIZE_POWER> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const EMPTY: u64, const RING_SIZE_POWER: u32> Lcrq<EMPTY, RING_SIZE_POWER> {
    const RING_SIZE: u64 = 1u64 << RING_SIZE_POWER;

    pub fn new() -> Self {
        let first = Box::into_raw(Box::new(RingSegment::<RING_SIZE_POWER>::new(EMPTY)));
        Self {
            head: CachePadded::new(AtomicPtr::new(first)),
            tail: CachePadded::new(AtomicPtr::new(first)),
        }
    }

    /// Pushes `element` onto the tail. `element` must not equal `EMPTY`.
    pub fn push(&self, element: u64) -> bool {
        debug_assert_ne!(element, EMPTY, "cannot push the reserved EMPTY sentinel");
        let mut attempts_to_close = 0u32;

        loop {
            let queue = self.tail.load(Ordering::Acquire);
            // SAFETY: `queue` is always a live segment owned by this chain.
            let seg = unsafe { &*queue };

            let next = seg.next.load(Ordering::Relaxed);
            if !next.is_null() {
                let _ = self.tail.compare_exchange(
                    queue,
                    next,
                    Ordering::Release,
                    Ordering::Relaxed,
                );
                continue;
            }

            let tail_ticket = seg.tail.fetch_add(1, Ordering::AcqRel);

            if get_tag(tail_ticket) != 0 {
                if self.add_queue(seg, element) {
                    return true;
                }
                continue;
            }

            let cell = seg.cell(tail_ticket);
            let raw = cell.load(Ordering::Relaxed);
            let (index, value) = unpack(raw);

            if value == EMPTY
                && get_index(index) <= tail_ticket
                && (get_tag(index) == 0 || seg.head.load(Ordering::Acquire) < tail_ticket)
            {
                let desired = pack(tail_ticket, element);
                if cell
                    .compare_exchange(raw, desired, Ordering::Release, Ordering::Relaxed)
                    .is_ok()
                {
                    return true;
                }
            }

            let head = seg.head.load(Ordering::Relaxed);
            if tail_ticket.wrapping_sub(head) > Self::RING_SIZE {
                let closing_ticket = tail_ticket + 1;
                attempts_to_close += 1;
                let closed = if attempts_to_close < 10 {
                    seg.tail
                        .compare_exchange(
                            closing_ticket,
                            closing_ticket | TAG_MASK,
                            Ordering::Release,
                            Ordering::Relaxed,
                        )
                        .is_ok()
                } else {
                    test_and_set_tag(&seg.tail)
                };
                if closed {
                    log::trace!("lcrq: closing congested ring segment");
                    if self.add_queue(seg, element) {
                        return true;
                    }
                    continue;
                }
            }
        }
    }

    /// Links a fresh segment after `queue`, pre-populated with `element` at
    /// slot 0. Returns `false` if another thread already linked one first,
    /// in which case the whole push must restart from scratch.
    fn add_queue(&self, queue: &RingSegment<RING_SIZE_POWER>, element: u64) -> bool {
        let mut new_segment = Box::new(RingSegment::<RING_SIZE_POWER>::new(EMPTY));
        new_segment.tail.store(1, Ordering::Relaxed);
        new_segment.cell(0).store(pack(0, element), Ordering::Relaxed);
        let new_ptr = Box::into_raw(new_segment);

        match queue.next.compare_exchange(
            ptr::null_mut(),
            new_ptr,
            Ordering::Release,
            Ordering::Relaxed,
        ) {
            Ok(_) => {
                let queue_ptr = queue as *const _ as *mut RingSegment<RING_SIZE_POWER>;
                let _ = self.tail.compare_exchange(
                    queue_ptr,
                    new_ptr,
                    Ordering::Release,
                    Ordering::Relaxed,
                );
                log::trace!("lcrq: linked new ring segment");
                true
            }
            Err(_) => {
                // SAFETY: new_ptr was never published to another thread.
                unsafe {
                    drop(Box::from_raw(new_ptr));
                }
                false
            }
        }
    }

    /// Pops the head element, if any.
    pub fn pop(&self, out: &mut u64) -> bool {
        loop {
            let queue_ptr = self.head.load(Ordering::Acquire);
            // SAFETY: `queue_ptr` is always a live segment owned by this chain.
            let seg = unsafe { &*queue_ptr };

            let head_ticket = seg.head.fetch_add(1, Ordering::AcqRel);
            let cell = seg.cell(head_ticket);

            let mut tail_sample = 0u64;
            let mut retry = 0u64;

            let found = loop {
                let raw = cell.load(Ordering::Relaxed);
                let (index, value) = unpack(raw);
                let masked_index = get_index(index);
                let unsafe_bit = get_tag(index);

                if masked_index > head_ticket {
                    break None;
                }

                if value != EMPTY {
                    if masked_index == head_ticket {
                        let desired =
                            pack(set_tag(head_ticket + Self::RING_SIZE, unsafe_bit), EMPTY);
                        if cell
                            .compare_exchange(raw, desired, Ordering::Release, Ordering::Relaxed)
                            .is_ok()
                        {
                            break Some(value);
                        }
                    } else {
                        let desired = pack(set_tag(masked_index, TAG_MASK), value);
                        if cell
                            .compare_exchange(raw, desired, Ordering::Release, Ordering::Relaxed)
                            .is_ok()
                        {
                            break None;
                        }
                    }
                } else {
                    if retry & 1023 == 0 {
                        tail_sample = seg.tail.load(Ordering::Relaxed);
                    }

                    let desired = pack(set_tag(head_ticket + Self::RING_SIZE, unsafe_bit), EMPTY);
                    if unsafe_bit != 0 {
                        if cell
                            .compare_exchange(raw, desired, Ordering::Release, Ordering::Relaxed)
                            .is_ok()
                        {
                            break None;
                        }
                    } else if get_index(tail_sample) < head_ticket + 1
                        || retry > 200_000
                        || get_tag(tail_sample) != 0
                    {
                        if cell
                            .compare_exchange(raw, desired, Ordering::Release, Ordering::Relaxed)
                            .is_ok()
                        {
                            if retry > 200_000 && get_index(tail_sample) > Self::RING_SIZE {
                                test_and_set_tag(&seg.tail);
                            }
                            break None;
                        }
                    } else {
                        retry += 1;
                    }
                }
            };

            if let Some(value) = found {
                *out = value;
                return true;
            }

            if get_index(seg.tail.load(Ordering::Relaxed)) > head_ticket + 1 {
                continue;
            }

            seg.fix_state();

            let next = seg.next.load(Ordering::Relaxed);
            if next.is_null() {
                return false;
            }

            if get_index(seg.tail.load(Ordering::Relaxed)) > head_ticket + 1 {
                continue;
            }

            if self
                .head
                .compare_exchange(queue_ptr, next, Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                // SAFETY: we are the unique winner of the `m_head` advance past
                // `queue_ptr`; no other thread can still reach it (design notes §9).
                unsafe {
                    drop(Box::from_raw(queue_ptr));
                }
            }
        }
    }

    /// A snapshot of the current tail segment's counter, used as the
    /// `Backend::State` token.
    pub fn tail_state(&self) -> u64 {
        let seg = self.tail.load(Ordering::Acquire);
        // SAFETY: `seg` is always a live segment owned by this chain.
        unsafe { (*seg).tail.load(Ordering::Acquire) }
    }
}

impl<const EMPTY: u64, const RING_SIZE_POWER: u32> Drop for Lcrq<EMPTY, RING_SIZE_POWER> {
    fn drop(&mut self) {
        let mut current = *self.head.get_mut();
        while !current.is_null() {
            // SAFETY: no concurrent operation may be in flight during `Drop`
            // (spec §9 caller obligation); we own the whole chain exclusively.
            let next = unsafe { *(*current).next.get_mut() };
            unsafe {
                drop(Box::from_raw(current));
            }
            current = next;
        }
    }
}

impl<const EMPTY: u64, const RING_SIZE_POWER: u32> Queue for Lcrq<EMPTY, RING_SIZE_POWER> {
    type Element = u64;

    fn put(&self, element: u64) -> bool {
        self.push(element)
    }

    fn get(&self, out: &mut Option<u64>) -> bool {
        let mut value = 0u64;
        if self.pop(&mut value) {
            *out = Some(value);
            true
        } else {
            false
        }
    }
}

impl<const EMPTY: u64, const RING_SIZE_POWER: u32> Backend for Lcrq<EMPTY, RING_SIZE_POWER> {
    type State = u64;

    fn pop(&self, out: &mut Option<u64>, state: &mut u64) -> bool {
        *state = self.tail_state();
        let mut value = 0u64;
        if Lcrq::pop(self, &mut value) {
            *out = Some(value);
            true
        } else {
            false
        }
    }

    fn tail_state(&self) -> u64 {
        Lcrq::tail_state(self)
    }

    fn empty(&self) -> bool {
        let queue_ptr = self.head.load(Ordering::Acquire);
        // SAFETY: `queue_ptr` is always a live segment owned by this chain.
        let seg = unsafe { &*queue_ptr };
        let head = seg.head.load(Ordering::Acquire);
        let tail = seg.tail.load(Ordering::Acquire);
        get_index(head) >= get_index(tail) && seg.next.load(Ordering::Acquire).is_null()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    /// Scenario LCRQ-single-producer-single-consumer (spec §8.3).
    #[test]
    fn spsc_fifo_strict_order() {
        let queue: Lcrq = Lcrq::new();

        thread::scope(|scope| {
            scope.spawn(|| {
                for i in 1..1000u64 {
                    while !queue.push(i) {
                        thread::yield_now();
                    }
                }
            });

            scope.spawn(|| {
                let mut sum = 0u64;
                let mut expected = 1u64;
                for _ in 1..1000u64 {
                    let mut value = 0u64;
                    while !queue.pop(&mut value) {
                        thread::sleep(Duration::from_millis(1));
                    }
                    assert_eq!(value, expected);
                    expected += 1;
                    sum += value;
                }
                assert_eq!(sum, 499_500);
            });
        });
    }

    /// Boundary: filling exactly one segment before a new one links.
    #[test]
    fn segment_boundary_no_loss() {
        const POWER: u32 = 4; // 16-slot segments, small enough to force growth quickly
        let queue: Lcrq<0, POWER> = Lcrq::new();
        let ring_size = 1u64 << POWER;

        for i in 1..=(ring_size + 1) {
            assert!(queue.push(i));
        }

        for i in 1..=(ring_size + 1) {
            let mut value = 0u64;
            assert!(queue.pop(&mut value));
            assert_eq!(value, i);
        }

        let mut value = 0u64;
        assert!(!queue.pop(&mut value));
    }

    #[test]
    fn empty_after_drain() {
        let queue: Lcrq = Lcrq::new();
        assert!(Backend::empty(&queue));
        queue.push(1);
        assert!(!Backend::empty(&queue));
        let mut out = 0u64;
        queue.pop(&mut out);
        assert!(Backend::empty(&queue));
    }
}

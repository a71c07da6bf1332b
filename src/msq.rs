//! MPMC Michael-Scott lock-free FIFO queue.
//!
//! This queue does not scale well under contention. If strict FIFO isn't
//! required, prefer using it as a backend of [`crate::lldd::Lldd`], which
//! gives each producer its own `Msq` and scales by federating many of them.
//!
//! Reference: M. M. Michael and M. L. Scott, "Simple, Fast, and Practical
//! Non-blocking and Blocking Concurrent Queue Algorithms", PODC '96.

use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::Ordering;

use crossbeam_utils::CachePadded;

use crate::queue::{Backend, Queue};
use crate::tagged_ptr::{AtomicTaggedPtr, TaggedPtr};

/// The state token returned alongside a `pop`/`try_pop`: the head tag at the
/// moment of the operation. Two observations with an unchanged `State`
/// prove no other thread advanced that end of the queue in between.
pub type State = u16;

/// Outcome of [`Msq::try_pop`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TryPopResult {
    /// The element was popped.
    Success,
    /// The queue was empty.
    EmptyQueue,
    /// `expected_head_tag` no longer matched; caller should reread state and
    /// retry if desired.
    Failure,
}

struct Node<T> {
    value: MaybeUninit<T>,
    next: AtomicTaggedPtr<Node<T>>,
}

impl<T> Node<T> {
    fn new(value: T) -> *mut Self {
        Box::into_raw(Box::new(Node {
            value: MaybeUninit::new(value),
            next: AtomicTaggedPtr::new(TaggedPtr::null()),
        }))
    }

    fn sentinel() -> *mut Self {
        Box::into_raw(Box::new(Node {
            value: MaybeUninit::uninit(),
            next: AtomicTaggedPtr::new(TaggedPtr::null()),
        }))
    }
}

/// A lock-free multi-producer, multi-consumer FIFO queue.
pub struct Msq<T> {
    head: CachePadded<AtomicTaggedPtr<Node<T>>>,
    tail: CachePadded<AtomicTaggedPtr<Node<T>>>,
}

// SAFETY: ownership of every `T` flows through the linked list under atomic
// CAS; a node is reachable from at most one queue's pointers at a time.
unsafe impl<T: Send> Send for Msq<T> {}
unsafe impl<T: Send> Sync for Msq<T> {}

impl<T> Default for Msq<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Msq<T> {
    pub fn new() -> Self {
        let sentinel = Node::<T>::sentinel();
        let ptr = TaggedPtr::new(sentinel, 0);
        Self {
            head: CachePadded::new(AtomicTaggedPtr::new(ptr)),
            tail: CachePadded::new(AtomicTaggedPtr::new(ptr)),
        }
    }

    /// Stable-snapshot emptiness check (spec §4.2): re-reads `head` after
    /// sampling `tail`/`head.next` and only trusts the snapshot if `head`
    /// didn't move in between.
    pub fn empty(&self) -> bool {
        loop {
            let old_head = self.head.load(Ordering::Acquire);
            let old_tail = self.tail.load(Ordering::Acquire);
            // SAFETY: old_head.addr() is always a live node owned by this queue.
            let next = unsafe { (*old_head.addr()).next.load(Ordering::Acquire) };
            if self.head.load(Ordering::Acquire) == old_head {
                return old_head.addr() == old_tail.addr() && next.addr().is_null();
            }
        }
    }

    /// Push `element` onto the tail. Always succeeds; lock-free.
    pub fn push(&self, element: T) {
        let node = Node::new(element);
        let mut old_tail = self.tail.load(Ordering::Relaxed);

        loop {
            // SAFETY: old_tail.addr() is reachable and owned by this queue.
            let next = unsafe { (*old_tail.addr()).next.load(Ordering::Relaxed) };

            if self.tail.load(Ordering::Relaxed) != old_tail {
                old_tail = self.tail.load(Ordering::Relaxed);
                continue;
            }

            if next.addr().is_null() {
                let linked = TaggedPtr::new(node, next.tag().wrapping_add(1));
                // SAFETY: see above.
                let cas = unsafe {
                    (*old_tail.addr())
                        .next
                        .compare_exchange_weak(next, linked, Ordering::Release, Ordering::Relaxed)
                };
                if cas.is_ok() {
                    let advanced = TaggedPtr::new(node, old_tail.tag().wrapping_add(1));
                    let _ = self.tail.compare_exchange_weak(
                        old_tail,
                        advanced,
                        Ordering::Release,
                        Ordering::Relaxed,
                    );
                    return;
                }
                old_tail = self.tail.load(Ordering::Relaxed);
            } else {
                let helped = TaggedPtr::new(next.addr(), old_tail.tag().wrapping_add(1));
                match self.tail.compare_exchange_weak(
                    old_tail,
                    helped,
                    Ordering::Release,
                    Ordering::Relaxed,
                ) {
                    Ok(()) => old_tail = helped,
                    Err(current) => old_tail = current,
                }
            }
        }
    }

    /// Single-shot push: attempts exactly one CAS, gated on the tail still
    /// carrying `expected_tail_tag`. Returns `false` without retrying on any
    /// contention.
    pub fn try_push(&self, element: T, expected_tail_tag: u16) -> bool {
        let old_tail = self.tail.load(Ordering::Relaxed);
        if old_tail.tag() != expected_tail_tag {
            return false;
        }
        // SAFETY: old_tail.addr() is reachable and owned by this queue.
        let next = unsafe { (*old_tail.addr()).next.load(Ordering::Relaxed) };
        if !next.addr().is_null() {
            let helped = TaggedPtr::new(next.addr(), old_tail.tag().wrapping_add(1));
            let _ = self.tail.compare_exchange(
                old_tail,
                helped,
                Ordering::Release,
                Ordering::Relaxed,
            );
            return false;
        }

        let node = Node::new(element);
        let linked = TaggedPtr::new(node, next.tag().wrapping_add(1));
        // SAFETY: see above.
        let cas = unsafe {
            (*old_tail.addr())
                .next
                .compare_exchange(next, linked, Ordering::Release, Ordering::Relaxed)
        };
        if cas.is_ok() {
            let advanced = TaggedPtr::new(node, old_tail.tag().wrapping_add(1));
            let _ =
                self.tail
                    .compare_exchange(old_tail, advanced, Ordering::Release, Ordering::Relaxed);
            true
        } else {
            // SAFETY: node was never linked into the list; we hold the only reference.
            unsafe {
                drop(Box::from_raw(node));
            }
            false
        }
    }

    /// Pop the head element, if any, without reporting the queue's state.
    pub fn pop(&self, out: &mut Option<T>) -> bool {
        let mut state = 0u16;
        self.pop_with_state(out, &mut state)
    }

    /// Pop the head element; on return, `state` holds the head tag observed
    /// at the moment of the operation (useful for `try_pop`-style proofs).
    pub fn pop_with_state(&self, out: &mut Option<T>, state: &mut State) -> bool {
        loop {
            let old_head = self.head.load(Ordering::Relaxed);
            let old_tail = self.tail.load(Ordering::Relaxed);
            // SAFETY: old_head.addr() is reachable and owned by this queue.
            let next = unsafe { (*old_head.addr()).next.load(Ordering::Relaxed) };

            if self.head.load(Ordering::Relaxed) != old_head {
                continue;
            }

            if old_head.addr() == old_tail.addr() {
                if next.addr().is_null() {
                    *state = old_tail.tag();
                    return false;
                }
                let helped = TaggedPtr::new(next.addr(), old_tail.tag().wrapping_add(1));
                let _ = self.tail.compare_exchange_weak(
                    old_tail,
                    helped,
                    Ordering::Release,
                    Ordering::Relaxed,
                );
            } else {
                // SAFETY: next.addr() is non-null and reachable.
                let value = unsafe { (*next.addr()).value.as_ptr().read() };
                let advanced = TaggedPtr::new(next.addr(), old_head.tag().wrapping_add(1));
                let cas = self.head.compare_exchange_weak(
                    old_head,
                    advanced,
                    Ordering::Release,
                    Ordering::Relaxed,
                );
                if cas.is_ok() {
                    *state = old_head.tag();
                    *out = Some(value);
                    // SAFETY: old_head was exclusively retired by winning this CAS;
                    // its value was either never initialized (sentinel) or already
                    // moved out by an earlier pop, so only the allocation is freed.
                    unsafe {
                        drop(Box::from_raw(old_head.addr()));
                    }
                    return true;
                }
                // CAS lost the race: forget the bitwise copy we took so `value`'s
                // destructor doesn't run twice (the winner will read it again).
                std::mem::forget(value);
            }
        }
    }

    /// Single-shot pop gated on the head still carrying `expected_head_tag`.
    pub fn try_pop(&self, out: &mut Option<T>, expected_head_tag: u16, state: &mut State) -> TryPopResult {
        let old_head = self.head.load(Ordering::Relaxed);
        let old_tail = self.tail.load(Ordering::Relaxed);
        // SAFETY: old_head.addr() is reachable and owned by this queue.
        let next = unsafe { (*old_head.addr()).next.load(Ordering::Relaxed) };

        if old_head.tag() != expected_head_tag {
            return TryPopResult::Failure;
        }

        if old_head.addr() == old_tail.addr() {
            if next.addr().is_null() {
                *state = old_tail.tag();
                return TryPopResult::EmptyQueue;
            }
            let helped = TaggedPtr::new(next.addr(), old_tail.tag().wrapping_add(1));
            let _ =
                self.tail
                    .compare_exchange(old_tail, helped, Ordering::Release, Ordering::Relaxed);
            TryPopResult::Failure
        } else {
            // SAFETY: next.addr() is non-null and reachable.
            let value = unsafe { (*next.addr()).value.as_ptr().read() };
            let advanced = TaggedPtr::new(next.addr(), old_head.tag().wrapping_add(1));
            let cas =
                self.head
                    .compare_exchange(old_head, advanced, Ordering::Release, Ordering::Relaxed);
            if cas.is_ok() {
                *state = old_head.tag();
                *out = Some(value);
                // SAFETY: see pop_with_state.
                unsafe {
                    drop(Box::from_raw(old_head.addr()));
                }
                TryPopResult::Success
            } else {
                std::mem::forget(value);
                TryPopResult::Failure
            }
        }
    }
}

impl<T> Drop for Msq<T> {
    fn drop(&mut self) {
        let mut current = self.head.load(Ordering::Relaxed).addr();
        let mut is_dummy = true;
        while !current.is_null() {
            // SAFETY: nodes from `current` onward are exclusively owned by this
            // queue; `Drop` runs with no concurrent access.
            let next = unsafe { (*current).next.load(Ordering::Relaxed) }.addr();
            if !is_dummy {
                // SAFETY: only non-dummy nodes hold a live, un-popped value.
                unsafe {
                    ptr::drop_in_place((*current).value.as_mut_ptr());
                }
            }
            // SAFETY: `current` was allocated via `Box::into_raw` in `Node::new`/`sentinel`.
            unsafe {
                drop(Box::from_raw(current));
            }
            current = next;
            is_dummy = false;
        }
    }
}

impl<T> Queue for Msq<T> {
    type Element = T;

    fn put(&self, element: T) -> bool {
        self.push(element);
        true
    }

    fn get(&self, out: &mut Option<T>) -> bool {
        self.pop(out)
    }
}

impl<T> Backend for Msq<T> {
    type State = State;

    fn pop(&self, out: &mut Option<T>, state: &mut State) -> bool {
        self.pop_with_state(out, state)
    }

    fn tail_state(&self) -> State {
        self.tail.load(Ordering::Acquire).tag()
    }

    fn empty(&self) -> bool {
        Msq::empty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    /// Scenario MSQ-FIFO-single-consumer (spec §8.1).
    #[test]
    fn fifo_single_producer_single_consumer() {
        let queue: Msq<i32> = Msq::new();
        assert!(queue.empty());

        thread::scope(|scope| {
            scope.spawn(|| {
                for i in 0..1000 {
                    queue.push(i);
                }
            });

            scope.spawn(|| {
                for i in 0..1000 {
                    let mut value = None;
                    while !queue.pop(&mut value) {
                        thread::sleep(Duration::from_millis(1));
                    }
                    assert_eq!(value, Some(i));
                }
            });
        });

        assert!(queue.empty());
    }

    /// Scenario MSQ-ABA-counter (spec §8.2).
    #[test]
    fn aba_counter_three_producers() {
        use std::sync::atomic::AtomicI32;

        let queue: Msq<i32> = Msq::new();
        let counter = AtomicI32::new(0);

        thread::scope(|scope| {
            for _ in 0..3 {
                scope.spawn(|| {
                    for _ in 0..333 {
                        queue.push(counter.fetch_add(1, Ordering::Relaxed));
                    }
                });
            }

            scope.spawn(|| {
                let mut sum = 0i64;
                for expected_state in 0u16..999 {
                    let mut value = None;
                    let mut state = 0u16;
                    while !queue.pop_with_state(&mut value, &mut state) {
                        thread::sleep(Duration::from_millis(1));
                    }
                    sum += value.unwrap() as i64;
                    assert_eq!(state, expected_state);
                }
                assert_eq!(sum, (0 + 998) * 999 / 2);
            });
        });

        assert!(queue.empty());
    }

    #[test]
    fn try_push_fails_on_stale_tag() {
        let queue: Msq<i32> = Msq::new();
        let stale_tag = queue.tail.load(Ordering::Relaxed).tag().wrapping_sub(1);
        assert!(!queue.try_push(1, stale_tag));
    }

    #[test]
    fn try_pop_reports_empty_queue() {
        let queue: Msq<i32> = Msq::new();
        let head_tag = queue.head.load(Ordering::Relaxed).tag();
        let mut out = None;
        let mut state = 0u16;
        assert_eq!(
            queue.try_pop(&mut out, head_tag, &mut state),
            TryPopResult::EmptyQueue
        );
    }

    #[test]
    fn drop_frees_remaining_elements() {
        let queue: Msq<String> = Msq::new();
        queue.push("a".to_string());
        queue.push("b".to_string());
        // Queue dropped here with two live, un-popped elements.
    }
}

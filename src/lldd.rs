//! Locally-linearizable dynamic distributed container.
//!
//! Federates many backend queues (one per producer thread, allocated
//! lazily) behind a single handle. Each thread's own sequence of operations
//! linearizes against its bound backend; a consumer with no bound backend
//! (or whose backend just ran dry) scans the others with a snapshot +
//! version + tail-state protocol that certifies emptiness without a global
//! lock on the hot path.
//!
//! Reference: A. Haas et al., "Local Linearizability for Concurrent
//! Data Structures", CoRR abs/1502.07118, 2015.

use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};

use rand::Rng;
use spin::Mutex;

use crate::error::ConstructError;
use crate::queue::Backend;

struct BackendNode<B> {
    backend: B,
    alive: AtomicBool,
}

impl<B: Default> BackendNode<B> {
    fn new() -> Box<Self> {
        Box::new(Self {
            backend: B::default(),
            alive: AtomicBool::new(true),
        })
    }
}

/// A caller-held handle bound to one backend slot.
///
/// Each thread keeps its own instance — typically behind a `thread_local!`
/// in the caller — and passes it by mutable reference into every call.
/// Unlike the source this is ported from, a bare `*mut` keeps this type
/// `!Send`/`!Sync`: the compiler enforces the one-thread-at-a-time
/// discipline the original relied on as an unenforced convention.
pub struct BackendHandle<B> {
    node: *mut BackendNode<B>,
}

impl<B> Default for BackendHandle<B> {
    fn default() -> Self {
        Self {
            node: ptr::null_mut(),
        }
    }
}

impl<B> BackendHandle<B> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_bound(&self) -> bool {
        !self.node.is_null()
    }
}

/// Federates backend queues of type `B`, one per distinct caller thread.
pub struct Lldd<B: Backend + Default> {
    segment: Box<[AtomicPtr<BackendNode<B>>]>,
    segment_length: AtomicUsize,
    segment_capacity: usize,
    version: AtomicUsize,
    lock: Mutex<()>,
}

// SAFETY: every `BackendNode<B>` reachable through `segment` is either
// `B: Send`-owned data accessed through its own lock-free API, or mutated
// only while `lock` is held.
unsafe impl<B: Backend + Default + Send> Send for Lldd<B> {}
unsafe impl<B: Backend + Default + Send + Sync> Sync for Lldd<B> {}

impl<B: Backend + Default> Lldd<B> {
    /// Creates a container that can hold up to `segment_capacity` live
    /// backends at once. Fails if `segment_capacity == 0`.
    pub fn new(segment_capacity: usize) -> Result<Self, ConstructError> {
        if segment_capacity == 0 {
            return Err(ConstructError::ZeroCapacity);
        }
        let segment = (0..segment_capacity)
            .map(|_| AtomicPtr::new(ptr::null_mut()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Ok(Self {
            segment,
            segment_length: AtomicUsize::new(0),
            segment_capacity,
            version: AtomicUsize::new(0),
            lock: Mutex::new(()),
        })
    }

    /// Inserts `element`, binding `local` to a fresh backend on first use.
    ///
    /// Returns `false` only if `local` is unbound and every slot is full of
    /// live, non-sweepable backends (capacity exceeded).
    pub fn put(&self, local: &mut BackendHandle<B>, element: B::Element) -> bool {
        if !local.is_bound() {
            let _guard = self.lock.lock();
            let mut length = self.segment_length.load(Ordering::Relaxed);

            if length >= self.segment_capacity {
                for i in 0..length {
                    self.sweep_locked(i);
                }
                length = self.segment_length.load(Ordering::Relaxed);
            }

            if length >= self.segment_capacity {
                log::warn!("lldd: capacity {} exceeded, put dropped", self.segment_capacity);
                return false;
            }

            let node = Box::into_raw(BackendNode::new());
            self.segment[length].store(node, Ordering::Release);
            self.segment_length.store(length + 1, Ordering::Release);
            self.version.fetch_add(1, Ordering::Release);
            local.node = node;
        }

        // SAFETY: `local.node` is non-null once bound and stays alive for
        // the lifetime of `self` — a node is only freed after this thread
        // calls `deregister_thread`, which clears `local` and never reuses it.
        let node = unsafe { &*local.node };
        node.backend.put(element)
    }

    /// Removes and returns one element.
    ///
    /// Tries the bound backend first, then falls back to a randomized scan
    /// of every other backend, certified empty via a version + tail-state
    /// protocol before reporting `false` (spec §4.4).
    pub fn get(&self, local: &mut BackendHandle<B>, out: &mut Option<B::Element>) -> bool {
        if local.is_bound() {
            // SAFETY: see `put`.
            let node = unsafe { &*local.node };
            let mut state = B::State::default();
            if node.backend.pop(out, &mut state) {
                return true;
            }
        }

        let mut rng = rand::rng();

        loop {
            let length = self.segment_length.load(Ordering::Acquire);
            if length == 0 {
                return false;
            }

            let start = rng.random_range(0..length);
            let version = self.version.load(Ordering::Acquire);
            // Pre-sized and indexed by scan position `i`, not pushed: a slot
            // can legitimately go null mid-scan (a concurrent sweep's
            // swap-remove), and the verify pass below must still compare
            // position `i` against the same backend the scan pass read at
            // that position, not whatever ended up at the next free index.
            let mut tail_states = vec![B::State::default(); length];
            let mut removed = false;

            for i in 0..length {
                let index = (start + i) % length;
                let node_ptr = self.segment[index].load(Ordering::Acquire);
                if node_ptr.is_null() {
                    continue;
                }
                // SAFETY: `node_ptr` was just loaded from a live slot; nodes
                // are only freed under `self.lock`, which this scan never
                // holds while dereferencing.
                let node = unsafe { &*node_ptr };

                let mut state = B::State::default();
                if node.backend.pop(out, &mut state) {
                    return true;
                }
                tail_states[i] = state;

                if !node.alive.load(Ordering::Acquire) {
                    self.sweep(index);
                    removed = true;
                    break;
                }
            }

            if removed {
                continue;
            }

            if self.version.load(Ordering::Acquire) != version {
                continue;
            }

            let mut changed = false;
            for (i, expected) in tail_states.iter().enumerate() {
                let index = (start + i) % length;
                let node_ptr = self.segment[index].load(Ordering::Acquire);
                if node_ptr.is_null() {
                    continue;
                }
                // SAFETY: see above.
                let node = unsafe { &*node_ptr };
                if node.backend.tail_state() != *expected {
                    changed = true;
                    break;
                }
            }

            if changed {
                continue;
            }

            return false;
        }
    }

    /// Every thread that called `put` or `get` must call this before exit,
    /// or its backend leaks (remains in the segment, `alive == false`,
    /// swept lazily by a later `put`/`get`).
    pub fn deregister_thread(&self, local: &mut BackendHandle<B>) {
        if !local.is_bound() {
            return;
        }

        let node_ptr = local.node;
        local.node = ptr::null_mut();
        // SAFETY: `node_ptr` was bound to this thread and no other thread
        // ever writes through it; only `alive` is shared.
        let node = unsafe { &*node_ptr };
        node.alive.store(false, Ordering::Release);

        if !node.backend.empty() {
            return;
        }

        let length = self.segment_length.load(Ordering::Acquire);
        for i in 0..length {
            if self.segment[i].load(Ordering::Acquire) == node_ptr {
                let _guard = self.lock.lock();
                self.sweep_locked(i);
                break;
            }
        }
    }

    /// Takes the lock then delegates to `sweep_locked`.
    fn sweep(&self, index: usize) {
        let _guard = self.lock.lock();
        self.sweep_locked(index);
    }

    /// Removes `segment[index]` iff it is still `!alive && empty()`;
    /// otherwise a no-op. Caller must hold `self.lock`.
    fn sweep_locked(&self, index: usize) {
        let length = self.segment_length.load(Ordering::Relaxed);
        if index >= length {
            return;
        }
        let node_ptr = self.segment[index].load(Ordering::Acquire);
        if node_ptr.is_null() {
            return;
        }
        // SAFETY: reachable only through `segment`, which we're mutating
        // exclusively under `self.lock`.
        let node = unsafe { &*node_ptr };
        if node.alive.load(Ordering::Acquire) || !node.backend.empty() {
            return;
        }

        let last = length - 1;
        let last_ptr = self.segment[last].load(Ordering::Acquire);
        self.segment[index].store(last_ptr, Ordering::Release);
        self.segment[last].store(ptr::null_mut(), Ordering::Release);
        self.segment_length.store(last, Ordering::Release);
        self.version.fetch_add(1, Ordering::Release);

        log::debug!("lldd: reclaimed abandoned backend at slot {index}");

        // SAFETY: `node_ptr` is now unreachable from `segment`; it was
        // observed `!alive` (its thread already deregistered) and `empty()`
        // (nothing left to drain), and removal only happens under `self.lock`.
        unsafe {
            drop(Box::from_raw(node_ptr));
        }
    }
}

impl<B: Backend + Default> Drop for Lldd<B> {
    fn drop(&mut self) {
        let length = *self.segment_length.get_mut();
        for slot in self.segment[..length].iter_mut() {
            let node_ptr = *slot.get_mut();
            if !node_ptr.is_null() {
                // SAFETY: `Drop` runs with exclusive access; no concurrent
                // operation may be in flight (spec §9 caller obligation).
                unsafe {
                    drop(Box::from_raw(node_ptr));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msq::Msq;
    use std::thread;
    use std::time::Duration;

    /// Scenario LLDD-over-MSQ-one-thread-each (spec §8.4).
    #[test]
    fn producer_and_consumer_each_get_their_own_backend() {
        let lldd: Lldd<Msq<i32>> = Lldd::new(64).unwrap();

        thread::scope(|scope| {
            scope.spawn(|| {
                let mut local = BackendHandle::new();
                for i in 0..1000 {
                    assert!(lldd.put(&mut local, i));
                }
                lldd.deregister_thread(&mut local);
            });

            scope.spawn(|| {
                let mut local = BackendHandle::new();
                for i in 0..1000 {
                    let mut value = None;
                    while !lldd.get(&mut local, &mut value) {
                        thread::sleep(Duration::from_millis(1));
                    }
                    assert_eq!(value, Some(i));
                }
                lldd.deregister_thread(&mut local);
            });
        });

        assert_eq!(lldd.segment_length.load(Ordering::Relaxed), 0);
    }

    /// Scenario LLDD-reclaim-on-full (spec §8.5).
    #[test]
    fn full_capacity_reclaims_abandoned_backends() {
        let lldd: Lldd<Msq<i32>> = Lldd::new(2).unwrap();

        let mut a = BackendHandle::new();
        assert!(lldd.put(&mut a, 1));
        let mut out = None;
        assert!(lldd.get(&mut a, &mut out));
        assert_eq!(out, Some(1));
        lldd.deregister_thread(&mut a);

        let mut b = BackendHandle::new();
        assert!(lldd.put(&mut b, 2));
        let mut out = None;
        assert!(lldd.get(&mut b, &mut out));
        assert_eq!(out, Some(2));
        lldd.deregister_thread(&mut b);

        let mut c = BackendHandle::new();
        assert!(lldd.put(&mut c, 3));
        let mut out = None;
        assert!(lldd.get(&mut c, &mut out));
        assert_eq!(out, Some(3));
        lldd.deregister_thread(&mut c);
    }

    #[test]
    fn put_fails_when_capacity_exceeded_by_live_backends() {
        let lldd: Lldd<Msq<i32>> = Lldd::new(1).unwrap();

        let mut a = BackendHandle::new();
        assert!(lldd.put(&mut a, 1));
        // `a` never deregisters and never drains: the one slot stays alive.

        let mut b = BackendHandle::new();
        assert!(!lldd.put(&mut b, 2));
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let result: Result<Lldd<Msq<i32>>, ConstructError> = Lldd::new(0);
        assert_eq!(result.unwrap_err(), ConstructError::ZeroCapacity);
    }
}

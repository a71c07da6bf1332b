//! Thin uniform interface shared by every queue backend.
//!
//! `Queue` is the narrow `put`/`get` façade a caller needing just a queue
//! wants; `Backend` extends it with the extra surface [`crate::lldd::Lldd`]
//! needs to detect emptiness across backends without a global lock
//! (`pop` with a state token, and `tail_state`/`empty` for the emptiness
//! certificate in `Lldd::get`).

/// A plain producer/consumer queue.
pub trait Queue {
    type Element;

    /// Insert `element`. Returns `false` only when the backend itself
    /// rejects the element (none of `Msq`/`Lcrq` ever do; reserved for
    /// bounded backends).
    fn put(&self, element: Self::Element) -> bool;

    /// Remove and return the oldest element, if any.
    fn get(&self, out: &mut Option<Self::Element>) -> bool;
}

/// The contract [`crate::lldd::Lldd`] requires of a per-thread backend.
pub trait Backend: Queue {
    /// A lightweight, comparable summary of the backend's tail position.
    type State: Copy + PartialEq + Default;

    /// Like `get`, but also reports the backend's state at the moment of
    /// the attempt, whether or not it succeeded.
    fn pop(&self, out: &mut Option<Self::Element>, state: &mut Self::State) -> bool;

    /// A snapshot of the current tail state, used by `Lldd::get`'s
    /// emptiness certificate to detect concurrent pushes during a scan.
    fn tail_state(&self) -> Self::State;

    /// Stable emptiness check.
    fn empty(&self) -> bool;
}

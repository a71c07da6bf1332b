//! Lock-free concurrent queues and a locally-linearizable distributed
//! container built on top of them.
//!
//! - [`msq`] — [`Msq`], a Michael-Scott MPMC FIFO queue.
//! - [`lcrq`] — [`Lcrq`], a linked chain of closable ring segments.
//! - [`lldd`] — [`Lldd`], a container that federates one backend queue per
//!   producer thread behind a single handle, linearizable per-thread but
//!   not globally.
//! - [`tagged_ptr`] — the `{address, tag}` packed-pointer building block
//!   both `Msq` and `Lldd` use for ABA protection / liveness bits.
//! - [`queue`] — the `Queue`/`Backend` traits [`Lldd`] is generic over.
//!
//! None of these structures use hazard pointers or epoch-based memory
//! reclamation; each relies on a narrower ownership invariant documented on
//! its own module (see each module's "Reference" and the crate's
//! `DESIGN.md`).

pub mod error;
pub mod lcrq;
pub mod lldd;
pub mod msq;
pub mod queue;
pub mod tagged_ptr;

pub use error::ConstructError;
pub use lcrq::Lcrq;
pub use lldd::{BackendHandle, Lldd};
pub use msq::{Msq, TryPopResult};
pub use queue::{Backend, Queue};
pub use tagged_ptr::{AtomicTaggedPtr, DoubleTagPtr, TaggedPtr};

//! Intrusive ordered containers and asynchronous concurrency primitives.
//!
//! Everything in this crate is *intrusive*: a container never owns or
//! allocates element storage, it only links caller-owned elements in
//! place through hooks embedded in the elements themselves. That makes
//! the containers suitable for schedulers, event loops and servers that
//! cannot afford a heap allocation per queued item.
//!
//! # Containers and primitives
//!
//! - [`List`] — a circular doubly-linked list.
//! - [`AvlSet`] — a height-balanced ordered set with its balance factors
//!   packed into the alignment bits of the child pointers
//!   ([`TaggedPtr`]).
//! - [`WbSet`] — a weight-balanced ordered set with O(log n) order
//!   statistics ([`WbSet::select`], [`WbSet::rank`]).
//! - [`Heap`] — a binary heap over an explicit complete binary tree,
//!   supporting removal by handle.
//! - [`MpscQueue`] — a lock-free multi-producer, single-consumer queue.
//! - [`Mutex`] — an asynchronous mutex suspending and resuming
//!   cooperative tasks, built on the same LIFO-drain pattern as the
//!   queue.
//!
//! Both ordered sets can [`flatten`](AvlSet::flatten) into a [`List`] in
//! key order without ever unlinking their elements.
//!
//! # Example
//!
//! An element declares its hooks and wires them up with [`element!`]:
//!
//! ```
//! use core::ptr::NonNull;
//! use rivet::{element, AvlSet, AvlHook, KeySelector};
//!
//! struct Session {
//!     id: u32,
//!     by_id: AvlHook,
//! }
//!
//! element!(impl Element<AvlHook> for Session { by_id });
//!
//! #[derive(Default)]
//! struct ById;
//!
//! impl KeySelector<Session> for ById {
//!     type Key = u32;
//!
//!     fn key<'a>(&self, session: &'a Session) -> &'a u32 {
//!         &session.id
//!     }
//! }
//!
//! let mut session = Box::new(Session { id: 7, by_id: AvlHook::new() });
//!
//! let mut sessions = AvlSet::<Session, ById>::new();
//! unsafe { sessions.insert(NonNull::from(&mut *session)) };
//!
//! assert_eq!(sessions.find(&7).unwrap().id, 7);
//! sessions.clear();
//! ```
//!
//! # Safety contract
//!
//! Linking operations are `unsafe`: the caller promises that an element
//! is linked into at most one container per hook, does not move and is
//! not dropped while linked, and outlives its membership. The containers
//! uphold everything else — no operation allocates, and element pointers
//! and iterators stay valid until the element they refer to is removed.
//!
//! The `link-debug` cargo feature (on by default) backs those promises
//! with runtime checks in builds with `debug_assertions`: every hook
//! then carries a reference to a refcounted identity object shared with
//! its container, and misuse panics instead of corrupting memory. The
//! checks need the `alloc` crate; disable the feature for allocator-free
//! release builds.
//!
//! # Concurrency
//!
//! [`MpscQueue`] and [`Mutex`] are thread-safe; the remaining containers
//! are single-threaded and rely on the caller for exclusion.

#![cfg_attr(not(test), no_std)]
#![deny(missing_docs)]

#[cfg(all(debug_assertions, feature = "link-debug"))]
extern crate alloc;

pub mod avl;
pub mod heap;
pub mod key;
pub mod link;
pub mod list;
pub mod mpsc;
pub mod mutex;
pub mod tagged;
pub mod wb;

pub use crate::avl::{AvlHook, AvlSet};
pub use crate::heap::{Heap, HeapHook, MinHeap};
pub use crate::key::{
    Compare, IdentitySelector, InsertResult, KeySelector, NaturalOrder, ReverseOrder,
};
pub use crate::link::{Element, LinkBase};
pub use crate::list::{List, ListHook};
pub use crate::mpsc::{MpscHook, MpscQueue};
pub use crate::mutex::{LockFuture, Mutex, MutexGuard};
pub use crate::tagged::TaggedPtr;
pub use crate::wb::{WbHook, WbSet};

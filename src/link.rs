//! Hook bases, element/hook conversion and container-identity tracking.
//!
//! Every intrusive hook embeds a [`LinkBase`]. In builds with
//! `debug_assertions` and the `link-debug` feature it carries a reference
//! to a refcounted identity object shared with the owning container, which
//! turns the most common intrusive-container mistakes (inserting an element
//! twice, removing it through the wrong container, destroying it while it
//! is still linked) into panics instead of memory corruption. In all other
//! builds the hooks carry no identity word and every check compiles to
//! nothing.

use core::ptr::NonNull;

#[cfg(all(debug_assertions, feature = "link-debug"))]
use core::{
    cell::Cell,
    ptr,
    sync::atomic::{AtomicIsize, Ordering},
};

#[cfg(all(debug_assertions, feature = "link-debug"))]
use alloc::boxed::Box;

/// Converts between an element and a hook of type `H` embedded in it.
///
/// Implement this with the [`element!`](crate::element) macro. An element
/// type may embed several hooks (one per container it can be linked into)
/// and implement `Element<H>` once for each hook type.
///
/// # Safety
///
/// `hook` must return a pointer to a hook embedded within the referenced
/// element, `element` must be its exact inverse, and both must be stable
/// for the lifetime of the element.
pub unsafe trait Element<H> {
    /// Returns the embedded hook of the element `this` points to.
    ///
    /// # Safety
    ///
    /// `this` must point to a live element.
    unsafe fn hook(this: NonNull<Self>) -> NonNull<H>;

    /// Recovers the element from a pointer to its embedded hook.
    ///
    /// # Safety
    ///
    /// `hook` must have been obtained from [`Element::hook`] on a still
    /// live element.
    unsafe fn element(hook: NonNull<H>) -> NonNull<Self>;
}

/// Implements [`Element`] for an element type embedding a hook field.
///
/// ```
/// use rivet::{element, ListHook};
///
/// struct Entry {
///     value: i32,
///     hook: ListHook,
/// }
///
/// element!(impl Element<ListHook> for Entry { hook });
/// # let _ = Entry { value: 0, hook: ListHook::new() };
/// ```
#[macro_export]
macro_rules! element {
    (impl Element<$hook:ty> for $elem:ty { $field:ident }) => {
        unsafe impl $crate::Element<$hook> for $elem {
            unsafe fn hook(
                this: ::core::ptr::NonNull<Self>,
            ) -> ::core::ptr::NonNull<$hook> {
                ::core::ptr::NonNull::new_unchecked(::core::ptr::addr_of_mut!(
                    (*this.as_ptr()).$field
                ))
            }

            unsafe fn element(
                hook: ::core::ptr::NonNull<$hook>,
            ) -> ::core::ptr::NonNull<Self> {
                let offset = ::core::mem::offset_of!($elem, $field);
                ::core::ptr::NonNull::new_unchecked(
                    hook.as_ptr().cast::<u8>().sub(offset).cast::<$elem>(),
                )
            }
        }
    };
}

#[cfg(all(debug_assertions, feature = "link-debug"))]
struct LinkShared {
    refcount: AtomicIsize,
}

#[cfg(all(debug_assertions, feature = "link-debug"))]
fn release_shared(shared: *mut LinkShared) {
    debug_assert!(!shared.is_null());
    // Container and element destruction may race across threads; the
    // refcount is atomic for exactly that reason.
    if unsafe { (*shared).refcount.fetch_sub(1, Ordering::AcqRel) } == 1 {
        drop(unsafe { Box::from_raw(shared) });
    }
}

/// The hook base embedded (through the concrete hook types) in every
/// intrusive element.
///
/// A hook is *idle* when it is not linked into any container. It must be
/// idle when its element is created, copied to, moved, or destroyed.
pub struct LinkBase {
    #[cfg(all(debug_assertions, feature = "link-debug"))]
    shared: Cell<*mut LinkShared>,
}

impl LinkBase {
    /// Creates an idle hook base.
    pub const fn new() -> Self {
        LinkBase {
            #[cfg(all(debug_assertions, feature = "link-debug"))]
            shared: Cell::new(ptr::null_mut()),
        }
    }

    /// Moves the identity reference from one hook to another without
    /// touching the refcount. Used when a container changes the hook an
    /// element is linked through (tree flattening).
    #[allow(unused_variables)]
    pub(crate) fn transfer(from: &LinkBase, to: &LinkBase) {
        #[cfg(all(debug_assertions, feature = "link-debug"))]
        {
            assert!(
                to.shared.get().is_null(),
                "destination hook is already linked into a container"
            );
            assert!(
                !from.shared.get().is_null(),
                "source hook is not linked into a container"
            );
            to.shared.set(from.shared.replace(ptr::null_mut()));
        }
    }
}

impl Default for LinkBase {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for LinkBase {
    fn drop(&mut self) {
        #[cfg(all(debug_assertions, feature = "link-debug"))]
        assert!(
            self.shared.get().is_null(),
            "element destroyed while still linked into a container"
        );
    }
}

// The identity pointer is only mutated by the owning container, under
// whatever exclusion the caller already provides for that container, and
// the refcount it points to is atomic.
unsafe impl Send for LinkBase {}
unsafe impl Sync for LinkBase {}

/// The container half of the identity handshake. One per container.
pub(crate) struct LinkContainer {
    #[cfg(all(debug_assertions, feature = "link-debug"))]
    shared: Cell<*mut LinkShared>,
}

impl LinkContainer {
    pub(crate) const fn new() -> Self {
        LinkContainer {
            #[cfg(all(debug_assertions, feature = "link-debug"))]
            shared: Cell::new(ptr::null_mut()),
        }
    }

    /// Adopts a hook into this container's identity. Panics if the hook is
    /// already linked anywhere.
    #[allow(unused_variables)]
    pub(crate) fn link(&self, hook: &LinkBase) {
        #[cfg(all(debug_assertions, feature = "link-debug"))]
        {
            let mut shared = self.shared.get();
            if shared.is_null() {
                shared = Box::into_raw(Box::new(LinkShared {
                    refcount: AtomicIsize::new(1),
                }));
                self.shared.set(shared);
            }
            assert!(
                hook.shared.get().is_null(),
                "element is already linked into a container"
            );
            let old = unsafe { (*shared).refcount.fetch_add(1, Ordering::Relaxed) };
            debug_assert!(old > 0);
            hook.shared.set(shared);
        }
    }

    /// Releases a hook from this container's identity. Panics if the hook
    /// does not belong to this container — including the case where the
    /// container it did belong to has since been destroyed.
    #[allow(unused_variables)]
    pub(crate) fn unlink(&self, hook: &LinkBase) {
        #[cfg(all(debug_assertions, feature = "link-debug"))]
        {
            let shared = self.shared.get();
            assert!(
                !shared.is_null() && hook.shared.get() == shared,
                "element is not linked into this container"
            );
            let old = unsafe { (*shared).refcount.fetch_sub(1, Ordering::Relaxed) };
            debug_assert!(old > 1);
            hook.shared.set(ptr::null_mut());
        }
    }

    /// Asserts that a hook belongs to this container.
    #[allow(unused_variables)]
    pub(crate) fn check(&self, hook: &LinkBase) {
        #[cfg(all(debug_assertions, feature = "link-debug"))]
        {
            let shared = self.shared.get();
            assert!(
                !shared.is_null() && hook.shared.get() == shared,
                "element is not linked into this container"
            );
        }
    }

    /// Moves the whole identity to a new container. The linked hooks keep
    /// their references; only the owning container changes.
    pub(crate) fn take(&mut self) -> LinkContainer {
        LinkContainer {
            #[cfg(all(debug_assertions, feature = "link-debug"))]
            shared: Cell::new(self.shared.replace(ptr::null_mut())),
        }
    }
}

impl Drop for LinkContainer {
    fn drop(&mut self) {
        #[cfg(all(debug_assertions, feature = "link-debug"))]
        {
            let shared = self.shared.get();
            if !shared.is_null() {
                // The identity object survives as long as any hook still
                // refers to it, so use-after-container-destruction is
                // detected rather than reading freed memory.
                release_shared(shared);
            }
        }
    }
}

unsafe impl Send for LinkContainer {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn link_unlink_roundtrip() {
        let container = LinkContainer::new();
        let hook = LinkBase::new();

        container.link(&hook);
        container.check(&hook);
        container.unlink(&hook);
    }

    #[test]
    fn identity_moves_between_containers() {
        let mut a = LinkContainer::new();
        let hook = LinkBase::new();

        a.link(&hook);
        let b = a.take();
        drop(a);

        b.check(&hook);
        b.unlink(&hook);
    }

    #[test]
    fn transfer_moves_hook_identity() {
        let container = LinkContainer::new();
        let from = LinkBase::new();
        let to = LinkBase::new();

        container.link(&from);
        LinkBase::transfer(&from, &to);
        container.check(&to);
        container.unlink(&to);
    }

    #[test]
    #[cfg(all(debug_assertions, feature = "link-debug"))]
    #[should_panic(expected = "already linked")]
    fn double_link_panics() {
        let a = LinkContainer::new();
        let b = LinkContainer::new();
        let hook = LinkBase::new();

        a.link(&hook);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            b.link(&hook);
        }));
        // Leave the hook idle so its destructor does not fire a second
        // panic while unwinding out of this test.
        a.unlink(&hook);
        if let Err(payload) = result {
            std::panic::resume_unwind(payload);
        }
    }

    #[test]
    #[cfg(all(debug_assertions, feature = "link-debug"))]
    #[should_panic(expected = "not linked into this container")]
    fn foreign_unlink_panics() {
        let a = LinkContainer::new();
        let b = LinkContainer::new();
        let hook = LinkBase::new();

        a.link(&hook);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            b.unlink(&hook);
        }));
        a.unlink(&hook);
        if let Err(payload) = result {
            std::panic::resume_unwind(payload);
        }
    }
}

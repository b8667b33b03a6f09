//! An asynchronous mutex for cooperative tasks.

use core::cell::{Cell, UnsafeCell};
use core::future::Future;
use core::marker::PhantomPinned;
use core::pin::Pin;
use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicPtr, Ordering};
use core::task::{Context, Poll, Waker};

use static_assertions::const_assert;

/// A waiter node owned by a suspended [`LockFuture`]. The unlocking
/// thread only touches it through the interior-mutable fields.
struct Waiter {
    next: Cell<*mut Waiter>,
    waker: UnsafeCell<Option<Waker>>,
    resumed: AtomicBool,
}

/// Reserved non-null state value meaning "unlocked". No waiter can live
/// at this address because `Waiter` has an alignment greater than one.
const UNLOCKED: *mut Waiter = 1 as *mut Waiter;

const_assert!(core::mem::align_of::<Waiter>() > 1);

/// An asynchronous mutual-exclusion primitive.
///
/// The whole lock is one atomic word: a reserved "unlocked" sentinel,
/// null for "locked with no waiters", or the head of a LIFO stack of
/// waiters. An
/// unlock with waiters drains the stack in one exchange and reverses it
/// into a FIFO hand-off queue, so fairness is FIFO within each drained
/// batch.
///
/// Waiters are resumable continuations ([`Waker`]s), not threads; a
/// waiter suspends at most once per acquisition and is resumed exactly
/// once, inline on the unlocking thread. Cancelling a queued acquisition
/// is not supported: dropping a [`LockFuture`] that is still queued
/// panics.
pub struct Mutex {
    state: AtomicPtr<Waiter>,

    /// Waiters already drained from the stack, oldest first. Owned by
    /// whoever holds the lock; only touched during unlock.
    queue: Cell<*mut Waiter>,
}

unsafe impl Send for Mutex {}
unsafe impl Sync for Mutex {}

impl Mutex {
    /// Creates an unlocked mutex.
    pub const fn new() -> Self {
        Mutex {
            state: AtomicPtr::new(UNLOCKED),
            queue: Cell::new(ptr::null_mut()),
        }
    }

    /// Attempts to acquire the lock without suspending.
    pub fn try_lock(&self) -> Option<MutexGuard<'_>> {
        if self.try_lock_raw() {
            Some(MutexGuard { mutex: self })
        } else {
            None
        }
    }

    /// Acquires the lock, suspending the calling task while it is held
    /// elsewhere. Resolves to a guard releasing the lock on drop.
    ///
    /// If the mutex is free the future resolves on its first poll
    /// without suspending.
    pub fn lock(&self) -> LockFuture<'_> {
        LockFuture {
            mutex: self,
            waiter: Waiter {
                next: Cell::new(ptr::null_mut()),
                waker: UnsafeCell::new(None),
                resumed: AtomicBool::new(false),
            },
            phase: Phase::Init,
            _pin: PhantomPinned,
        }
    }

    /// Releases the lock.
    ///
    /// If drained waiters are pending, the head of the FIFO queue is
    /// resumed and the lock stays held, now owned by that waiter.
    /// Otherwise, if the waiter stack is non-empty, it is drained and
    /// reversed first.
    ///
    /// # Safety
    ///
    /// Must be called by the current holder, exactly once per
    /// acquisition. Prefer dropping the [`MutexGuard`].
    pub unsafe fn unlock(&self) {
        debug_assert!(self.state.load(Ordering::Relaxed) != UNLOCKED);

        let mut queue = self.queue.get();

        if queue.is_null() {
            let state = self.state.load(Ordering::Relaxed);
            if state.is_null()
                && self
                    .state
                    .compare_exchange(
                        ptr::null_mut(),
                        UNLOCKED,
                        Ordering::Release,
                        Ordering::Relaxed,
                    )
                    .is_ok()
            {
                return;
            }

            // Waiters are stacked newest first; take them all and
            // reverse into arrival order.
            let mut drained = self.state.swap(ptr::null_mut(), Ordering::Acquire);
            debug_assert!(!drained.is_null() && drained != UNLOCKED);

            while !drained.is_null() {
                let next = (*drained).next.get();
                (*drained).next.set(queue);
                queue = drained;
                drained = next;
            }
        }

        self.queue.set((*queue).next.get());

        // Hand the lock over. After the release store the resumed task
        // may complete and free the waiter at any moment, so the waker
        // is taken out first.
        let waker = (*(*queue).waker.get()).take();
        (*queue).resumed.store(true, Ordering::Release);
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    fn try_lock_raw(&self) -> bool {
        self.state
            .compare_exchange(
                UNLOCKED,
                ptr::null_mut(),
                Ordering::Acquire,
                Ordering::Relaxed,
            )
            .is_ok()
    }

    /// Pushes a waiter onto the stack, or acquires the lock if it is
    /// observed unlocked mid-loop. Returns true if the waiter was
    /// queued, false if the lock was acquired.
    unsafe fn lock_suspend(&self, waiter: *mut Waiter) -> bool {
        let mut state = self.state.load(Ordering::Relaxed);
        loop {
            if state == UNLOCKED {
                match self.state.compare_exchange_weak(
                    state,
                    ptr::null_mut(),
                    Ordering::Acquire,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => return false,
                    Err(actual) => state = actual,
                }
            } else {
                (*waiter).next.set(state);
                // Release publishes the stored waker to the unlocker.
                match self.state.compare_exchange_weak(
                    state,
                    waiter,
                    Ordering::Release,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => return true,
                    Err(actual) => state = actual,
                }
            }
        }
    }
}

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Mutex {
    fn drop(&mut self) {
        let state = self.state.load(Ordering::Relaxed);
        debug_assert!(
            (state == UNLOCKED || state.is_null()) && self.queue.get().is_null(),
            "mutex destroyed with waiters pending"
        );
    }
}

enum Phase {
    Init,
    Queued,
    Done,
}

/// Future returned by [`Mutex::lock`].
pub struct LockFuture<'a> {
    mutex: &'a Mutex,
    waiter: Waiter,
    phase: Phase,
    _pin: PhantomPinned,
}

// The waiter is only shared with the unlocking thread through its
// interior-mutable fields, with the resumed flag ordering the hand-off.
unsafe impl Send for LockFuture<'_> {}

impl<'a> Future for LockFuture<'a> {
    type Output = MutexGuard<'a>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<MutexGuard<'a>> {
        // The future is structurally pinned; the waiter address handed
        // to the mutex stays valid until resumption.
        let this = unsafe { self.get_unchecked_mut() };

        match this.phase {
            Phase::Init => {
                if this.mutex.try_lock_raw() {
                    this.phase = Phase::Done;
                    return Poll::Ready(MutexGuard { mutex: this.mutex });
                }

                unsafe {
                    // The waker must be in place before the waiter is
                    // published.
                    *this.waiter.waker.get() = Some(cx.waker().clone());

                    if this.mutex.lock_suspend(&this.waiter as *const Waiter as *mut Waiter) {
                        this.phase = Phase::Queued;
                        Poll::Pending
                    } else {
                        this.phase = Phase::Done;
                        Poll::Ready(MutexGuard { mutex: this.mutex })
                    }
                }
            }
            Phase::Queued => {
                if this.waiter.resumed.load(Ordering::Acquire) {
                    this.phase = Phase::Done;
                    Poll::Ready(MutexGuard { mutex: this.mutex })
                } else {
                    // A queued waiter is resumed exactly once by a
                    // future unlock; spurious polls stay pending.
                    Poll::Pending
                }
            }
            Phase::Done => panic!("lock future polled after completion"),
        }
    }
}

impl Drop for LockFuture<'_> {
    fn drop(&mut self) {
        if let Phase::Queued = self.phase {
            if self.waiter.resumed.load(Ordering::Acquire) {
                // The lock was handed over but never observed; pass it
                // on so the mutex is not wedged.
                unsafe { self.mutex.unlock() };
            } else {
                panic!("lock future dropped while queued; cancellation is not supported");
            }
        }
    }
}

/// Releases the owning [`Mutex`] when dropped.
pub struct MutexGuard<'a> {
    mutex: &'a Mutex,
}

unsafe impl Send for MutexGuard<'_> {}
unsafe impl Sync for MutexGuard<'_> {}

impl Drop for MutexGuard<'_> {
    fn drop(&mut self) {
        // The guard's existence proves ownership.
        unsafe { self.mutex.unlock() };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;
    use futures::task::noop_waker;

    #[test]
    fn try_lock_excludes() {
        let mutex = Mutex::new();

        let guard = mutex.try_lock().unwrap();
        assert!(mutex.try_lock().is_none());
        drop(guard);

        assert!(mutex.try_lock().is_some());
    }

    #[test]
    fn uncontended_lock_resolves_inline() {
        let mutex = Mutex::new();

        let mut future = Box::pin(mutex.lock());
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);

        match future.as_mut().poll(&mut cx) {
            Poll::Ready(guard) => drop(guard),
            Poll::Pending => panic!("uncontended lock suspended"),
        }

        assert!(mutex.try_lock().is_some());
    }

    #[test]
    fn handoff_is_fifo_within_a_batch() {
        let mutex = Mutex::new();
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);

        let guard = mutex.try_lock().unwrap();

        let mut f1 = Box::pin(mutex.lock());
        let mut f2 = Box::pin(mutex.lock());
        let mut f3 = Box::pin(mutex.lock());
        assert!(f1.as_mut().poll(&mut cx).is_pending());
        assert!(f2.as_mut().poll(&mut cx).is_pending());
        assert!(f3.as_mut().poll(&mut cx).is_pending());

        // Unlock hands the lock to the earliest waiter; the others stay
        // suspended.
        drop(guard);
        assert!(f2.as_mut().poll(&mut cx).is_pending());
        assert!(f3.as_mut().poll(&mut cx).is_pending());
        let g1 = match f1.as_mut().poll(&mut cx) {
            Poll::Ready(guard) => guard,
            Poll::Pending => panic!("first waiter not resumed"),
        };
        assert!(mutex.try_lock().is_none());

        drop(g1);
        let g2 = match f2.as_mut().poll(&mut cx) {
            Poll::Ready(guard) => guard,
            Poll::Pending => panic!("second waiter not resumed"),
        };
        assert!(f3.as_mut().poll(&mut cx).is_pending());

        drop(g2);
        let g3 = match f3.as_mut().poll(&mut cx) {
            Poll::Ready(guard) => guard,
            Poll::Pending => panic!("third waiter not resumed"),
        };
        drop(g3);

        assert!(mutex.try_lock().is_some());
    }

    #[test]
    fn late_waiters_form_a_second_batch() {
        let mutex = Mutex::new();
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);

        let guard = mutex.try_lock().unwrap();

        let mut f1 = Box::pin(mutex.lock());
        let mut f2 = Box::pin(mutex.lock());
        assert!(f1.as_mut().poll(&mut cx).is_pending());
        assert!(f2.as_mut().poll(&mut cx).is_pending());

        drop(guard);
        let g1 = match f1.as_mut().poll(&mut cx) {
            Poll::Ready(guard) => guard,
            Poll::Pending => panic!(),
        };

        // A waiter arriving while the first batch drains queues behind
        // the already drained f2.
        let mut f3 = Box::pin(mutex.lock());
        assert!(f3.as_mut().poll(&mut cx).is_pending());

        drop(g1);
        let g2 = match f2.as_mut().poll(&mut cx) {
            Poll::Ready(guard) => guard,
            Poll::Pending => panic!(),
        };
        assert!(f3.as_mut().poll(&mut cx).is_pending());

        drop(g2);
        let g3 = match f3.as_mut().poll(&mut cx) {
            Poll::Ready(guard) => guard,
            Poll::Pending => panic!(),
        };
        drop(g3);
    }

    struct SharedCounter(UnsafeCell<u64>);
    unsafe impl Sync for SharedCounter {}

    #[test]
    fn mutual_exclusion() {
        const TASKS: usize = 8;
        const INCREMENTS: usize = 10_000;

        let mutex = Mutex::new();
        let counter = SharedCounter(UnsafeCell::new(0));

        std::thread::scope(|scope| {
            for _ in 0..TASKS {
                scope.spawn(|| {
                    let counter = &counter;
                    for _ in 0..INCREMENTS {
                        let guard = block_on(mutex.lock());
                        unsafe { *counter.0.get() += 1 };
                        drop(guard);
                    }
                });
            }
        });

        assert_eq!(unsafe { *counter.0.get() }, (TASKS * INCREMENTS) as u64);
        assert!(mutex.try_lock().is_some());
    }
}

//! A lock-free multi-producer, single-consumer intrusive queue.

use core::cell::Cell;
use core::marker::PhantomData;
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicPtr, Ordering};

use crate::link::Element;

/// The hook embedded by elements of an [`MpscQueue`].
pub struct MpscHook {
    next: Cell<*mut MpscHook>,
}

impl MpscHook {
    /// Creates an idle hook.
    pub const fn new() -> Self {
        MpscHook {
            next: Cell::new(ptr::null_mut()),
        }
    }
}

impl Default for MpscHook {
    fn default() -> Self {
        Self::new()
    }
}

// `next` is written by the producer that owns the element until the
// element is published with a release CAS, and read by the consumer only
// after an acquire load of the stack head.
unsafe impl Send for MpscHook {}
unsafe impl Sync for MpscHook {}

/// A lock-free multi-producer, single-consumer intrusive queue.
///
/// Producers push onto an atomic LIFO stack from any thread; the single
/// consumer takes the whole stack in one exchange and reverses it into a
/// private FIFO list. Elements are caller-owned and must outlive their
/// membership in the queue; the queue never allocates.
pub struct MpscQueue<T> {
    /// Producers push here; newest first.
    enqueue: AtomicPtr<MpscHook>,

    /// Drained elements owned by the consumer; oldest first. Only the
    /// consumer writes this, with relaxed orderings, so that `is_empty`
    /// stays callable from any thread.
    dequeue: AtomicPtr<MpscHook>,

    _marker: PhantomData<*const T>,
}

unsafe impl<T: Send> Send for MpscQueue<T> {}
unsafe impl<T: Send> Sync for MpscQueue<T> {}

impl<T: Element<MpscHook>> MpscQueue<T> {
    /// Creates an empty queue.
    pub const fn new() -> Self {
        MpscQueue {
            enqueue: AtomicPtr::new(ptr::null_mut()),
            dequeue: AtomicPtr::new(ptr::null_mut()),
            _marker: PhantomData,
        }
    }

    /// Returns true if both the consumer list and the producer stack are
    /// observed empty. Producers see all-or-nothing: their element is
    /// either still on the stack or wholly past the exchange.
    pub fn is_empty(&self) -> bool {
        self.enqueue.load(Ordering::Relaxed).is_null()
            && self.dequeue.load(Ordering::Relaxed).is_null()
    }

    /// Pushes an element. May be called from any thread.
    ///
    /// # Safety
    ///
    /// `element` must not already be in a queue, and must stay pinned and
    /// live until the consumer has dequeued it.
    pub unsafe fn enqueue(&self, element: NonNull<T>) {
        let hook = T::hook(element).as_ptr();

        let mut head = self.enqueue.load(Ordering::Acquire);
        loop {
            (*hook).next.set(head);
            match self.enqueue.compare_exchange_weak(
                head,
                hook,
                Ordering::Release,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(actual) => head = actual,
            }
        }
    }

    /// Pops the oldest element, or returns `None` if the queue is
    /// observed empty.
    ///
    /// # Safety
    ///
    /// Only one thread may dequeue at a time; two concurrent calls are
    /// undefined behavior.
    pub unsafe fn dequeue(&self) -> Option<NonNull<T>> {
        let head = self.dequeue.load(Ordering::Relaxed);
        if !head.is_null() {
            self.dequeue.store((*head).next.get(), Ordering::Relaxed);
            (*head).next.set(ptr::null_mut());
            return Some(T::element(NonNull::new_unchecked(head)));
        }

        if self.enqueue.load(Ordering::Acquire).is_null() {
            return None;
        }

        // Take the whole producer stack, then reverse it so that the
        // oldest element comes out first and the remainder becomes the
        // consumer list.
        let mut object = self.enqueue.swap(ptr::null_mut(), Ordering::AcqRel);
        debug_assert!(!object.is_null());

        let mut next = (*object).next.get();
        if !next.is_null() {
            (*object).next.set(ptr::null_mut());
            loop {
                let next2 = (*next).next.get();
                if next2.is_null() {
                    break;
                }
                (*next).next.set(object);
                object = next;
                next = next2;
            }
            self.dequeue.store(object, Ordering::Relaxed);
            object = next;
        }

        (*object).next.set(ptr::null_mut());
        Some(T::element(NonNull::new_unchecked(object)))
    }
}

impl<T: Element<MpscHook>> Default for MpscQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::element;

    struct Node {
        producer: usize,
        seq: usize,
        hook: MpscHook,
    }

    element!(impl Element<MpscHook> for Node { hook });

    #[derive(Clone, Copy)]
    struct SendPtr(NonNull<Node>);
    unsafe impl Send for SendPtr {}
    unsafe impl Sync for SendPtr {}

    fn nodes(producer: usize, count: usize) -> Vec<Box<Node>> {
        (0..count)
            .map(|seq| {
                Box::new(Node {
                    producer,
                    seq,
                    hook: MpscHook::new(),
                })
            })
            .collect()
    }

    #[test]
    fn fifo_across_batches() {
        let mut storage = nodes(0, 5);
        let handles: Vec<NonNull<Node>> =
            storage.iter_mut().map(|n| NonNull::from(&mut **n)).collect();

        let queue = MpscQueue::<Node>::new();
        assert!(queue.is_empty());

        unsafe {
            queue.enqueue(handles[0]);
            queue.enqueue(handles[1]);
            queue.enqueue(handles[2]);

            assert_eq!(queue.dequeue().unwrap().as_ref().seq, 0);

            // New pushes land behind the already drained batch.
            queue.enqueue(handles[3]);
            queue.enqueue(handles[4]);

            assert_eq!(queue.dequeue().unwrap().as_ref().seq, 1);
            assert_eq!(queue.dequeue().unwrap().as_ref().seq, 2);
            assert_eq!(queue.dequeue().unwrap().as_ref().seq, 3);
            assert_eq!(queue.dequeue().unwrap().as_ref().seq, 4);
            assert!(queue.dequeue().is_none());
        }

        assert!(queue.is_empty());
    }

    #[test]
    fn empty_dequeue() {
        let queue = MpscQueue::<Node>::new();
        assert!(unsafe { queue.dequeue() }.is_none());
        assert!(queue.is_empty());
    }

    #[test]
    fn contended() {
        const PRODUCERS: usize = 4;
        const PER_PRODUCER: usize = 100_000;

        let mut storage: Vec<Vec<Box<Node>>> =
            (0..PRODUCERS).map(|p| nodes(p, PER_PRODUCER)).collect();
        let handles: Vec<Vec<SendPtr>> = storage
            .iter_mut()
            .map(|nodes| {
                nodes
                    .iter_mut()
                    .map(|n| SendPtr(NonNull::from(&mut **n)))
                    .collect()
            })
            .collect();

        let queue = MpscQueue::<Node>::new();
        let mut received: Vec<(usize, usize)> = Vec::with_capacity(PRODUCERS * PER_PRODUCER);

        std::thread::scope(|scope| {
            for handles in &handles {
                let queue = &queue;
                scope.spawn(move || {
                    for &SendPtr(node) in handles {
                        unsafe { queue.enqueue(node) };
                    }
                });
            }

            while received.len() < PRODUCERS * PER_PRODUCER {
                match unsafe { queue.dequeue() } {
                    Some(node) => {
                        let node = unsafe { node.as_ref() };
                        received.push((node.producer, node.seq));
                    }
                    None => std::thread::yield_now(),
                }
            }
        });

        assert!(queue.is_empty());
        assert!(unsafe { queue.dequeue() }.is_none());

        // Per-producer order is preserved.
        let mut last = [0usize; PRODUCERS];
        let mut counts = [0usize; PRODUCERS];
        for &(producer, seq) in &received {
            if counts[producer] > 0 {
                assert!(seq > last[producer]);
            }
            last[producer] = seq;
            counts[producer] += 1;
        }
        assert_eq!(counts, [PER_PRODUCER; PRODUCERS]);
    }
}

//! An intrusive weight-balanced ordered set with order statistics.

use core::cmp::Ordering;
use core::marker::PhantomData;
use core::mem;
use core::ptr::{self, NonNull};

use crate::key::{Compare, IdentitySelector, InsertResult, KeySelector, NaturalOrder};
use crate::link::{Element, LinkBase, LinkContainer};
use crate::list::{List, ListHook};

/// Rebalance threshold: a subtree is rotated when its heavier side
/// reaches `DELTA` times the weight of the lighter side.
const DELTA: usize = 4;

/// Inner-rotation trigger: within the heavy side, a double rotation is
/// used when the inner grand-subtree reaches `RATIO` times the outer one.
const RATIO: usize = 2;

/// The hook embedded by elements of a [`WbSet`].
pub struct WbHook {
    children: [*mut WbHook; 2],
    parent: *mut WbHook,

    /// Number of nodes in the subtree rooted here, including this one.
    weight: usize,

    link: LinkBase,
}

impl WbHook {
    /// Creates an idle hook.
    pub const fn new() -> Self {
        WbHook {
            children: [ptr::null_mut(); 2],
            parent: ptr::null_mut(),
            weight: 0,
            link: LinkBase::new(),
        }
    }
}

impl Default for WbHook {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl Send for WbHook {}
unsafe impl Sync for WbHook {}

/// An intrusive weight-balanced ordered set.
///
/// Like [`AvlSet`](crate::AvlSet) but balanced by subtree weights, which
/// additionally buys O(log n) order statistics: [`select`](WbSet::select)
/// by rank and [`rank`](WbSet::rank) of an element.
pub struct WbSet<T, S = IdentitySelector, C = NaturalOrder> {
    root: *mut WbHook,
    container: LinkContainer,
    selector: S,
    compare: C,
    _marker: PhantomData<*const T>,
}

unsafe impl<T: Send, S: Send, C: Send> Send for WbSet<T, S, C> {}

struct FindSlot {
    found: *mut WbHook,
    parent: *mut WbHook,
    side: usize,
}

fn weight(hook: *mut WbHook) -> usize {
    if hook.is_null() {
        0
    } else {
        unsafe { (*hook).weight }
    }
}

impl<T, S, C> WbSet<T, S, C>
where
    T: Element<WbHook>,
    S: KeySelector<T>,
    C: Compare<S::Key>,
{
    /// Creates an empty set.
    pub fn new() -> Self
    where
        S: Default,
        C: Default,
    {
        Self::with(S::default(), C::default())
    }

    /// Creates an empty set with an explicit selector and comparator.
    pub fn with(selector: S, compare: C) -> Self {
        WbSet {
            root: ptr::null_mut(),
            container: LinkContainer::new(),
            selector,
            compare,
            _marker: PhantomData,
        }
    }

    /// Returns the number of elements in the set.
    pub fn size(&self) -> usize {
        weight(self.root)
    }

    /// Returns true if the set is empty.
    pub fn is_empty(&self) -> bool {
        self.root.is_null()
    }

    /// Returns the element at the root of the tree, or `None` if the set
    /// is empty. Exposed read-only for external tree algorithms.
    pub fn root(&self) -> Option<&T> {
        NonNull::new(self.root).map(|h| unsafe { T::element(h).as_ref() })
    }

    /// Returns the weight of the subtree rooted at an element.
    ///
    /// Panics in checked builds if the element is not part of this set.
    pub fn weight(&self, element: &T) -> usize {
        let hook = unsafe { T::hook(NonNull::from(element)) }.as_ptr();
        self.container.check(unsafe { &(*hook).link });
        unsafe { (*hook).weight }
    }

    /// Returns the children of an element in the tree, read-only.
    ///
    /// Panics in checked builds if the element is not part of this set.
    pub fn children(&self, element: &T) -> [Option<&T>; 2] {
        let hook = unsafe { T::hook(NonNull::from(element)) }.as_ptr();
        self.container.check(unsafe { &(*hook).link });
        unsafe {
            [
                NonNull::new((*hook).children[0]).map(|h| T::element(h).as_ref()),
                NonNull::new((*hook).children[1]).map(|h| T::element(h).as_ref()),
            ]
        }
    }

    /// Returns the element with the given rank (0-based, in key order),
    /// or `None` if `rank >= size`.
    pub fn select(&self, mut rank: usize) -> Option<&T> {
        if rank >= self.size() {
            return None;
        }
        unsafe {
            let mut hook = self.root;
            loop {
                debug_assert!(rank < (*hook).weight);
                let left = weight((*hook).children[0]);
                match rank.cmp(&left) {
                    Ordering::Equal => return Some(T::element(NonNull::new_unchecked(hook)).as_ref()),
                    Ordering::Less => hook = (*hook).children[0],
                    Ordering::Greater => {
                        rank -= left + 1;
                        hook = (*hook).children[1];
                    }
                }
            }
        }
    }

    /// Returns the rank of an element: the number of elements ordered
    /// before it.
    ///
    /// Panics in checked builds if the element is not part of this set.
    pub fn rank(&self, element: &T) -> usize {
        let hook = unsafe { T::hook(NonNull::from(element)) }.as_ptr();
        self.container.check(unsafe { &(*hook).link });
        unsafe {
            let mut rank = weight((*hook).children[0]);
            let mut hook = hook;
            loop {
                let parent = (*hook).parent;
                if parent.is_null() {
                    break;
                }
                // Each time the walk emerges from a right subtree, the
                // parent and its left subtree are ordered before.
                if (*parent).children[0] != hook {
                    rank += weight((*parent).children[0]) + 1;
                }
                hook = parent;
            }
            rank
        }
    }

    /// Finds the element with the given key.
    pub fn find(&self, key: &S::Key) -> Option<&T> {
        self.find_by(|probe| self.compare.compare(key, probe))
    }

    /// Finds an element by a three-way probe over the stored keys; the
    /// heterogeneous-key lookup.
    pub fn find_by<F>(&self, mut probe: F) -> Option<&T>
    where
        F: FnMut(&S::Key) -> Ordering,
    {
        unsafe {
            let selector = &self.selector;
            let slot = Self::find_slot(self.root, |e| probe(selector.key(e)));
            NonNull::new(slot.found).map(|h| T::element(h).as_ref())
        }
    }

    /// Inserts an element. If an element with an equal key is already
    /// present, the set is unchanged and the result carries the existing
    /// element with `inserted == false`.
    ///
    /// # Safety
    ///
    /// `element` must not be linked into any container, and must stay
    /// pinned and live until it is removed again.
    pub unsafe fn insert(&mut self, element: NonNull<T>) -> InsertResult<T> {
        let selector = &self.selector;
        let compare = &self.compare;
        let key = selector.key(element.as_ref());
        let slot = Self::find_slot(self.root, |e| compare.compare(key, selector.key(e)));

        if !slot.found.is_null() {
            return InsertResult {
                element: T::element(NonNull::new_unchecked(slot.found)),
                inserted: false,
            };
        }

        let hook = T::hook(element).as_ptr();
        self.container.link(&(*hook).link);

        (*hook).children = [ptr::null_mut(); 2];
        (*hook).parent = slot.parent;
        (*hook).weight = 1;
        if slot.parent.is_null() {
            self.root = hook;
        } else {
            (*slot.parent).children[slot.side] = hook;
        }

        self.rebalance(slot.parent, slot.side, true);
        debug_assert!(self.invariant());

        InsertResult {
            element,
            inserted: true,
        }
    }

    /// Removes an element from the set.
    ///
    /// # Safety
    ///
    /// `element` must be part of this set.
    pub unsafe fn remove(&mut self, element: NonNull<T>) {
        let hook = T::hook(element).as_ptr();
        self.container.unlink(&(*hook).link);

        let parent = (*hook).parent;
        let side = if parent.is_null() {
            0
        } else {
            ((*parent).children[0] != hook) as usize
        };

        let mut balance_hook = parent;
        let mut balance_side = side;

        let mut near_child = (*hook).children[0];
        let mut far_child = (*hook).children[1];

        if !near_child.is_null() || !far_child.is_null() {
            // Replace with the in-order neighbour on the heavier side.
            let succ_l = (weight(far_child) > weight(near_child)) as usize;
            let succ_r = succ_l ^ 1;
            if succ_l == 1 {
                mem::swap(&mut near_child, &mut far_child);
            }

            let mut successor = near_child;
            balance_hook = near_child;
            balance_side = succ_l;

            if !(*near_child).children[succ_r].is_null() {
                successor = Self::extreme(near_child, succ_r);

                let succ_parent = (*successor).parent;
                let succ_child = (*successor).children[succ_l];

                // Attach the successor's child to the successor's parent.
                (*succ_parent).children[succ_r] = succ_child;
                if !succ_child.is_null() {
                    (*succ_child).parent = succ_parent;
                }

                // Attach the removed node's direct child to the successor.
                (*successor).children[succ_l] = near_child;
                (*near_child).parent = successor;

                balance_hook = succ_parent;
                balance_side = succ_r;
            }

            // The successor takes over the removed node's whole subtree;
            // the walk below corrects the weights along the spliced path.
            (*successor).weight = (*hook).weight;

            // Attach the removed node's other child to the successor.
            (*successor).children[succ_r] = far_child;
            if !far_child.is_null() {
                (*far_child).parent = successor;
            }

            // Attach the successor to the removed node's parent.
            if parent.is_null() {
                self.root = successor;
            } else {
                (*parent).children[side] = successor;
            }
            (*successor).parent = parent;
        } else if parent.is_null() {
            self.root = ptr::null_mut();
        } else {
            (*parent).children[side] = ptr::null_mut();
        }

        self.rebalance(balance_hook, balance_side, false);
        debug_assert!(self.invariant());
    }

    /// Removes all elements, leaving every hook idle.
    pub fn clear(&mut self) {
        if self.root.is_null() {
            return;
        }
        unsafe {
            let mut cur = Self::extreme(self.root, 0);
            while !cur.is_null() {
                if !(*cur).children[1].is_null() {
                    cur = Self::extreme((*cur).children[1], 0);
                } else {
                    let parent = mem::replace(&mut (*cur).parent, ptr::null_mut());
                    if !parent.is_null() {
                        let side = ((*parent).children[0] != cur) as usize;
                        (*parent).children[side] = ptr::null_mut();
                    }
                    (*cur).children = [ptr::null_mut(); 2];
                    (*cur).weight = 0;
                    self.container.unlink(&(*cur).link);
                    cur = parent;
                }
            }
        }
        self.root = ptr::null_mut();
    }

    /// Consumes the set and flattens it into a [`List`] in key order,
    /// transferring the container identity to the list.
    pub fn flatten(mut self) -> List<T>
    where
        T: Element<ListHook>,
    {
        let size = self.size();
        let mut head: *mut ListHook = ptr::null_mut();
        let mut tail: *mut ListHook = ptr::null_mut();

        unsafe {
            let mut node = if self.root.is_null() {
                ptr::null_mut()
            } else {
                Self::extreme(self.root, 0)
            };

            while !node.is_null() {
                let element = <T as Element<WbHook>>::element(NonNull::new_unchecked(node));
                let list_hook = <T as Element<ListHook>>::hook(element).as_ptr();

                LinkBase::transfer(&(*node).link, &(*list_hook).link);

                if head.is_null() {
                    head = list_hook;
                } else {
                    (*tail).siblings[0] = list_hook;
                    (*list_hook).siblings[1] = tail;
                }
                tail = list_hook;

                node = Self::advance(node, 1);
            }

            if !head.is_null() {
                (*tail).siblings[0] = head;
                (*head).siblings[1] = tail;
            }
        }

        self.root = ptr::null_mut();
        List::adopt(self.container.take(), head, size)
    }

    /// Returns a double-ended in-order iterator over the set.
    pub fn iter(&self) -> Iter<'_, T> {
        let (front, back) = if self.root.is_null() {
            (ptr::null_mut(), ptr::null_mut())
        } else {
            unsafe { (Self::extreme(self.root, 0), Self::extreme(self.root, 1)) }
        };
        Iter {
            front,
            back,
            len: self.size(),
            _marker: PhantomData,
        }
    }

    /// Returns a cursor positioned at an element of this set.
    ///
    /// Panics in checked builds if the element is not part of this set.
    pub fn cursor(&self, element: &T) -> Cursor<'_, T, S, C> {
        let hook = unsafe { T::hook(NonNull::from(element)) }.as_ptr();
        self.container.check(unsafe { &(*hook).link });
        Cursor {
            current: hook,
            set: self,
        }
    }

    unsafe fn find_slot(root: *mut WbHook, mut probe: impl FnMut(&T) -> Ordering) -> FindSlot {
        let mut parent: *mut WbHook = ptr::null_mut();
        let mut side = 0;
        let mut node = root;

        while !node.is_null() {
            let element = T::element(NonNull::new_unchecked(node));
            match probe(element.as_ref()) {
                Ordering::Equal => {
                    return FindSlot {
                        found: node,
                        parent,
                        side,
                    }
                }
                Ordering::Less => {
                    parent = node;
                    side = 0;
                }
                Ordering::Greater => {
                    parent = node;
                    side = 1;
                }
            }
            node = (*parent).children[side];
        }

        FindSlot {
            found: ptr::null_mut(),
            parent,
            side,
        }
    }

    unsafe fn extreme(mut hook: *mut WbHook, side: usize) -> *mut WbHook {
        while !(*hook).children[side].is_null() {
            hook = (*hook).children[side];
        }
        hook
    }

    unsafe fn advance(hook: *mut WbHook, toward: usize) -> *mut WbHook {
        step(hook, toward)
    }

    /// Rotates the subtree at `node` from side `l` toward the other
    /// side, recomputing the two affected weights from the child
    /// weights.
    unsafe fn rotate(&mut self, node: *mut WbHook, l: usize) {
        let r = l ^ 1;

        let parent = (*node).parent;
        let pivot = (*node).children[l];
        let child = (*pivot).children[r];

        let node_weight = (*node).weight;
        let pivot_weight = (*pivot).weight;
        let child_weight = weight(child);

        (*node).children[l] = child;
        (*node).parent = pivot;

        (*pivot).children[r] = node;
        (*pivot).parent = parent;

        if !child.is_null() {
            (*child).parent = node;
        }

        if parent.is_null() {
            self.root = pivot;
        } else {
            let side = ((*parent).children[0] != node) as usize;
            (*parent).children[side] = pivot;
        }

        (*node).weight = node_weight - pivot_weight + child_weight;
        (*pivot).weight = node_weight;
    }

    /// Walks from `cur` to the root adjusting the weights and rotating
    /// wherever the balance bound is exceeded.
    unsafe fn rebalance(&mut self, mut cur: *mut WbHook, mut l: usize, insert: bool) {
        while !cur.is_null() {
            if !insert {
                l ^= 1;
            }
            let r = l ^ 1;

            let node = cur;
            if insert {
                (*node).weight += 1;
            } else {
                (*node).weight -= 1;
            }

            let mut new_parent = node;

            let near = (*node).children[l];
            let far = (*node).children[r];

            if (*node).weight > 2 && weight(near) >= weight(far) * DELTA {
                new_parent = near;

                let outer = (*near).children[l];
                let inner = (*near).children[r];

                if weight(inner) >= weight(outer) * RATIO {
                    self.rotate(near, r);
                    // The inner-rotation pivot becomes the subtree root.
                    new_parent = inner;
                }

                self.rotate(node, l);
            }

            let up = (*new_parent).parent;
            if up.is_null() {
                break;
            }
            l = ((*up).children[0] != new_parent) as usize;
            cur = up;
        }
    }

    fn invariant(&self) -> bool {
        unsafe {
            if self.check_node(self.root, ptr::null_mut()).is_none() {
                return false;
            }

            // In-order keys must strictly ascend.
            if !self.root.is_null() {
                let mut node = Self::extreme(self.root, 0);
                let mut prev: Option<&S::Key> = None;
                while !node.is_null() {
                    let key = self
                        .selector
                        .key(T::element(NonNull::new_unchecked(node)).as_ref());
                    if let Some(prev) = prev {
                        if self.compare.compare(prev, key) != Ordering::Less {
                            return false;
                        }
                    }
                    prev = Some(key);
                    node = Self::advance(node, 1);
                }
            }
            true
        }
    }

    /// Returns the subtree weight, or `None` on a parent-link, weight or
    /// balance violation.
    unsafe fn check_node(&self, hook: *mut WbHook, parent: *mut WbHook) -> Option<usize> {
        if hook.is_null() {
            return Some(0);
        }
        if (*hook).parent != parent {
            return None;
        }

        let lw = self.check_node((*hook).children[0], hook)?;
        let rw = self.check_node((*hook).children[1], hook)?;

        if lw + rw > 1 && (lw >= rw * DELTA || rw >= lw * DELTA) {
            return None;
        }
        if (*hook).weight != lw + rw + 1 {
            return None;
        }

        Some(lw + rw + 1)
    }
}

impl<T, S, C> Default for WbSet<T, S, C>
where
    T: Element<WbHook>,
    S: KeySelector<T> + Default,
    C: Compare<S::Key> + Default,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T, S, C> Drop for WbSet<T, S, C> {
    fn drop(&mut self) {
        // Idle every hook so the elements outliving the set stay usable.
        #[cfg(all(debug_assertions, feature = "link-debug"))]
        if !self.root.is_null() {
            unsafe {
                let mut cur = {
                    let mut hook = self.root;
                    while !(*hook).children[0].is_null() {
                        hook = (*hook).children[0];
                    }
                    hook
                };
                while !cur.is_null() {
                    if !(*cur).children[1].is_null() {
                        let mut hook = (*cur).children[1];
                        while !(*hook).children[0].is_null() {
                            hook = (*hook).children[0];
                        }
                        cur = hook;
                    } else {
                        let parent = mem::replace(&mut (*cur).parent, ptr::null_mut());
                        if !parent.is_null() {
                            let side = ((*parent).children[0] != cur) as usize;
                            (*parent).children[side] = ptr::null_mut();
                        }
                        self.container.unlink(&(*cur).link);
                        cur = parent;
                    }
                }
            }
        }
    }
}

/// Double-ended in-order iterator over a [`WbSet`].
pub struct Iter<'a, T> {
    front: *mut WbHook,
    back: *mut WbHook,
    len: usize,
    _marker: PhantomData<&'a T>,
}

impl<'a, T: Element<WbHook>> Iterator for Iter<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<&'a T> {
        if self.len == 0 {
            return None;
        }
        unsafe {
            let hook = NonNull::new_unchecked(self.front);
            self.front = step(self.front, 1);
            self.len -= 1;
            Some(T::element(hook).as_ref())
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.len, Some(self.len))
    }
}

impl<'a, T: Element<WbHook>> DoubleEndedIterator for Iter<'a, T> {
    fn next_back(&mut self) -> Option<&'a T> {
        if self.len == 0 {
            return None;
        }
        unsafe {
            let hook = NonNull::new_unchecked(self.back);
            self.back = step(self.back, 0);
            self.len -= 1;
            Some(T::element(hook).as_ref())
        }
    }
}

impl<'a, T: Element<WbHook>> ExactSizeIterator for Iter<'a, T> {}

unsafe fn step(hook: *mut WbHook, toward: usize) -> *mut WbHook {
    if !(*hook).children[toward].is_null() {
        let mut hook = (*hook).children[toward];
        let back = toward ^ 1;
        while !(*hook).children[back].is_null() {
            hook = (*hook).children[back];
        }
        return hook;
    }
    let mut hook = hook;
    loop {
        let parent = (*hook).parent;
        if parent.is_null() {
            return ptr::null_mut();
        }
        if (*parent).children[toward] != hook {
            return parent;
        }
        hook = parent;
    }
}

/// A bidirectional in-order cursor over a [`WbSet`].
///
/// `get` returns `None` when the cursor is past either end; stepping
/// again wraps to the nearest element.
pub struct Cursor<'a, T, S = IdentitySelector, C = NaturalOrder> {
    current: *mut WbHook,
    set: &'a WbSet<T, S, C>,
}

impl<'a, T, S, C> Cursor<'a, T, S, C>
where
    T: Element<WbHook>,
    S: KeySelector<T>,
    C: Compare<S::Key>,
{
    /// Returns the element the cursor points at, if any.
    pub fn get(&self) -> Option<&'a T> {
        NonNull::new(self.current).map(|h| unsafe { T::element(h).as_ref() })
    }

    /// Moves to the next element in key order.
    pub fn move_next(&mut self) {
        unsafe {
            self.current = if self.current.is_null() {
                if self.set.root.is_null() {
                    ptr::null_mut()
                } else {
                    WbSet::<T, S, C>::extreme(self.set.root, 0)
                }
            } else {
                step(self.current, 1)
            };
        }
    }

    /// Moves to the previous element in key order.
    pub fn move_prev(&mut self) {
        unsafe {
            self.current = if self.current.is_null() {
                if self.set.root.is_null() {
                    ptr::null_mut()
                } else {
                    WbSet::<T, S, C>::extreme(self.set.root, 1)
                }
            } else {
                step(self.current, 0)
            };
        }
    }
}

#![expect(unsafe_code, reason = "a Chase-Lev deque cannot be built on safe primitives")]
//! Component B: the Chase-Lev work-stealing spark deque (spec §4.B).
//!
//! The owner pushes and pops the bottom end without taking a lock; thieves
//! race each other (and the owner) for the top end via a single CAS. This
//! follows the classic Chase-Lev dynamic-array algorithm (Chase & Lev,
//! "Dynamic Circular Work-Stealing Deque", 2005), the same algorithm
//! `crossbeam-deque` implements.
//!
//! Growth allocates a new backing array and copies live elements into it;
//! the old array is kept (never freed) for the deque's remaining lifetime
//! rather than reclaimed via an epoch scheme. A thief may have already
//! loaded a pointer to the old array before the owner swaps it in, so
//! freeing it immediately would be a use-after-free. Leaking bounds the
//! waste to one array per growth doubling, which in practice is a handful
//! of allocations over the runtime's lifetime, documented in DESIGN.md as
//! a deliberate simplification rather than a literal epoch-GC port.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicIsize, AtomicPtr, Ordering};
use std::sync::Mutex;

use rt_sync::CachePadded;

struct Array<T> {
    mask: isize,
    cells: Box<[UnsafeCell<MaybeUninit<T>>]>,
}

impl<T> Array<T> {
    fn new(capacity: usize) -> Self {
        debug_assert!(capacity.is_power_of_two());
        let mut cells = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            cells.push(UnsafeCell::new(MaybeUninit::uninit()));
        }
        Self { mask: capacity as isize - 1, cells: cells.into_boxed_slice() }
    }

    fn capacity(&self) -> isize {
        self.mask + 1
    }

    fn slot(&self, index: isize) -> *mut MaybeUninit<T> {
        let i = (index & self.mask) as usize;
        self.cells[i].get()
    }

    /// # Safety
    /// The caller must guarantee slot `index` holds a live, uniquely-owned
    /// `T` that has not already been read out.
    unsafe fn read(&self, index: isize) -> T {
        unsafe { self.slot(index).read().assume_init() }
    }

    fn write(&self, index: isize, value: T) {
        unsafe { self.slot(index).write(MaybeUninit::new(value)) };
    }

    /// Copies the live range `[from, to)` into a freshly allocated array of
    /// double this array's capacity.
    fn grown(&self, from: isize, to: isize) -> Array<T> {
        let new = Array::new((self.capacity() as usize) * 2);
        let mut i = from;
        while i < to {
            // SAFETY: `[from, to)` is exactly the owner's live range; this
            // runs on the owner thread, which is the only writer, so no
            // thief can be mid-write here.
            let value = unsafe { self.read(i) };
            new.write(i, value);
            i += 1;
        }
        new
    }
}

/// Result of a steal attempt (spec §4.B).
pub enum Steal<T> {
    /// The deque was observed empty.
    Empty,
    /// Another thief (or the owner) won the race for the same slot; retry.
    Abort,
    Success(T),
}

/// A single-owner, multi-thief work-stealing deque.
///
/// `push_bottom`/`pop_bottom` must only be called by the owning engine;
/// `steal_top` may be called concurrently from any number of other threads.
pub struct Deque<T> {
    bottom: CachePadded<AtomicIsize>,
    top: CachePadded<AtomicIsize>,
    buffer: AtomicPtr<Array<T>>,
    retired: Mutex<Vec<Box<Array<T>>>>,
    /// Upper bound on the buffer's element capacity (spec §4.B, "deque
    /// length factor"). `None` leaves growth unbounded. Exceeding it is a
    /// fatal invariant violation, matching the reference runtime's
    /// fixed-size spark array sized once at startup.
    max_capacity: Option<usize>,
}

unsafe impl<T: Send> Send for Deque<T> {}
unsafe impl<T: Send> Sync for Deque<T> {}

impl<T> Deque<T> {
    const DEFAULT_INITIAL_CAPACITY: usize = 32;

    pub fn new() -> Self {
        Self::with_capacity(Self::DEFAULT_INITIAL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self::with_capacity_bound(capacity, None)
    }

    /// Like [`Self::with_capacity`], additionally refusing to grow the
    /// buffer past `max_capacity` elements (spec §6, `deque_length_factor`).
    pub fn with_capacity_bound(capacity: usize, max_capacity: Option<usize>) -> Self {
        let capacity = capacity.next_power_of_two().max(2);
        let array = Box::new(Array::new(capacity));
        Self {
            bottom: CachePadded::new(AtomicIsize::new(0)),
            top: CachePadded::new(AtomicIsize::new(0)),
            buffer: AtomicPtr::new(Box::into_raw(array)),
            retired: Mutex::new(Vec::new()),
            max_capacity,
        }
    }

    fn current_array(&self) -> &Array<T> {
        // SAFETY: `buffer` always points at a live, boxed `Array<T>` owned
        // either by `self` (current) or held alive in `retired`.
        unsafe { &*self.buffer.load(Ordering::Acquire) }
    }

    /// Owner-only: pushes a value to the bottom, growing the backing array
    /// if it is full.
    pub fn push_bottom(&self, value: T) {
        let b = self.bottom.load(Ordering::Relaxed);
        let t = self.top.load(Ordering::Acquire);
        let array = self.current_array();

        if b.wrapping_sub(t) >= array.capacity() {
            let grown_capacity = (array.capacity() as usize) * 2;
            if let Some(max) = self.max_capacity {
                assert!(
                    grown_capacity <= max,
                    "fatal: spark deque would grow past its configured length factor ({max} elements)"
                );
            }
            let grown = Box::new(array.grown(t, b));
            let old = self.buffer.swap(Box::into_raw(grown), Ordering::Release);
            // SAFETY: `old` was produced by a previous `Box::into_raw` and
            // is only read here to move it into the retirement list.
            let old = unsafe { Box::from_raw(old) };
            self.retired.lock().unwrap_or_else(|p| p.into_inner()).push(old);
        }

        self.current_array().write(b, value);
        std::sync::atomic::fence(Ordering::Release);
        self.bottom.store(b + 1, Ordering::Release);
    }

    /// Owner-only: pops from the bottom. Races with thieves only on the
    /// last remaining element, resolved with a single CAS on `top`.
    pub fn pop_bottom(&self) -> Option<T> {
        let b = self.bottom.load(Ordering::Relaxed);
        let array = self.current_array();
        let new_b = b - 1;
        self.bottom.store(new_b, Ordering::Relaxed);
        std::sync::atomic::fence(Ordering::SeqCst);
        let t = self.top.load(Ordering::Relaxed);

        if t > new_b {
            // Already empty; restore bottom and report nothing.
            self.bottom.store(b, Ordering::Relaxed);
            return None;
        }

        // SAFETY: `new_b >= t`, so slot `new_b` holds a value nobody else
        // has logically claimed yet (thieves only ever target `top`).
        let value = unsafe { array.read(new_b) };

        if t == new_b {
            // Last element: a thief could be racing us for it.
            let won = self
                .top
                .compare_exchange(t, t + 1, Ordering::SeqCst, Ordering::Relaxed)
                .is_ok();
            self.bottom.store(b, Ordering::Relaxed);
            if !won {
                // A thief took it first; the bytes we read are a duplicate
                // of the thief's copy, not a second logical value. Forget
                // rather than drop it to avoid a double-free/double-drop.
                std::mem::forget(value);
                return None;
            }
        } else {
            self.bottom.store(new_b, Ordering::Relaxed);
        }

        Some(value)
    }

    /// Thief-side: attempts to steal the oldest spark.
    pub fn steal_top(&self) -> Steal<T> {
        let t = self.top.load(Ordering::Acquire);
        std::sync::atomic::fence(Ordering::SeqCst);
        let b = self.bottom.load(Ordering::Acquire);

        if t >= b {
            return Steal::Empty;
        }

        let array = self.current_array();
        // SAFETY: `t < b` observed above; the slot at `t` holds a value
        // that has not yet been claimed by the owner (the owner only frees
        // slots up to its own `bottom`, which is strictly greater here).
        let value = unsafe { array.read(t) };

        match self.top.compare_exchange(t, t + 1, Ordering::SeqCst, Ordering::Relaxed) {
            Ok(_) => Steal::Success(value),
            Err(_) => {
                // Lost the race for this slot; our read is a duplicate of
                // the winner's copy, never the owner's. See `pop_bottom`.
                std::mem::forget(value);
                Steal::Abort
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        let b = self.bottom.load(Ordering::Acquire);
        let t = self.top.load(Ordering::Acquire);
        t >= b
    }

    pub fn len(&self) -> usize {
        let b = self.bottom.load(Ordering::Acquire);
        let t = self.top.load(Ordering::Acquire);
        (b - t).max(0) as usize
    }
}

impl<T> Default for Deque<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for Deque<T> {
    fn drop(&mut self) {
        let b = self.bottom.load(Ordering::Relaxed);
        let t = self.top.load(Ordering::Relaxed);
        let array = self.current_array();
        let mut i = t;
        while i < b {
            // SAFETY: `[t, b)` is exactly the set of still-live elements;
            // nothing else can be accessing the deque during `drop`.
            unsafe { drop(array.read(i)) };
            i += 1;
        }
        // SAFETY: reclaim the current array; `retired` arrays are dropped
        // normally as `Box<Array<T>>` values in the `Vec`.
        let current = self.buffer.load(Ordering::Relaxed);
        unsafe { drop(Box::from_raw(current)) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn push_then_pop_bottom_round_trips() {
        let deque: Deque<u32> = Deque::new();
        deque.push_bottom(1);
        deque.push_bottom(2);
        deque.push_bottom(3);
        assert_eq!(deque.pop_bottom(), Some(3));
        assert_eq!(deque.pop_bottom(), Some(2));
        assert_eq!(deque.pop_bottom(), Some(1));
        assert_eq!(deque.pop_bottom(), None);
    }

    #[test]
    fn steal_top_takes_oldest_first() {
        let deque: Deque<u32> = Deque::new();
        deque.push_bottom(1);
        deque.push_bottom(2);
        match deque.steal_top() {
            Steal::Success(v) => assert_eq!(v, 1),
            _ => panic!("expected a successful steal"),
        }
    }

    #[test]
    fn steal_from_empty_deque_reports_empty() {
        let deque: Deque<u32> = Deque::new();
        assert!(matches!(deque.steal_top(), Steal::Empty));
    }

    #[test]
    fn grows_past_initial_capacity_without_losing_elements() {
        let deque: Deque<u32> = Deque::with_capacity(2);
        for i in 0..100 {
            deque.push_bottom(i);
        }
        let mut popped = Vec::new();
        while let Some(v) = deque.pop_bottom() {
            popped.push(v);
        }
        popped.reverse();
        assert_eq!(popped, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn concurrent_owner_and_thieves_never_duplicate_or_lose_items() {
        let deque = Arc::new(Deque::with_capacity(4));
        for i in 0..2000u32 {
            deque.push_bottom(i);
        }

        let stolen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut thieves = Vec::new();
        for _ in 0..4 {
            let deque = Arc::clone(&deque);
            let stolen = Arc::clone(&stolen);
            thieves.push(thread::spawn(move || loop {
                match deque.steal_top() {
                    Steal::Success(v) => stolen.lock().unwrap().push(v),
                    Steal::Abort => continue,
                    Steal::Empty => break,
                }
            }));
        }

        let mut owned = Vec::new();
        while let Some(v) = deque.pop_bottom() {
            owned.push(v);
        }

        for t in thieves {
            t.join().unwrap();
        }

        let mut all = owned;
        all.extend(stolen.lock().unwrap().iter().copied());
        all.sort_unstable();
        assert_eq!(all, (0..2000).collect::<Vec<_>>());
    }
}

//! Data-parallel dispatch layer.
//!
//! Every parallel phase of the relocaliser is a bulk dispatch over one index
//! space (pixels, keypoints, candidates or inliers). The [`Dispatch`] trait
//! captures exactly that: `for_each(n, task)` runs `task(0..n)` with
//! unspecified ordering and an implicit barrier on return. The algorithm is
//! identical across backends; only the dispatch differs.
//!
//! Two shared-memory primitives back the dispatches:
//!
//! - [`AppendList`]: dense-prefix append through a single atomic counter,
//!   used for the candidate and inlier arrays;
//! - [`AtomicF64`]: compare-and-swap float accumulation, used for the
//!   per-candidate energy reduction.
//!
//! [`SharedSlice`] lets a dispatch write disjoint slots of a pre-sized arena
//! without locks; index-disjointness is the caller's obligation.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::prelude::*;

/// A bulk-synchronous parallel-for.
///
/// Implementations must run `task(i)` exactly once for every `i in 0..n` and
/// must not return before all invocations have completed. Invocation order
/// and interleaving are unspecified.
pub trait Dispatch: Send + Sync {
    fn for_each(&self, n: usize, task: &(dyn Fn(usize) + Send + Sync));
}

/// Single-threaded backend: iterates the index space in order.
///
/// Combined with a fixed RNG seed this is the reproducible configuration;
/// all reductions happen in index order.
#[derive(Debug, Default, Clone, Copy)]
pub struct Serial;

impl Dispatch for Serial {
    fn for_each(&self, n: usize, task: &(dyn Fn(usize) + Send + Sync)) {
        for i in 0..n {
            task(i);
        }
    }
}

/// Work-stealing host backend on the global rayon pool.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadPool;

impl Dispatch for ThreadPool {
    fn for_each(&self, n: usize, task: &(dyn Fn(usize) + Send + Sync)) {
        (0..n).into_par_iter().for_each(task);
    }
}

/// Derive the RNG for one dispatch slot.
///
/// Random decisions inside a dispatch never share generator state: each slot
/// gets its own `StdRng` keyed by `(seed, stream, slot)`, so a run is fully
/// determined by the configured seed regardless of thread interleaving.
/// `stream` separates the independent consumers (candidate generation,
/// per-round inlier sampling).
pub fn slot_rng(seed: u64, stream: u64, slot: u64) -> StdRng {
    let mut z = seed
        ^ stream.wrapping_mul(0x9E37_79B9_7F4A_7C15)
        ^ slot.wrapping_mul(0xD1B5_4A32_D192_ED03);
    // splitmix64 finaliser
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^= z >> 31;
    StdRng::seed_from_u64(z)
}

/// A float accumulator usable from concurrent dispatch slots.
///
/// Stores the IEEE-754 bit pattern in an `AtomicU64` and adds through a
/// compare-exchange loop.
#[derive(Debug)]
pub struct AtomicF64(AtomicU64);

impl AtomicF64 {
    pub fn new(value: f64) -> Self {
        Self(AtomicU64::new(value.to_bits()))
    }

    pub fn load(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::SeqCst))
    }

    pub fn store(&self, value: f64) {
        self.0.store(value.to_bits(), Ordering::SeqCst);
    }

    pub fn add(&self, value: f64) {
        let mut current = self.0.load(Ordering::SeqCst);
        loop {
            let next = (f64::from_bits(current) + value).to_bits();
            match self
                .0
                .compare_exchange_weak(current, next, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }
}

/// Dense-prefix append list with a single atomic length counter.
///
/// Concurrent `push` calls reserve slots with `fetch_add`; every reserved
/// index below capacity is written exactly once, so after the dispatch
/// barrier the first `len()` slots form a fully initialised dense prefix.
/// Pushes beyond capacity are rejected. Reading requires `&mut self`, which
/// guarantees quiescence.
pub struct AppendList<T> {
    slots: Vec<UnsafeCell<MaybeUninit<T>>>,
    len: AtomicUsize,
}

// SAFETY: slots are only written through `push`, which hands out each index
// at most once via the atomic counter, and only read through `&mut self`
// methods after all writers have finished. `T: Copy` rules out drop hazards
// for slots that were reserved but never handed to a reader.
unsafe impl<T: Copy + Send> Sync for AppendList<T> {}
unsafe impl<T: Copy + Send> Send for AppendList<T> {}

impl<T: Copy + Send> AppendList<T> {
    pub fn with_capacity(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || UnsafeCell::new(MaybeUninit::uninit()));
        Self {
            slots,
            len: AtomicUsize::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Append `value`, returning its index, or `None` when full.
    pub fn push(&self, value: T) -> Option<usize> {
        let index = self.len.fetch_add(1, Ordering::SeqCst);
        if index >= self.slots.len() {
            return None;
        }
        // SAFETY: `index` was reserved exclusively by the fetch_add above,
        // so no other thread writes or reads this slot concurrently.
        unsafe {
            (*self.slots[index].get()).write(value);
        }
        Some(index)
    }

    /// Number of accepted elements.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::SeqCst).min(self.slots.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The accepted dense prefix. Exclusive access guarantees no push races.
    pub fn as_slice(&mut self) -> &[T] {
        let len = self.len();
        // SAFETY: every slot below `len` was initialised by a completed
        // `push`, and `&mut self` excludes concurrent writers.
        unsafe { std::slice::from_raw_parts(self.slots.as_ptr().cast::<T>(), len) }
    }

    pub fn clear(&mut self) {
        self.len.store(0, Ordering::SeqCst);
    }
}

/// A mutable arena slice shareable across dispatch slots.
///
/// The dispatch closure receives only `&self`, so disjoint-index writes into
/// a pre-sized arena go through this wrapper. Soundness rests on the caller
/// upholding the index-disjointness contract of `slot_mut`.
pub struct SharedSlice<'a, T> {
    ptr: *mut T,
    len: usize,
    _marker: std::marker::PhantomData<&'a mut [T]>,
}

// SAFETY: access is partitioned by index between dispatch slots (the
// `slot_mut` contract); the wrapper itself adds no shared mutable state.
unsafe impl<T: Send> Sync for SharedSlice<'_, T> {}
unsafe impl<T: Send> Send for SharedSlice<'_, T> {}

impl<'a, T> SharedSlice<'a, T> {
    pub fn new(slice: &'a mut [T]) -> Self {
        Self {
            ptr: slice.as_mut_ptr(),
            len: slice.len(),
            _marker: std::marker::PhantomData,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Mutable access to one slot.
    ///
    /// # Safety
    ///
    /// No two concurrently live references may target the same `index`; the
    /// usual pattern is that dispatch slot `i` touches index `i` only.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn slot_mut(&self, index: usize) -> &mut T {
        debug_assert!(index < self.len);
        &mut *self.ptr.add(index)
    }

    /// Shared access to one slot.
    ///
    /// # Safety
    ///
    /// No concurrently live mutable reference may target `index`.
    pub unsafe fn slot(&self, index: usize) -> &T {
        debug_assert!(index < self.len);
        &*self.ptr.add(index)
    }

    /// Mutable access to a contiguous range of slots.
    ///
    /// # Safety
    ///
    /// Concurrently live ranges must be disjoint; the usual pattern is that
    /// dispatch slot `i` owns the range `[i * stride, (i + 1) * stride)`.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn range_mut(&self, start: usize, len: usize) -> &mut [T] {
        debug_assert!(start + len <= self.len);
        std::slice::from_raw_parts_mut(self.ptr.add(start), len)
    }
}

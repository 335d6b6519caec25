//! Single-producer, multi-reader growable buffer.
//!
//! The loader appends one count per record at high frequency while the UI
//! takes snapshots. Appends never take the lock; only capacity growth does,
//! and growth happens once per chunk instead of once per element.
//!
//! # Handles
//!
//! [`GrowableBuffer::new`] returns a pair:
//! - [`Appender`]: the unique write handle (`!Clone`), owned by the producer
//! - [`GrowableBuffer`]: a cloneable read handle
//!
//! # Publication protocol
//!
//! 1. The appender writes slot `len` through the current base pointer
//! 2. The appender stores `len + 1` with `Release`
//! 3. Readers load `len` with `Acquire` and never touch slots at or past it
//!
//! Relocation (copy into a larger allocation, free the old one) is done while
//! holding `relocation`, the same mutex readers hold while copying, so a
//! reader never copies out of freed memory.

use crate::error::RecordError;
use parking_lot::Mutex;
use std::marker::PhantomData;
use std::mem::ManuallyDrop;
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

/// Default growth granularity in elements
pub const DEFAULT_CHUNK: usize = 512;

struct Inner<T> {
    /// Held across relocation and across every reader copy
    relocation: Mutex<()>,
    base: AtomicPtr<T>,
    capacity: AtomicUsize,
    len: AtomicUsize,
    chunk: usize,
    _marker: PhantomData<T>,
}

impl<T: Copy> Inner<T> {
    /// Copies the published prefix. Caller must hold `relocation`.
    fn copy_published(&self) -> Vec<T> {
        let len = self.len.load(Ordering::Acquire);
        let base = self.base.load(Ordering::Acquire);
        let mut out = Vec::with_capacity(len);
        // SAFETY: slots [0, len) were written before `len` was released, and
        // the allocation cannot be freed while `relocation` is held.
        unsafe {
            ptr::copy_nonoverlapping(base, out.as_mut_ptr(), len);
            out.set_len(len);
        }
        out
    }
}

impl<T> Drop for Inner<T> {
    fn drop(&mut self) {
        let base = *self.base.get_mut();
        let capacity = *self.capacity.get_mut();
        // SAFETY: base/capacity always describe a live Vec<T> allocation
        // produced by `allocate`; elements are Copy so length 0 is fine.
        unsafe { drop(Vec::from_raw_parts(base, 0, capacity)) };
    }
}

fn allocate<T>(capacity: usize) -> Result<(*mut T, usize), RecordError> {
    let mut vec: Vec<T> = Vec::new();
    vec.try_reserve_exact(capacity)?;
    let mut vec = ManuallyDrop::new(vec);
    Ok((vec.as_mut_ptr(), vec.capacity()))
}

/// Read handle over a buffer filled by a single [`Appender`]
pub struct GrowableBuffer<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for GrowableBuffer<T> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<T> std::fmt::Debug for GrowableBuffer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GrowableBuffer")
            .field("len", &self.inner.len.load(Ordering::Relaxed))
            .field("capacity", &self.inner.capacity.load(Ordering::Relaxed))
            .field("chunk", &self.inner.chunk)
            .finish()
    }
}

impl<T: Copy + Send + Sync> GrowableBuffer<T> {
    /// Creates an empty buffer growing in steps of `chunk` elements
    ///
    /// A `chunk` of zero is treated as one.
    pub fn new(chunk: usize) -> (Appender<T>, GrowableBuffer<T>) {
        let mut empty = ManuallyDrop::new(Vec::<T>::new());
        let inner = Arc::new(Inner {
            relocation: Mutex::new(()),
            base: AtomicPtr::new(empty.as_mut_ptr()),
            capacity: AtomicUsize::new(empty.capacity()),
            len: AtomicUsize::new(0),
            chunk: chunk.max(1),
            _marker: PhantomData,
        });
        let reader = GrowableBuffer { inner: Arc::clone(&inner) };
        (Appender { inner }, reader)
    }

    /// Number of published elements (lock-free)
    pub fn len(&self) -> usize {
        self.inner.len.load(Ordering::Acquire)
    }

    /// Returns true if nothing has been published yet
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Currently reserved capacity
    pub fn capacity(&self) -> usize {
        self.inner.capacity.load(Ordering::Acquire)
    }

    /// Owned copy of the published contents
    ///
    /// May miss an append that races with the call; counts only grow, so a
    /// later snapshot catches up.
    pub fn snapshot(&self) -> Vec<T> {
        let _guard = self.inner.relocation.lock();
        self.inner.copy_published()
    }

    /// Reads one published element
    pub fn get(&self, index: usize) -> Option<T> {
        let _guard = self.inner.relocation.lock();
        if index >= self.inner.len.load(Ordering::Acquire) {
            return None;
        }
        let base = self.inner.base.load(Ordering::Acquire);
        // SAFETY: index is below the published length and the allocation is
        // pinned by the guard.
        Some(unsafe { base.add(index).read() })
    }
}

/// Unique write handle of a [`GrowableBuffer`]
///
/// Not `Clone`: there is exactly one producer per buffer.
pub struct Appender<T> {
    inner: Arc<Inner<T>>,
}

impl<T: Copy + Send + Sync> Appender<T> {
    /// Returns a new read handle onto the same buffer
    pub fn reader(&self) -> GrowableBuffer<T> {
        GrowableBuffer { inner: Arc::clone(&self.inner) }
    }

    /// Number of elements appended so far
    pub fn len(&self) -> usize {
        self.inner.len.load(Ordering::Relaxed)
    }

    /// Returns true if nothing has been appended
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Grows capacity to at least `n`, rounded up to the chunk size
    ///
    /// # Errors
    ///
    /// Returns [`RecordError::Allocation`] if the larger allocation fails.
    /// The buffer is left untouched in that case.
    pub fn reserve(&mut self, n: usize) -> Result<(), RecordError> {
        let inner = &*self.inner;
        let capacity = inner.capacity.load(Ordering::Relaxed);
        if capacity >= n {
            return Ok(());
        }
        let target = n.div_ceil(inner.chunk).saturating_mul(inner.chunk);
        let (new_base, new_capacity) = allocate::<T>(target)?;

        let _guard = inner.relocation.lock();
        let len = inner.len.load(Ordering::Relaxed);
        let old_base = inner.base.load(Ordering::Relaxed);
        // SAFETY: only the appender writes; [0, len) is initialized in the old
        // allocation and the new one holds at least `target >= n > len` slots.
        unsafe {
            ptr::copy_nonoverlapping(old_base, new_base, len);
            drop(Vec::from_raw_parts(old_base, 0, capacity));
        }
        inner.base.store(new_base, Ordering::Release);
        inner.capacity.store(new_capacity, Ordering::Release);
        tracing::debug!(from = capacity, to = new_capacity, "buffer relocated");
        Ok(())
    }

    /// Appends one element
    ///
    /// # Errors
    ///
    /// Returns [`RecordError::Allocation`] if growing the buffer fails.
    pub fn push(&mut self, value: T) -> Result<(), RecordError> {
        let len = self.inner.len.load(Ordering::Relaxed);
        if len >= self.inner.capacity.load(Ordering::Relaxed) {
            self.reserve(len + 1)?;
        }

        let base = self.inner.base.load(Ordering::Relaxed);
        // SAFETY: len < capacity, slot `len` is unpublished so no reader
        // touches it, and only this handle relocates.
        unsafe { base.add(len).write(value) };
        debug_assert_eq!(
            base,
            self.inner.base.load(Ordering::Relaxed),
            "push must never relocate"
        );

        self.inner.len.store(len + 1, Ordering::Release);
        Ok(())
    }
}

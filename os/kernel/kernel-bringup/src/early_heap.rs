//! # Early Heap
//!
//! The loader allocates little: program-header lists, the MADT records and
//! the open-mapping stack of the temporary window. A bump allocator over a
//! static arena covers that. Freeing the most recent allocation rolls the
//! bump pointer back, which is enough for the push/pop pattern of the
//! temporary window; anything else is leaked until the kernel takes over.
//!
//! ## Constraints
//! - Single core, interrupts off. The lock only guards against reentrancy.
//! - The arena does not grow.

use core::alloc::{GlobalAlloc, Layout};
use core::cell::UnsafeCell;
use core::ptr::null_mut;
use core::sync::atomic::{AtomicBool, Ordering};

/// A spinlock for the few instructions of a bump.
struct SpinLock<T> {
    locked: AtomicBool,
    inner: UnsafeCell<T>,
}

// Safety: access to `inner` is serialised by `locked`.
unsafe impl<T: Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    const fn new(inner: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            inner: UnsafeCell::new(inner),
        }
    }

    fn with_lock<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        while self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            core::hint::spin_loop();
        }
        let res = f(unsafe { &mut *self.inner.get() });
        self.locked.store(false, Ordering::Release);
        res
    }
}

#[derive(Debug)]
struct Bump {
    /// Offset of the first free byte.
    next: usize,
    /// Live allocations, for the report.
    live: usize,
}

#[repr(C, align(16))]
struct Arena<const N: usize>(UnsafeCell<[u8; N]>);

/// Bump allocator over an inline arena of `N` bytes.
pub struct EarlyHeap<const N: usize> {
    arena: Arena<N>,
    state: SpinLock<Bump>,
}

// Safety: the arena is only handed out in disjoint pieces under the lock.
unsafe impl<const N: usize> Sync for EarlyHeap<N> {}

impl<const N: usize> EarlyHeap<N> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            arena: Arena(UnsafeCell::new([0; N])),
            state: SpinLock::new(Bump { next: 0, live: 0 }),
        }
    }

    /// Bytes handed out and not rolled back.
    #[must_use]
    pub fn used(&self) -> usize {
        self.state.with_lock(|b| b.next)
    }

    /// Allocations not yet freed.
    #[must_use]
    pub fn live(&self) -> usize {
        self.state.with_lock(|b| b.live)
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        N
    }

    const fn base(&self) -> *mut u8 {
        self.arena.0.get().cast()
    }
}

impl<const N: usize> Default for EarlyHeap<N> {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl<const N: usize> GlobalAlloc for EarlyHeap<N> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let base = self.base();
        self.state.with_lock(|b| {
            let Some(start) = (base.addr() + b.next).checked_next_multiple_of(layout.align())
            else {
                return null_mut();
            };
            let offset = start - base.addr();
            let Some(end) = offset.checked_add(layout.size()) else {
                return null_mut();
            };
            if end > N {
                return null_mut();
            }
            b.next = end;
            b.live += 1;
            base.wrapping_add(offset)
        })
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        let offset = ptr.addr() - self.base().addr();
        self.state.with_lock(|b| {
            b.live = b.live.saturating_sub(1);
            if offset + layout.size() == b.next {
                b.next = offset;
            }
            if b.live == 0 {
                b.next = 0;
            }
        });
    }
}

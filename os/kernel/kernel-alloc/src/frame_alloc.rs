//! # Bitmap Physical Frame Allocator
//!
//! One bit per 4 KiB frame, packed into `u32` words, bit `i % 32` of word
//! `i / 32` describing frame `i`. A set bit means the frame is unavailable.
//!
//! The allocator never owns its storage. The loader places the words in its
//! reserved (identity-mapped) area, so the same bitmap works before and after
//! paging; the kernel re-attaches to it with
//! [`BitmapFrameAlloc::from_bounds`].

use kernel_info::setup::BitmapBounds;
use kernel_memory_addresses::{PageSize, PhysicalAddress, PhysicalPage, Size4K};
use kernel_vmem::FrameAlloc;
use log::warn;

const BITS: u32 = u32::BITS;

/// Frames addressable with 32-bit physical addresses.
pub const MAX_FRAMES: u32 = 1 << (32 - Size4K::SHIFT);

#[derive(Debug, Clone, Copy, Eq, PartialEq, thiserror::Error)]
pub enum FrameAllocError {
    #[error("frames {first:#x}+{count} outside the bitmap ({frames} frames)")]
    OutOfRange { first: u32, count: u32, frames: u32 },
    #[error("no run of {requested} free frames")]
    OutOfMemory { requested: u32 },
    #[error("bitmap storage holds {available} words, {needed} needed")]
    StorageTooSmall { needed: usize, available: usize },
    #[error("zero-frame request")]
    EmptyRequest,
}

/// First-fit physical frame allocator over a borrowed bitmap.
pub struct BitmapFrameAlloc<'a> {
    words: &'a mut [u32],
    frames: u32,
    free: u32,
    /// Every frame below `hint` is known to be used.
    hint: u32,
}

impl<'a> BitmapFrameAlloc<'a> {
    /// Words of storage needed to track every frame below `max_address`.
    #[must_use]
    pub const fn words_for(max_address: u64) -> usize {
        Self::words_for_frames(Self::frames_below(max_address))
    }

    /// Frames needed to cover `[0, max_address)`, capped at 4 GiB.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn frames_below(max_address: u64) -> u32 {
        let frames = max_address.div_ceil(Size4K::SIZE as u64);
        if frames > MAX_FRAMES as u64 {
            MAX_FRAMES
        } else {
            frames as u32
        }
    }

    #[must_use]
    pub const fn words_for_frames(frames: u32) -> usize {
        frames.div_ceil(BITS) as usize
    }

    /// Take over `storage` and mark all `frames` free.
    ///
    /// Bits past `frames` in the last word are set so they can never be
    /// handed out.
    ///
    /// # Errors
    /// [`FrameAllocError::StorageTooSmall`] if `storage` cannot hold `frames` bits.
    pub fn initialize(storage: &'a mut [u32], frames: u32) -> Result<Self, FrameAllocError> {
        let frames = frames.min(MAX_FRAMES);
        let needed = Self::words_for_frames(frames);
        if storage.len() < needed {
            return Err(FrameAllocError::StorageTooSmall {
                needed,
                available: storage.len(),
            });
        }

        let words = &mut storage[..needed];
        words.fill(0);
        let tail = frames % BITS;
        if tail != 0
            && let Some(last) = words.last_mut()
        {
            *last = !((1u32 << tail) - 1);
        }

        Ok(Self {
            words,
            frames,
            free: frames,
            hint: 0,
        })
    }

    /// Re-attach to a bitmap the loader handed over.
    ///
    /// # Safety
    /// `bounds.words` must point to `bounds.word_count` words that stay valid
    /// and unaliased for `'a`, and must describe a bitmap produced by
    /// [`initialize`](Self::initialize).
    #[must_use]
    pub unsafe fn from_bounds(bounds: BitmapBounds) -> Self {
        let words: &'a mut [u32] = if bounds.words.is_null() || bounds.word_count == 0 {
            &mut []
        } else {
            unsafe { core::slice::from_raw_parts_mut(bounds.words, bounds.word_count as usize) }
        };
        let frames = bounds.frame_count.min(BITS * bounds.word_count);
        let mut this = Self {
            words,
            frames,
            free: 0,
            hint: 0,
        };
        this.free = (0..frames).filter(|&f| !this.bit(f)).fold(0, |n, _| n + 1);
        this
    }

    /// Where the bitmap lives, for the setup-information record.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn bounds(&mut self) -> BitmapBounds {
        BitmapBounds {
            words: self.words.as_mut_ptr(),
            word_count: self.words.len() as u32,
            frame_count: self.frames,
        }
    }

    #[must_use]
    pub const fn frame_count(&self) -> u32 {
        self.frames
    }

    #[must_use]
    pub const fn free_frames(&self) -> u32 {
        self.free
    }

    #[must_use]
    pub const fn used_frames(&self) -> u32 {
        self.frames - self.free
    }

    /// `true` for used frames and for frames outside the bitmap.
    #[must_use]
    pub fn is_used(&self, page: PhysicalPage<Size4K>) -> bool {
        let frame = page.index();
        frame >= self.frames || self.bit(frame)
    }

    /// Mark `count` frames starting at `start` as unavailable.
    ///
    /// # Errors
    /// [`FrameAllocError::OutOfRange`] if the range leaves the bitmap. Nothing
    /// is changed in that case.
    pub fn mark_used(&mut self, start: PhysicalPage<Size4K>, count: u32) -> Result<(), FrameAllocError> {
        self.check_range(start.index(), count)?;
        self.set_range(start.index(), count, true);
        Ok(())
    }

    /// Mark `count` frames starting at `start` as available.
    ///
    /// # Errors
    /// [`FrameAllocError::OutOfRange`] if the range leaves the bitmap.
    pub fn mark_free(&mut self, start: PhysicalPage<Size4K>, count: u32) -> Result<(), FrameAllocError> {
        self.check_range(start.index(), count)?;
        self.set_range(start.index(), count, false);
        self.hint = self.hint.min(start.index());
        Ok(())
    }

    /// Return a run previously obtained from [`allocate`](Self::allocate).
    ///
    /// # Errors
    /// [`FrameAllocError::OutOfRange`] if the range leaves the bitmap.
    pub fn deallocate(&mut self, start: PhysicalPage<Size4K>, count: u32) -> Result<(), FrameAllocError> {
        self.mark_free(start, count)
    }

    /// The first run of `count` contiguous free frames, marked used.
    ///
    /// # Errors
    /// [`FrameAllocError::OutOfMemory`] if no such run exists.
    pub fn allocate(&mut self, count: u32) -> Result<PhysicalPage<Size4K>, FrameAllocError> {
        self.allocate_in(count, self.frames)
    }

    /// Like [`allocate`](Self::allocate), but the whole run must end at or
    /// below `limit`.
    ///
    /// # Errors
    /// [`FrameAllocError::OutOfMemory`] if no such run exists below `limit`.
    pub fn allocate_below(
        &mut self,
        count: u32,
        limit: PhysicalAddress,
    ) -> Result<PhysicalPage<Size4K>, FrameAllocError> {
        let limit = (limit.as_u32() >> Size4K::SHIFT).min(self.frames);
        self.allocate_in(count, limit)
    }

    fn allocate_in(&mut self, count: u32, limit: u32) -> Result<PhysicalPage<Size4K>, FrameAllocError> {
        if count == 0 {
            return Err(FrameAllocError::EmptyRequest);
        }

        let mut first_free = None;
        let mut run_start = self.hint;
        let mut run_len = 0;
        let mut frame = self.hint;
        while frame < limit {
            // Skip fully used words while not inside a run.
            if run_len == 0 && frame % BITS == 0 && self.words[(frame / BITS) as usize] == u32::MAX {
                frame += BITS;
                continue;
            }

            if self.bit(frame) {
                run_len = 0;
            } else {
                if run_len == 0 {
                    run_start = frame;
                    first_free.get_or_insert(frame);
                }
                run_len += 1;
                if run_len == count {
                    self.set_range(run_start, count, true);
                    self.hint = match first_free {
                        Some(f) if f < run_start => f,
                        _ => run_start + count,
                    };
                    return Ok(PhysicalPage::from_index(run_start));
                }
            }
            frame += 1;
        }

        if limit == self.frames {
            self.hint = first_free.unwrap_or(self.frames);
        }
        Err(FrameAllocError::OutOfMemory { requested: count })
    }

    const fn check_range(&self, first: u32, count: u32) -> Result<(), FrameAllocError> {
        match first.checked_add(count) {
            Some(end) if end <= self.frames => Ok(()),
            _ => Err(FrameAllocError::OutOfRange {
                first,
                count,
                frames: self.frames,
            }),
        }
    }

    #[inline]
    fn bit(&self, frame: u32) -> bool {
        self.words[(frame / BITS) as usize] & (1 << (frame % BITS)) != 0
    }

    /// Set or clear `count` bits starting at `first`, keeping `free` exact.
    fn set_range(&mut self, first: u32, count: u32, used: bool) {
        let mut frame = first;
        let end = first + count;
        while frame < end {
            let word = (frame / BITS) as usize;
            let bit = frame % BITS;
            let span = (BITS - bit).min(end - frame);
            let mask = if span == BITS { u32::MAX } else { ((1u32 << span) - 1) << bit };

            let before = self.words[word];
            let after = if used { before | mask } else { before & !mask };
            let changed = (before ^ after).count_ones();
            if used {
                self.free -= changed;
            } else {
                self.free += changed;
            }
            self.words[word] = after;
            frame += span;
        }
    }
}

impl FrameAlloc for BitmapFrameAlloc<'_> {
    fn alloc_4k(&mut self) -> Option<PhysicalPage<Size4K>> {
        self.allocate(1).ok()
    }

    fn free_4k(&mut self, page: PhysicalPage<Size4K>) {
        if let Err(e) = self.deallocate(page, 1) {
            warn!("dropping frame {page}: {e}");
        }
    }
}

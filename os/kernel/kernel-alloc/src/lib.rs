//! # Physical Memory Accounting
//!
//! Everything the loader needs to know about which physical frames are
//! free, before there is a heap or paging.
//!
//! ```text
//! bootloader regions + modules
//!             │
//!             ▼
//! ┌─────────────────────────────┐
//! │   Memory-Map Interpreter    │  memory_map::MemoryMap::load
//! │ clip, free usable, reserve  │
//! └──────────────┬──────────────┘
//!                ▼
//! ┌─────────────────────────────┐
//! │  Physical Page Allocator    │  frame_alloc::BitmapFrameAlloc
//! │  one bit per 4 KiB frame    │
//! └─────────────────────────────┘
//! ```
//!
//! ## Components
//!
//! ### Physical Page Allocator ([`frame_alloc`])
//! * One bit per frame; a set bit means *unavailable* (reserved, module,
//!   or handed out).
//! * First-fit contiguous runs with a search hint.
//! * Storage is borrowed, not owned: the loader reserves it statically and
//!   the kernel re-attaches to it through
//!   [`BitmapBounds`](kernel_info::setup::BitmapBounds).
//!
//! ### Memory-Map Interpreter ([`memory_map`])
//! Feeds the bootloader's region list into the bitmap. Regions may arrive
//! unsorted and overlapping; reserved ranges always win over usable ones and
//! module ranges are never freed.
//!
//! ### Static Pool ([`static_pool`])
//! A bump allocator over a window of the loader's own image, used for the
//! first page directory and identity-map tables before the bitmap exists.
//!
//! ### Identity Mapper ([`phys_mapper`])
//! [`PhysMapper`](kernel_vmem::PhysMapper) for code running unpaged or inside the
//! identity-mapped reserved area.
//!
//! No operation in this crate is thread-safe; bring-up is single-threaded.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod frame_alloc;
pub mod memory_map;
pub mod phys_mapper;
pub mod static_pool;

pub use frame_alloc::{BitmapFrameAlloc, FrameAllocError};
pub use memory_map::{MemoryMap, MemoryMapError, MemoryMapSummary};
pub use static_pool::StaticFrameAlloc;

//! # Paging Bootstrapper
//!
//! A linear state machine, one type per state:
//!
//! ```text
//! Bootstrap<Unpaged> ──load_memory_map──► Bootstrap<Relocating> ──enable_paging──► Bootstrap<Mapped>
//!  directory from the                      bitmap live, modules                     recursive slot,
//!  static pool, identity                   moved out of the kernel's                CR4.PGE, CR3, CR0.PG
//!  map of [0, reserved)                    way and identity mapped
//! ```
//!
//! Before [`Mapped`] every table edit goes through the physical address of
//! the table; afterwards only through the recursive slot.

use crate::error::BootError;
use kernel_alloc::{BitmapFrameAlloc, MemoryMap, StaticFrameAlloc};
use kernel_info::boot::ModuleDescriptor;
use kernel_info::memory::{KERNEL_BASE, LEGACY_AREA_END, PhysicalRange};
use kernel_info::setup::{PlatformInfo, SetupInformation};
use kernel_memory_addresses::{PageSize, PhysicalAddress, PhysicalPage, Size4K, VirtualAddress, VirtualPage};
use kernel_vmem::{
    AddressSpace, FrameAlloc, MapError, PageDirectory, PageEntryBits, PagingControl, PhysMapper,
    PhysicalWindow, RecursiveAddressSpace, RecursiveWindow, TableWindow, VirtualAccess,
};
use log::{debug, info, warn};

/// Where the loader sits in physical memory.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct LoaderLayout {
    reserved_area_end: PhysicalAddress,
    page_pool: PhysicalRange,
}

impl LoaderLayout {
    /// `reserved_area_end` covers the legacy area plus the loader's code,
    /// data, bitmap and stack. `page_pool` is the part of that image set
    /// aside for the first page directory and tables.
    ///
    /// # Errors
    /// - [`BootError::ReservedArea`] if the end is below 1 MiB or unaligned.
    /// - [`BootError::PagePool`] if the pool leaves the reserved area.
    pub fn new(reserved_area_end: PhysicalAddress, page_pool: PhysicalRange) -> Result<Self, BootError> {
        if reserved_area_end.as_u32() < LEGACY_AREA_END || !reserved_area_end.is_aligned::<Size4K>() {
            return Err(BootError::ReservedArea(reserved_area_end));
        }
        if page_pool.is_empty() || page_pool.end > reserved_area_end {
            return Err(BootError::PagePool {
                start: page_pool.start,
                end: page_pool.end,
            });
        }
        Ok(Self {
            reserved_area_end,
            page_pool,
        })
    }

    #[must_use]
    pub const fn reserved_area_end(&self) -> PhysicalAddress {
        self.reserved_area_end
    }

    #[must_use]
    pub const fn page_pool(&self) -> PhysicalRange {
        self.page_pool
    }

    /// `[0, reserved_area_end)`
    #[must_use]
    pub const fn reserved_area(&self) -> PhysicalRange {
        PhysicalRange::new(PhysicalAddress::zero(), self.reserved_area_end)
    }
}

/// Paging is off; only the static pool hands out frames.
pub struct Unpaged {
    pool: StaticFrameAlloc,
}

/// The bitmap tracks physical memory; modules may still move.
pub struct Relocating<'a> {
    frames: BitmapFrameAlloc<'a>,
}

/// Paging is on and the directory is edited through itself.
pub struct Mapped<'a, V: VirtualAccess> {
    pub(crate) frames: BitmapFrameAlloc<'a>,
    pub(crate) space: RecursiveAddressSpace<V>,
    /// Pages of the MMIO window handed out so far.
    pub(crate) mmio_used: u32,
    pub(crate) platform: PlatformInfo,
}

/// The loader's bring-up context in state `S`.
pub struct Bootstrap<'m, M: PhysMapper, S> {
    mapper: &'m M,
    layout: LoaderLayout,
    directory: PhysicalPage<Size4K>,
    state: S,
}

impl<'m, M: PhysMapper, S> Bootstrap<'m, M, S> {
    /// Physical frame of the page directory.
    #[inline]
    #[must_use]
    pub const fn directory(&self) -> PhysicalPage<Size4K> {
        self.directory
    }

    #[inline]
    #[must_use]
    pub const fn layout(&self) -> &LoaderLayout {
        &self.layout
    }

    pub(crate) const fn state_mut(&mut self) -> &mut S {
        &mut self.state
    }

    fn physical_space(&self) -> AddressSpace<PhysicalWindow<'m, M>> {
        AddressSpace::new(PhysicalWindow::new(self.mapper, self.directory))
    }
}

impl<'m, M: PhysMapper> Bootstrap<'m, M, Unpaged> {
    /// Build the first directory and identity-map `[0, reserved_area_end)`
    /// read-write, supervisor only. Every frame comes from the static pool.
    ///
    /// # Errors
    /// [`BootError::IdentityMap`] if the pool runs dry.
    pub fn new(mapper: &'m M, layout: LoaderLayout) -> Result<Self, BootError> {
        let mut pool = StaticFrameAlloc::new(layout.page_pool);
        let directory = pool
            .alloc_4k()
            .ok_or(BootError::IdentityMap(MapError::OutOfFrames))?;
        unsafe { mapper.phys_to_mut::<PageDirectory>(directory.base()) }.zero();

        let mut this = Self {
            mapper,
            layout,
            directory,
            state: Unpaged { pool },
        };
        let pages = this
            .physical_space()
            .identity_map_range(
                &mut this.state.pool,
                layout.reserved_area(),
                PageEntryBits::kernel_table(),
                PageEntryBits::kernel_rw(),
            )
            .map_err(BootError::IdentityMap)?;

        let used = this.state.pool.consumed();
        info!(
            "directory at {}, identity mapped {pages} pages up to {}, {} pool frames used",
            directory,
            layout.reserved_area_end,
            used.page_span()
        );
        Ok(this)
    }

    /// Size the bitmap after the map, place it in `storage` and feed the map
    /// into it. Everything below `reserved_area_end` stays used.
    ///
    /// # Errors
    /// [`BootError::Bitmap`] if `storage` is too small,
    /// [`BootError::MemoryMap`] if no usable memory remains.
    pub fn load_memory_map<'a>(
        self,
        storage: &'a mut [u32],
        map: &MemoryMap<'_>,
    ) -> Result<Bootstrap<'m, M, Relocating<'a>>, BootError> {
        let mut frames = BitmapFrameAlloc::initialize(storage, map.frames_to_track())?;
        let summary = map.load(&mut frames, self.layout.reserved_area_end)?;
        info!(
            "{} frames free, {} used, {} held by modules",
            summary.free_frames, summary.used_frames, summary.module_frames
        );
        debug!(
            "{} static pool frames left unused",
            self.state.pool.remaining()
        );
        Ok(Bootstrap {
            mapper: self.mapper,
            layout: self.layout,
            directory: self.directory,
            state: Relocating { frames },
        })
    }
}

impl<'m, 'a, M: PhysMapper> Bootstrap<'m, M, Relocating<'a>> {
    #[must_use]
    pub const fn frames(&self) -> &BitmapFrameAlloc<'a> {
        &self.state.frames
    }

    /// Reserve the kernel's physical extent and move every module that is in
    /// its way, or that would sit under the kernel half once identity mapped.
    ///
    /// Moved modules land on fresh frames below [`KERNEL_BASE`]; their
    /// descriptors are rewritten and the frames they vacate are freed unless
    /// the kernel, another module or the reserved area still claims them.
    ///
    /// Returns the number of modules moved.
    ///
    /// # Errors
    /// - [`BootError::KernelPlacement`] if the extent reaches into the
    ///   reserved area, or names a frame that is neither free nor held by a
    ///   module.
    /// - [`BootError::Relocation`] if there is no room for a module.
    pub fn relocate_modules(
        &mut self,
        modules: &mut [ModuleDescriptor],
        kernel_extent: Option<PhysicalRange>,
    ) -> Result<u32, BootError> {
        if let Some(extent) = kernel_extent.filter(|e| !e.is_empty()) {
            self.check_kernel_placement(extent, modules)?;
            self.state
                .frames
                .mark_used(extent.first_page(), extent.page_span())?;
            debug!(
                "kernel frames {}..{} reserved",
                extent.start, extent.end
            );
        }

        let mut moved = 0;
        for i in 0..modules.len() {
            let old = modules[i].range();
            if old.is_empty() || !needs_relocation(old, kernel_extent) {
                continue;
            }

            let pages = old.page_span();
            let target = self
                .state
                .frames
                .allocate_below(pages, PhysicalAddress::new(KERNEL_BASE))
                .map_err(|source| BootError::Relocation {
                    start: old.start.as_u32(),
                    source,
                })?;
            unsafe { self.mapper.copy(target.base(), old.start, old.len()) };
            modules[i].relocate(target.base());
            info!(
                "module {} moved {}..{} -> {}..{:#010x}",
                modules[i].path(),
                old.start,
                old.end,
                target.base(),
                modules[i].end
            );
            moved += 1;

            for n in 0..pages {
                let page = PhysicalPage::<Size4K>::from_index(old.first_page().index() + n);
                let frame = PhysicalRange::new(page.base(), page.base() + Size4K::SIZE);
                let claimed = page.base() < self.layout.reserved_area_end
                    || kernel_extent.is_some_and(|e| e.overlaps(&frame))
                    || modules.iter().any(|m| m.range().overlaps(&frame));
                if !claimed {
                    self.state.frames.deallocate(page, 1)?;
                }
            }
        }
        Ok(moved)
    }

    /// The kernel may only claim frames that are free RAM right now, or that
    /// a module holds and is about to give up.
    fn check_kernel_placement(
        &self,
        extent: PhysicalRange,
        modules: &[ModuleDescriptor],
    ) -> Result<(), BootError> {
        let rejected = BootError::KernelPlacement {
            start: extent.start,
            end: extent.end,
        };
        if extent.start < self.layout.reserved_area_end {
            return Err(rejected);
        }
        let first = extent.first_page().index();
        for n in 0..extent.page_span() {
            let page = PhysicalPage::<Size4K>::from_index(first + n);
            let frame = PhysicalRange::new(page.base(), page.base() + Size4K::SIZE);
            if self.state.frames.is_used(page) && !modules.iter().any(|m| m.range().overlaps(&frame)) {
                warn!("kernel frame {} is not free RAM", page.base());
                return Err(rejected);
            }
        }
        Ok(())
    }

    /// Identity-map the modules, install the recursive slot and switch
    /// paging on through `cpu`.
    ///
    /// Module pages inside the reserved area keep their read-write mapping;
    /// the rest are mapped read-only.
    ///
    /// # Errors
    /// [`BootError::ModuleMapping`] if a page table cannot be allocated or a
    /// module collides with an existing mapping.
    pub fn enable_paging<C>(
        self,
        modules: &[ModuleDescriptor],
        cpu: C,
    ) -> Result<Bootstrap<'m, M, Mapped<'a, C>>, BootError>
    where
        C: PagingControl + VirtualAccess,
    {
        let reserved_end = self.layout.reserved_area_end;
        let mut space = self.physical_space();
        let Self {
            mapper,
            layout,
            directory,
            state: Relocating { mut frames },
        } = self;
        for module in modules {
            let range = module.range();
            if range.end <= reserved_end {
                continue;
            }
            let range = PhysicalRange::new(range.start.max(reserved_end), range.end);
            space
                .identity_map_range(
                    &mut frames,
                    range,
                    PageEntryBits::kernel_table(),
                    PageEntryBits::kernel_ro(),
                )
                .map_err(|source| BootError::ModuleMapping {
                    start: module.start,
                    source,
                })?;
        }

        let mut window = space.into_window();
        window.directory().install_recursive_slot(directory);

        unsafe {
            cpu.enable_global_pages();
            cpu.load_directory(directory);
            cpu.enable_paging();
        }
        info!("paging enabled, directory {directory}");

        Ok(Bootstrap {
            mapper,
            layout,
            directory,
            state: Mapped {
                frames,
                space: AddressSpace::new(RecursiveWindow::new(cpu)),
                mmio_used: 0,
                platform: PlatformInfo::empty(),
            },
        })
    }
}

/// A module must move if the kernel will occupy its frames, or if its
/// identity map would reach into the kernel half.
fn needs_relocation(module: PhysicalRange, kernel_extent: Option<PhysicalRange>) -> bool {
    kernel_extent.is_some_and(|e| e.overlaps(&module)) || module.end.as_u32() > KERNEL_BASE
}

impl<'a, M: PhysMapper, V: VirtualAccess> Bootstrap<'_, M, Mapped<'a, V>> {
    /// Map `virtual_address -> physical` in the live directory, taking any
    /// page table from the bitmap.
    ///
    /// # Errors
    /// See [`AddressSpace::map_page_to_recursive_directory`].
    pub fn map_page_to_recursive_directory(
        &mut self,
        virtual_address: VirtualAddress,
        physical: PhysicalAddress,
        table_flags: PageEntryBits,
        page_flags: PageEntryBits,
    ) -> Result<(), MapError> {
        let Mapped { frames, space, .. } = &mut self.state;
        space.map_page_to_recursive_directory(frames, virtual_address, physical, table_flags, page_flags)
    }

    /// # Errors
    /// [`MapError::NotMapped`] if nothing is mapped at `page`.
    pub fn unmap_page(&mut self, page: VirtualPage<Size4K>) -> Result<PhysicalPage<Size4K>, MapError> {
        self.state.space.unmap_page(page)
    }

    pub fn translate(&mut self, va: VirtualAddress) -> Option<PhysicalAddress> {
        self.state.space.translate(va)
    }

    pub fn leaf_flags(&mut self, va: VirtualAddress) -> Option<PageEntryBits> {
        self.state.space.leaf_flags(va)
    }

    #[must_use]
    pub const fn frames(&self) -> &BitmapFrameAlloc<'a> {
        &self.state.frames
    }

    /// The bitmap and the live address space, borrowed together so mapping
    /// helpers can allocate page tables while editing the directory.
    pub const fn parts(&mut self) -> (&mut BitmapFrameAlloc<'a>, &mut RecursiveAddressSpace<V>) {
        (&mut self.state.frames, &mut self.state.space)
    }

    /// Firmware tables and interrupt controllers recorded so far.
    #[must_use]
    pub const fn platform(&self) -> &PlatformInfo {
        &self.state.platform
    }

    pub const fn platform_mut(&mut self) -> &mut PlatformInfo {
        &mut self.state.platform
    }

    /// The record handed to the kernel entry point.
    pub fn setup_information(&mut self, modules: &[ModuleDescriptor]) -> SetupInformation {
        let bounds = self.state.frames.bounds();
        let mut platform = self.state.platform;
        platform.mmio_window_pages = self.state.mmio_used;
        let setup = SetupInformation::new(
            self.directory.base(),
            self.layout.reserved_area_end,
            bounds,
            platform,
            modules,
        );
        trace_setup(&setup, modules);
        setup
    }
}

fn trace_setup(setup: &SetupInformation, modules: &[ModuleDescriptor]) {
    info!(
        "setup: directory {}, reserved to {}, bitmap {:p} ({} words, {} frames), {} module(s)",
        setup.page_directory,
        setup.reserved_area_end,
        setup.bitmap.words,
        setup.bitmap.word_count,
        setup.bitmap.frame_count,
        setup.module_count()
    );
    let platform = &setup.platform;
    if platform.has_local_apic() {
        info!(
            "setup: APIC {} with timer vector {:#x}, {} IO-APIC(s), {} MMIO page(s), {} ACPI table(s)",
            platform.boot_apic_id,
            platform.timer_vector,
            platform.io_apics().len(),
            platform.mmio_window_pages,
            platform.tables().len()
        );
    }
    for module in modules {
        debug!("  {module:?}");
    }
    if modules.is_empty() {
        warn!("no modules handed to the kernel");
    }
}

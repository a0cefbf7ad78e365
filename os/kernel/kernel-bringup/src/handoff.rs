//! # Kernel Handoff
//!
//! The kernel is an ELF32 module linked at [`KERNEL_BASE`] whose segments
//! name the physical frames they expect to occupy. The loader reserves those
//! frames, moves any module out of the way, then maps and fills every
//! segment through the live recursive directory. Kernel pages are global so
//! they survive every later CR3 switch.

use crate::bootstrap::{Bootstrap, Mapped};
use crate::error::{BootError, HandoffError};
use alloc::vec::Vec;
use kernel_alloc::BitmapFrameAlloc;
use kernel_elf::{
    ElfImage, ModuleBytes, ProcessSpawner, ProgramHeader, SecurityLevel, SpawnError, TlsMaster,
    spawn_from_module,
};
use kernel_info::boot::{KernelEntryFn, ModuleDescriptor};
use kernel_info::memory::{KERNEL_BASE, PhysicalRange};
use kernel_info::setup::SetupInformation;
use kernel_memory_addresses::{PageSize, PhysicalPage, Size4K, VirtualAddress, VirtualPage};
use kernel_vmem::{PageEntryBits, PhysMapper, RecursiveAddressSpace, VirtualAccess};
use log::{debug, info, warn};

/// File name of the module that holds the kernel.
pub const KERNEL_MODULE_NAME: &str = "kernel";

/// Index of the kernel module, matched on the last path component.
#[must_use]
pub fn find_kernel(modules: &[ModuleDescriptor]) -> Option<usize> {
    modules
        .iter()
        .position(|m| m.path().rsplit('/').next() == Some(KERNEL_MODULE_NAME))
}

/// Physical frames the kernel's loadable segments occupy.
///
/// # Errors
/// - [`BootError::Kernel`] if the module bytes are unreachable.
/// - [`BootError::KernelImage`] if the module is not a valid image.
/// - [`BootError::KernelEmpty`] if it has nothing to load.
pub fn kernel_extent<B: ModuleBytes + ?Sized>(
    modules: &B,
    descriptor: &ModuleDescriptor,
) -> Result<PhysicalRange, BootError> {
    let bytes = modules
        .module_bytes(descriptor)
        .ok_or(BootError::Kernel(SpawnError::ModuleUnavailable(descriptor.start)))?;
    let extent = ElfImage::parse(bytes)?
        .physical_extent()
        .ok_or(BootError::KernelEmpty)?;
    debug!("kernel wants frames {}..{}", extent.start, extent.end);
    Ok(extent)
}

/// The loaded kernel, ready to be entered.
#[derive(Debug)]
pub struct KernelImage {
    pub entry: VirtualAddress,
    pub tls: Option<TlsMaster>,
}

impl KernelImage {
    /// Jump to the kernel entry point.
    ///
    /// # Safety
    /// The image must be mapped in the active directory and `setup` must stay
    /// valid for as long as the kernel reads it.
    pub unsafe fn enter(&self, setup: &SetupInformation) -> ! {
        let entry =
            unsafe { core::mem::transmute::<usize, KernelEntryFn>(self.entry.as_usize()) };
        info!("entering kernel at {}", self.entry);
        entry(core::ptr::from_ref(setup))
    }
}

/// Pages mapped for the kernel, so a failed load can take them back.
#[derive(Debug, Default)]
pub struct KernelMappings {
    pages: Vec<VirtualPage<Size4K>>,
}

impl KernelMappings {
    #[must_use]
    pub fn pages(&self) -> &[VirtualPage<Size4K>] {
        &self.pages
    }
}

/// Places kernel segments at the physical frames their headers name, in the
/// live address space.
pub struct KernelSpawner<'s, 'a, V: VirtualAccess> {
    frames: &'s mut BitmapFrameAlloc<'a>,
    space: &'s mut RecursiveAddressSpace<V>,
    segments: Vec<ProgramHeader>,
}

impl<'s, 'a, V: VirtualAccess> KernelSpawner<'s, 'a, V> {
    pub const fn new(
        frames: &'s mut BitmapFrameAlloc<'a>,
        space: &'s mut RecursiveAddressSpace<V>,
        segments: Vec<ProgramHeader>,
    ) -> Self {
        Self {
            frames,
            space,
            segments,
        }
    }

    /// The frame backing `page`, taken from the first segment covering it.
    fn frame_for(&self, page: VirtualPage<Size4K>) -> Result<PhysicalPage<Size4K>, HandoffError> {
        let ph = self
            .segments
            .iter()
            .find(|ph| ph.covers(page))
            .ok_or(HandoffError::Unbacked(page.base()))?;
        if ph.p_vaddr.as_u32() % Size4K::SIZE != ph.p_paddr.as_u32() % Size4K::SIZE {
            return Err(HandoffError::Misaligned {
                vaddr: ph.p_vaddr,
                paddr: ph.p_paddr,
            });
        }
        let delta = page.base().as_u32() - ph.p_vaddr.align_down::<Size4K>().as_u32();
        Ok(PhysicalPage::containing_address(
            ph.p_paddr.align_down::<Size4K>() + delta,
        ))
    }

    /// Run `f` over each page-sized piece of `[va, va + len)`, as a mutable
    /// slice of the mapped memory.
    fn for_each_chunk(
        &mut self,
        va: VirtualAddress,
        len: u32,
        mut f: impl FnMut(&mut [u8], usize),
    ) -> Result<(), HandoffError> {
        let mut done = 0;
        while done < len {
            let at = va + done;
            let in_page = Size4K::SIZE - at.as_u32() % Size4K::SIZE;
            let n = in_page.min(len - done);
            if self.space.translate(at).is_none() {
                return Err(HandoffError::NotMapped(at));
            }
            let chunk = unsafe {
                let ptr = self.space.window().access().virt_to_mut::<u8>(at);
                core::slice::from_raw_parts_mut(core::ptr::from_mut(ptr), n as usize)
            };
            f(chunk, done as usize);
            done += n;
        }
        Ok(())
    }
}

impl<V: VirtualAccess> ProcessSpawner for KernelSpawner<'_, '_, V> {
    type AddressSpace = KernelMappings;
    type Thread = KernelImage;
    type Error = HandoffError;

    fn create_address_space(&mut self, level: SecurityLevel) -> Result<KernelMappings, HandoffError> {
        match level {
            SecurityLevel::Kernel => Ok(KernelMappings::default()),
            SecurityLevel::User => Err(HandoffError::NotKernel),
        }
    }

    fn map_page(
        &mut self,
        space: &mut KernelMappings,
        page: VirtualPage<Size4K>,
        flags: PageEntryBits,
    ) -> Result<(), HandoffError> {
        let frame = self.frame_for(page)?;
        self.space.map_page(
            &mut *self.frames,
            page,
            frame,
            PageEntryBits::kernel_table(),
            flags.with_global_translation(true),
        )?;
        space.pages.push(page);
        Ok(())
    }

    #[allow(clippy::cast_possible_truncation)]
    fn write(&mut self, _space: &mut KernelMappings, va: VirtualAddress, bytes: &[u8]) -> Result<(), HandoffError> {
        self.for_each_chunk(va, bytes.len() as u32, |chunk, at| {
            chunk.copy_from_slice(&bytes[at..at + chunk.len()]);
        })
    }

    fn zero(&mut self, _space: &mut KernelMappings, va: VirtualAddress, len: u32) -> Result<(), HandoffError> {
        self.for_each_chunk(va, len, |chunk, _| chunk.fill(0))
    }

    fn create_thread(
        &mut self,
        _space: &mut KernelMappings,
        entry: VirtualAddress,
        tls: Option<TlsMaster>,
    ) -> Result<KernelImage, HandoffError> {
        Ok(KernelImage { entry, tls })
    }

    fn destroy_address_space(&mut self, space: KernelMappings) {
        for page in space.pages {
            if let Err(e) = self.space.unmap_page(page) {
                warn!("cannot unmap kernel page {page}: {e}");
            }
        }
    }
}

impl<M: PhysMapper, V: VirtualAccess> Bootstrap<'_, M, Mapped<'_, V>> {
    /// Map and fill the kernel image described by `descriptor`.
    ///
    /// The frames the image names must already be reserved, see
    /// [`relocate_modules`](Bootstrap::relocate_modules).
    ///
    /// # Errors
    /// - [`BootError::KernelImage`] if the module is not a valid image.
    /// - [`BootError::KernelEmpty`] if it has nothing to load.
    /// - [`BootError::Kernel`] if mapping or copying fails; pages mapped so
    ///   far are removed again.
    pub fn load_kernel<B: ModuleBytes + ?Sized>(
        &mut self,
        modules: &B,
        descriptor: &ModuleDescriptor,
    ) -> Result<KernelImage, BootError> {
        let bytes = modules
            .module_bytes(descriptor)
            .ok_or(BootError::Kernel(SpawnError::ModuleUnavailable(descriptor.start)))?;
        let segments: Vec<ProgramHeader> = ElfImage::parse(bytes)?.load_segments().collect();
        if segments.is_empty() {
            return Err(BootError::KernelEmpty);
        }
        if let Some(ph) = segments.iter().find(|ph| ph.p_vaddr.as_u32() < KERNEL_BASE) {
            warn!("kernel segment at {} lies below the kernel base", ph.p_vaddr);
        }

        let (frames, space) = self.parts();
        let mut spawner = KernelSpawner::new(frames, space, segments);
        let spawned = spawn_from_module(&mut spawner, modules, descriptor, SecurityLevel::Kernel)?;
        info!(
            "kernel loaded, {} pages mapped, entry {}",
            spawned.address_space.pages().len(),
            spawned.entry
        );
        Ok(spawned.thread)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_elf::{ElfError, PT_LOAD};
    use kernel_elf::testing::{ImageBuilder, rx};
    use kernel_memory_addresses::PhysicalAddress;

    #[test]
    fn kernel_module_is_found_by_file_name() {
        let modules = [
            ModuleDescriptor::new(0x20_0000, 0x20_1000, "/boot/init"),
            ModuleDescriptor::new(0x30_0000, 0x30_1000, "/boot/kernel"),
            ModuleDescriptor::new(0x40_0000, 0x40_1000, "/boot/kernel.sym"),
        ];
        assert_eq!(find_kernel(&modules), Some(1));
        assert_eq!(find_kernel(&modules[..1]), None);
        assert_eq!(
            find_kernel(&[ModuleDescriptor::new(0x10_0000, 0x10_1000, "kernel")]),
            Some(0)
        );
    }

    struct Bytes(Vec<u8>);

    impl ModuleBytes for Bytes {
        fn module_bytes(&self, _module: &ModuleDescriptor) -> Option<&[u8]> {
            Some(&self.0)
        }
    }

    #[test]
    fn extent_covers_every_loadable_segment() {
        let image = ImageBuilder::new(0xC010_0000)
            .segment(PT_LOAD, 0xC010_0000, 0x1800, rx(), &[0x90; 16])
            .at_physical(0x20_0000)
            .build();
        let descriptor = ModuleDescriptor::new(0x50_0000, 0x50_1000, "/boot/kernel");
        let extent = kernel_extent(&Bytes(image), &descriptor).expect("extent");
        assert_eq!(extent.start, PhysicalAddress::new(0x20_0000));
        assert_eq!(extent.end, PhysicalAddress::new(0x20_1800));
    }

    #[test]
    fn image_with_only_empty_segments_has_no_extent() {
        let image = ImageBuilder::new(0xC010_0000)
            .segment(PT_LOAD, 0xC010_0000, 0, rx(), &[])
            .build();
        let descriptor = ModuleDescriptor::new(0x50_0000, 0x50_1000, "/boot/kernel");
        assert!(matches!(
            kernel_extent(&Bytes(image), &descriptor),
            Err(BootError::KernelEmpty)
        ));
    }

    #[test]
    fn garbage_is_not_a_kernel() {
        let descriptor = ModuleDescriptor::new(0x50_0000, 0x50_1000, "/boot/kernel");
        assert!(matches!(
            kernel_extent(&Bytes(alloc::vec![0; 64]), &descriptor),
            Err(BootError::KernelImage(ElfError::NotElf))
        ));
        let no_segments = ImageBuilder::new(0xC010_0000).build();
        assert!(matches!(
            kernel_extent(&Bytes(no_segments), &descriptor),
            Err(BootError::KernelImage(ElfError::NoLoadableSegments))
        ));
    }
}

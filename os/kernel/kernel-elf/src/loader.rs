//! # Spawning a Process from a Module
//!
//! [`spawn_from_module`] validates a preloaded module as an ELF32
//! executable, then builds a fresh address space for it through a
//! [`ProcessSpawner`]:
//!
//! 1. Every page touched by a `PT_LOAD` segment is mapped once, with the
//!    union of the permissions of all segments that touch it.
//! 2. `p_filesz` bytes are copied from the file, `p_memsz - p_filesz`
//!    bytes (BSS) are zero-filled.
//! 3. A `PT_TLS` segment is not mapped; it is copied into a [`TlsMaster`]
//!    that the thread layer clones per thread.
//! 4. The initial thread is created at `e_entry`.
//!
//! Validation happens before step 1. If a later step fails the address
//! space is handed back to [`ProcessSpawner::destroy_address_space`].

use crate::header::{ElfError, ElfImage};
use crate::program::{PFlags, ProgramHeader};
use alloc::vec::Vec;
use core::fmt;
use kernel_info::boot::ModuleDescriptor;
use kernel_info::memory::USERSPACE_END;
use kernel_memory_addresses::{Size4K, VirtualAddress, VirtualPage};
use kernel_vmem::{PageEntryBits, PhysMapper};
use log::{debug, info, warn};

/// Privilege of the spawned process.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SecurityLevel {
    Kernel,
    User,
}

/// Translate ELF segment flags into leaf page flags.
///
/// Non-PAE paging cannot express execute-only or no-execute: every present
/// page is readable and executable, so only `PF_W` changes the result.
#[must_use]
pub const fn page_flags_for(flags: PFlags, level: SecurityLevel) -> PageEntryBits {
    let base = match level {
        SecurityLevel::Kernel => PageEntryBits::kernel_ro(),
        SecurityLevel::User => PageEntryBits::user_ro(),
    };
    base.with_writable(flags.write())
}

/// Initial thread-local storage image taken from `PT_TLS`.
///
/// `image` is `p_memsz` long: the file bytes followed by zeroes.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TlsMaster {
    image: Vec<u8>,
    file_len: u32,
    align: u32,
}

impl TlsMaster {
    /// # Errors
    /// [`ElfError::TlsTooLarge`] if the heap cannot hold the image.
    fn from_segment(elf: &ElfImage<'_>, ph: &ProgramHeader) -> Result<Self, ElfError> {
        let size = ph.p_memsz as usize;
        let mut image = Vec::new();
        image
            .try_reserve_exact(size)
            .map_err(|_| ElfError::TlsTooLarge { size: ph.p_memsz })?;
        image.extend_from_slice(elf.segment_bytes(ph));
        image.resize(size, 0);
        Ok(Self {
            image,
            file_len: ph.p_filesz,
            align: ph.p_align,
        })
    }

    #[must_use]
    pub fn image(&self) -> &[u8] {
        &self.image
    }

    /// Bytes initialised from the file (`.tdata`); the rest is `.tbss`.
    #[must_use]
    pub const fn file_len(&self) -> u32 {
        self.file_len
    }

    #[must_use]
    pub const fn align(&self) -> u32 {
        self.align
    }

    /// A fresh per-thread copy.
    #[must_use]
    pub fn instantiate(&self) -> Vec<u8> {
        self.image.clone()
    }
}

/// Resolves a module descriptor to its bytes.
pub trait ModuleBytes {
    fn module_bytes(&self, module: &ModuleDescriptor) -> Option<&[u8]>;
}

/// Modules reached through a [`PhysMapper`].
pub struct PhysicalModules<M: PhysMapper> {
    mapper: M,
}

impl<M: PhysMapper> PhysicalModules<M> {
    /// # Safety
    /// Every module range passed to [`ModuleBytes::module_bytes`] must be
    /// reachable through `mapper` and must not change while borrowed.
    pub const unsafe fn new(mapper: M) -> Self {
        Self { mapper }
    }
}

impl<M: PhysMapper> ModuleBytes for PhysicalModules<M> {
    fn module_bytes(&self, module: &ModuleDescriptor) -> Option<&[u8]> {
        if module.is_empty() {
            return None;
        }
        Some(unsafe { self.mapper.bytes(module.range().start, module.len()) })
    }
}

/// The process layer, as seen by the loader.
///
/// Writes go through the spawner's own view of the target space, so they
/// succeed regardless of the page permissions requested in `map_page`.
pub trait ProcessSpawner {
    type AddressSpace;
    type Thread;
    type Error: fmt::Debug + fmt::Display;

    fn create_address_space(
        &mut self,
        level: SecurityLevel,
    ) -> Result<Self::AddressSpace, Self::Error>;

    /// Back `page` with a frame of the spawner's choosing. Its contents
    /// are unspecified.
    fn map_page(
        &mut self,
        space: &mut Self::AddressSpace,
        page: VirtualPage<Size4K>,
        flags: PageEntryBits,
    ) -> Result<(), Self::Error>;

    fn write(
        &mut self,
        space: &mut Self::AddressSpace,
        va: VirtualAddress,
        bytes: &[u8],
    ) -> Result<(), Self::Error>;

    fn zero(
        &mut self,
        space: &mut Self::AddressSpace,
        va: VirtualAddress,
        len: u32,
    ) -> Result<(), Self::Error>;

    fn create_thread(
        &mut self,
        space: &mut Self::AddressSpace,
        entry: VirtualAddress,
        tls: Option<TlsMaster>,
    ) -> Result<Self::Thread, Self::Error>;

    /// Release the space and every frame mapped into it.
    fn destroy_address_space(&mut self, space: Self::AddressSpace);
}

#[derive(Debug, thiserror::Error)]
pub enum SpawnError<E> {
    #[error("module at {0:#010x} is empty or unreachable")]
    ModuleUnavailable(u32),
    #[error(transparent)]
    Elf(#[from] ElfError),
    #[error("user image maps kernel address {0}")]
    KernelAddressInUserImage(VirtualAddress),
    #[error("address space setup failed: {0}")]
    Spawner(E),
}

/// A running process: its address space and initial thread.
pub struct Spawned<S: ProcessSpawner> {
    pub address_space: S::AddressSpace,
    pub thread: S::Thread,
    pub entry: VirtualAddress,
}

/// Load the executable in `descriptor` into a new address space and create
/// its initial thread.
///
/// # Errors
/// - [`SpawnError::ModuleUnavailable`] if `modules` cannot produce the bytes.
/// - [`SpawnError::Elf`] for every header or segment validation failure.
/// - [`SpawnError::KernelAddressInUserImage`] if a user image reaches into
///   the kernel half.
/// - [`SpawnError::Spawner`] if the spawner fails; the address space is
///   destroyed first.
///
/// Only the last case ever creates an address space.
pub fn spawn_from_module<S, B>(
    spawner: &mut S,
    modules: &B,
    descriptor: &ModuleDescriptor,
    level: SecurityLevel,
) -> Result<Spawned<S>, SpawnError<S::Error>>
where
    S: ProcessSpawner,
    B: ModuleBytes + ?Sized,
{
    let bytes = modules
        .module_bytes(descriptor)
        .ok_or(SpawnError::ModuleUnavailable(descriptor.start))?;

    let image = ElfImage::parse(bytes).inspect_err(|e| {
        warn!("{}: not spawnable: {e}", descriptor.path());
    })?;

    if level == SecurityLevel::User
        && let Some(ph) = image
            .load_segments()
            .find(|ph| ph.virtual_end().is_none_or(|end| end > USERSPACE_END))
    {
        warn!("{}: segment at {} reaches the kernel half", descriptor.path(), ph.p_vaddr);
        return Err(SpawnError::KernelAddressInUserImage(ph.p_vaddr));
    }

    let segments: Vec<ProgramHeader> = image.load_segments().collect();
    let tls = image
        .tls_segment()
        .map(|ph| TlsMaster::from_segment(&image, &ph))
        .transpose()
        .inspect_err(|e| warn!("{}: {e}", descriptor.path()))?;

    let mut space = spawner
        .create_address_space(level)
        .map_err(SpawnError::Spawner)?;

    match populate(spawner, &mut space, &image, &segments, level, tls) {
        Ok(thread) => {
            info!(
                "{}: spawned, entry {}, {} segment(s)",
                descriptor.path(),
                image.entry(),
                segments.len()
            );
            Ok(Spawned {
                address_space: space,
                thread,
                entry: image.entry(),
            })
        }
        Err(e) => {
            warn!("{}: spawn failed: {e}", descriptor.path());
            spawner.destroy_address_space(space);
            Err(SpawnError::Spawner(e))
        }
    }
}

fn populate<S: ProcessSpawner>(
    spawner: &mut S,
    space: &mut S::AddressSpace,
    image: &ElfImage<'_>,
    segments: &[ProgramHeader],
    level: SecurityLevel,
    tls: Option<TlsMaster>,
) -> Result<S::Thread, S::Error> {
    for (i, ph) in segments.iter().enumerate() {
        let (first, count) = ph.pages();
        for n in 0..count {
            let page = VirtualPage::<Size4K>::from_index(first.index() + n);
            if segments[..i].iter().any(|earlier| earlier.covers(page)) {
                continue;
            }
            let flags = segments[i..]
                .iter()
                .filter(|s| s.covers(page))
                .fold(PFlags::new(), |acc, s| acc.union(s.p_flags));
            spawner.map_page(space, page, page_flags_for(flags, level))?;
        }
    }

    for ph in segments {
        let file = image.segment_bytes(ph);
        if !file.is_empty() {
            spawner.write(space, ph.p_vaddr, file)?;
        }
        let bss = ph.bss_len();
        if bss != 0 {
            spawner.zero(space, ph.p_vaddr + ph.p_filesz, bss)?;
        }
        debug!(
            "segment {}..+{:#x} file {:#x} flags {:?}",
            ph.p_vaddr, ph.p_memsz, ph.p_filesz, ph.p_flags
        );
    }

    spawner.create_thread(space, image.entry(), tls)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ImageBuilder, rw, rx};
    use crate::program::{PT_LOAD, PT_TLS};
    use kernel_memory_addresses::PageSize;
    use std::collections::BTreeMap;

    const PAGE: usize = Size4K::SIZE as usize;

    struct Blob(Vec<u8>);

    impl ModuleBytes for Blob {
        fn module_bytes(&self, _module: &ModuleDescriptor) -> Option<&[u8]> {
            Some(&self.0)
        }
    }

    /// Records every call; fresh pages are filled with 0xCC.
    #[derive(Default)]
    struct RecordingSpawner {
        spaces_created: usize,
        spaces_destroyed: usize,
        mappings: Vec<(u32, PageEntryBits)>,
        zeroed: Vec<(u32, u32)>,
        pages: BTreeMap<u32, Vec<u8>>,
        threads: Vec<(VirtualAddress, Option<TlsMaster>)>,
        fail_map_after: Option<usize>,
    }

    impl RecordingSpawner {
        fn byte_mut(&mut self, va: u32) -> Result<&mut u8, &'static str> {
            let page = self.pages.get_mut(&(va >> 12)).ok_or("write to unmapped page")?;
            Ok(&mut page[(va & 0xFFF) as usize])
        }

        fn read(&self, va: u32, len: usize) -> Vec<u8> {
            (0..len as u32)
                .map(|i| {
                    let a = va + i;
                    self.pages[&(a >> 12)][(a & 0xFFF) as usize]
                })
                .collect()
        }
    }

    impl ProcessSpawner for RecordingSpawner {
        type AddressSpace = usize;
        type Thread = usize;
        type Error = &'static str;

        fn create_address_space(&mut self, _level: SecurityLevel) -> Result<usize, Self::Error> {
            self.spaces_created += 1;
            Ok(self.spaces_created)
        }

        fn map_page(
            &mut self,
            _space: &mut usize,
            page: VirtualPage<Size4K>,
            flags: PageEntryBits,
        ) -> Result<(), Self::Error> {
            if self.fail_map_after == Some(self.mappings.len()) {
                return Err("out of frames");
            }
            assert!(
                self.pages.insert(page.index(), vec![0xCC; PAGE]).is_none(),
                "page {page} mapped twice"
            );
            self.mappings.push((page.index(), flags));
            Ok(())
        }

        fn write(&mut self, _space: &mut usize, va: VirtualAddress, bytes: &[u8]) -> Result<(), Self::Error> {
            for (i, b) in bytes.iter().enumerate() {
                *self.byte_mut(va.as_u32() + i as u32)? = *b;
            }
            Ok(())
        }

        fn zero(&mut self, _space: &mut usize, va: VirtualAddress, len: u32) -> Result<(), Self::Error> {
            self.zeroed.push((va.as_u32(), len));
            for i in 0..len {
                *self.byte_mut(va.as_u32() + i)? = 0;
            }
            Ok(())
        }

        fn create_thread(
            &mut self,
            _space: &mut usize,
            entry: VirtualAddress,
            tls: Option<TlsMaster>,
        ) -> Result<usize, Self::Error> {
            self.threads.push((entry, tls));
            Ok(self.threads.len())
        }

        fn destroy_address_space(&mut self, _space: usize) {
            self.spaces_destroyed += 1;
            self.pages.clear();
        }
    }

    fn module() -> ModuleDescriptor {
        ModuleDescriptor::new(0x0020_0000, 0x0020_4000, "/bin/init")
    }

    #[test]
    fn bad_magic_creates_nothing() {
        let mut bytes = ImageBuilder::new(0x0804_8000)
            .segment(PT_LOAD, 0x0804_8000, 0x1000, rx(), &[0x90; 16])
            .build();
        bytes[1] = b'X';
        let mut spawner = RecordingSpawner::default();

        let err = spawn_from_module(&mut spawner, &Blob(bytes), &module(), SecurityLevel::User)
            .err()
            .expect("must fail");

        assert!(matches!(err, SpawnError::Elf(ElfError::NotElf)));
        assert_eq!(spawner.spaces_created, 0);
        assert!(spawner.mappings.is_empty());
    }

    #[test]
    fn bss_zero_fill_covers_exactly_the_tail() {
        let bytes = ImageBuilder::new(0x0804_8000)
            .segment(PT_LOAD, 0x0804_8000, 8192, rw(), &[0xAB; 4096])
            .build();
        let mut spawner = RecordingSpawner::default();

        let spawned = spawn_from_module(&mut spawner, &Blob(bytes), &module(), SecurityLevel::User)
            .expect("spawn");

        assert_eq!(spawned.entry, VirtualAddress::new(0x0804_8000));
        assert_eq!(spawner.mappings.len(), 2);
        assert_eq!(spawner.zeroed, vec![(0x0804_9000, 4096)]);
        assert!(spawner.read(0x0804_8000, 4096).iter().all(|&b| b == 0xAB));
        assert!(spawner.read(0x0804_9000, 4096).iter().all(|&b| b == 0));
    }

    #[test]
    fn shared_page_gets_the_union_of_flags() {
        let bytes = ImageBuilder::new(0x0804_8000)
            .segment(PT_LOAD, 0x0804_8000, 0x800, rx(), &[0x90; 0x800])
            .segment(PT_LOAD, 0x0804_8800, 0x1800, rw(), &[0x11; 0x10])
            .build();
        let mut spawner = RecordingSpawner::default();

        spawn_from_module(&mut spawner, &Blob(bytes), &module(), SecurityLevel::User).expect("spawn");

        let pages: Vec<u32> = spawner.mappings.iter().map(|(p, _)| *p).collect();
        assert_eq!(pages, vec![0x0804_8, 0x0804_9]);
        for (_, flags) in &spawner.mappings {
            assert!(flags.present() && flags.writable() && flags.user_access());
        }
        assert_eq!(spawner.read(0x0804_87FF, 2), vec![0x90, 0x11]);
    }

    #[test]
    fn read_only_kernel_segment_is_not_writable() {
        let bytes = ImageBuilder::new(0xC010_0000)
            .segment(PT_LOAD, 0xC010_0000, 0x1000, rx(), &[0x90; 4])
            .build();
        let mut spawner = RecordingSpawner::default();

        spawn_from_module(&mut spawner, &Blob(bytes), &module(), SecurityLevel::Kernel)
            .expect("spawn");

        let (_, flags) = spawner.mappings[0];
        assert!(flags.present());
        assert!(!flags.writable());
        assert!(!flags.user_access());
    }

    #[test]
    fn tls_segment_becomes_master_copy() {
        let bytes = ImageBuilder::new(0x0804_8000)
            .segment(PT_LOAD, 0x0804_8000, 0x1000, rx(), &[0x90; 4])
            .segment(PT_TLS, 0x0804_9000, 16, rw(), &[1, 2, 3, 4, 5, 6, 7, 8])
            .build();
        let mut spawner = RecordingSpawner::default();

        spawn_from_module(&mut spawner, &Blob(bytes), &module(), SecurityLevel::User).expect("spawn");

        assert_eq!(spawner.mappings.len(), 1, "TLS is not mapped");
        let tls = spawner.threads[0].1.as_ref().expect("master copy");
        assert_eq!(tls.image(), &[1, 2, 3, 4, 5, 6, 7, 8, 0, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(tls.file_len(), 8);
        assert_eq!(tls.align(), 0x1000);
        assert_eq!(tls.instantiate(), tls.image());
    }

    #[test]
    fn oversized_tls_is_refused_before_any_space_exists() {
        let bytes = ImageBuilder::new(0x0804_8000)
            .segment(PT_LOAD, 0x0804_8000, 0x1000, rx(), &[0x90; 4])
            .segment(PT_TLS, 0x0804_9000, 0x8000_0000, rw(), &[])
            .build();
        let mut spawner = RecordingSpawner::default();

        let result = spawn_from_module(&mut spawner, &Blob(bytes), &module(), SecurityLevel::Kernel);
        assert!(matches!(
            result,
            Err(SpawnError::Elf(ElfError::TlsTooLarge { size: 0x8000_0000 }))
        ));
        assert_eq!(spawner.spaces_created, 0);
        assert!(spawner.threads.is_empty());
    }

    #[test]
    fn failed_mapping_destroys_the_space() {
        let bytes = ImageBuilder::new(0x0804_8000)
            .segment(PT_LOAD, 0x0804_8000, 0x3000, rw(), &[])
            .build();
        let mut spawner = RecordingSpawner {
            fail_map_after: Some(2),
            ..RecordingSpawner::default()
        };

        let err = spawn_from_module(&mut spawner, &Blob(bytes), &module(), SecurityLevel::User)
            .err()
            .expect("must fail");

        assert!(matches!(err, SpawnError::Spawner("out of frames")));
        assert_eq!(spawner.spaces_created, 1);
        assert_eq!(spawner.spaces_destroyed, 1);
        assert!(spawner.threads.is_empty());
    }

    #[test]
    fn user_image_may_not_touch_kernel_half() {
        let bytes = ImageBuilder::new(0xC000_0000)
            .segment(PT_LOAD, 0xBFFF_F000, 0x2000, rw(), &[])
            .build();
        let mut spawner = RecordingSpawner::default();

        let err = spawn_from_module(&mut spawner, &Blob(bytes), &module(), SecurityLevel::User)
            .err()
            .expect("must fail");

        assert!(matches!(err, SpawnError::KernelAddressInUserImage(_)));
        assert_eq!(spawner.spaces_created, 0);
    }

    #[test]
    fn modules_are_read_from_physical_memory() {
        use kernel_memory_addresses::PhysicalAddress;
        use kernel_vmem::testing::FakePhysicalMemory;

        let bytes = ImageBuilder::new(0x0804_8000)
            .segment(PT_LOAD, 0x0804_8000, 0x1000, rx(), &[0x90; 4])
            .build();
        let memory = FakePhysicalMemory::new(0x40_0000);
        memory.write(PhysicalAddress::new(0x0020_0000), &bytes);
        let descriptor = ModuleDescriptor::new(0x0020_0000, 0x0020_0000 + bytes.len() as u32, "/bin/init");
        let modules = unsafe { PhysicalModules::new(&memory) };
        let mut spawner = RecordingSpawner::default();

        spawn_from_module(&mut spawner, &modules, &descriptor, SecurityLevel::User).expect("spawn");
        assert_eq!(spawner.read(0x0804_8000, 4), vec![0x90; 4]);

        let empty = ModuleDescriptor::new(0x0020_0000, 0x0020_0000, "/bin/none");
        assert!(matches!(
            spawn_from_module(&mut spawner, &modules, &empty, SecurityLevel::User),
            Err(SpawnError::ModuleUnavailable(0x0020_0000))
        ));
    }
}

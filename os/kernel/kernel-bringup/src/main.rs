//! # Loader Entry Point
//!
//! The first-stage bootloader jumps to [`_start`] in 32-bit protected mode,
//! paging off, interrupts in any state, with a pointer to the
//! [`BootInformation`] block in `EBX`. The loader never returns: it either
//! enters the kernel or halts through [`fatal`].
//!
//! On a hosted target this binary only explains itself; the logic lives in
//! the library and is tested there.

#![cfg_attr(target_os = "none", no_std, no_main)]
#![allow(unsafe_code)]

#[cfg(not(target_os = "none"))]
fn main() {
    eprintln!("the loader runs on bare metal only; build it for an i686 `none` target");
}

#[cfg(target_os = "none")]
mod loader {
    use kernel_alloc::phys_mapper::IdentityPhysMapper;
    use kernel_alloc::{BitmapFrameAlloc, MemoryMap};
    use kernel_bringup::{
        BootError, Bootstrap, EarlyHeap, LoaderLayout, find_kernel, kernel_extent,
    };
    use kernel_diagnostics::{DiagnosticLogger, FatalError, diag_print};
    use kernel_elf::PhysicalModules;
    use kernel_info::boot::BootInformation;
    use kernel_info::memory::{KERNEL_STACK_SIZE, PhysicalRange};
    use kernel_memory_addresses::{PageSize, PhysicalAddress, Size4K};
    use kernel_vmem::Cpu;
    use log::{LevelFilter, debug, info, warn};

    /// Page tables needed before the bitmap exists: the directory plus one
    /// table per 4 MiB of loader image.
    const PAGE_POOL_FRAMES: u32 = 16;

    /// Enough for 4 GiB of 4 KiB frames.
    const BITMAP_WORDS: usize = BitmapFrameAlloc::words_for(1 << 32);

    const HEAP_SIZE: usize = 64 * 1024;

    #[repr(C, align(16))]
    struct Aligned<const N: usize>([u8; N]);

    #[repr(C, align(4096))]
    struct PagePool([[u8; 4096]; PAGE_POOL_FRAMES as usize]);

    #[unsafe(link_section = ".bss.boot")]
    #[unsafe(no_mangle)]
    static mut BOOT_STACK: Aligned<{ KERNEL_STACK_SIZE as usize }> =
        Aligned([0; KERNEL_STACK_SIZE as usize]);

    #[unsafe(link_section = ".bss.boot")]
    static mut PAGE_POOL: PagePool = PagePool([[0; 4096]; PAGE_POOL_FRAMES as usize]);

    static mut BITMAP: [u32; BITMAP_WORDS] = [0; BITMAP_WORDS];

    #[global_allocator]
    static HEAP: EarlyHeap<HEAP_SIZE> = EarlyHeap::new();

    static LOGGER: DiagnosticLogger = DiagnosticLogger::new(LevelFilter::Debug);

    unsafe extern "C" {
        /// First byte past the loader image, from `loader.ld`.
        static __loader_end: u8;
    }

    #[panic_handler]
    fn panic(info: &core::panic::PanicInfo) -> ! {
        kernel_diagnostics::fatal("panic", info)
    }

    /// The loader entry point.
    ///
    /// # Naked function & Stack
    /// Nothing about the caller's stack is known, so the stack is set up
    /// before any Rust code runs. `EBX` is pushed as the single cdecl
    /// argument of [`loader_main`].
    #[unsafe(no_mangle)]
    #[unsafe(naked)]
    pub unsafe extern "C" fn _start() -> ! {
        core::arch::naked_asm!(
            "cli",
            "lea esp, [{stack} + {stack_size}]",
            "and esp, -16",
            "xor ebp, ebp",
            // Keep ESP 16-byte aligned at the call.
            "sub esp, 12",
            "push ebx",
            "call {rust_entry}",
            "ud2",
            stack = sym BOOT_STACK,
            stack_size = const KERNEL_STACK_SIZE,
            rust_entry = sym loader_main,
        );
    }

    /// Loader entry running on the boot stack.
    extern "C" fn loader_main(info: *const BootInformation) -> ! {
        diag_print!("loader\n");
        if LOGGER.init().is_err() {
            diag_print!("logger already installed\n");
        }

        let info = unsafe { &*info };
        match run(info) {
            Err(e) => FatalError::new(e.context(), e).halt(),
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn physical<T>(ptr: *const T) -> PhysicalAddress {
        // Unpaged, or identity mapped: the pointer is the physical address.
        PhysicalAddress::new(ptr.addr() as u32)
    }

    fn run(info: &BootInformation) -> Result<core::convert::Infallible, BootError> {
        if !info.is_valid() {
            return Err(BootError::BadMagic(info.magic));
        }
        let regions = unsafe { info.memory_regions() };
        let modules = unsafe { info.modules_mut() };
        info!(
            "{} memory region(s), {} module(s) from the bootloader",
            regions.len(),
            modules.len()
        );

        let pool_start = physical(&raw const PAGE_POOL);
        let pool_end = pool_start + PAGE_POOL_FRAMES * Size4K::SIZE;
        let layout = LoaderLayout::new(
            physical(&raw const __loader_end),
            PhysicalRange::new(pool_start, pool_end),
        )?;

        let mapper = IdentityPhysMapper;
        let bitmap = unsafe { &mut *(&raw mut BITMAP) };
        let mut boot = Bootstrap::new(&mapper, layout)?
            .load_memory_map(bitmap, &MemoryMap::new(regions, modules))?;

        let kernel = find_kernel(modules).ok_or(BootError::KernelMissing)?;
        // Identity mapped or unpaged throughout, so module bytes are reachable.
        let module_bytes = unsafe { PhysicalModules::new(IdentityPhysMapper) };
        let extent = kernel_extent(&module_bytes, &modules[kernel])?;
        boot.relocate_modules(modules, Some(extent))?;

        let mut boot = boot.enable_paging(modules, Cpu)?;

        match boot.discover_madt() {
            Some(madt) => match boot.bring_up_interrupts(&madt) {
                Ok(topology) => info!(
                    "boot processor APIC {}, {} IO-APIC(s)",
                    topology.boot_apic_id,
                    topology.io_apics.len()
                ),
                Err(e) => warn!("interrupt controllers left alone: {e}"),
            },
            None => warn!("no MADT, staying on the legacy PIC"),
        }

        let image = boot.load_kernel(&module_bytes, &modules[kernel])?;
        let setup = boot.setup_information(modules);
        debug!("early heap: {} of {} bytes used", HEAP.used(), HEAP.capacity());
        unsafe { image.enter(&setup) }
    }
}

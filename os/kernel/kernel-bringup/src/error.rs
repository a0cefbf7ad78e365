use kernel_alloc::{FrameAllocError, MemoryMapError};
use kernel_apic::{IoApicError, LocalApicError};
use kernel_elf::{ElfError, SpawnError};
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_vmem::MapError;

/// Everything that stops the loader. All of these end in
/// [`fatal`](kernel_diagnostics::fatal).
#[derive(Debug, thiserror::Error)]
pub enum BootError {
    #[error("magic {0:#010x} does not identify a boot information block")]
    BadMagic(u32),
    #[error("reserved area end {0} is below 1 MiB or not page aligned")]
    ReservedArea(PhysicalAddress),
    #[error("page pool {start}..{end} is not inside the reserved area")]
    PagePool {
        start: PhysicalAddress,
        end: PhysicalAddress,
    },
    #[error("reserved area cannot be identity mapped: {0}")]
    IdentityMap(MapError),
    #[error(transparent)]
    Bitmap(#[from] FrameAllocError),
    #[error(transparent)]
    MemoryMap(#[from] MemoryMapError),
    #[error("module at {start:#010x} cannot be relocated: {source}")]
    Relocation {
        start: u32,
        source: FrameAllocError,
    },
    #[error("module at {start:#010x} cannot be identity mapped: {source}")]
    ModuleMapping { start: u32, source: MapError },
    #[error("no module named kernel")]
    KernelMissing,
    #[error("kernel frames {start}..{end} are not free memory above the loader")]
    KernelPlacement {
        start: PhysicalAddress,
        end: PhysicalAddress,
    },
    #[error("kernel image has no loadable segment")]
    KernelEmpty,
    #[error("kernel image: {0}")]
    KernelImage(#[from] ElfError),
    #[error(transparent)]
    Kernel(#[from] SpawnError<HandoffError>),
}

impl BootError {
    /// The bring-up step that failed, for the fatal report.
    #[must_use]
    pub const fn context(&self) -> &'static str {
        match self {
            Self::BadMagic(_) => "boot information",
            Self::ReservedArea(_) | Self::PagePool { .. } => "loader layout",
            Self::IdentityMap(_) => "identity map",
            Self::Bitmap(_) => "frame bitmap",
            Self::MemoryMap(_) => "memory map",
            Self::Relocation { .. } | Self::ModuleMapping { .. } => "module relocation",
            Self::KernelMissing
            | Self::KernelEmpty
            | Self::KernelPlacement { .. }
            | Self::KernelImage(_)
            | Self::Kernel(_) => "kernel handoff",
        }
    }
}

/// Failures while mapping the kernel image into the live address space.
#[derive(Debug, Clone, Copy, Eq, PartialEq, thiserror::Error)]
pub enum HandoffError {
    #[error("only kernel images are loaded at boot")]
    NotKernel,
    #[error("no segment provides a physical frame for {0}")]
    Unbacked(VirtualAddress),
    #[error("segment at {vaddr} and its physical address {paddr} differ in page offset")]
    Misaligned {
        vaddr: VirtualAddress,
        paddr: PhysicalAddress,
    },
    #[error("{0} is not mapped")]
    NotMapped(VirtualAddress),
    #[error(transparent)]
    Map(#[from] MapError),
}

/// Failures while bringing up interrupt routing. None of them is fatal:
/// the kernel falls back to the legacy PIC.
#[derive(Debug, Clone, Copy, Eq, PartialEq, thiserror::Error)]
pub enum TopologyError {
    #[error(transparent)]
    LocalApic(#[from] LocalApicError),
    #[error(transparent)]
    IoApic(#[from] IoApicError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_error_names_its_step() {
        assert_eq!(BootError::BadMagic(0).context(), "boot information");
        assert_eq!(
            BootError::IdentityMap(MapError::OutOfFrames).context(),
            "identity map"
        );
        assert_eq!(
            BootError::Relocation {
                start: 0x40_0000,
                source: FrameAllocError::OutOfMemory { requested: 4 }
            }
            .context(),
            "module relocation"
        );
        assert_eq!(BootError::KernelMissing.context(), "kernel handoff");
    }

    #[test]
    fn messages_carry_the_addresses() {
        let err = BootError::BadMagic(0x1BAD_B002);
        assert_eq!(
            err.to_string(),
            "magic 0x1badb002 does not identify a boot information block"
        );
        let err = HandoffError::Unbacked(VirtualAddress::new(0xC010_0000));
        assert_eq!(
            err.to_string(),
            "no segment provides a physical frame for 0xC0100000"
        );
    }
}

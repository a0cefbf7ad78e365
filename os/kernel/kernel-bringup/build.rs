use kernel_info::memory;
use std::{env, path::PathBuf};

/// Physical (and, before paging, virtual) load address of the loader image.
const LOADER_BASE: u32 = memory::LEGACY_AREA_END;

fn main() {
    // Rebuild when inputs change
    let manifest_dir = PathBuf::from(env::var("CARGO_MANIFEST_DIR").unwrap());
    let ld = manifest_dir.join("loader.ld");
    println!("cargo:rerun-if-changed={}", ld.display());

    // Host builds only compile the stub binary; no linker script applies.
    if env::var("CARGO_CFG_TARGET_OS").as_deref() != Ok("none") {
        return;
    }

    // Sanity checks (fail fast during build)
    assert_eq!(
        LOADER_BASE & 0xfff,
        0,
        "LOADER_BASE must be 4 KiB aligned (got {LOADER_BASE:#x})"
    );
    assert!(
        LOADER_BASE < memory::KERNEL_BASE,
        "the loader must sit below the kernel half"
    );

    println!("cargo:rustc-link-arg-bins=-T{}", ld.display());
    println!("cargo:rustc-link-arg-bins=--defsym=LOADER_BASE={LOADER_BASE:#x}");
}

//! Compile-time memory layout. The partition derived from these constants
//! is fixed for the life of the boot.

/// Base of RAM; the loader is linked here (see loader.ld).
pub const MEM_START: usize = 0x8000_0000;

/// Memory reserved for the loader image and the microkernel payload,
/// measured from [`MEM_START`]. The main guest's window begins one
/// megapage above this ceiling.
pub const MICRO_MEMSIZE: usize = 32 * 1024 * 1024;

/// Memory granted to the main guest, including the relocated description
/// blob placed above its image.
pub const MAIN_MEMSIZE: usize = 96 * 1024 * 1024;

/// Large-page granularity of the guests' virtual-address schemes. The main
/// guest's base and the relocated blob are aligned to it.
pub const MEGAPAGE_SIZE: usize = 2 * 1024 * 1024;

/// Where the main guest's image is copied by the boot hart.
pub const MAIN_BASE: usize = MEM_START + MICRO_MEMSIZE + MEGAPAGE_SIZE;

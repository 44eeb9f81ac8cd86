//! Boot orchestration.
//!
//! Every hart lands in [`boot_hart`] out of boot.S. The first one through
//! the election becomes the boot hart: it places the second guest's image,
//! relocates and filters the description blob, publishes the entry latch
//! and enters the microkernel. Every other hart spins on the latch, then
//! either parks (disabled hart) or applies its own partition and enters
//! the main guest. No path returns.

use core::ptr;

use log::{error, info};

use loader_boot::{Election, EntryLatch, HartMask, HartRole, SecondaryFate};
use loader_pmp::{Guest, MemoryLayout, PartitionPlan, PhysRange};

use crate::arch::{self, enter, pmp};
use crate::config;
use crate::console;
use crate::logger;
use crate::payload;

extern "C" {
    static _ftext: u8;
    static _end: u8;
    static mut _bss_start: u8;
    static mut _bss_end: u8;
}

static ELECTION: Election = Election::new();

// Zero is the latch's unset state, so both words must live in loaded data:
// a hart can start spinning before the boot hart has cleared .bss, and a
// word there holds junk until then.
#[link_section = ".data"]
static ENTRY: EntryLatch = EntryLatch::new();
#[link_section = ".data"]
static DISABLED_HARTS: HartMask = HartMask::new();

pub fn boot_hart(dtb_addr: usize) -> ! {
    let hartid = arch::hart_id();
    match ELECTION.claim(hartid) {
        HartRole::Primary => primary(hartid, dtb_addr),
        HartRole::Secondary => secondary(),
    }
}

fn primary(hartid: usize, dtb_addr: usize) -> ! {
    // SAFETY: we won the election and no zero-initialized static has been
    // touched yet; the losers read nothing but the entry latch until it
    // publishes, and zero is its unset state.
    unsafe { zero_bss() };

    console::init(dtb_addr);
    logger::init();

    let layout = memory_layout();
    info!(
        "boot hart {hartid}: loader {:#x}..{:#x}",
        layout.loader.base(),
        layout.loader.end()
    );

    // Place the main guest's image above the microkernel ceiling.
    let main_image = payload::main_image();
    // SAFETY: the target window starts one megapage past the reserved
    // region and belongs to no one yet.
    unsafe {
        ptr::copy_nonoverlapping(
            main_image.as_ptr(),
            config::MAIN_BASE as *mut u8,
            main_image.len(),
        );
    }

    relocate_and_filter(dtb_addr, config::MAIN_BASE + main_image.len());

    // Everything written above happens-before the publish; a hart that has
    // seen the latch non-empty sees the image, the blob and the mask.
    ENTRY.publish(config::MAIN_BASE);

    enforce_partition(Guest::Micro, &layout);

    let micro = payload::micro_image();
    if cfg!(feature = "guest-micro") {
        info!(
            "starting microkernel payload at {:#x}",
            micro.as_ptr() as usize
        );
        // The microkernel uses its own embedded description blob.
        // SAFETY: one-way handoff; this hart's partition is in force.
        unsafe { enter::supervisor(micro.as_ptr() as usize, hartid, 0) }
    } else {
        info!("microkernel payload disabled, parking boot hart");
        arch::park()
    }
}

fn secondary() -> ! {
    let entry = ENTRY.wait();
    let hartid = arch::hart_id();

    match loader_boot::secondary_fate(hartid, DISABLED_HARTS.load()) {
        SecondaryFate::Park => {
            info!("(disabled hart {hartid})");
            arch::park()
        }
        SecondaryFate::Enter => {
            // TODO: hold main-guest harts until the microkernel signals it
            // has finished its own startup; no such notification exists yet,
            // so the latch alone orders the handoff.
            let blob = dtb_output();
            if cfg!(feature = "boot-machine") {
                info!("starting main payload at {entry:#x} on hart {hartid} (machine mode)");
                // SAFETY: one-way handoff; the guest is trusted with the
                // whole machine in this configuration.
                unsafe { enter::machine(entry, hartid, blob) }
            } else {
                enforce_partition(Guest::Main, &memory_layout());
                if cfg!(feature = "guest-main") {
                    info!("starting main payload at {entry:#x} on hart {hartid}");
                    // SAFETY: one-way handoff; this hart's partition is in
                    // force.
                    unsafe { enter::supervisor(entry, hartid, blob) }
                } else {
                    info!("main payload disabled, parking hart {hartid}");
                    arch::park()
                }
            }
        }
    }
}

/// Copy the inbound description blob above the main guest's image and
/// strip what that guest must not see. Records the disabled-hart mask as a
/// side effect. Returns the relocated blob's address.
fn relocate_and_filter(dtb_addr: usize, main_end: usize) -> usize {
    let out = loader_fdt::relocation_target(main_end as u64, config::MEGAPAGE_SIZE as u64) as usize;

    // SAFETY: trusted boot-chain blob, readable at the inbound address.
    let header = unsafe { core::slice::from_raw_parts(dtb_addr as *const u8, 40) };
    let size = match loader_fdt::total_size(header) {
        Ok(size) => size,
        Err(err) => {
            error!("{err}");
            arch::halt("inbound device tree is unusable")
        }
    };

    // SAFETY: the destination sits above the main guest's window; the
    // boot chain places the inbound blob outside that window.
    unsafe { ptr::copy_nonoverlapping(dtb_addr as *const u8, out as *mut u8, size) };
    // SAFETY: `size` bytes were just written at `out` and nothing else
    // refers to them yet.
    let blob = unsafe { core::slice::from_raw_parts_mut(out as *mut u8, size) };

    let mut disabled = 0u64;
    let mut removed = 0;
    removed += checked(loader_fdt::filter_harts(blob, &mut disabled));
    removed += checked(loader_fdt::filter_interrupt_controller(blob));
    removed += checked(loader_fdt::filter_compatible(blob, "riscv,clint0"));
    removed += checked(loader_fdt::filter_compatible(blob, "riscv,debug-013"));
    DISABLED_HARTS.store(disabled);

    info!("relocated device tree to {out:#x} ({size} bytes, {removed} nodes stripped)");
    out
}

fn checked(result: Result<usize, loader_fdt::FdtError>) -> usize {
    match result {
        Ok(removed) => removed,
        Err(err) => {
            error!("{err}");
            arch::halt("device tree filtering failed")
        }
    }
}

/// Probe the protection bank and program this hart's partition. Fatal when
/// the bank cannot hold the plan: proceeding would silently drop the
/// isolation this loader exists to provide.
fn enforce_partition(guest: Guest, layout: &MemoryLayout) {
    let plan = PartitionPlan::for_guest(guest, layout);
    let usable = pmp::probe_usable_registers();
    if let Err(err) = plan.require_registers(usable) {
        error!("{err}");
        arch::halt("not enough pmp registers");
    }
    pmp::apply(&plan);
}

/// The fixed partition, recomputed per hart from the linker symbols and
/// the configured layout. The main guest's window starts one megapage
/// below its base, covering the alignment gap, and spans its configured
/// memory including the relocated blob.
fn memory_layout() -> MemoryLayout {
    // SAFETY: linker-provided symbols delimiting the loader image.
    let loader_start = unsafe { ptr::addr_of!(_ftext) } as u64;
    let loader_end = unsafe { ptr::addr_of!(_end) } as u64;
    let micro = payload::micro_image();
    MemoryLayout {
        loader: PhysRange::from_bounds(loader_start, loader_end),
        micro: PhysRange::new(micro.as_ptr() as u64, micro.len() as u64),
        main: PhysRange::new(
            (config::MAIN_BASE - config::MEGAPAGE_SIZE) as u64,
            config::MAIN_MEMSIZE as u64,
        ),
    }
}

/// Address of the relocated blob: a pure function of the layout, so every
/// hart recomputes it instead of sharing another word.
fn dtb_output() -> usize {
    let main_end = config::MAIN_BASE + payload::main_image().len();
    loader_fdt::relocation_target(main_end as u64, config::MEGAPAGE_SIZE as u64) as usize
}

/// Zero the uninitialized data sections.
///
/// # Safety
///
/// Must run exactly once, on the boot hart, before any zero-initialized
/// static is used. The per-hart stacks live outside the zeroed span.
unsafe fn zero_bss() {
    let start = ptr::addr_of_mut!(_bss_start) as usize;
    let end = ptr::addr_of_mut!(_bss_end) as usize;
    ptr::write_bytes(start as *mut u8, 0, end - start);
}

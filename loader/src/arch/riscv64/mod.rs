//! RISC-V hardware access. Everything that touches a CSR or an instruction
//! directly lives under this module; the rest of the loader stays ignorant
//! of the encodings.

pub mod enter;
pub mod pmp;

// Per-hart entry: stack setup, then loader_start. Assembled by the
// integrated assembler so no cross toolchain is needed.
core::arch::global_asm!(include_str!("boot.S"));

/// Identity of the calling hart.
pub fn hart_id() -> usize {
    riscv::register::mhartid::read()
}

/// Park the calling hart forever. Terminal: there is no scheduler to
/// recover into.
pub fn park() -> ! {
    loop {
        // SAFETY: waiting for an interrupt that never arrives is the
        // documented terminal state for this hart.
        unsafe { riscv::asm::wfi() };
    }
}

/// Fatal error: report and stop. Used when the isolation guarantee cannot
/// be established; proceeding would be worse than halting.
pub fn halt(msg: &str) -> ! {
    log::error!("fatal: {msg}");
    park()
}

//! Privilege-mode handoff. Both entries are one-way: the loader never
//! gets this hart back.

use riscv::register::mepc;
use riscv::register::mstatus::{self, MPP};

/// Enter supervisor mode at `entry`, passing the hart id and the
/// description-blob address in the first two argument registers.
///
/// # Safety
///
/// `entry` must be the physical address of a supervisor-mode image ready
/// to execute, and this hart's partition must already be in force.
pub unsafe fn supervisor(entry: usize, hartid: usize, blob: usize) -> ! {
    mstatus::set_mpp(MPP::Supervisor);
    mepc::write(entry);
    core::arch::asm!(
        "csrw satp, zero",
        "mv a0, {hartid}",
        "mv a1, {blob}",
        "mret",
        hartid = in(reg) hartid,
        blob = in(reg) blob,
        options(noreturn),
    )
}

/// Enter `entry` staying in machine mode; the guest owns the machine and
/// no partition applies.
///
/// # Safety
///
/// `entry` must be the physical address of a machine-mode image ready to
/// execute.
pub unsafe fn machine(entry: usize, hartid: usize, blob: usize) -> ! {
    mstatus::set_mpp(MPP::Machine);
    mepc::write(entry);
    core::arch::asm!(
        "mv a0, {hartid}",
        "mv a1, {blob}",
        "mret",
        hartid = in(reg) hartid,
        blob = in(reg) blob,
        options(noreturn),
    )
}

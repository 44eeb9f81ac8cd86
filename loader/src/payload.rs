//! Guest images embedded at build time.
//!
//! The linker script places both sections above the loader's protected
//! range: the microkernel executes in place, so its image must be outside
//! the range its own partition denies, and on a megapage boundary. Image
//! paths come from `PAYLOAD_MICRO`/`PAYLOAD_MAIN` (see build.rs).

#[repr(C, align(2097152))]
struct PayloadImage<const N: usize>([u8; N]);

#[link_section = ".guest_micro"]
static MICRO_IMAGE: PayloadImage<{ include_bytes!(env!("PAYLOAD_MICRO")).len() }> =
    PayloadImage(*include_bytes!(env!("PAYLOAD_MICRO")));

#[link_section = ".guest_main"]
static MAIN_IMAGE: PayloadImage<{ include_bytes!(env!("PAYLOAD_MAIN")).len() }> =
    PayloadImage(*include_bytes!(env!("PAYLOAD_MAIN")));

/// The microkernel payload, resident at its final address.
pub fn micro_image() -> &'static [u8] {
    &MICRO_IMAGE.0
}

/// The main guest payload at its embedded location; copied to its target
/// window by the boot hart.
pub fn main_image() -> &'static [u8] {
    &MAIN_IMAGE.0
}

//! LiteX UART console, used only for diagnostics during boot.

use core::fmt;
use core::ptr::{read_volatile, write_volatile};

use spin::Mutex;

// Register indices; u32-wide registers at stride 4.
const REG_RXTX: usize = 0;
const REG_TXFULL: usize = 1;
const REG_RXEMPTY: usize = 2;
const REG_EV_PENDING: usize = 4;

/// RX event bit in EV_PENDING.
const EV_RX: u32 = 0x02;

pub struct LitexUart {
    base: usize,
}

impl LitexUart {
    /// # Safety
    ///
    /// `base` must point at a LiteX UART register block.
    pub const unsafe fn new(base: usize) -> Self {
        Self { base }
    }

    #[inline]
    unsafe fn read_reg(&self, reg: usize) -> u32 {
        read_volatile((self.base + reg * 4) as *const u32)
    }

    #[inline]
    unsafe fn write_reg(&mut self, reg: usize, value: u32) {
        write_volatile((self.base + reg * 4) as *mut u32, value);
    }

    /// Transmit one byte, blocking while the TX buffer is full.
    pub fn put_byte(&mut self, byte: u8) {
        // SAFETY: construction vouched for the register block.
        unsafe {
            while self.read_reg(REG_TXFULL) & 1 != 0 {}
            self.write_reg(REG_RXTX, u32::from(byte));
        }
    }

    /// Non-blocking receive; acks the RX event when a byte is taken.
    #[allow(dead_code)]
    pub fn get_byte(&mut self) -> Option<u8> {
        // SAFETY: construction vouched for the register block.
        unsafe {
            if self.read_reg(REG_RXEMPTY) & 1 != 0 {
                return None;
            }
            let byte = self.read_reg(REG_RXTX) as u8;
            self.write_reg(REG_EV_PENDING, EV_RX);
            Some(byte)
        }
    }
}

static CONSOLE: Mutex<Option<LitexUart>> = Mutex::new(None);

/// Discover the UART in the inbound description blob and install it.
/// Boots without one stay silent; the console is not part of the
/// isolation guarantee.
pub fn init(dtb_addr: usize) {
    // SAFETY: the firmware hands every hart a readable blob pointer; the
    // parser only reads.
    let Ok(tree) = (unsafe { fdt::Fdt::from_ptr(dtb_addr as *const u8) }) else {
        return;
    };
    let Some(node) = tree.find_compatible(&["litex,uart0"]) else {
        return;
    };
    let Some(region) = node.reg().and_then(|mut regs| regs.next()) else {
        return;
    };
    let base = region.starting_address as usize;
    // SAFETY: the address comes from the platform's own description.
    *CONSOLE.lock() = Some(unsafe { LitexUart::new(base) });
}

/// Byte-sink handle for the logger.
pub struct Writer;

impl fmt::Write for Writer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let mut console = CONSOLE.lock();
        if let Some(uart) = console.as_mut() {
            for byte in s.bytes() {
                if byte == b'\n' {
                    uart.put_byte(b'\r');
                }
                uart.put_byte(byte);
            }
        }
        Ok(())
    }
}

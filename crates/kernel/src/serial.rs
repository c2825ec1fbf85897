//! Serial output for the kernel log.

use crate::console::Console;

/// I/O port of the first PC serial line.
#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
const COM1: u16 = 0x3F8;

pub struct SerialWriter {
    #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
    port: uart_16550::SerialPort,
    #[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
    port: uart_16550::MmioSerialPort,
}

impl core::fmt::Write for SerialWriter {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        self.port.write_str(s)
    }
}

// cSpell:ignore uart
#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
pub fn init(console: &Console) {
    // SAFETY: COM1 is a standard port and nothing else in the kernel drives it.
    let mut port = unsafe { uart_16550::SerialPort::new(COM1) };
    port.init();
    console.attach_serial(SerialWriter { port });
}

#[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
pub fn init(console: &Console, address: usize) {
    let mut port = unsafe { uart_16550::MmioSerialPort::new(address) };
    port.init();
    console.attach_serial(SerialWriter { port });
}

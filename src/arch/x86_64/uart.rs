/*
 * 16550 UART Driver
 *
 * Register-level driver for the PC serial port. The console layer owns one
 * instance for COM1 and uses it for both kernel log output and interrupt-
 * driven input.
 */

use bitflags::bitflags;
use x86_64::instructions::port::Port;

bitflags! {
    /// Interrupt enable flags
    struct IntEnFlags: u8 {
        const RECEIVED = 1;
        const SENT = 1 << 1;
        const ERRORED = 1 << 2;
        const STATUS_CHANGE = 1 << 3;
        // 4 to 7 are unused
    }
}

bitflags! {
    /// Line status flags
    struct LineStsFlags: u8 {
        const INPUT_FULL = 1;
        // 1 to 4 unknown
        const OUTPUT_EMPTY = 1 << 5;
        // 6 and 7 unknown
    }
}

/// Serial port representation.
pub struct SerialPort {
    data: Port<u8>,       // Data register, read to receive, write to send
    int_en: Port<u8>,     // Interrupt enable
    fifo_ctrl: Port<u8>,  // FIFO control
    line_ctrl: Port<u8>,  // Line control
    modem_ctrl: Port<u8>, // Modem control
    line_sts: Port<u8>,   // Line status (read only)
}

impl SerialPort {
    /// Creates a new serial port instance for the given base port address.
    pub const fn new(base: u16) -> SerialPort {
        SerialPort {
            data: Port::new(base),
            int_en: Port::new(base + 1),
            fifo_ctrl: Port::new(base + 2),
            line_ctrl: Port::new(base + 3),
            modem_ctrl: Port::new(base + 4),
            line_sts: Port::new(base + 5),
        }
    }

    /// Initializes the serial port: 115200 baud 8N1, FIFO on, receive
    /// interrupt enabled.
    pub fn init(&mut self) {
        unsafe {
            self.int_en.write(0x00);
            self.line_ctrl.write(0x80); // DLAB on
            self.data.write(0x01); // divisor = 1
            self.int_en.write(0x00);
            self.line_ctrl.write(0x03); // 8N1, DLAB off
            self.fifo_ctrl.write(0xc7);
            self.modem_ctrl.write(0x0b);
            self.int_en.write(IntEnFlags::RECEIVED.bits());
        }
    }

    fn line_sts(&mut self) -> LineStsFlags {
        LineStsFlags::from_bits_truncate(unsafe { self.line_sts.read() })
    }

    /// Reads a pending byte, or None if the receive buffer is empty.
    pub fn receive(&mut self) -> Option<u8> {
        if self.line_sts().contains(LineStsFlags::INPUT_FULL) {
            Some(unsafe { self.data.read() })
        } else {
            None
        }
    }

    /// Sends a byte of data through the serial port.
    pub fn send(&mut self, data: u8) {
        while !self.line_sts().contains(LineStsFlags::OUTPUT_EMPTY) {}
        unsafe { self.data.write(data) }
    }

    /// Writes a byte, translating newline and backspace for terminals.
    pub fn write(&mut self, b: u8) {
        match b {
            8 | 0x7f => {
                self.send(8);
                self.send(b' ');
                self.send(8);
            }
            b'\n' => {
                self.send(b'\r');
                self.send(b'\n');
            }
            _ => {
                self.send(b);
            }
        }
    }
}

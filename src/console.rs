/*
 * Kernel Console
 *
 * Serial-backed console. Output goes straight to COM1. Input arrives either
 * through the COM1 receive interrupt (IRQ 4) or by polling, and is staged in
 * a small ring buffer that `getc` drains without blocking.
 */

use core::fmt;

use heapless::Deque;
use spin::Mutex;

use crate::arch::x86_64::uart::SerialPort;

const COM1: u16 = 0x3f8;

/// Bytes the input ring can hold before keystrokes are dropped
const CONSBUF_SIZE: usize = 512;

static PORT: Mutex<SerialPort> = Mutex::new(SerialPort::new(COM1));
static INPUT: Mutex<Deque<u8, CONSBUF_SIZE>> = Mutex::new(Deque::new());

pub fn init() {
    PORT.lock().init();
}

/// Drain the UART receive FIFO into the input ring. Called from the serial
/// interrupt handler and from `getc` (to pick up input with interrupts off).
pub fn interrupt() {
    let mut port = PORT.lock();
    let mut input = INPUT.lock();
    while let Some(b) = port.receive() {
        // Normalise CR to NL like the original console did
        let b = if b == b'\r' { b'\n' } else { b };
        if input.push_back(b).is_err() {
            break; // ring full, drop the rest
        }
    }
}

/// Return one buffered input character without blocking, or 0 if there is
/// no input waiting.
pub fn getc() -> u8 {
    interrupt();
    INPUT.lock().pop_front().unwrap_or(0)
}

pub fn putc(b: u8) {
    PORT.lock().write(b);
}

/// Print raw bytes (user output from sys_cputs; not UTF-8 validated).
pub fn put_bytes(s: &[u8]) {
    let mut port = PORT.lock();
    for &b in s {
        port.write(b);
    }
}

struct ConsoleWriter;

impl fmt::Write for ConsoleWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        put_bytes(s.as_bytes());
        Ok(())
    }
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    use fmt::Write;
    let _ = write!(ConsoleWriter, "{}", args);
}

#[macro_export]
macro_rules! cprint {
    ($($arg:tt)*) => ($crate::console::_print(format_args!($($arg)*)));
}

#[macro_export]
macro_rules! cprintln {
    () => ($crate::cprint!("\n"));
    ($($arg:tt)*) => ($crate::cprint!("{}\n", format_args!($($arg)*)));
}

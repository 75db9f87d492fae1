//! Bare-metal x86_64 pieces: interrupt flag, halt, idle loop, COM1 log sink

use core::fmt;

use spin::Mutex;
use uart_16550::SerialPort;
use x86_64::instructions::{hlt, interrupts};

use crate::logger::{self, LogLevel, LogSink};

/// Disable interrupts, returning whether they were enabled.
#[inline]
pub fn disable_interrupts() -> bool {
    let were_enabled = interrupts::are_enabled();
    interrupts::disable();
    were_enabled
}

#[inline]
pub fn restore_interrupts(was_enabled: bool) {
    if was_enabled {
        interrupts::enable();
    }
}

#[inline]
pub fn halt() {
    hlt();
}

/// Body of every CPU's permanent idle thread.
pub extern "C" fn idle_loop() -> ! {
    loop {
        interrupts::enable_and_hlt();
    }
}

/// Address to hand to `CpuOps::idle_entry`.
pub fn idle_entry() -> usize {
    idle_loop as usize
}

struct SerialPortWrapper {
    port: Option<SerialPort>,
}

impl SerialPortWrapper {
    const fn new() -> Self {
        Self { port: None }
    }

    fn ensure_init(&mut self) {
        if self.port.is_none() {
            let mut port = unsafe { SerialPort::new(0x3F8) };
            port.init();
            self.port = Some(port);
        }
    }
}

impl fmt::Write for SerialPortWrapper {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.ensure_init();
        match self.port.as_mut() {
            Some(port) => fmt::Write::write_str(port, s),
            None => Ok(()),
        }
    }
}

/// COM1 log sink with level colours
pub struct SerialSink {
    port: Mutex<SerialPortWrapper>,
}

impl SerialSink {
    pub const fn new() -> Self {
        Self {
            port: Mutex::new(SerialPortWrapper::new()),
        }
    }
}

impl LogSink for SerialSink {
    fn write_line(&self, level: LogLevel, args: fmt::Arguments<'_>) {
        // Interrupt handlers log too; never spin on a port held by the code
        // they interrupted.
        let were_enabled = disable_interrupts();
        if let Some(mut port) = self.port.try_lock() {
            let _ = logger::format_line(&mut *port, level, args, true);
        }
        restore_interrupts(were_enabled);
    }
}

static SERIAL_SINK: SerialSink = SerialSink::new();

/// Send kernel log output to COM1.
pub fn install_serial_logger() {
    logger::install(&SERIAL_SINK);
}

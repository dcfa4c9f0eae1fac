//! Polled 16550 UART on COM1, used as the `log` sink on bare metal.

use lazy_static::lazy_static;
use log::{LevelFilter, Log, Metadata, Record};
use spin::Mutex;
use x86_64::instructions::interrupts;
use x86_64::instructions::port::Port;

use crate::logger;

const COM1: u16 = 0x3F8;

// register offsets from the base port
const DATA: u16 = 0;
const INTERRUPT_ENABLE: u16 = 1;
const FIFO_CONTROL: u16 = 2;
const LINE_CONTROL: u16 = 3;
const MODEM_CONTROL: u16 = 4;
const LINE_STATUS: u16 = 5;

const DIVISOR_LATCH: u8 = 0x80;
const EIGHT_N_ONE: u8 = 0x03;
const TRANSMIT_EMPTY: u8 = 0x20;

/// 38400 baud.
const BAUD_DIVISOR: u16 = 3;

pub struct Uart {
    base: u16,
}

impl Uart {
    /// # Safety
    ///
    /// `base` must be the I/O base of a 16550 compatible UART that nothing
    /// else drives.
    pub const unsafe fn new(base: u16) -> Self {
        Uart { base }
    }

    fn write_reg(&mut self, offset: u16, value: u8) {
        unsafe { Port::<u8>::new(self.base + offset).write(value) }
    }

    fn read_reg(&mut self, offset: u16) -> u8 {
        unsafe { Port::<u8>::new(self.base + offset).read() }
    }

    /// 8N1, FIFOs on, no UART interrupts: output is polled.
    pub fn configure(&mut self, divisor: u16) {
        let [low, high] = divisor.to_le_bytes();
        self.write_reg(INTERRUPT_ENABLE, 0);
        self.write_reg(LINE_CONTROL, DIVISOR_LATCH);
        self.write_reg(DATA, low);
        self.write_reg(INTERRUPT_ENABLE, high);
        self.write_reg(LINE_CONTROL, EIGHT_N_ONE);
        self.write_reg(FIFO_CONTROL, 0xC7);
        self.write_reg(MODEM_CONTROL, 0x0B);
    }

    pub fn put(&mut self, byte: u8) {
        while self.read_reg(LINE_STATUS) & TRANSMIT_EMPTY == 0 {
            core::hint::spin_loop();
        }
        self.write_reg(DATA, byte);
    }
}

impl core::fmt::Write for Uart {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        s.bytes().for_each(|b| self.put(b));
        Ok(())
    }
}

lazy_static! {
    static ref CONSOLE: Mutex<Uart> = {
        let mut uart = unsafe { Uart::new(COM1) };
        uart.configure(BAUD_DIVISOR);
        Mutex::new(uart)
    };
}

struct UartLogger;

impl Log for UartLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            // also reached from the timer path
            interrupts::without_interrupts(|| {
                let _ = logger::write_record(&mut *CONSOLE.lock(), record);
            });
        }
    }

    fn flush(&self) {}
}

static LOGGER: UartLogger = UartLogger;

/// Bring up COM1 and route `log` records to it.
pub fn init(level: LevelFilter) {
    lazy_static::initialize(&CONSOLE);
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(level);
    }
}

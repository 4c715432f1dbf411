use crate::serial_println;
use bootloader_x86_64_common::logger::LockedLogger;
use conquer_once::spin::OnceCell;
use core::fmt::{self, Write};
use log::{Level, LevelFilter, Log, Metadata, Record};
use spin::Mutex;

pub static FRAMEBUFFER_LOGGER: OnceCell<LockedLogger> = OnceCell::uninit();

const BUFFER_SIZE: usize = 8192;

/// Holds early boot log lines until the serial port is up.
struct LogBuffer {
    buffer: [u8; BUFFER_SIZE],
    position: usize,
}

impl LogBuffer {
    const fn new() -> Self {
        Self { buffer: [0; BUFFER_SIZE], position: 0 }
    }

    fn push(&mut self, s: &str) {
        let bytes = s.as_bytes();
        let remaining = BUFFER_SIZE - self.position;
        if bytes.len() > remaining {
            return;
        }
        self.buffer[self.position..self.position + bytes.len()].copy_from_slice(bytes);
        self.position += bytes.len();
    }

    fn contents(&self) -> &str {
        core::str::from_utf8(&self.buffer[..self.position]).unwrap_or("<invalid UTF-8>")
    }
}

impl Write for LogBuffer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.push(s);
        Ok(())
    }
}

enum LoggerState {
    Buffering,
    SerialReady,
    FullyInitialized,
}

pub struct CombinedLogger {
    buffer: Mutex<LogBuffer>,
    state: Mutex<LoggerState>,
}

impl CombinedLogger {
    const fn new() -> Self {
        CombinedLogger {
            buffer: Mutex::new(LogBuffer::new()),
            state: Mutex::new(LoggerState::Buffering),
        }
    }

    pub fn serial_ready(&self) {
        let mut state = self.state.lock();
        let buffer = self.buffer.lock();
        if buffer.position > 0 {
            serial_println!("=== buffered boot messages ===");
            serial_println!("{}", buffer.contents());
            serial_println!("=== end buffered messages ===");
        }
        *state = LoggerState::SerialReady;
    }

    pub fn fully_ready(&self) {
        *self.state.lock() = LoggerState::FullyInitialized;
    }
}

impl Log for CombinedLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= Level::Trace
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let state = match self.state.try_lock() {
            Some(state) => state,
            None => {
                serial_println!("[intr] {}: {}", record.target(), record.args());
                return;
            }
        };

        match *state {
            LoggerState::Buffering => {
                drop(state);
                if let Some(mut buffer) = self.buffer.try_lock() {
                    let _ = write!(&mut *buffer, "[{:>5}] {}: {}\n", record.level(), record.target(), record.args());
                } else {
                    serial_println!("[buf] {}: {}", record.target(), record.args());
                }
            }
            LoggerState::SerialReady => {
                drop(state);
                serial_println!("[{:>5}] {}: {}", record.level(), record.target(), record.args());
            }
            LoggerState::FullyInitialized => {
                drop(state);
                serial_println!("[{:>5}] {}: {}", record.level(), record.target(), record.args());
                if let Some(fb_logger) = FRAMEBUFFER_LOGGER.get() {
                    fb_logger.log(record);
                }
            }
        }
    }

    fn flush(&self) {
        if let Some(fb_logger) = FRAMEBUFFER_LOGGER.get() {
            fb_logger.flush();
        }
    }
}

pub static COMBINED_LOGGER: CombinedLogger = CombinedLogger::new();

/// Installs the logger before the serial port is initialized; messages are
/// buffered and replayed once `serial_ready()` runs.
pub fn init_early() {
    log::set_logger(&COMBINED_LOGGER).expect("logger already set");
    log::set_max_level(LevelFilter::Trace);
}

pub fn serial_ready() {
    COMBINED_LOGGER.serial_ready();
}

pub fn init_framebuffer(buffer: &'static mut [u8], info: bootloader_api::info::FrameBufferInfo) {
    let _ = FRAMEBUFFER_LOGGER.get_or_init(move || LockedLogger::new(buffer, info, true, false));
    COMBINED_LOGGER.fully_ready();
    log::info!("logger fully initialized: serial + framebuffer");
}

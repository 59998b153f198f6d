//! # Debug-Console Logging
//!
//! A [`log`] backend for kernels running under QEMU. Bytes go out through
//! the debug port (`0x402`, enabled with `-debugcon`), which needs no device
//! initialization and works from the first instruction — exactly what early
//! memory-management bring-up wants.
//!
//! Every subsystem logs through the `log` facade; this crate is only the
//! sink. Install it once during boot:
//!
//! ```ignore
//! kernel_debugcon::init(log::LevelFilter::Debug).unwrap();
//! log::info!("paging up");
//! ```
//!
//! Without the `asm` feature the port write compiles to nothing, so the
//! crate links (and hosted tests run) on any target.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

use core::fmt::{self, Write};
use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};

/// QEMU's debug-console port.
pub const DEBUGCON_PORT: u16 = 0x402;

#[cfg(feature = "asm")]
#[inline]
fn putc(byte: u8) {
    // SAFETY: the debug port is write-only and side-effect free beyond
    // emitting the byte on the host.
    unsafe { kernel_registers::port::outb(DEBUGCON_PORT, byte) }
}

#[cfg(not(feature = "asm"))]
#[inline]
fn putc(_byte: u8) {}

/// `fmt::Write` sink over the debug port.
pub struct DebugconSink;

impl Write for DebugconSink {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            putc(byte);
        }
        Ok(())
    }
}

/// Format directly to the debug console, bypassing the `log` facade.
///
/// Useful before [`init`] has run or inside the logger itself.
#[macro_export]
macro_rules! debugcon_print {
    ($($arg:tt)*) => {{
        use ::core::fmt::Write;
        let _ = ::core::write!($crate::DebugconSink, $($arg)*);
    }};
}

/// The `log::Log` implementation writing `[LEVEL] target: message` lines.
pub struct DebugconLogger;

static LOGGER: DebugconLogger = DebugconLogger;

/// Install the debug-console logger. Call once during early init.
///
/// # Errors
/// Fails if another logger is already installed.
pub fn init(max_level: LevelFilter) -> Result<(), SetLoggerError> {
    log::set_logger(&LOGGER)?;
    log::set_max_level(max_level);
    Ok(())
}

impl Log for DebugconLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        debugcon_print!("[{}] {}: {}\n", record.level(), record.target(), record.args());
    }

    fn flush(&self) {
        // nothing buffered
    }
}

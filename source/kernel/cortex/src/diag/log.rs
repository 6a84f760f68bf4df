// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Kernel backend for the `log` facade
//! OWNERS: @kernel-team
//! STATUS: Functional
//! PUBLIC API: init(), KernelLogger, recent_lines() (host)
//! DEPENDS_ON: hal::Console (target), log
//! INVARIANTS: Single-line emission as `[LEVEL target] message`; init() is idempotent;
//!             the host ring never holds more than HOST_RING_CAPACITY lines

use core::fmt::Write;

use ::log::{LevelFilter, Log, Metadata, Record};

/// Logger installed by [`init`].
pub struct KernelLogger;

static LOGGER: KernelLogger = KernelLogger;

/// Installs the kernel logger and applies the compile-time `LOG` level.
pub fn init() {
    let _ = ::log::set_logger(&LOGGER);
    ::log::set_max_level(level_from(option_env!("LOG")));
}

fn level_from(raw: Option<&str>) -> LevelFilter {
    raw.and_then(|value| value.parse().ok()).unwrap_or(LevelFilter::Info)
}

impl Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= ::log::max_level()
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        emit(record);
    }

    fn flush(&self) {}
}

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
fn emit(record: &Record<'_>) {
    struct ConsoleWriter;

    impl Write for ConsoleWriter {
        fn write_str(&mut self, s: &str) -> core::fmt::Result {
            use crate::hal::Console;
            let console = crate::hal::machine().console();
            for &byte in s.as_bytes() {
                if byte == b'\n' {
                    console.putchar(b'\r');
                }
                console.putchar(byte);
            }
            Ok(())
        }
    }

    let _ = writeln!(ConsoleWriter, "[{} {}] {}", record.level(), record.target(), record.args());
}

#[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
pub use host_ring::recent_lines;

#[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
fn emit(record: &Record<'_>) {
    let mut line = alloc::string::String::new();
    let _ = write!(line, "[{} {}] {}", record.level(), record.target(), record.args());
    host_ring::push(line);
}

#[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
mod host_ring {
    extern crate alloc;

    use alloc::collections::VecDeque;
    use alloc::string::String;
    use alloc::vec::Vec;

    use spin::Mutex;

    pub const HOST_RING_CAPACITY: usize = 256;

    pub(super) struct Ring {
        lines: VecDeque<String>,
    }

    impl Ring {
        pub(super) const fn new() -> Self {
            Self { lines: VecDeque::new() }
        }

        pub(super) fn push(&mut self, line: String) {
            if self.lines.len() == HOST_RING_CAPACITY {
                self.lines.pop_front();
            }
            self.lines.push_back(line);
        }

        pub(super) fn lines(&self) -> Vec<String> {
            self.lines.iter().cloned().collect()
        }
    }

    static RING: Mutex<Ring> = Mutex::new(Ring::new());

    pub(super) fn push(line: String) {
        RING.lock().push(line);
    }

    /// Most recent log lines, oldest first.
    pub fn recent_lines() -> Vec<String> {
        RING.lock().lines()
    }
}

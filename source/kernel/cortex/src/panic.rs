// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Panic handler for bare-metal kernel images
//! OWNERS: @kernel-team
//! PUBLIC API: panic handler (no_std, `panic_handler` feature)
//! DEPENDS_ON: hal::Console, sbi-rt
//! INVARIANTS: Writes straight to the console without the logger or the heap; never returns

use core::fmt::{self, Write};
use core::panic::PanicInfo;

use crate::hal::{self, Console};

struct PanicWriter;

impl Write for PanicWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let console = hal::machine().console();
        for &byte in s.as_bytes() {
            if byte == b'\n' {
                console.putchar(b'\r');
            }
            console.putchar(byte);
        }
        Ok(())
    }
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    let mut w = PanicWriter;
    match info.location() {
        Some(location) => {
            let _ = writeln!(w, "\nPANIC at {}:{}: {}", location.file(), location.line(), info.message());
        }
        None => {
            let _ = writeln!(w, "\nPANIC: {}", info.message());
        }
    }
    let _ = sbi_rt::system_reset(sbi_rt::Shutdown, sbi_rt::SystemFailure);
    loop {
        core::hint::spin_loop();
    }
}

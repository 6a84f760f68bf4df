// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Console-backed stdin and stdout.

use super::{File, FileError, UserBuffer};
use crate::hal::{self, Console};

pub struct Stdin;

pub struct Stdout;

impl File for Stdin {
    fn readable(&self) -> bool {
        true
    }

    fn writable(&self) -> bool {
        false
    }

    /// Fills as much of `buf` as the console has buffered.
    fn read(&self, mut buf: UserBuffer) -> Result<usize, FileError> {
        let console = hal::machine().console();
        let mut count = 0;
        for slot in buf.bytes_mut() {
            match console.getchar() {
                Some(byte) => {
                    *slot = byte;
                    count += 1;
                }
                None => break,
            }
        }
        if count == 0 {
            return Err(FileError::WouldBlock);
        }
        Ok(count)
    }

    fn write(&self, _buf: UserBuffer) -> Result<usize, FileError> {
        Ok(0)
    }
}

impl File for Stdout {
    fn readable(&self) -> bool {
        false
    }

    fn writable(&self) -> bool {
        true
    }

    fn read(&self, _buf: UserBuffer) -> Result<usize, FileError> {
        Ok(0)
    }

    fn write(&self, buf: UserBuffer) -> Result<usize, FileError> {
        let console = hal::machine().console();
        for byte in buf.bytes() {
            console.putchar(byte);
        }
        Ok(buf.len())
    }
}

// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Anonymous pipes over a fixed ring buffer.
//!
//! Each end holds the shared ring; the ring holds weak references back to
//! both ends so either side can tell when its peer has been closed.

extern crate alloc;

use alloc::sync::{Arc, Weak};

use spin::Mutex;

use super::{File, FileError, UserBuffer};

const RING_BUFFER_SIZE: usize = 32;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RingBufferStatus {
    Full,
    Empty,
    Normal,
}

pub struct PipeRingBuffer {
    arr: [u8; RING_BUFFER_SIZE],
    head: usize,
    tail: usize,
    status: RingBufferStatus,
    read_end: Option<Weak<Pipe>>,
    write_end: Option<Weak<Pipe>>,
}

impl PipeRingBuffer {
    fn new() -> Self {
        Self {
            arr: [0; RING_BUFFER_SIZE],
            head: 0,
            tail: 0,
            status: RingBufferStatus::Empty,
            read_end: None,
            write_end: None,
        }
    }

    fn write_byte(&mut self, byte: u8) {
        self.status = RingBufferStatus::Normal;
        self.arr[self.tail] = byte;
        self.tail = (self.tail + 1) % RING_BUFFER_SIZE;
        if self.tail == self.head {
            self.status = RingBufferStatus::Full;
        }
    }

    fn read_byte(&mut self) -> u8 {
        self.status = RingBufferStatus::Normal;
        let byte = self.arr[self.head];
        self.head = (self.head + 1) % RING_BUFFER_SIZE;
        if self.head == self.tail {
            self.status = RingBufferStatus::Empty;
        }
        byte
    }

    fn available_read(&self) -> usize {
        match self.status {
            RingBufferStatus::Empty => 0,
            RingBufferStatus::Full => RING_BUFFER_SIZE,
            RingBufferStatus::Normal => (self.tail + RING_BUFFER_SIZE - self.head) % RING_BUFFER_SIZE,
        }
    }

    fn available_write(&self) -> usize {
        RING_BUFFER_SIZE - self.available_read()
    }

    fn all_write_ends_closed(&self) -> bool {
        self.write_end.as_ref().map_or(true, |end| end.upgrade().is_none())
    }

    fn all_read_ends_closed(&self) -> bool {
        self.read_end.as_ref().map_or(true, |end| end.upgrade().is_none())
    }

    pub fn status(&self) -> RingBufferStatus {
        self.status
    }
}

/// One end of a pipe.
pub struct Pipe {
    readable: bool,
    writable: bool,
    buffer: Arc<Mutex<PipeRingBuffer>>,
}

/// Returns `(read end, write end)`.
pub fn make_pipe() -> (Arc<Pipe>, Arc<Pipe>) {
    let buffer = Arc::new(Mutex::new(PipeRingBuffer::new()));
    let read_end = Arc::new(Pipe { readable: true, writable: false, buffer: buffer.clone() });
    let write_end = Arc::new(Pipe { readable: false, writable: true, buffer: buffer.clone() });
    {
        let mut ring = buffer.lock();
        ring.read_end = Some(Arc::downgrade(&read_end));
        ring.write_end = Some(Arc::downgrade(&write_end));
    }
    (read_end, write_end)
}

impl File for Pipe {
    fn readable(&self) -> bool {
        self.readable
    }

    fn writable(&self) -> bool {
        self.writable
    }

    fn read(&self, mut buf: UserBuffer) -> Result<usize, FileError> {
        let want = buf.len();
        let mut ring = self.buffer.lock();
        let available = ring.available_read();
        if available == 0 {
            if ring.all_write_ends_closed() {
                return Ok(0);
            }
            if want > 0 {
                return Err(FileError::WouldBlock);
            }
        }
        let mut count = 0;
        for slot in buf.bytes_mut().take(available) {
            *slot = ring.read_byte();
            count += 1;
        }
        Ok(count)
    }

    fn write(&self, buf: UserBuffer) -> Result<usize, FileError> {
        let mut ring = self.buffer.lock();
        if ring.all_read_ends_closed() {
            return Err(FileError::BrokenPipe);
        }
        let room = ring.available_write();
        if room == 0 && !buf.is_empty() {
            return Err(FileError::WouldBlock);
        }
        let mut count = 0;
        for byte in buf.bytes().take(room) {
            ring.write_byte(byte);
            count += 1;
        }
        Ok(count)
    }
}

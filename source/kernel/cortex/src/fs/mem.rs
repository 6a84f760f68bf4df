// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! In-memory flat file system used for program images and scratch files.

extern crate alloc;

use alloc::collections::BTreeMap;
use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Mutex;

use super::{File, FileError, FileSystem, OpenFlags, UserBuffer};

#[derive(Default)]
pub struct MemInode {
    data: Mutex<Vec<u8>>,
}

/// Open description of a [`MemInode`] with its own cursor.
pub struct MemFile {
    inode: Arc<MemInode>,
    offset: Mutex<usize>,
    readable: bool,
    writable: bool,
}

impl File for MemFile {
    fn readable(&self) -> bool {
        self.readable
    }

    fn writable(&self) -> bool {
        self.writable
    }

    fn read(&self, mut buf: UserBuffer) -> Result<usize, FileError> {
        let data = self.inode.data.lock();
        let mut offset = self.offset.lock();
        let start = (*offset).min(data.len());
        let mut count = 0;
        for (slot, byte) in buf.bytes_mut().zip(&data[start..]) {
            *slot = *byte;
            count += 1;
        }
        *offset = start + count;
        Ok(count)
    }

    fn write(&self, buf: UserBuffer) -> Result<usize, FileError> {
        let mut data = self.inode.data.lock();
        let mut offset = self.offset.lock();
        let end = *offset + buf.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        for (i, byte) in buf.bytes().enumerate() {
            data[*offset + i] = byte;
        }
        *offset = end;
        Ok(buf.len())
    }
}

#[derive(Default)]
pub struct MemFs {
    files: Mutex<BTreeMap<String, Arc<MemInode>>>,
}

impl MemFs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates or replaces `path` with `contents`.
    pub fn insert(&self, path: &str, contents: Vec<u8>) {
        let inode = Arc::new(MemInode { data: Mutex::new(contents) });
        self.files.lock().insert(path.to_string(), inode);
    }

    pub fn contains(&self, path: &str) -> bool {
        self.files.lock().contains_key(path)
    }
}

impl FileSystem for MemFs {
    fn open(&self, path: &str, flags: OpenFlags) -> Option<Arc<dyn File>> {
        let (readable, writable) = flags.read_write();
        let mut files = self.files.lock();
        let inode = match files.get(path) {
            Some(inode) => {
                if flags.contains(OpenFlags::TRUNC) {
                    inode.data.lock().clear();
                }
                inode.clone()
            }
            None if flags.contains(OpenFlags::CREATE) => {
                let inode = Arc::new(MemInode::default());
                files.insert(path.to_string(), inode.clone());
                inode
            }
            None => return None,
        };
        Some(Arc::new(MemFile { inode, offset: Mutex::new(0), readable, writable }))
    }

    fn load(&self, path: &str) -> Option<Vec<u8>> {
        self.files.lock().get(path).map(|inode| inode.data.lock().clone())
    }
}

// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Typed random-access reads and writes over a fixed-length byte buffer.
//!
//! Anything that is `Seek` can back a store: a `File` (usually behind a
//! `BufReader`) for the archive being signed, or a `Cursor<Vec<u8>>` for the
//! archive being rebuilt. The store remembers the length it was created with
//! and refuses to read or write past it. Only [ByteStore::append] grows it.

use std::io::{self, Read, Seek, SeekFrom, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use resign_common::*;

/// Largest piece moved at once by [ByteStore::copy_range_to].
const COPY_BUFFER_SIZE: usize = 1024 * 1024;

pub struct ByteStore<T> {
    inner: T,
    position: u64,
    length: u64
}

impl<T: Seek> ByteStore<T> {
    /// Wraps `inner`, taking its current end as the store's length. The cursor
    /// starts at 0.
    pub fn new(mut inner: T) -> Result<ByteStore<T>> {
        let length = inner.seek(SeekFrom::End(0))?;
        inner.seek(SeekFrom::Start(0))?;
        Ok(ByteStore {
            inner,
            position: 0,
            length
        })
    }

    pub fn len(&self) -> u64 {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    /// Moves the cursor to an absolute position. Seeking to exactly
    /// [ByteStore::len] is allowed, since that's where appends happen.
    pub fn seek(&mut self, position: u64) -> Result<()> {
        if position > self.length {
            return Err(ResignError::OutOfRange {
                position,
                requested: 0,
                length: self.length
            });
        }
        self.inner.seek(SeekFrom::Start(position))?;
        self.position = position;
        Ok(())
    }

    pub fn into_inner(self) -> T {
        self.inner
    }

    // Runs one fixed-size transfer at the cursor. If it fails partway the
    // inner cursor is put back, so `position` stays the truth either way.
    fn transfer<V>(&mut self, len: u64, op: impl FnOnce(&mut T) -> io::Result<V>) -> Result<V> {
        self.ensure_available(len)?;
        match op(&mut self.inner) {
            Ok(value) => {
                self.position += len;
                Ok(value)
            }
            Err(e) => {
                self.inner.seek(SeekFrom::Start(self.position))?;
                Err(e.into())
            }
        }
    }

    fn ensure_available(&self, requested: u64) -> Result<()> {
        match self.position.checked_add(requested) {
            Some(end) if end <= self.length => Ok(()),
            _ => Err(ResignError::OutOfRange {
                position: self.position,
                requested,
                length: self.length
            })
        }
    }
}

impl<T: Read + Seek> ByteStore<T> {
    pub fn read_u16(&mut self) -> Result<u16> {
        self.transfer(2, |inner| inner.read_u16::<LittleEndian>())
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        self.transfer(4, |inner| inner.read_u32::<LittleEndian>())
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        self.transfer(4, |inner| inner.read_i32::<LittleEndian>())
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        self.transfer(8, |inner| inner.read_u64::<LittleEndian>())
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        self.transfer(8, |inner| inner.read_i64::<LittleEndian>())
    }

    /// Fills `buf` completely from the cursor.
    pub fn read_into(&mut self, buf: &mut [u8]) -> Result<()> {
        self.transfer(buf.len() as u64, |inner| inner.read_exact(buf))
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0; len];
        self.read_into(&mut buf)?;
        Ok(buf)
    }

    /// Reads a fixed-length ASCII field, such as the signing block magic.
    pub fn read_string(&mut self, len: usize) -> Result<String> {
        let start = self.position;
        let bytes = self.read_bytes(len)?;
        if !bytes.is_ascii() {
            return Err(ResignError::NotAscii(start));
        }
        Ok(bytes.into_iter().map(char::from).collect())
    }

    /// Streams `len` bytes starting at `start` into `dest` at its cursor,
    /// without holding more than one piece in memory.
    pub fn copy_range_to<U: Write + Seek>(
        &mut self,
        dest: &mut ByteStore<U>,
        start: u64,
        len: u64
    ) -> Result<()> {
        self.seek(start)?;
        self.ensure_available(len)?;
        dest.ensure_available(len)?;

        let mut buf = vec![0; (len as usize).min(COPY_BUFFER_SIZE)];
        let mut remaining = len;
        while remaining > 0 {
            let piece = &mut buf[..(remaining as usize).min(COPY_BUFFER_SIZE)];
            self.read_into(piece)?;
            dest.write_bytes(piece)?;
            remaining -= piece.len() as u64;
        }
        Ok(())
    }
}

impl<T: Write + Seek> ByteStore<T> {
    pub fn write_u16(&mut self, value: u16) -> Result<()> {
        self.transfer(2, |inner| inner.write_u16::<LittleEndian>(value))
    }

    pub fn write_u32(&mut self, value: u32) -> Result<()> {
        self.transfer(4, |inner| inner.write_u32::<LittleEndian>(value))
    }

    pub fn write_i32(&mut self, value: i32) -> Result<()> {
        self.transfer(4, |inner| inner.write_i32::<LittleEndian>(value))
    }

    pub fn write_u64(&mut self, value: u64) -> Result<()> {
        self.transfer(8, |inner| inner.write_u64::<LittleEndian>(value))
    }

    pub fn write_i64(&mut self, value: i64) -> Result<()> {
        self.transfer(8, |inner| inner.write_i64::<LittleEndian>(value))
    }

    /// Overwrites bytes at the cursor. The store must already be big enough.
    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.transfer(bytes.len() as u64, |inner| inner.write_all(bytes))
    }

    /// Writes `bytes` after the current end, growing the store. The cursor
    /// ends up at the new end.
    pub fn append(&mut self, bytes: &[u8]) -> Result<()> {
        self.inner.seek(SeekFrom::Start(self.length))?;
        self.inner.write_all(bytes)?;
        self.length += bytes.len() as u64;
        self.position = self.length;
        Ok(())
    }
}

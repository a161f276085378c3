use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};

use crate::mem;

/// Growable byte vector the assembler emits into. Patches may rewrite
/// prior bytes but never extend past the current length.
pub struct Buffer {
    data: Vec<u8>,
    minimum_capacity: usize,
}

impl Buffer {
    pub fn new(minimum_capacity: usize) -> Buffer {
        Buffer {
            data: Vec::new(),
            minimum_capacity,
        }
    }

    fn ensure(&mut self, space: usize) {
        let needed = self.data.len() + space;

        if needed > self.data.capacity() {
            let new_capacity = needed
                .max(self.minimum_capacity)
                .max(self.data.capacity() * 2);
            self.data.reserve_exact(new_capacity - self.data.len());
        }
    }

    pub fn append_u8(&mut self, value: u8) {
        self.ensure(1);
        self.data.write_u8(value).unwrap();
    }

    pub fn append_u16(&mut self, value: u16) {
        self.ensure(2);
        self.data.write_u16::<LittleEndian>(value).unwrap();
    }

    pub fn append_u32(&mut self, value: u32) {
        self.ensure(4);
        self.data.write_u32::<LittleEndian>(value).unwrap();
    }

    pub fn append_u64(&mut self, value: u64) {
        self.ensure(8);
        self.data.write_u64::<LittleEndian>(value).unwrap();
    }

    /// Emits 4 bytes on 32-bit targets, 8 bytes on 64-bit targets.
    pub fn append_word(&mut self, value: usize) {
        if mem::ptr_width() == 8 {
            self.append_u64(value as u64);
        } else {
            self.append_u32(value as u32);
        }
    }

    pub fn patch_u16(&mut self, offset: usize, value: u16) {
        assert!(offset + 2 <= self.data.len());
        LittleEndian::write_u16(&mut self.data[offset..], value);
    }

    pub fn patch_u32(&mut self, offset: usize, value: u32) {
        assert!(offset + 4 <= self.data.len());
        LittleEndian::write_u32(&mut self.data[offset..], value);
    }

    pub fn read_u16(&self, offset: usize) -> u16 {
        assert!(offset + 2 <= self.data.len());
        LittleEndian::read_u16(&self.data[offset..])
    }

    pub fn read_u32(&self, offset: usize) -> u32 {
        assert!(offset + 4 <= self.data.len());
        LittleEndian::read_u32(&self.data[offset..])
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn copy_to(&self, target: &mut [u8]) {
        target[..self.data.len()].copy_from_slice(&self.data);
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }
}

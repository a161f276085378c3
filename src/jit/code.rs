//! The finished product of a compilation: executable bytes plus the
//! native line-number and exception-handler side-tables, packed into a
//! single allocation.
//!
//! `CompiledCode` owns the allocation (it lives in the machine's code
//! arena); `CodeRef` is the raw image address that gets published into
//! a method's compiled slot and that emitted code does address
//! arithmetic on (`slot + COMPILED_BODY` is the executable body).

use std::ptr;
use std::slice;

use crate::mem::{self, CodeMemory};

/// Byte offset of the executable body within the image.
pub const COMPILED_BODY: usize = 12;

#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct NativeLineNumber {
    pub ip: u32,
    pub line: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct NativeExceptionHandler {
    pub start: u32,
    pub end: u32,
    pub ip: u32,

    /// 1-based index into the method's constant pool, 0 for catch-all.
    pub catch_type: u32,
}

/// Address of a compiled-code image:
///
/// ```text
/// offset 0   : u32 code_length
/// offset 4   : u32 line_table_length_bytes
/// offset 8   : u32 handler_table_length_bytes
/// offset 12  : code bytes
/// pad(12+code_length)          : line-number entries
/// pad(.. + line_table_length)  : handler entries
/// ```
///
/// The image is immutable after construction; the side-table offsets
/// are padded to the word size relative to the body.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CodeRef(*const u8);

impl CodeRef {
    pub fn null() -> CodeRef {
        CodeRef(ptr::null())
    }

    pub fn from_usize(value: usize) -> CodeRef {
        CodeRef(value as *const u8)
    }

    pub fn to_usize(self) -> usize {
        self.0 as usize
    }

    pub fn is_null(self) -> bool {
        self.0.is_null()
    }

    pub fn ptr(self) -> *const u8 {
        self.0
    }

    /// Start of the executable body.
    pub fn entry(self) -> *const u8 {
        unsafe { self.0.add(COMPILED_BODY) }
    }

    pub fn code_length(self) -> usize {
        unsafe { *(self.0 as *const u32) as usize }
    }

    fn line_table_bytes(self) -> usize {
        unsafe { *(self.0.add(4) as *const u32) as usize }
    }

    fn handler_table_bytes(self) -> usize {
        unsafe { *(self.0.add(8) as *const u32) as usize }
    }

    pub fn line_number_table_length(self) -> usize {
        self.line_table_bytes() / std::mem::size_of::<NativeLineNumber>()
    }

    pub fn exception_handler_table_length(self) -> usize {
        self.handler_table_bytes() / std::mem::size_of::<NativeExceptionHandler>()
    }

    pub fn line_numbers<'a>(self) -> &'a [NativeLineNumber] {
        unsafe {
            let lines = self.entry().add(mem::pad(self.code_length()));
            slice::from_raw_parts(
                lines as *const NativeLineNumber,
                self.line_number_table_length(),
            )
        }
    }

    pub fn exception_handlers<'a>(self) -> &'a [NativeExceptionHandler] {
        unsafe {
            let table = self
                .entry()
                .add(mem::pad(self.code_length()))
                .add(mem::pad(self.line_table_bytes()));
            slice::from_raw_parts(
                table as *const NativeExceptionHandler,
                self.exception_handler_table_length(),
            )
        }
    }

    /// Source line for a machine-IP offset: the last transition at or
    /// before the offset, 0 when unknown.
    pub fn line_for_offset(self, offset: u32) -> u32 {
        let mut line = 0;

        for entry in self.line_numbers() {
            if entry.ip > offset {
                break;
            }

            line = entry.line;
        }

        line
    }

    /// Copies the code bytes out, for template inspection in tests.
    pub fn code_bytes(self) -> Vec<u8> {
        unsafe { slice::from_raw_parts(self.entry(), self.code_length()) }.to_vec()
    }
}

/// Owner of one image; lives in the machine's code arena for the life
/// of the process.
pub struct CompiledCode {
    mem: CodeMemory,
}

impl CompiledCode {
    pub fn from_parts(
        code: &[u8],
        line_numbers: &[NativeLineNumber],
        handlers: &[NativeExceptionHandler],
    ) -> CompiledCode {
        let line_bytes = line_numbers.len() * std::mem::size_of::<NativeLineNumber>();
        let handler_bytes = handlers.len() * std::mem::size_of::<NativeExceptionHandler>();

        let size = COMPILED_BODY
            + mem::pad(code.len())
            + mem::pad(line_bytes)
            + mem::pad(handler_bytes);

        let memory = CodeMemory::new(size);
        let base = memory.ptr();

        unsafe {
            *(base as *mut u32) = code.len() as u32;
            *(base.add(4) as *mut u32) = line_bytes as u32;
            *(base.add(8) as *mut u32) = handler_bytes as u32;

            let body = base.add(COMPILED_BODY);
            ptr::copy_nonoverlapping(code.as_ptr(), body, code.len());

            let lines = body.add(mem::pad(code.len()));
            ptr::copy_nonoverlapping(line_numbers.as_ptr() as *const u8, lines, line_bytes);

            let table = lines.add(mem::pad(line_bytes));
            ptr::copy_nonoverlapping(handlers.as_ptr() as *const u8, table, handler_bytes);
        }

        CompiledCode { mem: memory }
    }

    pub fn code_ref(&self) -> CodeRef {
        CodeRef(self.mem.ptr())
    }

    pub fn entry(&self) -> *const u8 {
        self.code_ref().entry()
    }
}

// The image is immutable after construction and the allocation lives in
// the machine's code arena.
unsafe impl Send for CompiledCode {}
unsafe impl Sync for CompiledCode {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_bit_exact() {
        let code = [0x90u8, 0x90, 0xc3];
        let lines = [NativeLineNumber { ip: 0, line: 7 }];
        let handlers = [NativeExceptionHandler {
            start: 0,
            end: 3,
            ip: 2,
            catch_type: 0,
        }];

        let compiled = CompiledCode::from_parts(&code, &lines, &handlers);
        let image = compiled.code_ref();

        unsafe {
            let base = image.ptr();
            assert_eq!(3, *(base as *const u32));
            assert_eq!(8, *(base.add(4) as *const u32));
            assert_eq!(16, *(base.add(8) as *const u32));
            assert_eq!(0x90, *base.add(COMPILED_BODY));
            assert_eq!(0xc3, *base.add(COMPILED_BODY + 2));
        }

        assert_eq!(3, image.code_length());
        assert_eq!(1, image.line_number_table_length());
        assert_eq!(1, image.exception_handler_table_length());
        assert_eq!(lines[0], image.line_numbers()[0]);
        assert_eq!(handlers[0], image.exception_handlers()[0]);
    }

    #[test]
    fn test_empty_tables() {
        let compiled = CompiledCode::from_parts(&[0xc3], &[], &[]);
        let image = compiled.code_ref();

        assert_eq!(1, image.code_length());
        assert_eq!(0, image.line_number_table_length());
        assert_eq!(0, image.exception_handler_table_length());
        assert!(image.exception_handlers().is_empty());
    }

    #[test]
    fn test_line_for_offset() {
        let lines = [
            NativeLineNumber { ip: 0, line: 3 },
            NativeLineNumber { ip: 10, line: 4 },
            NativeLineNumber { ip: 20, line: 9 },
        ];
        let compiled = CompiledCode::from_parts(&[0u8; 32], &lines, &[]);
        let image = compiled.code_ref();

        assert_eq!(3, image.line_for_offset(0));
        assert_eq!(3, image.line_for_offset(9));
        assert_eq!(4, image.line_for_offset(10));
        assert_eq!(4, image.line_for_offset(19));
        assert_eq!(9, image.line_for_offset(31));
    }
}

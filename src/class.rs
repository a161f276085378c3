//! The parsed-class-file side of the world: classes, fields, methods and
//! the pre-linked constant pool. Fields read by emitted code sit at the
//! front of their `#[repr(C)]` structs and are addressed via `offset_of!`.

use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use memoffset::offset_of;

use crate::bytecode::{ACC_NATIVE, ACC_STATIC};
use crate::jit::code::CodeRef;
use crate::mem;
use crate::object::{Header, Obj};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TypeCode {
    Byte,
    Boolean,
    Char,
    Short,
    Int,
    Float,
    Long,
    Double,
    Object,
    Void,
}

impl TypeCode {
    pub fn is_category2(self) -> bool {
        matches!(self, TypeCode::Long | TypeCode::Double)
    }

    /// Width in bytes of a field or array element of this type.
    pub fn width(self) -> i32 {
        match self {
            TypeCode::Byte | TypeCode::Boolean => 1,
            TypeCode::Char | TypeCode::Short => 2,
            TypeCode::Int | TypeCode::Float => 4,
            TypeCode::Long | TypeCode::Double => 8,
            TypeCode::Object => mem::ptr_width(),
            TypeCode::Void => 0,
        }
    }
}

// class vm-flag bits
pub const NEED_INIT: u8 = 0x01;
pub const INIT_IN_PROGRESS: u8 = 0x02;

#[repr(C)]
pub struct Class {
    pub header: Header,

    /// Array object holding method words; virtual dispatch loads
    /// `[class + offset_of_vtable] + ARRAY_DATA + index * word`.
    pub vtable: *mut Obj,

    pub super_class: *mut Class,

    /// Array object backing the static slot table.
    pub statics: *mut Obj,

    pub initializer: *mut Method,
    pub instance_size: u32,
    pub flags: u16,
    pub vm_flags: AtomicU8,
    pub name: String,
    pub methods: Vec<*mut Method>,
    pub fields: Vec<*mut Field>,
}

impl Class {
    pub fn offset_of_vtable() -> i32 {
        offset_of!(Class, vtable) as i32
    }

    pub fn needs_init(&self) -> bool {
        self.vm_flags.load(Ordering::Relaxed) & NEED_INIT != 0
    }

    pub fn init_in_progress(&self) -> bool {
        self.vm_flags.load(Ordering::Relaxed) & INIT_IN_PROGRESS != 0
    }

    pub fn set_vm_flags(&self, flags: u8) {
        self.vm_flags.store(flags, Ordering::Relaxed);
    }
}

pub struct Field {
    pub class: *mut Class,
    pub code: TypeCode,

    /// Byte offset: from the object start for instance fields, into the
    /// static table body for static fields.
    pub offset: i32,

    pub flags: u16,
    pub name: String,
}

impl Field {
    pub fn is_static(&self) -> bool {
        self.flags & ACC_STATIC != 0
    }
}

#[repr(C)]
pub struct Method {
    /// Compiled-code image address: the stub until lazy compilation
    /// publishes the real body. Loaded by call templates and by the
    /// stub itself, which jump to `image + COMPILED_BODY`.
    pub compiled: AtomicUsize,

    /// Before compilation: unused. Afterwards: the constant-pool array
    /// object the body addresses through the pool register.
    pub code: AtomicUsize,

    /// Cached foreign entry point for native methods.
    pub native_entry: AtomicUsize,

    pub class: *mut Class,
    pub flags: u16,
    pub is_virtual: bool,

    /// Index into the declaring class's vtable.
    pub offset: u32,

    pub return_code: TypeCode,

    /// Parameter area words, receiver included; category-2 arguments
    /// count two.
    pub param_footprint: u16,

    pub param_count: u16,
    pub name: String,
    pub descriptor: String,

    /// Retained bytecode; the compiler and the unwinder (max_locals)
    /// read it, the `code` slot is taken over by the pool.
    pub source: Option<CodeAttr>,
}

impl Method {
    pub fn offset_of_compiled() -> i32 {
        offset_of!(Method, compiled) as i32
    }

    pub fn offset_of_code() -> i32 {
        offset_of!(Method, code) as i32
    }

    pub fn is_static(&self) -> bool {
        self.flags & ACC_STATIC != 0
    }

    pub fn is_native(&self) -> bool {
        self.flags & ACC_NATIVE != 0
    }

    pub fn compiled_code(&self) -> CodeRef {
        CodeRef::from_usize(self.compiled.load(Ordering::Acquire))
    }

    pub fn set_compiled_code(&self, code: CodeRef) {
        self.compiled.store(code.to_usize(), Ordering::Release);
    }

    pub fn pool_object(&self) -> *mut Obj {
        self.code.load(Ordering::Acquire) as *mut Obj
    }

    pub fn set_pool_object(&self, pool: *mut Obj) {
        self.code.store(pool as usize, Ordering::Release);
    }

    pub fn max_locals(&self) -> u16 {
        self.source.as_ref().map(|code| code.max_locals).unwrap_or(0)
    }

    pub fn full_name(&self) -> String {
        let class_name = if self.class.is_null() {
            "?"
        } else {
            unsafe { &(*self.class).name }
        };

        format!("{}.{}", class_name, self.name)
    }
}

/// One pre-linked constant-pool entry. Resolution of symbolic entries
/// into these handles belongs to the linker; an `Unresolved` entry left
/// behind surfaces as a compile-time resolution failure.
pub enum PoolEntry {
    ClassRef(*mut Class),
    FieldRef(*mut Field),
    MethodRef(*mut Method),
    Int(i32),
    Float(f32),
    Str(*mut Obj),
    Unresolved,
}

pub struct SourceHandler {
    pub start: u16,
    pub end: u16,
    pub ip: u16,

    /// 1-based pool index of the catch class, 0 for catch-all.
    pub catch_type: u16,
}

pub struct CodeAttr {
    pub body: Vec<u8>,
    pub max_locals: u16,
    pub pool: Vec<PoolEntry>,
    pub handlers: Vec<SourceHandler>,

    /// `(bytecode ip, source line)`, sorted by ip.
    pub line_numbers: Vec<(u16, u16)>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jit_visible_offsets() {
        assert_eq!(0, Method::offset_of_compiled());
        assert_eq!(mem::ptr_width(), Method::offset_of_code());
        assert_eq!(mem::ptr_width(), Class::offset_of_vtable());
    }

    #[test]
    fn test_type_code_width() {
        assert_eq!(1, TypeCode::Boolean.width());
        assert_eq!(2, TypeCode::Char.width());
        assert_eq!(4, TypeCode::Int.width());
        assert_eq!(8, TypeCode::Long.width());
        assert_eq!(mem::ptr_width(), TypeCode::Object.width());
    }
}

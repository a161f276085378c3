//! Fixtures and builders for tests: a machine with a processor and one
//! thread, plus shorthand for defining classes, methods and fields the
//! way a class loader would.

use std::ptr;
use std::sync::atomic::{AtomicU8, AtomicUsize};
use std::sync::Arc;

use crate::bytecode::{ACC_NATIVE, ACC_STATIC};
use crate::class::{Class, CodeAttr, Field, Method, TypeCode};
use crate::descriptor;
use crate::machine::Machine;
use crate::object::{self, Header, IntObj, LongObj, Obj};
use crate::processor::{make_processor, Processor};
use crate::threads::Thread;

pub struct Fixture {
    pub machine: Arc<Machine>,
    pub processor: Processor,
    pub thread: *mut Thread,
}

pub fn fixture() -> Fixture {
    let _ = env_logger::builder().is_test(true).try_init();

    let machine = Machine::new();
    let processor = make_processor(machine.clone());
    let thread = processor.make_thread(ptr::null_mut(), ptr::null_mut());

    Fixture {
        machine,
        processor,
        thread,
    }
}

pub fn define_class(f: &Fixture, name: &str, super_class: *mut Class) -> *mut Class {
    f.machine.add_class(Box::new(Class {
        header: Header { class: ptr::null() },
        vtable: ptr::null_mut(),
        super_class,
        statics: ptr::null_mut(),
        initializer: ptr::null_mut(),
        instance_size: Header::size() as u32,
        flags: 0,
        vm_flags: AtomicU8::new(0),
        name: name.to_string(),
        methods: Vec::new(),
        fields: Vec::new(),
    }))
}

pub fn define_method(
    f: &Fixture,
    class: *mut Class,
    name: &str,
    descriptor: &str,
    flags: u16,
    source: Option<CodeAttr>,
) -> *mut Method {
    let is_static = flags & ACC_STATIC != 0;
    let compiled = if flags & ACC_NATIVE != 0 {
        f.processor.native_invoker()
    } else {
        f.processor.method_stub()
    };

    let method = f.machine.add_method(Box::new(Method {
        compiled: AtomicUsize::new(compiled.to_usize()),
        code: AtomicUsize::new(0),
        native_entry: AtomicUsize::new(0),
        class,
        flags,
        is_virtual: false,
        offset: 0,
        return_code: descriptor::return_code(descriptor),
        param_footprint: descriptor::slot_footprint(descriptor, is_static) as u16,
        param_count: descriptor::parameter_count(descriptor) as u16,
        name: name.to_string(),
        descriptor: descriptor.to_string(),
        source,
    }));

    unsafe {
        (*class).methods.push(method);
    }

    method
}

/// Installs a vtable: the methods become virtual with their slot index.
pub fn set_vtable(f: &Fixture, class: *mut Class, methods: &[*mut Method]) {
    let table = f.machine.heap.make_array(
        f.machine.types.object_array,
        crate::mem::ptr_width_usize(),
        methods.len(),
    );

    unsafe {
        for (index, &method) in methods.iter().enumerate() {
            (*method).is_virtual = true;
            (*method).offset = index as u32;
            object::array_set::<usize>(table, index, method as usize);
        }

        (*class).vtable = table;
    }
}

/// Backs the class's static fields with a slot table of the given byte
/// size.
pub fn set_statics(f: &Fixture, class: *mut Class, bytes: usize) {
    let table = f
        .machine
        .heap
        .make_array(f.machine.types.object_array, 1, bytes);

    unsafe {
        (*class).statics = table;
    }
}

pub fn define_field(
    f: &Fixture,
    class: *mut Class,
    name: &str,
    code: TypeCode,
    offset: i32,
    flags: u16,
) -> *mut Field {
    let field = f.machine.add_field(Box::new(Field {
        class,
        code,
        offset,
        flags,
        name: name.to_string(),
    }));

    unsafe {
        (*class).fields.push(field);
    }

    field
}

pub fn code_attr(body: Vec<u8>, max_locals: u16, pool: Vec<crate::class::PoolEntry>) -> CodeAttr {
    CodeAttr {
        body,
        max_locals,
        pool,
        handlers: Vec::new(),
        line_numbers: Vec::new(),
    }
}

pub fn int_value(obj: *const Obj) -> i32 {
    assert!(!obj.is_null());
    unsafe { (*(obj as *const IntObj)).value }
}

pub fn long_value(obj: *const Obj) -> i64 {
    assert!(!obj.is_null());
    unsafe { (*(obj as *const LongObj)).value }
}

pub fn pending_exception_class(t: *const Thread) -> *const Class {
    unsafe {
        assert!((*t).has_exception(), "no exception pending");
        (*(*t).exception).class()
    }
}

pub fn clear_exception(t: *mut Thread) {
    unsafe {
        (*t).exception = ptr::null_mut();
    }
}

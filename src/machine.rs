//! The VM context: the class lock, the heap, the arenas owning classes,
//! methods and compiled code, the built-in classes, and the lazily
//! generated trampolines.

use std::collections::HashMap;
use std::ptr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, ReentrantMutex};

use crate::args::{invoke, ArgumentList};
use crate::bytecode::{T_BOOLEAN, T_BYTE, T_CHAR, T_DOUBLE, T_FLOAT, T_INT, T_LONG, T_SHORT};
use crate::class::{Class, Field, Method, INIT_IN_PROGRESS, NEED_INIT};
use crate::error::VmError;
use crate::heap::Heap;
use crate::jit::code::{CodeRef, CompiledCode};
use crate::jit::native::{AbiType, GateKey};
use crate::jit::{entry, native, stub};
use crate::object::{self, Header, IntObj, LongObj, Obj, ThrowableObj};
use crate::threads::Thread;

/// Entry-point signature of the managed-entry gate.
pub type EntryGateFn = extern "C" fn(*const u8, *const usize, usize) -> u64;

/// Entry-point signature of a per-signature foreign-call gate.
pub type FfiGateFn = extern "C" fn(usize, *const usize) -> u64;

pub struct BuiltinTypes {
    pub throwable: *mut Class,
    pub null_pointer: *mut Class,
    pub array_index: *mut Class,
    pub class_cast: *mut Class,
    pub negative_array_size: *mut Class,
    pub unsatisfied_link: *mut Class,
    pub initializer_error: *mut Class,
    pub linkage_error: *mut Class,
    pub int_box: *mut Class,
    pub long_box: *mut Class,
    pub string: *mut Class,
    pub bool_array: *mut Class,
    pub char_array: *mut Class,
    pub float_array: *mut Class,
    pub double_array: *mut Class,
    pub byte_array: *mut Class,
    pub short_array: *mut Class,
    pub int_array: *mut Class,
    pub long_array: *mut Class,
    pub object_array: *mut Class,
}

pub struct Machine {
    /// Serializes compilation and class initialization. Reentrant:
    /// initialization triggered from inside a compilation re-enters.
    pub class_lock: ReentrantMutex<()>,

    pub heap: Heap,
    pub types: BuiltinTypes,

    code_arena: Mutex<Vec<Box<CompiledCode>>>,
    class_arena: Mutex<Vec<Box<Class>>>,
    method_arena: Mutex<Vec<Box<Method>>>,
    field_arena: Mutex<Vec<Box<Field>>>,

    classes: Mutex<HashMap<String, *mut Class>>,
    natives: Mutex<HashMap<String, usize>>,
    pub threads: Mutex<Vec<*mut Thread>>,

    method_stub: Mutex<Option<CodeRef>>,
    native_invoker: Mutex<Option<CodeRef>>,
    entry_gate: Mutex<Option<CodeRef>>,
    resume_thunk: Mutex<Option<CodeRef>>,
    return_thunk: Mutex<Option<CodeRef>>,
    ffi_gates: Mutex<HashMap<GateKey, usize>>,
}

unsafe impl Send for Machine {}
unsafe impl Sync for Machine {}

impl Machine {
    pub fn new() -> Arc<Machine> {
        let mut class_arena: Vec<Box<Class>> = Vec::new();
        let mut name_map: HashMap<String, *mut Class> = HashMap::new();

        let mut define = |name: &str, super_class: *mut Class, instance_size: usize| {
            let mut class = Box::new(Class {
                header: Header { class: ptr::null() },
                vtable: ptr::null_mut(),
                super_class,
                statics: ptr::null_mut(),
                initializer: ptr::null_mut(),
                instance_size: instance_size as u32,
                flags: 0,
                vm_flags: AtomicU8::new(0),
                name: name.to_string(),
                methods: Vec::new(),
                fields: Vec::new(),
            });

            let ptr = &mut *class as *mut Class;
            class_arena.push(class);
            name_map.insert(name.to_string(), ptr);
            ptr
        };

        let throwable = define("java/lang/Throwable", ptr::null_mut(), ThrowableObj::instance_size());
        let ex_size = ThrowableObj::instance_size();

        let types = BuiltinTypes {
            throwable,
            null_pointer: define("java/lang/NullPointerException", throwable, ex_size),
            array_index: define(
                "java/lang/ArrayIndexOutOfBoundsException",
                throwable,
                ex_size,
            ),
            class_cast: define("java/lang/ClassCastException", throwable, ex_size),
            negative_array_size: define(
                "java/lang/NegativeArraySizeException",
                throwable,
                ex_size,
            ),
            unsatisfied_link: define("java/lang/UnsatisfiedLinkError", throwable, ex_size),
            initializer_error: define(
                "java/lang/ExceptionInInitializerError",
                throwable,
                ex_size,
            ),
            linkage_error: define("java/lang/LinkageError", throwable, ex_size),
            int_box: define("java/lang/Integer", ptr::null_mut(), std::mem::size_of::<IntObj>()),
            long_box: define("java/lang/Long", ptr::null_mut(), std::mem::size_of::<LongObj>()),
            string: define("java/lang/String", ptr::null_mut(), 0),
            bool_array: define("[Z", ptr::null_mut(), 0),
            char_array: define("[C", ptr::null_mut(), 0),
            float_array: define("[F", ptr::null_mut(), 0),
            double_array: define("[D", ptr::null_mut(), 0),
            byte_array: define("[B", ptr::null_mut(), 0),
            short_array: define("[S", ptr::null_mut(), 0),
            int_array: define("[I", ptr::null_mut(), 0),
            long_array: define("[J", ptr::null_mut(), 0),
            object_array: define("[Ljava/lang/Object;", ptr::null_mut(), 0),
        };

        Arc::new(Machine {
            class_lock: ReentrantMutex::new(()),
            heap: Heap::new(),
            types,
            code_arena: Mutex::new(Vec::new()),
            class_arena: Mutex::new(class_arena),
            method_arena: Mutex::new(Vec::new()),
            field_arena: Mutex::new(Vec::new()),
            classes: Mutex::new(name_map),
            natives: Mutex::new(HashMap::new()),
            threads: Mutex::new(Vec::new()),
            method_stub: Mutex::new(None),
            native_invoker: Mutex::new(None),
            entry_gate: Mutex::new(None),
            resume_thunk: Mutex::new(None),
            return_thunk: Mutex::new(None),
            ffi_gates: Mutex::new(HashMap::new()),
        })
    }

    pub fn add_class(&self, class: Box<Class>) -> *mut Class {
        let mut arena = self.class_arena.lock();
        arena.push(class);
        let ptr = &mut **arena.last_mut().unwrap() as *mut Class;

        self.classes.lock().insert(unsafe { (*ptr).name.clone() }, ptr);

        ptr
    }

    pub fn add_method(&self, method: Box<Method>) -> *mut Method {
        let mut arena = self.method_arena.lock();
        arena.push(method);
        &mut **arena.last_mut().unwrap() as *mut Method
    }

    pub fn add_field(&self, field: Box<Field>) -> *mut Field {
        let mut arena = self.field_arena.lock();
        arena.push(field);
        &mut **arena.last_mut().unwrap() as *mut Field
    }

    pub fn find_class(&self, name: &str) -> Option<*mut Class> {
        self.classes.lock().get(name).copied()
    }

    pub fn register_native(&self, name: &str, entry: usize) {
        self.natives.lock().insert(name.to_string(), entry);
    }

    pub fn native_symbol(&self, name: &str) -> Option<usize> {
        self.natives.lock().get(name).copied()
    }

    /// Moves a compiled image into the process-lifetime code arena.
    pub fn alloc_code(&self, code: CompiledCode) -> CodeRef {
        let mut arena = self.code_arena.lock();
        let image = code.code_ref();
        arena.push(Box::new(code));
        image
    }

    fn cached_code(
        &self,
        cache: &Mutex<Option<CodeRef>>,
        generate: impl FnOnce(&Machine) -> CompiledCode,
    ) -> CodeRef {
        let mut slot = cache.lock();

        if slot.is_none() {
            *slot = Some(self.alloc_code(generate(self)));
        }

        slot.unwrap()
    }

    /// The shared lazy-compilation trampoline.
    pub fn method_stub(&self) -> CodeRef {
        self.cached_code(&self.method_stub, stub::generate_method_stub)
    }

    /// The shared managed-to-foreign trampoline.
    pub fn native_invoker(&self) -> CodeRef {
        self.cached_code(&self.native_invoker, native::generate_native_invoker)
    }

    pub fn entry_gate(&self) -> EntryGateFn {
        let code = self.cached_code(&self.entry_gate, entry::generate_entry_gate);
        unsafe { std::mem::transmute(code.entry()) }
    }

    pub fn resume_thunk(&self) -> *const u8 {
        self.cached_code(&self.resume_thunk, entry::generate_resume_thunk)
            .entry()
    }

    pub fn return_thunk(&self) -> *const u8 {
        self.cached_code(&self.return_thunk, entry::generate_return_thunk)
            .entry()
    }

    /// Foreign-call gate for one marshalled signature, generated on
    /// first use and cached.
    pub fn ffi_gate(&self, types: &[AbiType], return_type: AbiType) -> FfiGateFn {
        let key: GateKey = (types.to_vec(), return_type);
        let mut gates = self.ffi_gates.lock();

        let entry = match gates.get(&key) {
            Some(&entry) => entry,
            None => {
                let code = native::generate_ffi_gate(&key);
                let entry = self.alloc_code(code).entry() as usize;
                gates.insert(key, entry);
                entry
            }
        };

        unsafe { std::mem::transmute(entry) }
    }

    /// Drops the cached trampolines and gates. Compiled method bodies
    /// stay; they are arena-owned for the life of the machine.
    pub fn drop_trampolines(&self) {
        *self.method_stub.lock() = None;
        *self.native_invoker.lock() = None;
        *self.entry_gate.lock() = None;
        *self.resume_thunk.lock() = None;
        *self.return_thunk.lock() = None;
        self.ffi_gates.lock().clear();
    }

    pub fn make_int(&self, value: i32) -> *mut Obj {
        let obj = self
            .heap
            .make_object(self.types.int_box, std::mem::size_of::<IntObj>());

        unsafe {
            (*(obj as *mut IntObj)).value = value;
        }

        obj
    }

    pub fn make_long(&self, value: i64) -> *mut Obj {
        let obj = self
            .heap
            .make_object(self.types.long_box, std::mem::size_of::<LongObj>());

        unsafe {
            (*(obj as *mut LongObj)).value = value;
        }

        obj
    }

    pub fn make_string(&self, value: &str) -> *mut Obj {
        let obj = self
            .heap
            .make_array(self.types.string, 1, value.len());

        unsafe {
            ptr::copy_nonoverlapping(
                value.as_ptr(),
                object::array_data::<u8>(obj),
                value.len(),
            );
        }

        obj
    }

    /// Reads a string object back out; test and diagnostics helper.
    pub fn str_value(&self, obj: *const Obj) -> String {
        if obj.is_null() {
            return String::new();
        }

        unsafe {
            let len = object::array_length(obj);
            let data = object::array_data::<u8>(obj as *mut Obj);
            String::from_utf8_lossy(std::slice::from_raw_parts(data, len)).into_owned()
        }
    }

    pub fn make_exception(&self, class: *mut Class, message: Option<&str>) -> *mut Obj {
        let obj = self
            .heap
            .make_object(class, unsafe { (*class).instance_size as usize });

        if let Some(message) = message {
            unsafe {
                (*(obj as *mut ThrowableObj)).message = self.make_string(message);
            }
        }

        obj
    }

    pub fn make_exception_with_cause(
        &self,
        class: *mut Class,
        message: Option<&str>,
        cause: *mut Obj,
    ) -> *mut Obj {
        let obj = self.make_exception(class, message);

        unsafe {
            (*(obj as *mut ThrowableObj)).cause = cause;
        }

        obj
    }

    pub fn make_null_pointer_exception(&self) -> *mut Obj {
        self.make_exception(self.types.null_pointer, None)
    }

    /// The pending-exception object for a compile-time resolution
    /// failure.
    pub fn exception_for(&self, err: &VmError) -> *mut Obj {
        self.make_exception(self.types.linkage_error, Some(&err.to_string()))
    }

    /// Array class and element size for a `newarray` type tag.
    pub fn array_class_for_tag(&self, tag: u8) -> (*mut Class, usize) {
        match tag {
            T_BOOLEAN => (self.types.bool_array, 1),
            T_CHAR => (self.types.char_array, 2),
            T_FLOAT => (self.types.float_array, 4),
            T_DOUBLE => (self.types.double_array, 8),
            T_BYTE => (self.types.byte_array, 1),
            T_SHORT => (self.types.short_array, 2),
            T_INT => (self.types.int_array, 4),
            T_LONG => (self.types.long_array, 8),
            _ => panic!("unknown array type tag {}", tag),
        }
    }

    /// Double-checked class initialization under the class lock. A
    /// throwing initializer is wrapped in `ExceptionInInitializerError`
    /// and the in-progress bit cleared so the class can be retried.
    pub fn init_class(&self, t: *mut Thread, class: *mut Class) {
        let _guard = self.class_lock.lock();

        unsafe {
            if !(*class).needs_init() || (*class).init_in_progress() {
                return;
            }

            (*class).vm_flags.fetch_or(INIT_IN_PROGRESS, Ordering::Relaxed);

            let initializer = (*class).initializer;

            if !initializer.is_null() {
                let mut list = ArgumentList::from_values(
                    t,
                    ptr::null_mut(),
                    &(*initializer).descriptor,
                    false,
                    &[],
                );
                invoke(t, initializer, &mut list);
            }

            let thread = &mut *t;

            if thread.has_exception() {
                let cause = thread.exception;
                thread.exception = self.make_exception_with_cause(
                    self.types.initializer_error,
                    None,
                    cause,
                );

                (*class)
                    .vm_flags
                    .fetch_and(!INIT_IN_PROGRESS, Ordering::Relaxed);
            } else {
                (*class)
                    .vm_flags
                    .fetch_and(!(NEED_INIT | INIT_IN_PROGRESS), Ordering::Relaxed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_hierarchy() {
        let machine = Machine::new();

        unsafe {
            assert_eq!(
                machine.types.throwable,
                (*machine.types.null_pointer).super_class
            );
            assert!((*machine.types.throwable).super_class.is_null());
        }
    }

    #[test]
    fn test_boxes() {
        let machine = Machine::new();

        unsafe {
            let i = machine.make_int(-7);
            assert_eq!(-7, (*(i as *mut IntObj)).value);

            let l = machine.make_long(1 << 40);
            assert_eq!(1 << 40, (*(l as *mut LongObj)).value);
        }
    }

    #[test]
    fn test_strings_round_trip() {
        let machine = Machine::new();
        let s = machine.make_string("hello");

        assert_eq!("hello", machine.str_value(s));
    }
}

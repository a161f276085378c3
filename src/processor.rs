//! The public surface the rest of the VM drives: thread creation, the
//! cached trampolines, invocation entry points, frame iteration and
//! local-reference management.

use std::ptr;
use std::sync::Arc;

use crate::args::{invoke, ArgumentList, JavaValue};
use crate::class::{Class, Method};
use crate::descriptor;
use crate::error::VmError;
use crate::exception;
use crate::jit::code::CodeRef;
use crate::linker;
use crate::machine::Machine;
use crate::object::Obj;
use crate::threads::{Thread, ThreadState};

/// Root-scan callback; receives the address of each slot holding an
/// object reference.
pub trait RootVisitor {
    fn visit(&mut self, slot: *mut *mut Obj);
}

pub struct Processor {
    machine: Arc<Machine>,
}

pub fn make_processor(machine: Arc<Machine>) -> Processor {
    Processor { machine }
}

impl Processor {
    pub fn machine(&self) -> &Machine {
        &self.machine
    }

    pub fn make_thread(&self, java_thread: *mut Obj, parent: *mut Thread) -> *mut Thread {
        let thread = Box::into_raw(Box::new(Thread::new(
            Arc::as_ptr(&self.machine),
            java_thread,
            parent,
        )));

        self.machine.threads.lock().push(thread);

        thread
    }

    /// The lazy-compile trampoline; freshly created methods point their
    /// compiled slot here.
    pub fn method_stub(&self) -> CodeRef {
        self.machine.method_stub()
    }

    pub fn native_invoker(&self) -> CodeRef {
        self.machine.native_invoker()
    }

    pub fn parameter_footprint(&self, descriptor: &str, is_static: bool) -> usize {
        descriptor::parameter_footprint(descriptor, is_static)
    }

    pub fn init_class(&self, t: *mut Thread, class: *mut Class) {
        self.machine.init_class(t, class);
    }

    /// Walks every thread's argument-list masks and local-reference
    /// slots.
    pub fn visit_objects(&self, visitor: &mut dyn RootVisitor) {
        for &thread in self.machine.threads.lock().iter() {
            unsafe {
                let mut list = (*thread).argument_list;

                while !list.is_null() {
                    (*list).visit_roots(|slot| visitor.visit(slot));
                    list = (*list).next();
                }

                (*thread).handles.visit_slots(|slot| visitor.visit(slot));
            }
        }
    }

    pub fn frame_start(&self, t: *const Thread) -> usize {
        unsafe { (*t).frame }
    }

    pub fn frame_next(&self, frame: usize) -> usize {
        unsafe { exception::frame_next(frame) }
    }

    pub fn frame_valid(&self, frame: usize) -> bool {
        exception::frame_valid(frame)
    }

    pub fn frame_method(&self, frame: usize) -> *mut Method {
        unsafe { exception::frame_method(frame) }
    }

    pub fn frame_ip(&self, t: *const Thread, frame: usize) -> u32 {
        unsafe { exception::frame_ip(t, frame) }
    }

    pub fn make_local_reference(&self, t: *mut Thread, obj: *mut Obj) -> *mut *mut Obj {
        if obj.is_null() {
            return ptr::null_mut();
        }

        unsafe { (*t).handles.push(obj) }
    }

    pub fn dispose_local_reference(&self, reference: *mut *mut Obj) {
        if !reference.is_null() {
            unsafe {
                *reference = ptr::null_mut();
            }
        }
    }

    pub fn invoke_array(
        &self,
        t: *mut Thread,
        method: *mut Method,
        this: *mut Obj,
        arguments: *mut Obj,
    ) -> *mut Obj {
        self.assert_invocable(t, method, this);

        let descriptor = unsafe { (*method).descriptor.clone() };
        let mut list = ArgumentList::from_object_array(t, this, &descriptor, arguments);

        invoke(t, method, &mut list)
    }

    pub fn invoke_list(
        &self,
        t: *mut Thread,
        method: *mut Method,
        this: *mut Obj,
        indirect: bool,
        values: &[JavaValue],
    ) -> *mut Obj {
        self.assert_invocable(t, method, this);

        let descriptor = unsafe { (*method).descriptor.clone() };
        let mut list = ArgumentList::from_values(t, this, &descriptor, indirect, values);

        invoke(t, method, &mut list)
    }

    /// Resolve-then-invoke convenience entry; a failed lookup leaves a
    /// pending exception and returns null.
    pub fn invoke_named(
        &self,
        t: *mut Thread,
        class_name: &str,
        method_name: &str,
        method_descriptor: &str,
        this: *mut Obj,
        values: &[JavaValue],
    ) -> *mut Obj {
        let method = self
            .machine
            .find_class(class_name)
            .and_then(|class| linker::find_method(class, method_name, method_descriptor));

        match method {
            Some(method) => self.invoke_list(t, method, this, false, values),

            None => {
                let err = VmError::NoSuchMethod(format!("{}.{}", class_name, method_name));

                unsafe {
                    (*t).exception = self.machine.exception_for(&err);
                }

                ptr::null_mut()
            }
        }
    }

    /// Frees the cached trampolines and gates, then the processor.
    /// Compiled method bodies stay with the machine's code arena.
    pub fn dispose(self) {
        self.machine.drop_trampolines();
    }

    fn assert_invocable(&self, t: *const Thread, method: *const Method, this: *const Obj) {
        unsafe {
            let state = (*t).state();
            assert!(
                state == ThreadState::Active || state == ThreadState::Exclusive,
                "invocation from {:?} state",
                state
            );

            assert!(
                (*method).is_static() == this.is_null(),
                "receiver mismatch for {}",
                (*method).full_name()
            );
        }
    }
}

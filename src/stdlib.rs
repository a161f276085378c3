//! Runtime helpers called from emitted code. All follow the helper-call
//! protocol: the thread is the first argument, the caller has stored
//! its frame base into `thread.frame` and the resume address into
//! `thread.xpc`.

use crate::class::Class;
use crate::exception::unwind;
use crate::linker;
use crate::object::Obj;
use crate::threads::Thread;

/// Allocates and raises a new instance of an exception class.
pub extern "C" fn throw_new(t: *mut Thread, class: *mut Class) -> ! {
    unsafe {
        let thread = &mut *t;
        thread.exception = thread.machine().make_exception(class, None);
        unwind(t)
    }
}

/// Raises a user-supplied throwable; a null reference raises
/// `NullPointerException` instead.
pub extern "C" fn throw_object(t: *mut Thread, obj: *mut Obj) -> ! {
    unsafe {
        let thread = &mut *t;

        if obj.is_null() {
            thread.exception = thread.machine().make_null_pointer_exception();
        } else {
            thread.exception = obj;
        }

        unwind(t)
    }
}

/// `new`: zeroed instance of a class.
pub extern "C" fn make_new(t: *mut Thread, class: *mut Class) -> *mut Obj {
    unsafe {
        let machine = (*t).machine();
        machine
            .heap
            .make_object(class, (*class).instance_size as usize)
    }
}

/// `anewarray`: cleared reference array. The emitted sign check runs
/// before this call, so the length is non-negative here.
pub extern "C" fn make_blank_object_array(
    t: *mut Thread,
    _element_class: *mut Class,
    length: i64,
) -> *mut Obj {
    unsafe {
        let machine = (*t).machine();
        machine.heap.make_array(
            machine.types.object_array,
            crate::mem::ptr_width_usize(),
            length as usize,
        )
    }
}

/// `newarray`: cleared primitive array for a type tag.
pub extern "C" fn make_blank_array(t: *mut Thread, tag: usize, length: i64) -> *mut Obj {
    unsafe {
        let machine = (*t).machine();
        let (class, element_size) = machine.array_class_for_tag(tag as u8);
        machine.heap.make_array(class, element_size, length as usize)
    }
}

/// `checkcast`/`instanceof` slow path.
pub extern "C" fn is_assignable_from(
    _t: *mut Thread,
    sup: *mut Class,
    sub: *mut Class,
) -> usize {
    linker::is_assignable_from(sup, sub) as usize
}

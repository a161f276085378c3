//! The compiled-frame model, stack walking, and exception unwinding.
//!
//! A frame value is the frame base (RBP) of a compiled method. Relative
//! to it, the caller pushed the thread, the method handle and its own
//! frame base before the call:
//!
//! ```text
//! [frame + 0]   saved caller RBP
//! [frame + 1w]  return address
//! [frame + 2w]  thread
//! [frame + 3w]  method
//! [frame + 4w]  previous frame (linked list, null-terminated)
//! [frame + 5w..] argument words
//! ```

use log::trace;

use crate::class::{Class, Method};
use crate::jit::code::NativeExceptionHandler;
use crate::linker;
use crate::mem;
use crate::object::{ArrayObj, Obj};
use crate::threads::Thread;

pub fn frame_thread_offset() -> i32 {
    2 * mem::ptr_width()
}

pub fn frame_method_offset() -> i32 {
    3 * mem::ptr_width()
}

pub fn frame_next_offset() -> i32 {
    frame_method_offset() + mem::ptr_width()
}

/// Words pushed around every managed call: thread, method, previous
/// frame.
pub fn frame_footprint() -> i32 {
    3 * mem::ptr_width()
}

pub fn frame_valid(frame: usize) -> bool {
    frame != 0
}

pub unsafe fn frame_next(frame: usize) -> usize {
    *((frame + frame_next_offset() as usize) as *const usize)
}

pub unsafe fn frame_method(frame: usize) -> *mut Method {
    *((frame + frame_method_offset() as usize) as *const *mut Method)
}

pub unsafe fn frame_thread(frame: usize) -> *mut Thread {
    *((frame + frame_thread_offset() as usize) as *const *mut Thread)
}

pub unsafe fn frame_return_address(frame: usize) -> usize {
    *((frame + mem::ptr_width_usize()) as *const usize)
}

pub unsafe fn frame_caller_base(frame: usize) -> usize {
    *(frame as *const usize)
}

/// Machine-IP offset of an absolute address within a method's body.
pub unsafe fn address_offset(method: *const Method, address: usize) -> u32 {
    let code = (*method).compiled_code();
    address.wrapping_sub(code.entry() as usize) as u32
}

/// Machine-IP offset at which execution left the given frame. The
/// innermost frame's address was recorded in `thread.xpc` by the
/// helper-call sequence; outer frames use the return address stored in
/// the frame below them.
pub unsafe fn frame_ip(t: *const Thread, frame: usize) -> u32 {
    let mut current = (*t).frame;
    let mut address = (*t).xpc;

    while frame_valid(current) {
        if current == frame {
            return address_offset(frame_method(current), address);
        }

        address = frame_return_address(current);
        current = frame_next(current);
    }

    0
}

unsafe fn find_handler(
    method: *const Method,
    offset: u32,
    exception: *mut Obj,
) -> Option<NativeExceptionHandler> {
    let code = (*method).compiled_code();

    if code.is_null() {
        return None;
    }

    let exception_class = (*exception).class();
    let probe = offset.wrapping_sub(1);

    for handler in code.exception_handlers() {
        if probe < handler.start || probe >= handler.end {
            continue;
        }

        let matches = if handler.catch_type == 0 {
            true
        } else {
            let pool = (*method).pool_object();
            let slot = pool as usize
                + ArrayObj::offset_of_data() as usize
                + (handler.catch_type as usize - 1) * mem::ptr_width_usize();
            let catch_class = *(slot as *const *mut Class);

            linker::is_assignable_from(catch_class, exception_class)
        };

        if matches {
            return Some(*handler);
        }
    }

    None
}

/// Walks frames outward from the thread's current frame, transferring
/// control to the innermost matching handler, or popping out to the
/// nearest native frame, entry boundary or sentinel with the exception
/// left pending. Does not return.
pub unsafe fn unwind(t: *mut Thread) -> ! {
    let exception = (*t).exception;
    assert!(!exception.is_null(), "unwind without pending exception");

    let machine = (*t).machine();
    let word = mem::ptr_width_usize();

    let mut frame = (*t).frame;
    let mut address = (*t).xpc;

    while frame_valid(frame) {
        let method = frame_method(frame);

        if !method.is_null() && !(*method).is_native() && !(*method).compiled_code().is_null() {
            let code = (*method).compiled_code();
            let offset = address.wrapping_sub(code.entry() as usize) as u32;

            if let Some(handler) = find_handler(method, offset, exception) {
                trace!(
                    "resuming at handler +{:#x} of {}",
                    handler.ip,
                    (*method).full_name()
                );

                (*t).frame = frame;
                (*t).exception = std::ptr::null_mut();

                let reserved = ((*method).max_locals() as usize * word)
                    .saturating_sub((*method).param_footprint as usize * word);
                let stack = frame - reserved;
                let target = code.entry() as usize + handler.ip as usize;

                let resume: extern "C" fn(usize, usize, usize, *mut Obj) -> ! =
                    std::mem::transmute(machine.resume_thunk());
                resume(target, frame, stack, exception);
            }
        }

        let next = frame_next(frame);
        let at_boundary = (*t).entry_boundary() == Some(next);
        let next_native =
            frame_valid(next) && !frame_method(next).is_null() && (*frame_method(next)).is_native();

        if !frame_valid(next) || at_boundary || next_native {
            // pop to the caller with the exception pending
            (*t).frame = next;

            let target = frame_return_address(frame);
            let caller_base = frame_caller_base(frame);
            let stack = frame + 2 * word;

            trace!("unwinding out to caller at {:#x}", target);

            let ret: extern "C" fn(usize, usize, usize) -> ! =
                std::mem::transmute(machine.return_thunk());
            ret(target, caller_base, stack);
        }

        address = frame_return_address(frame);
        frame = next;
    }

    panic!("unhandled exception with no remaining frame");
}

//! The lazy-compilation trampoline. Every method starts out with its
//! compiled slot pointing at the shared stub; the first call compiles
//! the method, publishes the body and rewrites direct call sites.

use log::debug;

use crate::class::Method;
use crate::cpu::asm;
use crate::cpu::x64::reg::Reg::{RAX, RBP, RSI, RSP};
use crate::exception::{self, unwind};
use crate::jit::code::{CompiledCode, COMPILED_BODY};
use crate::jit::codegen::{emit_runtime_call, Compiler};
use crate::machine::Machine;
use crate::masm::MacroAssembler;
use crate::mem;
use crate::object::Obj;
use crate::threads::Thread;

/// Prologue identical to a compiled method, a call into the compiler,
/// then a tail jump into the freshly published body so it observes the
/// original caller's return address.
pub fn generate_method_stub(_machine: &Machine) -> CompiledCode {
    let mut masm = MacroAssembler::new();

    asm::emit_pushq_reg(&mut masm, RBP);
    asm::emit_movq_reg_reg(&mut masm, RSP, RBP);

    asm::emit_movq_memq_reg(&mut masm, RBP, exception::frame_method_offset(), RSI);
    emit_runtime_call(&mut masm, compile_method as usize);

    asm::emit_movq_memq_reg(&mut masm, RBP, exception::frame_method_offset(), RAX);
    asm::emit_movq_memq_reg(&mut masm, RAX, Method::offset_of_compiled(), RAX);

    asm::emit_movq_reg_reg(&mut masm, RBP, RSP);
    asm::emit_popq_reg(&mut masm, RBP);

    asm::emit_addq_imm_reg(&mut masm, COMPILED_BODY as i32, RAX);
    asm::emit_jmpq_reg(&mut masm, RAX);

    CompiledCode::from_parts(&masm.data(), &[], &[])
}

pub extern "C" fn compile_method(t: *mut Thread, method: *mut Method) {
    unsafe {
        compile_method2(t, method);

        let thread = &mut *t;

        if thread.has_exception() {
            unwind(t);
        } else if !(*method).is_virtual {
            update_caller(t, method);
        }
    }
}

/// Double-checked compile-and-publish under the class lock. The pool is
/// installed before the code slot; a racing caller observing either the
/// stub or the new body reaches correct code, because the stub simply
/// re-dispatches through whatever the slot holds.
unsafe fn compile_method2(t: *mut Thread, method: *mut Method) {
    let machine = (*t).machine();

    if (*method).compiled_code() != machine.method_stub() {
        return;
    }

    let _guard = machine.class_lock.lock();

    if (*method).compiled_code() != machine.method_stub() {
        return;
    }

    match Compiler::new(machine).compile(t, method) {
        Ok(image) => {
            let pool = make_pool(machine, &image.pool);
            let code = machine.alloc_code(image.code);

            (*method).set_pool_object(pool);
            (*method).set_compiled_code(code);

            debug!(
                "compiled {} to {:p}+{:#x}",
                (*method).full_name(),
                code.entry(),
                code.code_length()
            );
        }

        Err(err) => {
            let thread = &mut *t;

            if !thread.has_exception() {
                thread.exception = machine.exception_for(&err);
            }
        }
    }
}

/// The pool becomes an ordinary managed array attached to the method's
/// code slot; that is what keeps pool-indexed references alive across
/// collections.
fn make_pool(machine: &Machine, pool: &[usize]) -> *mut Obj {
    if pool.is_empty() {
        return std::ptr::null_mut();
    }

    let array = machine.heap.make_array(
        machine.types.object_array,
        mem::ptr_width_usize(),
        pool.len(),
    );

    unsafe {
        let data = crate::object::array_data::<usize>(array);
        std::ptr::copy_nonoverlapping(pool.as_ptr(), data, pool.len());
    }

    array
}

/// Rewrites the caller's `mov imm64, rax; call rax` sequence so future
/// direct calls skip the stub. The immediate was emitted word-aligned,
/// making the rewrite a single atomic store; anything else at the call
/// site (a vtable dispatch, the entry gate) fails the template compare
/// and is left alone.
unsafe fn update_caller(t: *mut Thread, method: *mut Method) {
    let machine = (*t).machine();
    let stub_entry = machine.method_stub().entry();

    let mut template = MacroAssembler::new();
    asm::emit_movq_imm64_reg(&mut template, stub_entry as i64, RAX);
    let offset = template.pos() - mem::ptr_width_usize();
    asm::emit_callq_reg(&mut template, RAX);
    let template = template.data();

    let return_address = exception::frame_return_address((*t).frame);
    let caller = return_address - template.len();
    let site = std::slice::from_raw_parts(caller as *const u8, template.len());

    if site == template.as_slice() {
        let patch = caller + offset;
        assert_eq!(0, patch % mem::ptr_width_usize());

        let body = (*method).compiled_code().entry() as usize;
        std::ptr::write_volatile(patch as *mut usize, body);

        debug!("patched call site {:#x} for {}", caller, (*method).full_name());
    }
}

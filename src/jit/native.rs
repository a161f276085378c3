//! The managed-to-foreign bridge: the shared native-invoker trampoline,
//! the marshaller it calls, and the per-signature gates that place
//! arguments per the platform C ABI.

use std::sync::atomic::Ordering;

use log::debug;

use crate::class::{Method, TypeCode};
use crate::cpu::asm;
use crate::cpu::x64::reg::Reg::{R10, R11, RAX, RBP, RDI, RSI, RSP};
use crate::cpu::x64::reg::{FREG_PARAMS, REG_PARAMS};
use crate::descriptor::{DescriptorIter, ParamKind};
use crate::exception::{self, unwind};
use crate::jit::code::CompiledCode;
use crate::jit::codegen::emit_runtime_call;
use crate::linker;
use crate::machine::Machine;
use crate::masm::MacroAssembler;
use crate::mem;
use crate::threads::{Thread, ThreadState};

/// Machine shape of one marshalled word.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum AbiType {
    Int32,
    Int64,
    Pointer,
    Float,
    Double,
}

pub type GateKey = (Vec<AbiType>, AbiType);

fn abi_type(code: TypeCode) -> AbiType {
    match code {
        TypeCode::Byte
        | TypeCode::Boolean
        | TypeCode::Char
        | TypeCode::Short
        | TypeCode::Int
        | TypeCode::Void => AbiType::Int32,
        TypeCode::Float => AbiType::Float,
        TypeCode::Long => AbiType::Int64,
        TypeCode::Double => AbiType::Double,
        TypeCode::Object => AbiType::Pointer,
    }
}

/// Same prologue as a compiled method; hands thread and method to the
/// marshaller and returns its accumulator value to the managed caller.
pub fn generate_native_invoker(_machine: &Machine) -> CompiledCode {
    let mut masm = MacroAssembler::new();

    asm::emit_pushq_reg(&mut masm, RBP);
    asm::emit_movq_reg_reg(&mut masm, RSP, RBP);

    asm::emit_movq_memq_reg(&mut masm, RBP, exception::frame_method_offset(), RSI);
    emit_runtime_call(&mut masm, invoke_native as usize);

    asm::emit_movq_reg_reg(&mut masm, RBP, RSP);
    asm::emit_popq_reg(&mut masm, RBP);
    asm::emit_retq(&mut masm);

    CompiledCode::from_parts(&masm.data(), &[], &[])
}

pub extern "C" fn invoke_native(t: *mut Thread, method: *mut Method) -> u64 {
    unsafe {
        let result = invoke_native2(t, method);

        if (*t).has_exception() {
            unwind(t);
        }

        result
    }
}

unsafe fn invoke_native2(t: *mut Thread, method: *mut Method) -> u64 {
    let machine = (*t).machine();
    let method_ref = &*method;

    let mut entry = method_ref.native_entry.load(Ordering::Relaxed);

    if entry == 0 {
        match linker::resolve_native_method(machine, method_ref) {
            Some(found) => {
                method_ref.native_entry.store(found, Ordering::Relaxed);
                entry = found;
            }

            None => {
                (*t).exception = machine.make_exception(
                    machine.types.unsatisfied_link,
                    Some(&method_ref.full_name()),
                );
                return 0;
            }
        }
    }

    let word = mem::ptr_width_usize();
    let frame = (*t).frame;
    let footprint = method_ref.param_footprint as usize;

    // argument word j of the frame's parameter area
    let arg_word = |j: usize| -> usize { frame + (5 + (footprint - 1 - j)) * word };

    let mut args: Vec<usize> = Vec::new();
    let mut types: Vec<AbiType> = Vec::new();

    args.push(t as usize);
    types.push(AbiType::Pointer);

    let mut j = 0;

    if method_ref.is_static() {
        // stable handle to the declaring class
        args.push(&(*method).class as *const _ as usize);
        types.push(AbiType::Pointer);
    } else {
        args.push(arg_word(0));
        types.push(AbiType::Pointer);
        j = 1;
    }

    for kind in DescriptorIter::new(&method_ref.descriptor) {
        match kind {
            ParamKind::Int8 | ParamKind::Int16 | ParamKind::Int32 => {
                args.push(*(arg_word(j) as *const usize) & 0xffff_ffff);
                types.push(AbiType::Int32);
                j += 1;
            }

            ParamKind::Float32 => {
                args.push(*(arg_word(j) as *const usize) & 0xffff_ffff);
                types.push(AbiType::Float);
                j += 1;
            }

            ParamKind::Int64 | ParamKind::Float64 => {
                let high = *(arg_word(j) as *const usize);
                let low = *(arg_word(j + 1) as *const usize);

                if mem::ptr_width() == 8 {
                    args.push((high << 32) | (low & 0xffff_ffff));
                } else {
                    args.push(high);
                    args.push(low);
                }

                types.push(if kind == ParamKind::Int64 {
                    AbiType::Int64
                } else {
                    AbiType::Double
                });
                j += 2;
            }

            ParamKind::Reference => {
                // pointer to the frame slot, so collectors relocating
                // the referent stay invisible to the callee
                args.push(arg_word(j));
                types.push(AbiType::Pointer);
                j += 1;
            }
        }
    }

    let return_type = abi_type(method_ref.return_code);
    let gate = machine.ffi_gate(&types, return_type);

    debug!("invoke native {}", method_ref.full_name());

    (*t).set_state(ThreadState::Idle);
    let result = gate(entry, args.as_ptr());
    (*t).set_state(ThreadState::Active);

    if !(*t).has_exception()
        && return_type == AbiType::Pointer
        && method_ref.return_code == TypeCode::Object
    {
        if result == 0 {
            0
        } else {
            *(result as usize as *const usize) as u64
        }
    } else {
        result
    }
}

/// One gate per marshalled signature: integer words in the System-V
/// registers, FLOAT/DOUBLE in XMM, overflow on the (re-aligned) stack,
/// AL carrying the vector count, float results normalized into RAX.
pub fn generate_ffi_gate(key: &GateKey) -> CompiledCode {
    let (types, return_type) = key;
    let mut masm = MacroAssembler::new();

    // rdi = target, rsi = argument words
    asm::emit_movq_reg_reg(&mut masm, RSI, R10);
    asm::emit_movq_reg_reg(&mut masm, RDI, R11);

    let mut int_index = 0;
    let mut float_index = 0;
    let mut spills: Vec<usize> = Vec::new();

    for (i, ty) in types.iter().enumerate() {
        let disp = (i * mem::ptr_width_usize()) as i32;

        match ty {
            AbiType::Float if float_index < FREG_PARAMS.len() => {
                asm::emit_movss_memq_freg(&mut masm, R10, disp, FREG_PARAMS[float_index]);
                float_index += 1;
            }

            AbiType::Double if float_index < FREG_PARAMS.len() => {
                asm::emit_movsd_memq_freg(&mut masm, R10, disp, FREG_PARAMS[float_index]);
                float_index += 1;
            }

            AbiType::Float | AbiType::Double => spills.push(i),

            _ if int_index < REG_PARAMS.len() => {
                asm::emit_movq_memq_reg(&mut masm, R10, disp, REG_PARAMS[int_index]);
                int_index += 1;
            }

            _ => spills.push(i),
        }
    }

    // keep the stack 16-byte aligned at the call
    let pad = if spills.len() % 2 == 0 { 8 } else { 0 };

    if pad != 0 {
        asm::emit_subq_imm_reg(&mut masm, pad, RSP);
    }

    for &i in spills.iter().rev() {
        asm::emit_pushq_memq(&mut masm, R10, (i * mem::ptr_width_usize()) as i32);
    }

    asm::emit_movb_imm_al(&mut masm, float_index as u8);
    asm::emit_callq_reg(&mut masm, R11);

    let cleanup = spills.len() as i32 * mem::ptr_width() + pad;
    if cleanup != 0 {
        asm::emit_addq_imm_reg(&mut masm, cleanup, RSP);
    }

    if let AbiType::Float | AbiType::Double = return_type {
        asm::emit_movq_freg_reg(&mut masm, FREG_PARAMS[0], RAX);
    }

    asm::emit_retq(&mut masm);

    CompiledCode::from_parts(&masm.data(), &[], &[])
}

//! Generated glue between host code and compiled frames: the managed
//! entry gate and the two control-transfer thunks the unwinder uses.
//! Generating these with the same assembler keeps the crate free of
//! external assembly sources.

use crate::cpu::asm;
use crate::cpu::x64::reg::Reg::{RAX, RBP, RBX, RCX, RDI, RDX, RSI, RSP};
use crate::jit::code::CompiledCode;
use crate::machine::Machine;
use crate::masm::MacroAssembler;
use crate::mem;

/// `fn(entry, args, arg_bytes) -> u64`
///
/// Copies the argument-list image onto the native stack (word 0 ending
/// up closest to the new frame, which makes it the callee's thread
/// slot) and calls the compiled body. RBX is preserved: the templates
/// use it freely.
pub fn generate_entry_gate(_machine: &Machine) -> CompiledCode {
    let word = mem::ptr_width();
    let mut masm = MacroAssembler::new();

    asm::emit_pushq_reg(&mut masm, RBP);
    asm::emit_movq_reg_reg(&mut masm, RSP, RBP);
    asm::emit_pushq_reg(&mut masm, RBX);

    asm::emit_movq_reg_reg(&mut masm, RDI, RAX);
    asm::emit_subq_reg_reg(&mut masm, RDX, RSP);
    asm::emit_movq_reg_reg(&mut masm, RSP, RDI);

    let head = masm.create_label();
    let done = masm.create_label();

    masm.bind_label(head);
    asm::emit_cmpq_imm_reg(&mut masm, 0, RDX);
    asm::emit_jcc(&mut masm, crate::cpu::CondCode::Equal, done);

    asm::emit_movq_memq_reg(&mut masm, RSI, 0, RBX);
    asm::emit_movq_reg_memq(&mut masm, RBX, RDI, 0);
    asm::emit_addq_imm_reg(&mut masm, word, RSI);
    asm::emit_addq_imm_reg(&mut masm, word, RDI);
    asm::emit_subq_imm_reg(&mut masm, word, RDX);
    asm::emit_jmp(&mut masm, head);

    masm.bind_label(done);
    asm::emit_callq_reg(&mut masm, RAX);

    asm::emit_movq_memq_reg(&mut masm, RBP, -word, RBX);
    asm::emit_movq_reg_reg(&mut masm, RBP, RSP);
    asm::emit_popq_reg(&mut masm, RBP);
    asm::emit_retq(&mut masm);

    CompiledCode::from_parts(&masm.data(), &[], &[])
}

/// `fn(target, frame, stack, exception) -> !`
///
/// Rebuilds a handler's frame, pushes the pending exception as the sole
/// operand-stack entry and jumps to the handler IP.
pub fn generate_resume_thunk(_machine: &Machine) -> CompiledCode {
    let mut masm = MacroAssembler::new();

    asm::emit_movq_reg_reg(&mut masm, RSI, RBP);
    asm::emit_movq_reg_reg(&mut masm, RDX, RSP);
    asm::emit_pushq_reg(&mut masm, RCX);
    asm::emit_jmpq_reg(&mut masm, RDI);

    CompiledCode::from_parts(&masm.data(), &[], &[])
}

/// `fn(target, frame_base, stack) -> !`
///
/// Pops out to a frame's caller with a zero result sentinel; the
/// exception stays pending on the thread.
pub fn generate_return_thunk(_machine: &Machine) -> CompiledCode {
    let mut masm = MacroAssembler::new();

    asm::emit_movq_reg_reg(&mut masm, RSI, RBP);
    asm::emit_movq_reg_reg(&mut masm, RDX, RSP);
    asm::emit_movl_imm_reg(&mut masm, 0, RAX);
    asm::emit_jmpq_reg(&mut masm, RDI);

    CompiledCode::from_parts(&masm.data(), &[], &[])
}

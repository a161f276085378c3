//! The method compiler: one pass over the bytecode, a fixed template
//! per opcode, then branch resolution against the IP map and the
//! handler-table translation.

use log::debug;

use crate::bytecode::*;
use crate::class::{Method, PoolEntry, TypeCode};
use crate::cpu::asm;
use crate::cpu::x64::reg::Reg::{self, RAX, RBP, RBX, RCX, RDI, RDX, RSI, RSP};
use crate::cpu::x64::reg::{REG_POOL, REG_SCRATCH};
use crate::cpu::CondCode;
use crate::error::VmError;
use crate::exception;
use crate::jit::code::{CompiledCode, NativeExceptionHandler, NativeLineNumber};
use crate::linker;
use crate::machine::Machine;
use crate::masm::MacroAssembler;
use crate::mem;
use crate::object::ArrayObj;
use crate::stdlib;
use crate::threads::Thread;

/// Everything one compilation produces: the packed image and the
/// constant-pool words that become the method's post-compile code slot.
pub struct CompiledMethodImage {
    pub code: CompiledCode,
    pub pool: Vec<usize>,
}

/// Offset of a local variable relative to the frame base. Indices below
/// the parameter count address the caller-pushed argument words; higher
/// indices address the locally reserved slots.
fn local_offset(v: i32, parameter_footprint: i32) -> i32 {
    let word = mem::ptr_width();
    let v = v * word;

    if v < parameter_footprint {
        (parameter_footprint - v - word) + 2 * word + exception::frame_footprint()
    } else {
        -(v + word - parameter_footprint)
    }
}

fn log2_word() -> u8 {
    if mem::ptr_width() == 8 {
        3
    } else {
        2
    }
}

fn read_u8(body: &[u8], ip: &mut usize) -> u8 {
    let v = body[*ip];
    *ip += 1;
    v
}

fn read_u16(body: &[u8], ip: &mut usize) -> u16 {
    let hi = read_u8(body, ip) as u16;
    let lo = read_u8(body, ip) as u16;
    (hi << 8) | lo
}

fn read_i16(body: &[u8], ip: &mut usize) -> i16 {
    read_u16(body, ip) as i16
}

fn read_i32(body: &[u8], ip: &mut usize) -> i32 {
    let hi = read_u16(body, ip) as u32;
    let lo = read_u16(body, ip) as u32;
    ((hi << 16) | lo) as i32
}

/// The call sequence into the runtime. Arguments beyond the thread must
/// already sit in their registers; this loads the thread, records the
/// frame base and the resume address for the unwinder, realigns the
/// stack and calls.
pub(crate) fn emit_runtime_call(masm: &mut MacroAssembler, f: usize) {
    asm::emit_movq_memq_reg(masm, RBP, exception::frame_thread_offset(), RDI);
    asm::emit_movq_reg_memq(masm, RBP, RDI, Thread::offset_of_frame());

    let patch = asm::emit_lea_rip(masm, RCX);
    asm::emit_movq_reg_memq(masm, RCX, RDI, Thread::offset_of_xpc());

    asm::emit_movq_reg_reg(masm, RSP, REG_SCRATCH);
    asm::emit_andq_imm_reg(masm, -16, RSP);
    asm::emit_subq_imm_reg(masm, 16, RSP);
    asm::emit_movq_reg_memq(masm, REG_SCRATCH, RSP, 0);

    asm::emit_movq_imm64_reg(masm, f as i64, RAX);
    asm::emit_callq_reg(masm, RAX);

    let resume = masm.pos();
    masm.patch_u32(patch, (resume - (patch + 4)) as u32);

    asm::emit_movq_memq_reg(masm, RSP, 0, RSP);
}

pub struct Compiler<'a> {
    machine: &'a Machine,
    masm: MacroAssembler,

    /// Object words the emitted code reaches through the pool register.
    pool: Vec<usize>,

    /// True whenever a preceding call may have overwritten the pool
    /// register; the next pool access reloads it from the frame's
    /// method.
    pool_clobbered: bool,

    /// Sorted `(bytecode ip, machine ip)` pairs, one per emitted
    /// template plus a final entry for the end of the body.
    ip_map: Vec<(u32, u32)>,

    line_numbers: Vec<NativeLineNumber>,
    handlers: Vec<NativeExceptionHandler>,
}

impl<'a> Compiler<'a> {
    pub fn new(machine: &'a Machine) -> Compiler<'a> {
        Compiler {
            machine,
            masm: MacroAssembler::new(),
            pool: Vec::new(),
            pool_clobbered: true,
            ip_map: Vec::new(),
            line_numbers: Vec::new(),
            handlers: Vec::new(),
        }
    }

    pub fn compile(
        mut self,
        t: *mut Thread,
        method: *mut Method,
    ) -> Result<CompiledMethodImage, VmError> {
        let method_ref = unsafe { &*method };
        let code_attr = method_ref.source.as_ref().expect("method without bytecode");
        let word = mem::ptr_width();

        let parameter_footprint = method_ref.param_footprint as i32 * word;
        let local_footprint = code_attr.max_locals as i32 * word;

        debug!("compiling {}", method_ref.full_name());

        asm::emit_pushq_reg(&mut self.masm, RBP);
        asm::emit_movq_reg_reg(&mut self.masm, RSP, RBP);

        if local_footprint > parameter_footprint {
            // reserve space for local variables
            asm::emit_subq_imm_reg(&mut self.masm, local_footprint - parameter_footprint, RSP);
        }

        let body = &code_attr.body;
        let mut line_index = 0;
        let mut ip: usize = 0;

        while ip < body.len() {
            self.ip_map.push((ip as u32, self.masm.pos() as u32));

            while line_index < code_attr.line_numbers.len()
                && code_attr.line_numbers[line_index].0 as usize == ip
            {
                self.line_numbers.push(NativeLineNumber {
                    ip: self.masm.pos() as u32,
                    line: code_attr.line_numbers[line_index].1 as u32,
                });
                line_index += 1;
            }

            let opcode = read_u8(body, &mut ip);

            match opcode {
                AALOAD | BALOAD | CALOAD | DALOAD | FALOAD | IALOAD | LALOAD | SALOAD => {
                    let out_of_bounds = self.masm.create_label();
                    let next = self.masm.create_label();

                    asm::emit_popq_reg(&mut self.masm, RCX);
                    asm::emit_popq_reg(&mut self.masm, RAX);

                    asm::emit_cmpl_imm_reg(&mut self.masm, 0, RCX);
                    asm::emit_jcc(&mut self.masm, CondCode::Less, out_of_bounds);

                    asm::emit_movl_memq_reg(
                        &mut self.masm,
                        RAX,
                        ArrayObj::offset_of_length(),
                        RDX,
                    );
                    asm::emit_cmpl_reg_reg(&mut self.masm, RDX, RCX);
                    asm::emit_jcc(&mut self.masm, CondCode::GreaterEq, out_of_bounds);

                    asm::emit_addq_imm_reg(&mut self.masm, ArrayObj::offset_of_data(), RAX);

                    match opcode {
                        AALOAD => {
                            asm::emit_shlq_imm_reg(&mut self.masm, log2_word(), RCX);
                            asm::emit_addq_reg_reg(&mut self.masm, RCX, RAX);
                            asm::emit_pushq_memq(&mut self.masm, RAX, 0);
                        }

                        FALOAD | IALOAD => {
                            asm::emit_shlq_imm_reg(&mut self.masm, 2, RCX);
                            asm::emit_addq_reg_reg(&mut self.masm, RCX, RAX);
                            self.push4(RAX, 0);
                        }

                        BALOAD => {
                            asm::emit_addq_reg_reg(&mut self.masm, RCX, RAX);
                            asm::emit_movsbq_memq_reg(&mut self.masm, RAX, 0, RAX);
                            asm::emit_pushq_reg(&mut self.masm, RAX);
                        }

                        CALOAD => {
                            asm::emit_shlq_imm_reg(&mut self.masm, 1, RCX);
                            asm::emit_addq_reg_reg(&mut self.masm, RCX, RAX);
                            asm::emit_movzwl_memq_reg(&mut self.masm, RAX, 0, RAX);
                            asm::emit_pushq_reg(&mut self.masm, RAX);
                        }

                        SALOAD => {
                            asm::emit_shlq_imm_reg(&mut self.masm, 1, RCX);
                            asm::emit_addq_reg_reg(&mut self.masm, RCX, RAX);
                            asm::emit_movswq_memq_reg(&mut self.masm, RAX, 0, RAX);
                            asm::emit_pushq_reg(&mut self.masm, RAX);
                        }

                        DALOAD | LALOAD => {
                            asm::emit_shlq_imm_reg(&mut self.masm, 3, RCX);
                            asm::emit_addq_reg_reg(&mut self.masm, RCX, RAX);
                            // high word first, low word on top
                            self.push4(RAX, 4);
                            self.push4(RAX, 0);
                        }

                        _ => unreachable!(),
                    }

                    asm::emit_jmp(&mut self.masm, next);

                    self.masm.bind_label(out_of_bounds);
                    self.compile_call_obj(
                        stdlib::throw_new as usize,
                        self.machine.types.array_index as usize,
                    );

                    self.masm.bind_label(next);
                }

                AASTORE | BASTORE | CASTORE | DASTORE | FASTORE | IASTORE | LASTORE
                | SASTORE => {
                    let out_of_bounds = self.masm.create_label();
                    let next = self.masm.create_label();

                    asm::emit_popq_reg(&mut self.masm, RBX);
                    if opcode == DASTORE || opcode == LASTORE {
                        // rbx holds the low word, rdx the high word
                        asm::emit_popq_reg(&mut self.masm, RDX);
                    }
                    asm::emit_popq_reg(&mut self.masm, RCX);
                    asm::emit_popq_reg(&mut self.masm, RAX);

                    asm::emit_cmpl_imm_reg(&mut self.masm, 0, RCX);
                    asm::emit_jcc(&mut self.masm, CondCode::Less, out_of_bounds);

                    asm::emit_movl_memq_reg(
                        &mut self.masm,
                        RAX,
                        ArrayObj::offset_of_length(),
                        RSI,
                    );
                    asm::emit_cmpl_reg_reg(&mut self.masm, RSI, RCX);
                    asm::emit_jcc(&mut self.masm, CondCode::GreaterEq, out_of_bounds);

                    asm::emit_addq_imm_reg(&mut self.masm, ArrayObj::offset_of_data(), RAX);

                    match opcode {
                        AASTORE => {
                            asm::emit_shlq_imm_reg(&mut self.masm, log2_word(), RCX);
                            asm::emit_addq_reg_reg(&mut self.masm, RCX, RAX);
                            asm::emit_movq_reg_memq(&mut self.masm, RBX, RAX, 0);
                        }

                        FASTORE | IASTORE => {
                            asm::emit_shlq_imm_reg(&mut self.masm, 2, RCX);
                            asm::emit_addq_reg_reg(&mut self.masm, RCX, RAX);
                            asm::emit_movl_reg_memq(&mut self.masm, RBX, RAX, 0);
                        }

                        BASTORE => {
                            asm::emit_addq_reg_reg(&mut self.masm, RCX, RAX);
                            asm::emit_movb_reg_memq(&mut self.masm, RBX, RAX, 0);
                        }

                        CASTORE | SASTORE => {
                            asm::emit_shlq_imm_reg(&mut self.masm, 1, RCX);
                            asm::emit_addq_reg_reg(&mut self.masm, RCX, RAX);
                            asm::emit_movw_reg_memq(&mut self.masm, RBX, RAX, 0);
                        }

                        DASTORE | LASTORE => {
                            asm::emit_shlq_imm_reg(&mut self.masm, 3, RCX);
                            asm::emit_addq_reg_reg(&mut self.masm, RCX, RAX);
                            asm::emit_movl_reg_memq(&mut self.masm, RBX, RAX, 0);
                            asm::emit_movl_reg_memq(&mut self.masm, RDX, RAX, 4);
                        }

                        _ => unreachable!(),
                    }

                    asm::emit_jmp(&mut self.masm, next);

                    self.masm.bind_label(out_of_bounds);
                    self.compile_call_obj(
                        stdlib::throw_new as usize,
                        self.machine.types.array_index as usize,
                    );

                    self.masm.bind_label(next);
                }

                ACONST_NULL => asm::emit_pushq_imm(&mut self.masm, 0),

                ICONST_M1 => asm::emit_pushq_imm(&mut self.masm, -1),
                ICONST_0 => asm::emit_pushq_imm(&mut self.masm, 0),
                ICONST_1 => asm::emit_pushq_imm(&mut self.masm, 1),
                ICONST_2 => asm::emit_pushq_imm(&mut self.masm, 2),
                ICONST_3 => asm::emit_pushq_imm(&mut self.masm, 3),
                ICONST_4 => asm::emit_pushq_imm(&mut self.masm, 4),
                ICONST_5 => asm::emit_pushq_imm(&mut self.masm, 5),

                BIPUSH => {
                    let value = read_u8(body, &mut ip) as i8;
                    asm::emit_pushq_imm(&mut self.masm, value as i32);
                }

                SIPUSH => {
                    let value = read_i16(body, &mut ip);
                    asm::emit_pushq_imm(&mut self.masm, value as i32);
                }

                ALOAD | ILOAD | FLOAD => {
                    let v = read_u8(body, &mut ip) as i32;
                    asm::emit_pushq_memq(&mut self.masm, RBP, local_offset(v, parameter_footprint));
                }

                ALOAD_0 | ILOAD_0 | FLOAD_0 => {
                    asm::emit_pushq_memq(&mut self.masm, RBP, local_offset(0, parameter_footprint));
                }

                ALOAD_1 | ILOAD_1 | FLOAD_1 => {
                    asm::emit_pushq_memq(&mut self.masm, RBP, local_offset(1, parameter_footprint));
                }

                ALOAD_2 | ILOAD_2 | FLOAD_2 => {
                    asm::emit_pushq_memq(&mut self.masm, RBP, local_offset(2, parameter_footprint));
                }

                ALOAD_3 | ILOAD_3 | FLOAD_3 => {
                    asm::emit_pushq_memq(&mut self.masm, RBP, local_offset(3, parameter_footprint));
                }

                ASTORE | ISTORE | FSTORE => {
                    let v = read_u8(body, &mut ip) as i32;
                    asm::emit_popq_memq(&mut self.masm, RBP, local_offset(v, parameter_footprint));
                }

                ASTORE_0 | ISTORE_0 | FSTORE_0 => {
                    asm::emit_popq_memq(&mut self.masm, RBP, local_offset(0, parameter_footprint));
                }

                ASTORE_1 | ISTORE_1 | FSTORE_1 => {
                    asm::emit_popq_memq(&mut self.masm, RBP, local_offset(1, parameter_footprint));
                }

                ASTORE_2 | ISTORE_2 | FSTORE_2 => {
                    asm::emit_popq_memq(&mut self.masm, RBP, local_offset(2, parameter_footprint));
                }

                ASTORE_3 | ISTORE_3 | FSTORE_3 => {
                    asm::emit_popq_memq(&mut self.masm, RBP, local_offset(3, parameter_footprint));
                }

                ARRAYLENGTH => {
                    asm::emit_popq_reg(&mut self.masm, RAX);
                    asm::emit_pushq_memq(&mut self.masm, RAX, ArrayObj::offset_of_length());
                }

                ARETURN | IRETURN | FRETURN => {
                    asm::emit_popq_reg(&mut self.masm, RAX);
                    asm::emit_movq_reg_reg(&mut self.masm, RBP, RSP);
                    asm::emit_popq_reg(&mut self.masm, RBP);
                    asm::emit_retq(&mut self.masm);
                }

                RETURN => {
                    asm::emit_movq_reg_reg(&mut self.masm, RBP, RSP);
                    asm::emit_popq_reg(&mut self.masm, RBP);
                    asm::emit_retq(&mut self.masm);
                }

                ATHROW => {
                    asm::emit_popq_reg(&mut self.masm, RAX);
                    self.compile_call_reg(stdlib::throw_object as usize, RAX);
                }

                DUP => asm::emit_pushq_memq(&mut self.masm, RSP, 0),

                POP => {
                    asm::emit_addq_imm_reg(&mut self.masm, mem::ptr_width(), RSP);
                }

                IINC => {
                    let index = read_u8(body, &mut ip) as i32;
                    let value = read_u8(body, &mut ip) as i8;

                    asm::emit_addq_imm_memq(
                        &mut self.masm,
                        value as i32,
                        RBP,
                        local_offset(index, parameter_footprint),
                    );
                }

                I2B => {
                    asm::emit_movq_memq_reg(&mut self.masm, RSP, 0, RAX);
                    asm::emit_movsbq_reg_reg(&mut self.masm, RAX, RAX);
                    asm::emit_movq_reg_memq(&mut self.masm, RAX, RSP, 0);
                }

                I2C => {
                    asm::emit_movq_memq_reg(&mut self.masm, RSP, 0, RAX);
                    asm::emit_movzwl_reg_reg(&mut self.masm, RAX, RAX);
                    asm::emit_movq_reg_memq(&mut self.masm, RAX, RSP, 0);
                }

                I2S => {
                    asm::emit_movq_memq_reg(&mut self.masm, RSP, 0, RAX);
                    asm::emit_movswq_reg_reg(&mut self.masm, RAX, RAX);
                    asm::emit_movq_reg_memq(&mut self.masm, RAX, RSP, 0);
                }

                IADD => {
                    asm::emit_popq_reg(&mut self.masm, RCX);
                    asm::emit_popq_reg(&mut self.masm, RAX);
                    asm::emit_addq_reg_reg(&mut self.masm, RCX, RAX);
                    asm::emit_pushq_reg(&mut self.masm, RAX);
                }

                ISUB => {
                    asm::emit_popq_reg(&mut self.masm, RCX);
                    asm::emit_popq_reg(&mut self.masm, RAX);
                    asm::emit_subq_reg_reg(&mut self.masm, RCX, RAX);
                    asm::emit_pushq_reg(&mut self.masm, RAX);
                }

                IMUL => {
                    asm::emit_popq_reg(&mut self.masm, RCX);
                    asm::emit_popq_reg(&mut self.masm, RAX);
                    asm::emit_imulq_reg_reg(&mut self.masm, RCX, RAX);
                    asm::emit_pushq_reg(&mut self.masm, RAX);
                }

                IF_ICMPEQ | IF_ICMPNE | IF_ICMPLT | IF_ICMPGE | IF_ICMPGT | IF_ICMPLE => {
                    let offset = read_i16(body, &mut ip) as i32;
                    let target = (ip as i32 - 3 + offset) as u32;

                    asm::emit_popq_reg(&mut self.masm, RCX);
                    asm::emit_popq_reg(&mut self.masm, RAX);
                    asm::emit_cmpl_reg_reg(&mut self.masm, RCX, RAX);

                    let cond = match opcode {
                        IF_ICMPEQ => CondCode::Equal,
                        IF_ICMPNE => CondCode::NotEqual,
                        IF_ICMPLT => CondCode::Less,
                        IF_ICMPGE => CondCode::GreaterEq,
                        IF_ICMPGT => CondCode::Greater,
                        IF_ICMPLE => CondCode::LessEq,
                        _ => unreachable!(),
                    };
                    asm::emit_jcc_ip(&mut self.masm, cond, target);
                }

                IF_ACMPEQ | IF_ACMPNE => {
                    let offset = read_i16(body, &mut ip) as i32;
                    let target = (ip as i32 - 3 + offset) as u32;

                    asm::emit_popq_reg(&mut self.masm, RCX);
                    asm::emit_popq_reg(&mut self.masm, RAX);
                    asm::emit_cmpq_reg_reg(&mut self.masm, RCX, RAX);

                    let cond = if opcode == IF_ACMPEQ {
                        CondCode::Equal
                    } else {
                        CondCode::NotEqual
                    };
                    asm::emit_jcc_ip(&mut self.masm, cond, target);
                }

                IFEQ | IFNE | IFLT | IFGE | IFGT | IFLE => {
                    let offset = read_i16(body, &mut ip) as i32;
                    let target = (ip as i32 - 3 + offset) as u32;

                    asm::emit_popq_reg(&mut self.masm, RAX);
                    asm::emit_cmpl_imm_reg(&mut self.masm, 0, RAX);

                    let cond = match opcode {
                        IFEQ => CondCode::Equal,
                        IFNE => CondCode::NotEqual,
                        IFLT => CondCode::Less,
                        IFGE => CondCode::GreaterEq,
                        IFGT => CondCode::Greater,
                        IFLE => CondCode::LessEq,
                        _ => unreachable!(),
                    };
                    asm::emit_jcc_ip(&mut self.masm, cond, target);
                }

                IFNULL | IFNONNULL => {
                    let offset = read_i16(body, &mut ip) as i32;
                    let target = (ip as i32 - 3 + offset) as u32;

                    asm::emit_popq_reg(&mut self.masm, RAX);
                    asm::emit_cmpq_imm_reg(&mut self.masm, 0, RAX);

                    let cond = if opcode == IFNULL {
                        CondCode::Equal
                    } else {
                        CondCode::NotEqual
                    };
                    asm::emit_jcc_ip(&mut self.masm, cond, target);
                }

                GOTO => {
                    let offset = read_i16(body, &mut ip) as i32;
                    let target = (ip as i32 - 3 + offset) as u32;
                    asm::emit_jmp_ip(&mut self.masm, target);
                }

                GOTO_W => {
                    let offset = read_i32(body, &mut ip);
                    let target = (ip as i32 - 5 + offset) as u32;
                    asm::emit_jmp_ip(&mut self.masm, target);
                }

                LDC | LDC_W => {
                    let index = if opcode == LDC {
                        read_u8(body, &mut ip) as u16
                    } else {
                        read_u16(body, &mut ip)
                    };

                    match linker::pool_entry(&code_attr.pool, index) {
                        Some(&PoolEntry::Int(value)) => {
                            asm::emit_pushq_imm(&mut self.masm, value);
                        }

                        Some(&PoolEntry::Float(value)) => {
                            asm::emit_pushq_imm(&mut self.masm, value.to_bits() as i32);
                        }

                        Some(&PoolEntry::Str(value)) => {
                            self.push_pool(value as usize);
                        }

                        Some(&PoolEntry::ClassRef(value)) => {
                            self.push_pool(value as usize);
                        }

                        _ => return Err(VmError::UnresolvedConstant(index)),
                    }
                }

                NEW => {
                    let index = read_u16(body, &mut ip);
                    let class = linker::resolve_class(&code_attr.pool, index)?;

                    self.check_init(t, class)?;

                    self.compile_call_obj(stdlib::make_new as usize, class as usize);
                    asm::emit_pushq_reg(&mut self.masm, RAX);
                }

                NEWARRAY => {
                    let tag = read_u8(body, &mut ip);
                    assert!((T_BOOLEAN..=T_LONG).contains(&tag), "unknown array tag");

                    let nonnegative = self.masm.create_label();

                    asm::emit_popq_reg(&mut self.masm, RAX);
                    asm::emit_cmpl_imm_reg(&mut self.masm, 0, RAX);
                    asm::emit_jcc(&mut self.masm, CondCode::GreaterEq, nonnegative);

                    self.compile_call_obj(
                        stdlib::throw_new as usize,
                        self.machine.types.negative_array_size as usize,
                    );

                    self.masm.bind_label(nonnegative);
                    self.compile_call_imm_reg(stdlib::make_blank_array as usize, tag as i32, RAX);
                    asm::emit_pushq_reg(&mut self.masm, RAX);
                }

                ANEWARRAY => {
                    let index = read_u16(body, &mut ip);
                    let class = linker::resolve_class(&code_attr.pool, index)?;

                    let nonnegative = self.masm.create_label();

                    asm::emit_popq_reg(&mut self.masm, RAX);
                    asm::emit_cmpl_imm_reg(&mut self.masm, 0, RAX);
                    asm::emit_jcc(&mut self.masm, CondCode::GreaterEq, nonnegative);

                    self.compile_call_obj(
                        stdlib::throw_new as usize,
                        self.machine.types.negative_array_size as usize,
                    );

                    self.masm.bind_label(nonnegative);
                    self.compile_call_obj_reg(
                        stdlib::make_blank_object_array as usize,
                        class as usize,
                        RAX,
                    );
                    asm::emit_pushq_reg(&mut self.masm, RAX);
                }

                CHECKCAST => {
                    let index = read_u16(body, &mut ip);
                    let class = linker::resolve_class(&code_attr.pool, index)?;

                    let next = self.masm.create_label();

                    asm::emit_movq_memq_reg(&mut self.masm, RSP, 0, RAX);
                    asm::emit_cmpq_imm_reg(&mut self.masm, 0, RAX);
                    asm::emit_jcc(&mut self.masm, CondCode::Equal, next);

                    self.load_pool(class as usize, RCX);
                    asm::emit_movq_memq_reg(&mut self.masm, RAX, 0, RAX);
                    asm::emit_cmpq_reg_reg(&mut self.masm, RCX, RAX);
                    asm::emit_jcc(&mut self.masm, CondCode::Equal, next);

                    self.compile_call_reg_reg(stdlib::is_assignable_from as usize, RCX, RAX);
                    asm::emit_cmpq_imm_reg(&mut self.masm, 0, RAX);
                    asm::emit_jcc(&mut self.masm, CondCode::NotEqual, next);

                    self.compile_call_obj(
                        stdlib::throw_new as usize,
                        self.machine.types.class_cast as usize,
                    );

                    self.masm.bind_label(next);
                }

                INSTANCEOF => {
                    let index = read_u16(body, &mut ip);
                    let class = linker::resolve_class(&code_attr.pool, index)?;

                    let slow = self.masm.create_label();
                    let zero = self.masm.create_label();
                    let next = self.masm.create_label();

                    asm::emit_popq_reg(&mut self.masm, RAX);
                    asm::emit_cmpq_imm_reg(&mut self.masm, 0, RAX);
                    asm::emit_jcc(&mut self.masm, CondCode::Equal, zero);

                    self.load_pool(class as usize, RCX);
                    asm::emit_movq_memq_reg(&mut self.masm, RAX, 0, RAX);
                    asm::emit_cmpq_reg_reg(&mut self.masm, RCX, RAX);
                    asm::emit_jcc(&mut self.masm, CondCode::NotEqual, slow);

                    asm::emit_pushq_imm(&mut self.masm, 1);
                    asm::emit_jmp(&mut self.masm, next);

                    self.masm.bind_label(slow);
                    self.compile_call_reg_reg(stdlib::is_assignable_from as usize, RCX, RAX);
                    asm::emit_pushq_reg(&mut self.masm, RAX);
                    asm::emit_jmp(&mut self.masm, next);

                    self.masm.bind_label(zero);
                    asm::emit_pushq_imm(&mut self.masm, 0);

                    self.masm.bind_label(next);
                }

                GETFIELD => {
                    let index = read_u16(body, &mut ip);
                    let field = linker::resolve_field(&code_attr.pool, index)?;
                    let field = unsafe { &*field };

                    asm::emit_popq_reg(&mut self.masm, RAX);
                    self.emit_typed_load(RAX, field.offset, field.code);
                }

                PUTFIELD => {
                    let index = read_u16(body, &mut ip);
                    let field = linker::resolve_field(&code_attr.pool, index)?;
                    let field = unsafe { &*field };

                    match field.code {
                        TypeCode::Long | TypeCode::Double => {
                            asm::emit_popq_reg(&mut self.masm, RCX);
                            asm::emit_popq_reg(&mut self.masm, RDX);
                            asm::emit_popq_reg(&mut self.masm, RAX);
                        }

                        _ => {
                            asm::emit_popq_reg(&mut self.masm, RCX);
                            asm::emit_popq_reg(&mut self.masm, RAX);
                        }
                    }

                    self.emit_typed_store(RAX, field.offset, field.code);
                }

                GETSTATIC => {
                    let index = read_u16(body, &mut ip);
                    let field = linker::resolve_field(&code_attr.pool, index)?;
                    let (class, offset, code) =
                        unsafe { ((*field).class, (*field).offset, (*field).code) };

                    self.check_init(t, class)?;

                    let table = unsafe { (*class).statics };
                    self.load_pool(table as usize, RAX);

                    self.emit_typed_load(RAX, ArrayObj::offset_of_data() + offset, code);
                }

                PUTSTATIC => {
                    let index = read_u16(body, &mut ip);
                    let field = linker::resolve_field(&code_attr.pool, index)?;
                    let (class, offset, code) =
                        unsafe { ((*field).class, (*field).offset, (*field).code) };

                    self.check_init(t, class)?;

                    match code {
                        TypeCode::Long | TypeCode::Double => {
                            asm::emit_popq_reg(&mut self.masm, RCX);
                            asm::emit_popq_reg(&mut self.masm, RDX);
                        }

                        _ => {
                            asm::emit_popq_reg(&mut self.masm, RCX);
                        }
                    }

                    let table = unsafe { (*class).statics };
                    self.load_pool(table as usize, RAX);

                    self.emit_typed_store(RAX, ArrayObj::offset_of_data() + offset, code);
                }

                INVOKESPECIAL => {
                    let index = read_u16(body, &mut ip);
                    let mut target = linker::resolve_method(&code_attr.pool, index)?;

                    let caller_class = method_ref.class;
                    if linker::is_special_method(target, caller_class) {
                        let (name, descriptor) = unsafe {
                            ((*target).name.clone(), (*target).descriptor.clone())
                        };
                        let super_class = unsafe { (*caller_class).super_class };

                        target = linker::find_method(super_class, &name, &descriptor)
                            .ok_or(VmError::NoSuchMethod(name))?;
                    }

                    self.compile_direct_invoke(target);
                }

                INVOKESTATIC => {
                    let index = read_u16(body, &mut ip);
                    let target = linker::resolve_method(&code_attr.pool, index)?;

                    self.check_init(t, unsafe { (*target).class })?;

                    self.compile_direct_invoke(target);
                }

                INVOKEVIRTUAL => {
                    let index = read_u16(body, &mut ip);
                    let target = linker::resolve_method(&code_attr.pool, index)?;
                    let target_ref = unsafe { &*target };

                    if !target_ref.is_virtual {
                        // final or private targets bind directly
                        self.compile_direct_invoke(target);
                    } else {
                        let word = mem::ptr_width();
                        let target_footprint = target_ref.param_footprint as i32 * word;
                        let instance = target_footprint - word;
                        let footprint = exception::frame_footprint() + target_footprint;
                        let vtable_slot = ArrayObj::offset_of_data()
                            + target_ref.offset as i32 * word;

                        // receiver -> class -> vtable -> method
                        asm::emit_movq_memq_reg(&mut self.masm, RSP, instance, RAX);
                        asm::emit_movq_memq_reg(&mut self.masm, RAX, 0, RAX);
                        asm::emit_movq_memq_reg(
                            &mut self.masm,
                            RAX,
                            crate::class::Class::offset_of_vtable(),
                            RAX,
                        );
                        asm::emit_movq_memq_reg(&mut self.masm, RAX, vtable_slot, RAX);

                        asm::emit_pushq_reg(&mut self.masm, RBP);
                        asm::emit_pushq_reg(&mut self.masm, RAX);
                        asm::emit_pushq_memq(
                            &mut self.masm,
                            RBP,
                            exception::frame_thread_offset(),
                        );

                        asm::emit_movq_memq_reg(
                            &mut self.masm,
                            RAX,
                            Method::offset_of_compiled(),
                            RAX,
                        );
                        asm::emit_addq_imm_reg(
                            &mut self.masm,
                            crate::jit::code::COMPILED_BODY as i32,
                            RAX,
                        );
                        asm::emit_callq_reg(&mut self.masm, RAX);
                        self.pool_clobbered = true;

                        asm::emit_addq_imm_reg(&mut self.masm, footprint, RSP);
                        self.push_return_value(target_ref.return_code);
                    }
                }

                _ => panic!("unknown opcode {:#04x} at ip {}", opcode, ip - 1),
            }
        }

        self.ip_map.push((body.len() as u32, self.masm.pos() as u32));

        self.resolve_jumps();
        self.build_handler_table(code_attr)?;

        Ok(self.finish())
    }

    /// Width-dispatched load from `[base + offset]`, pushed onto the
    /// operand stack.
    fn emit_typed_load(&mut self, base: Reg, offset: i32, code: TypeCode) {
        match code {
            TypeCode::Byte | TypeCode::Boolean => {
                asm::emit_movsbq_memq_reg(&mut self.masm, base, offset, RAX);
                asm::emit_pushq_reg(&mut self.masm, RAX);
            }

            TypeCode::Char => {
                asm::emit_movzwl_memq_reg(&mut self.masm, base, offset, RAX);
                asm::emit_pushq_reg(&mut self.masm, RAX);
            }

            TypeCode::Short => {
                asm::emit_movswq_memq_reg(&mut self.masm, base, offset, RAX);
                asm::emit_pushq_reg(&mut self.masm, RAX);
            }

            TypeCode::Int | TypeCode::Float => {
                self.push4(base, offset);
            }

            TypeCode::Long | TypeCode::Double => {
                self.push4(base, offset + 4);
                self.push4(base, offset);
            }

            TypeCode::Object => {
                asm::emit_pushq_memq(&mut self.masm, base, offset);
            }

            TypeCode::Void => panic!("void-typed field"),
        }
    }

    /// Width-dispatched store to `[base + offset]`. Category-1 values
    /// arrive in RCX; category-2 values in RCX (low) and RDX (high).
    fn emit_typed_store(&mut self, base: Reg, offset: i32, code: TypeCode) {
        match code {
            TypeCode::Byte | TypeCode::Boolean => {
                asm::emit_movb_reg_memq(&mut self.masm, RCX, base, offset);
            }

            TypeCode::Char | TypeCode::Short => {
                asm::emit_movw_reg_memq(&mut self.masm, RCX, base, offset);
            }

            TypeCode::Int | TypeCode::Float => {
                asm::emit_movl_reg_memq(&mut self.masm, RCX, base, offset);
            }

            TypeCode::Long | TypeCode::Double => {
                asm::emit_movl_reg_memq(&mut self.masm, RCX, base, offset);
                asm::emit_movl_reg_memq(&mut self.masm, RDX, base, offset + 4);
            }

            TypeCode::Object => {
                asm::emit_movq_reg_memq(&mut self.masm, RCX, base, offset);
            }

            TypeCode::Void => panic!("void-typed field"),
        }
    }

    /// Pushes a 32-bit value from memory as one machine word.
    fn push4(&mut self, base: Reg, disp: i32) {
        if mem::ptr_width() == 8 {
            asm::emit_movl_memq_reg(&mut self.masm, base, disp, RSI);
            asm::emit_pushq_reg(&mut self.masm, RSI);
        } else {
            asm::emit_pushq_memq(&mut self.masm, base, disp);
        }
    }

    fn reload_pool_if_clobbered(&mut self) {
        if self.pool_clobbered {
            asm::emit_movq_memq_reg(
                &mut self.masm,
                RBP,
                exception::frame_method_offset(),
                REG_POOL,
            );
            asm::emit_movq_memq_reg(
                &mut self.masm,
                REG_POOL,
                Method::offset_of_code(),
                REG_POOL,
            );
            self.pool_clobbered = false;
        }
    }

    /// Interns an object in the pool; returns its displacement from the
    /// pool register (the pool array object).
    fn pool_disp(&mut self, object: usize) -> i32 {
        self.pool.push(object);
        ArrayObj::offset_of_data() + (self.pool.len() as i32 - 1) * mem::ptr_width()
    }

    /// Interns an object and returns its 1-based pool index; emits no
    /// code (used by the handler table).
    fn pool_index(&mut self, object: usize) -> u32 {
        self.pool.push(object);
        self.pool.len() as u32
    }

    fn push_pool(&mut self, object: usize) {
        self.reload_pool_if_clobbered();
        let disp = self.pool_disp(object);
        asm::emit_pushq_memq(&mut self.masm, REG_POOL, disp);
    }

    fn load_pool(&mut self, object: usize, dest: Reg) {
        self.reload_pool_if_clobbered();
        let disp = self.pool_disp(object);
        asm::emit_movq_memq_reg(&mut self.masm, REG_POOL, disp, dest);
    }

    fn runtime_call(&mut self, f: usize) {
        emit_runtime_call(&mut self.masm, f);
        self.pool_clobbered = true;
    }

    fn compile_call_obj(&mut self, f: usize, object: usize) {
        self.load_pool(object, RSI);
        self.runtime_call(f);
    }

    fn compile_call_reg(&mut self, f: usize, arg: Reg) {
        if arg != RSI {
            asm::emit_movq_reg_reg(&mut self.masm, arg, RSI);
        }

        self.runtime_call(f);
    }

    fn compile_call_obj_reg(&mut self, f: usize, object: usize, arg: Reg) {
        assert!(arg != RSI && arg != RDI);

        if arg != RDX {
            asm::emit_movq_reg_reg(&mut self.masm, arg, RDX);
        }

        self.load_pool(object, RSI);
        self.runtime_call(f);
    }

    fn compile_call_imm_reg(&mut self, f: usize, imm: i32, arg: Reg) {
        assert!(arg != RSI && arg != RDI);

        if arg != RDX {
            asm::emit_movq_reg_reg(&mut self.masm, arg, RDX);
        }

        asm::emit_movl_imm_reg(&mut self.masm, imm, RSI);
        self.runtime_call(f);
    }

    fn compile_call_reg_reg(&mut self, f: usize, arg1: Reg, arg2: Reg) {
        assert!(arg1 != RDX && arg1 != RDI && arg2 != RSI && arg2 != RDI);

        if arg2 != RDX {
            asm::emit_movq_reg_reg(&mut self.masm, arg2, RDX);
        }

        if arg1 != RSI {
            asm::emit_movq_reg_reg(&mut self.masm, arg1, RSI);
        }

        self.runtime_call(f);
    }

    fn compile_direct_invoke(&mut self, target: *mut Method) {
        let target_ref = unsafe { &*target };
        let word = mem::ptr_width();
        let footprint =
            exception::frame_footprint() + target_ref.param_footprint as i32 * word;
        let entry = target_ref.compiled_code().entry();

        asm::emit_pushq_reg(&mut self.masm, RBP);
        self.push_pool(target as usize);
        asm::emit_pushq_memq(&mut self.masm, RBP, exception::frame_thread_offset());

        asm::emit_aligned_movq_imm64_reg(&mut self.masm, entry as i64, RAX);
        asm::emit_callq_reg(&mut self.masm, RAX);
        self.pool_clobbered = true;

        asm::emit_addq_imm_reg(&mut self.masm, footprint, RSP);

        self.push_return_value(target_ref.return_code);
    }

    fn push_return_value(&mut self, code: TypeCode) {
        match code {
            TypeCode::Byte
            | TypeCode::Boolean
            | TypeCode::Char
            | TypeCode::Short
            | TypeCode::Float
            | TypeCode::Int
            | TypeCode::Object => {
                asm::emit_pushq_reg(&mut self.masm, RAX);
            }

            TypeCode::Long | TypeCode::Double => {
                if mem::ptr_width() == 8 {
                    asm::emit_movq_reg_reg(&mut self.masm, RAX, RDX);
                    asm::emit_shrq_imm_reg(&mut self.masm, 32, RDX);
                }

                // high word first, low word on top
                asm::emit_pushq_reg(&mut self.masm, RDX);
                asm::emit_pushq_reg(&mut self.masm, RAX);
            }

            TypeCode::Void => {}
        }
    }

    fn check_init(&mut self, t: *mut Thread, class: *mut crate::class::Class) -> Result<(), VmError> {
        self.machine.init_class(t, class);

        if unsafe { (*t).has_exception() } {
            Err(VmError::Pending)
        } else {
            Ok(())
        }
    }

    /// Machine IP an emitted template starts at. A branch to a bytecode
    /// IP that never started a template is a verifier-level bug.
    fn machine_ip(&self, bytecode_ip: u32) -> u32 {
        match self
            .ip_map
            .binary_search_by_key(&bytecode_ip, |&(ip, _)| ip)
        {
            Ok(index) => self.ip_map[index].1,
            Err(_) => panic!("branch to nonexistent bytecode ip {}", bytecode_ip),
        }
    }

    fn resolve_jumps(&mut self) {
        let jumps: Vec<_> = self.masm.ip_jumps().to_vec();

        for jump in jumps {
            let target = self.machine_ip(jump.target);
            self.masm
                .patch_u32(jump.at, target.wrapping_sub(jump.at as u32 + 4));
        }
    }

    fn build_handler_table(&mut self, code_attr: &crate::class::CodeAttr) -> Result<(), VmError> {
        for handler in &code_attr.handlers {
            let catch_type = if handler.catch_type != 0 {
                let class = linker::resolve_class(&code_attr.pool, handler.catch_type)?;
                self.pool_index(class as usize)
            } else {
                0
            };

            let entry = NativeExceptionHandler {
                start: self.machine_ip(handler.start as u32),
                end: self.machine_ip(handler.end as u32),
                ip: self.machine_ip(handler.ip as u32),
                catch_type,
            };
            self.handlers.push(entry);
        }

        Ok(())
    }

    fn finish(self) -> CompiledMethodImage {
        let Compiler {
            masm,
            pool,
            line_numbers,
            handlers,
            ..
        } = self;

        let code = masm.finish();

        CompiledMethodImage {
            code: CompiledCode::from_parts(&code, &line_numbers, &handlers),
            pool,
        }
    }
}

#[cfg(all(test, target_arch = "x86_64", target_family = "unix"))]
mod tests {
    use std::ptr;

    use super::*;
    use crate::bytecode::{ACC_STATIC, GETFIELD, GOTO, ICONST_1, ILOAD_0, IMUL, INVOKESTATIC,
                          IRETURN, ISUB, IFNE, RETURN};
    use crate::test::*;

    fn fact_body() -> Vec<u8> {
        vec![
            ILOAD_0,
            IFNE, 0, 5,
            ICONST_1,
            IRETURN,
            ILOAD_0,
            ILOAD_0,
            ICONST_1,
            ISUB,
            INVOKESTATIC, 0, 1,
            IMUL,
            IRETURN,
        ]
    }

    #[test]
    fn test_recompilation_is_deterministic() {
        let f = fixture();
        let class = define_class(&f, "Det", ptr::null_mut());
        let fact = define_method(&f, class, "fact", "(I)I", ACC_STATIC, None);

        unsafe {
            (*fact).source = Some(code_attr(
                fact_body(),
                1,
                vec![crate::class::PoolEntry::MethodRef(fact)],
            ));
        }

        let first = Compiler::new(f.machine.as_ref())
            .compile(f.thread, fact)
            .unwrap();
        let second = Compiler::new(f.machine.as_ref())
            .compile(f.thread, fact)
            .unwrap();

        let first_image = first.code.code_ref();
        let second_image = second.code.code_ref();

        assert_eq!(first_image.code_bytes(), second_image.code_bytes());
        assert_eq!(first_image.line_numbers(), second_image.line_numbers());
        assert_eq!(
            first_image.exception_handlers(),
            second_image.exception_handlers()
        );
        assert_eq!(first.pool, second.pool);
    }

    #[test]
    fn test_resolution_failure_aborts_compilation() {
        let f = fixture();
        let class = define_class(&f, "Bad", ptr::null_mut());
        let m = define_method(
            &f,
            class,
            "broken",
            "(Ljava/lang/Object;)V",
            ACC_STATIC,
            Some(code_attr(
                vec![crate::bytecode::ALOAD_0, GETFIELD, 0, 1, RETURN],
                1,
                vec![crate::class::PoolEntry::Unresolved],
            )),
        );

        let result = Compiler::new(f.machine.as_ref()).compile(f.thread, m);

        assert!(result.is_err());
        // nothing was published
        unsafe {
            assert_eq!(f.processor.method_stub(), (*m).compiled_code());
        }
    }

    #[test]
    #[should_panic(expected = "unknown opcode")]
    fn test_unknown_opcode_aborts() {
        let f = fixture();
        let class = define_class(&f, "Odd", ptr::null_mut());
        let m = define_method(
            &f,
            class,
            "odd",
            "()V",
            ACC_STATIC,
            Some(code_attr(vec![0xfe], 0, vec![])),
        );

        let _ = Compiler::new(f.machine.as_ref()).compile(f.thread, m);
    }

    #[test]
    #[should_panic(expected = "nonexistent bytecode ip")]
    fn test_branch_into_template_interior_aborts() {
        let f = fixture();
        let class = define_class(&f, "Wild", ptr::null_mut());
        let m = define_method(
            &f,
            class,
            "wild",
            "()V",
            ACC_STATIC,
            // branch lands inside the goto's own operand bytes
            Some(code_attr(vec![GOTO, 0, 2, RETURN], 0, vec![])),
        );

        let _ = Compiler::new(f.machine.as_ref()).compile(f.thread, m);
    }

    #[test]
    fn test_local_offsets() {
        let word = mem::ptr_width();

        // two int parameters: first at the far end of the caller-pushed
        // area, locals below the frame base
        let footprint = 2 * word;
        assert_eq!(6 * word, local_offset(0, footprint));
        assert_eq!(5 * word, local_offset(1, footprint));
        assert_eq!(-word, local_offset(2, footprint));
        assert_eq!(-2 * word, local_offset(3, footprint));
    }
}

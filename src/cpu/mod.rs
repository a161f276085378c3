pub mod x64;

pub use self::x64::asm;
pub use self::x64::reg::*;

/// Condition codes for conditional branches, mapped to the x86 `jcc`
/// encodings by the assembler.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CondCode {
    Zero,
    NonZero,
    Equal,
    NotEqual,
    Greater,
    GreaterEq,
    Less,
    LessEq,
    UnsignedGreater,
    UnsignedGreaterEq,
    UnsignedLess,
    UnsignedLessEq,
}

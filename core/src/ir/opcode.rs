//! Static instruction catalog.
//!
//! Every instruction is two bytes wide: an opcode byte followed by a single
//! operand byte. The catalog is closed; bytes outside it are rejected by the
//! decoder rather than skipped.

use std::fmt;

use once_cell::sync::Lazy;

/// Width in bytes of one encoded instruction.
pub const INSTR_WIDTH: usize = 2;

/// Instruction kinds understood by the patcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    PopTop,
    Nop,
    BinaryPower,
    BinaryMultiply,
    BinaryModulo,
    BinaryAdd,
    BinarySubtract,
    BinaryFloorDivide,
    BinaryTrueDivide,
    GetIter,
    ReturnValue,
    PopBlock,
    StoreName,
    ForIter,
    LoadConst,
    LoadName,
    CompareOp,
    ImportName,
    JumpForward,
    JumpAbsolute,
    PopJumpIfFalse,
    PopJumpIfTrue,
    LoadGlobal,
    SetupLoop,
    LoadFast,
    StoreFast,
    CallFunction,
    MakeFunction,
    BuildConstKeyMap,
    LoadMethod,
    CallMethod,
}

/// What the operand byte of an instruction refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandKind {
    /// Operand is ignored (encoded as zero).
    Unused,
    Const,
    Name,
    Local,
    /// Operand encodes a jump target.
    Jump,
    /// Operand is a literal small integer (argument count, comparison kind, flags).
    Immediate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JumpMode {
    /// Operand is a displacement from the end of the jump instruction.
    Relative,
    /// Operand is a byte offset from the start of the payload.
    Absolute,
}

/// Order in which consumed values are recorded as producer links.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PopOrder {
    /// Deepest value first: second-from-top, then top.
    Natural,
    /// Top of stack first.
    TopFirst,
}

/// Number of values an instruction consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pops {
    Fixed(u8),
    /// `operand + extra` values (call-like instructions).
    ArgPlus(u8),
    /// Code object and qualified name plus one value per set flag bit.
    FunctionFlags,
}

#[derive(Debug, Clone, Copy)]
pub struct OpInfo {
    pub op: Opcode,
    pub name: &'static str,
    pub byte: u8,
    pub operand: OperandKind,
    pub pops: Pops,
    pub pushes: u8,
    pub pop_order: PopOrder,
    pub jump: Option<JumpMode>,
}

const fn info(op: Opcode, name: &'static str, byte: u8, operand: OperandKind, pops: Pops, pushes: u8) -> OpInfo {
    let jump = match op {
        Opcode::ForIter | Opcode::JumpForward | Opcode::SetupLoop => Some(JumpMode::Relative),
        Opcode::JumpAbsolute | Opcode::PopJumpIfFalse | Opcode::PopJumpIfTrue => Some(JumpMode::Absolute),
        _ => None,
    };
    let pop_order = match op {
        Opcode::BinaryAdd | Opcode::BinaryMultiply => PopOrder::TopFirst,
        _ => PopOrder::Natural,
    };
    OpInfo {
        op,
        name,
        byte,
        operand,
        pops,
        pushes,
        pop_order,
        jump,
    }
}

use OperandKind::{Const as K, Immediate as Imm, Jump as J, Local as L, Name as N, Unused as U};
use Pops::{ArgPlus, Fixed, FunctionFlags};

pub static OPCODES: &[OpInfo] = &[
    info(Opcode::PopTop, "POP_TOP", 1, U, Fixed(1), 0),
    info(Opcode::Nop, "NOP", 9, U, Fixed(0), 0),
    info(Opcode::BinaryPower, "BINARY_POWER", 19, U, Fixed(2), 1),
    info(Opcode::BinaryMultiply, "BINARY_MULTIPLY", 20, U, Fixed(2), 1),
    info(Opcode::BinaryModulo, "BINARY_MODULO", 22, U, Fixed(2), 1),
    info(Opcode::BinaryAdd, "BINARY_ADD", 23, U, Fixed(2), 1),
    info(Opcode::BinarySubtract, "BINARY_SUBTRACT", 24, U, Fixed(2), 1),
    info(Opcode::BinaryFloorDivide, "BINARY_FLOOR_DIVIDE", 26, U, Fixed(2), 1),
    info(Opcode::BinaryTrueDivide, "BINARY_TRUE_DIVIDE", 27, U, Fixed(2), 1),
    info(Opcode::GetIter, "GET_ITER", 68, U, Fixed(1), 1),
    info(Opcode::ReturnValue, "RETURN_VALUE", 83, U, Fixed(1), 0),
    info(Opcode::PopBlock, "POP_BLOCK", 87, U, Fixed(0), 0),
    info(Opcode::StoreName, "STORE_NAME", 90, N, Fixed(1), 0),
    // FOR_ITER leaves the iterator in place and pushes the next item.
    info(Opcode::ForIter, "FOR_ITER", 93, J, Fixed(0), 1),
    info(Opcode::LoadConst, "LOAD_CONST", 100, K, Fixed(0), 1),
    info(Opcode::LoadName, "LOAD_NAME", 101, N, Fixed(0), 1),
    info(Opcode::CompareOp, "COMPARE_OP", 107, Imm, Fixed(2), 1),
    info(Opcode::ImportName, "IMPORT_NAME", 108, N, Fixed(2), 1),
    info(Opcode::JumpForward, "JUMP_FORWARD", 110, J, Fixed(0), 0),
    info(Opcode::JumpAbsolute, "JUMP_ABSOLUTE", 113, J, Fixed(0), 0),
    info(Opcode::PopJumpIfFalse, "POP_JUMP_IF_FALSE", 114, J, Fixed(1), 0),
    info(Opcode::PopJumpIfTrue, "POP_JUMP_IF_TRUE", 115, J, Fixed(1), 0),
    info(Opcode::LoadGlobal, "LOAD_GLOBAL", 116, N, Fixed(0), 1),
    info(Opcode::SetupLoop, "SETUP_LOOP", 120, J, Fixed(0), 0),
    info(Opcode::LoadFast, "LOAD_FAST", 124, L, Fixed(0), 1),
    info(Opcode::StoreFast, "STORE_FAST", 125, L, Fixed(1), 0),
    info(Opcode::CallFunction, "CALL_FUNCTION", 131, Imm, ArgPlus(1), 1),
    info(Opcode::MakeFunction, "MAKE_FUNCTION", 132, Imm, FunctionFlags, 1),
    info(Opcode::BuildConstKeyMap, "BUILD_CONST_KEY_MAP", 156, Imm, ArgPlus(1), 1),
    // Pushes the bound method and its receiver slot.
    info(Opcode::LoadMethod, "LOAD_METHOD", 160, N, Fixed(1), 2),
    info(Opcode::CallMethod, "CALL_METHOD", 161, Imm, ArgPlus(2), 1),
];

static BY_BYTE: Lazy<[Option<Opcode>; 256]> = Lazy::new(|| {
    let mut table = [None; 256];
    for entry in OPCODES {
        table[entry.byte as usize] = Some(entry.op);
    }
    table
});

impl Opcode {
    /// Looks up the instruction kind for an opcode byte.
    #[inline]
    pub fn from_byte(byte: u8) -> Option<Opcode> {
        BY_BYTE[byte as usize]
    }

    #[inline]
    pub fn info(self) -> &'static OpInfo {
        // The catalog is declared in enum order.
        &OPCODES[self as usize]
    }

    #[inline]
    pub fn byte(self) -> u8 {
        self.info().byte
    }

    #[inline]
    pub fn name(self) -> &'static str {
        self.info().name
    }

    #[inline]
    pub fn operand_kind(self) -> OperandKind {
        self.info().operand
    }

    #[inline]
    pub fn jump_mode(self) -> Option<JumpMode> {
        self.info().jump
    }

    #[inline]
    pub fn is_jump(self) -> bool {
        self.info().jump.is_some()
    }

    /// Values consumed when executed with operand `arg`.
    pub fn pops(self, arg: u8) -> usize {
        match self.info().pops {
            Pops::Fixed(n) => n as usize,
            Pops::ArgPlus(extra) => arg as usize + extra as usize,
            Pops::FunctionFlags => 2 + (arg & 0x0F).count_ones() as usize,
        }
    }

    #[inline]
    pub fn pushes(self) -> usize {
        self.info().pushes as usize
    }

    pub fn is_load_var(self) -> bool {
        matches!(self, Opcode::LoadFast | Opcode::LoadName)
    }

    pub fn is_store_var(self) -> bool {
        matches!(self, Opcode::StoreFast | Opcode::StoreName)
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

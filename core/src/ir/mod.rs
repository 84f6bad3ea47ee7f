mod decode;
mod encode;
mod instr;
mod opcode;
mod seq;


pub use decode::{decode, decode_raw};
pub use encode::encode;
pub use instr::{Instr, InstrId, Operand, Resolved};
pub use opcode::{INSTR_WIDTH, JumpMode, OPCODES, OpInfo, Opcode, OperandKind, PopOrder, Pops};
pub use seq::Sequence;

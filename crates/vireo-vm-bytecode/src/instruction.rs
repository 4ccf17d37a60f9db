//! Fixed-width bytecode instructions
//!
//! Every instruction occupies 40 bits on the wire: an 8-bit opcode followed
//! by two 16-bit operands, little-endian. Operands index the constant pool,
//! the local table, or encode signed jump offsets; unused operands are zero.

use serde::{Deserialize, Serialize};

use crate::error::{BytecodeError, Result};
use crate::opcode::Opcode;

/// Encoded size of one instruction in bytes
pub const INSTRUCTION_SIZE: usize = 5;

/// A single 40-bit instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instruction {
    /// The opcode
    pub op: Opcode,
    /// First operand
    pub a: u16,
    /// Second operand
    pub b: u16,
}

impl Instruction {
    /// Create an instruction with both operands
    #[inline]
    pub const fn new(op: Opcode, a: u16, b: u16) -> Self {
        Self { op, a, b }
    }

    /// Create an instruction with a single operand
    #[inline]
    pub const fn with_a(op: Opcode, a: u16) -> Self {
        Self { op, a, b: 0 }
    }

    /// Create an operand-less instruction
    #[inline]
    pub const fn plain(op: Opcode) -> Self {
        Self { op, a: 0, b: 0 }
    }

    /// Create a jump instruction with a signed offset in operand `a`
    #[inline]
    pub const fn jump(op: Opcode, offset: i16) -> Self {
        Self {
            op,
            a: offset as u16,
            b: 0,
        }
    }

    /// Interpret operand `a` as a signed jump offset
    #[inline]
    pub const fn a_signed(self) -> i16 {
        self.a as i16
    }

    /// Interpret operand `b` as a signed offset (guard deopt target)
    #[inline]
    pub const fn b_signed(self) -> i16 {
        self.b as i16
    }

    /// Append the 5-byte wire encoding to `out`
    pub fn encode(self, out: &mut Vec<u8>) {
        out.push(self.op.to_byte());
        out.extend_from_slice(&self.a.to_le_bytes());
        out.extend_from_slice(&self.b.to_le_bytes());
    }

    /// Decode one instruction from the front of `bytes`
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < INSTRUCTION_SIZE {
            return Err(BytecodeError::UnexpectedEnd);
        }
        let op = Opcode::from_byte(bytes[0]).ok_or(BytecodeError::InvalidOpcode(bytes[0]))?;
        let a = u16::from_le_bytes([bytes[1], bytes[2]]);
        let b = u16::from_le_bytes([bytes[3], bytes[4]]);
        Ok(Self { op, a, b })
    }

    /// Net stack effect `(pops, pushes)` of this instruction.
    ///
    /// Call-family effects depend on the argc operand; returns `None` for
    /// opcodes whose effect the verifier must special-case (none currently).
    pub fn stack_effect(self) -> (u16, u16) {
        use Opcode::*;
        match self.op {
            PushConst | PushInt | PushNull | PushTrue | PushFalse | PushLocal | PushGlobal => {
                (0, 1)
            }
            StoreLocal | StoreGlobal | Pop | Jz | Jnz | Throw | Ret => (1, 0),
            Dup => (1, 2),
            Swap => (2, 2),
            AddInt | AddFloat | AddAny | SubInt | SubFloat | SubAny | MulInt | MulFloat
            | MulAny | DivInt | DivFloat | DivAny | ModInt | Concat | GetElem => (2, 1),
            Neg | Not | CloneVal | ArrayLen | GetProp | GetPropIc | InstanceOf | GetField => (1, 1),
            Eq | Neq | Lt | Le | Gt | Ge | Identical | NotIdentical => (2, 1),
            Jmp | CheckGc | RetNull | Nop => (0, 0),
            Call => (self.b, 1),
            CallValue => (self.b + 1, 1),
            CallMethod => (self.b + 1, 1),
            CallBuiltin => (self.b, 1),
            NewObj => (0, 1),
            SetProp | SetPropIc => (2, 0),
            MakeClosure => (self.b, 1),
            NewArray => (self.a, 1),
            SetElem => (3, 0),
            ArrayPush => (2, 0),
            // NewStruct pops a (name, value) pair per field
            NewStruct => (self.a * 2, 1),
            SetField => (2, 0),
            GuardInt | GuardFloat => (0, 0),
            GuardStr | GuardArray | GuardObj => (0, 0),
            PassByValue | PassByRef | PassByCow | PassByMove | CowCheck => (1, 1),
            // CowCopy reads a local slot and pushes the exclusive aggregate
            CowCopy => (0, 1),
        }
    }
}

impl std::fmt::Display for Instruction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.op.is_jump() {
            write!(f, "{} {:+}", self.op.name(), self.a_signed())
        } else {
            write!(f, "{} {} {}", self.op.name(), self.a, self.b)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_roundtrip() {
        let cases = [
            Instruction::with_a(Opcode::PushConst, 7),
            Instruction::new(Opcode::Call, 3, 2),
            Instruction::jump(Opcode::Jmp, -12),
            Instruction::plain(Opcode::Ret),
            Instruction::new(Opcode::GuardInt, 4, 1),
        ];

        for instr in cases {
            let mut bytes = Vec::new();
            instr.encode(&mut bytes);
            assert_eq!(bytes.len(), INSTRUCTION_SIZE);
            let decoded = Instruction::decode(&bytes).unwrap();
            assert_eq!(decoded, instr);
        }
    }

    #[test]
    fn test_signed_offset() {
        let instr = Instruction::jump(Opcode::Jz, -5);
        assert_eq!(instr.a_signed(), -5);

        let fwd = Instruction::jump(Opcode::Jmp, 300);
        assert_eq!(fwd.a_signed(), 300);
    }

    #[test]
    fn test_decode_truncated() {
        let result = Instruction::decode(&[0x00, 0x01]);
        assert!(matches!(result, Err(BytecodeError::UnexpectedEnd)));
    }

    #[test]
    fn test_decode_invalid_opcode() {
        let result = Instruction::decode(&[0xFF, 0, 0, 0, 0]);
        assert!(matches!(result, Err(BytecodeError::InvalidOpcode(0xFF))));
    }

    #[test]
    fn test_call_stack_effect_uses_argc() {
        let call = Instruction::new(Opcode::Call, 0, 3);
        assert_eq!(call.stack_effect(), (3, 1));

        let method = Instruction::new(Opcode::CallMethod, 0, 2);
        assert_eq!(method.stack_effect(), (3, 1));
    }
}

//! Bytecode verifier
//!
//! Checks a compiled function before execution: operand indices must be in
//! bounds, jumps must land inside the body, and the operand stack must have
//! a consistent depth at every instruction, never underflowing and never
//! exceeding the declared maximum. Verification failure is fatal.

use crate::error::{BytecodeError, Result};
use crate::function::CompiledFunction;
use crate::opcode::Opcode;

/// Verify a compiled function.
pub fn verify_function(func: &CompiledFunction) -> Result<()> {
    let len = func.code.len();

    for entry in &func.exception_table {
        if entry.start > entry.end
            || entry.end as usize > len
            || entry.handler as usize >= len.max(1)
        {
            return Err(BytecodeError::BadExceptionRange {
                start: entry.start,
                end: entry.end,
            });
        }
    }

    // Default-value descriptors must resolve in the pool.
    for param in &func.params {
        if let Some(idx) = param.default {
            if func.constants.get(idx).is_none() {
                return Err(BytecodeError::BadConstantIndex { pc: 0, index: idx });
            }
        }
    }

    // Abstract interpretation of stack depth over the control-flow graph.
    let mut depth_at: Vec<Option<u16>> = vec![None; len];
    let mut worklist: Vec<(usize, u16)> = vec![(0, 0)];

    // Exception handlers are entered with the thrown value on the stack.
    for entry in &func.exception_table {
        worklist.push((entry.handler as usize, 1));
    }

    while let Some((pc, depth)) = worklist.pop() {
        if pc >= len {
            // Falling off the end is an implicit null return.
            continue;
        }
        match depth_at[pc] {
            Some(seen) if seen == depth => continue,
            Some(seen) => {
                return Err(BytecodeError::InconsistentStackDepth {
                    pc,
                    first: seen,
                    second: depth,
                });
            }
            None => depth_at[pc] = Some(depth),
        }

        let instr = func.code[pc];
        check_operands(func, pc)?;

        let (pops, pushes) = instr.stack_effect();
        if depth < pops {
            return Err(BytecodeError::StackUnderflow { pc });
        }
        let next_depth = depth - pops + pushes;
        if next_depth > func.max_stack {
            return Err(BytecodeError::MaxStackExceeded {
                pc,
                max: func.max_stack,
            });
        }

        match instr.op {
            Opcode::Jmp => {
                worklist.push((jump_target(pc, instr.a_signed(), len)?, next_depth));
            }
            Opcode::Jz | Opcode::Jnz => {
                worklist.push((jump_target(pc, instr.a_signed(), len)?, next_depth));
                worklist.push((pc + 1, next_depth));
            }
            Opcode::Ret | Opcode::RetNull | Opcode::Throw => {}
            Opcode::GuardInt
            | Opcode::GuardFloat
            | Opcode::GuardStr
            | Opcode::GuardArray
            | Opcode::GuardObj => {
                // Deopt target in operand b plus fallthrough.
                worklist.push((jump_target(pc, instr.b_signed(), len)?, next_depth));
                worklist.push((pc + 1, next_depth));
            }
            _ => {
                worklist.push((pc + 1, next_depth));
            }
        }
    }

    Ok(())
}

fn jump_target(pc: usize, offset: i16, len: usize) -> Result<usize> {
    let target = pc as i64 + 1 + offset as i64;
    if target < 0 || target as usize > len {
        return Err(BytecodeError::JumpOutOfBounds { pc, target });
    }
    Ok(target as usize)
}

fn check_operands(func: &CompiledFunction, pc: usize) -> Result<()> {
    let instr = func.code[pc];
    match instr.op {
        Opcode::PushConst
        | Opcode::PushGlobal
        | Opcode::StoreGlobal
        | Opcode::GetProp
        | Opcode::SetProp
        | Opcode::GetPropIc
        | Opcode::SetPropIc
        | Opcode::CallMethod => {
            if func.constants.get(instr.a).is_none() {
                return Err(BytecodeError::BadConstantIndex { pc, index: instr.a });
            }
        }
        Opcode::PushLocal
        | Opcode::StoreLocal
        | Opcode::PassByRef
        | Opcode::PassByMove
        | Opcode::CowCopy => {
            if instr.a >= func.local_count {
                return Err(BytecodeError::BadLocalIndex { pc, index: instr.a });
            }
        }
        _ => {}
    }

    Ok(())
}

//! Bytecode disassembler: turns a compiled `Code` back into a human-readable
//! assembly-like listing, used by `eva-cli`'s `--disasm` flag and by tests
//! that check jump targets / constant references stay in range.

use std::fmt::Write as _;

use super::code::Code;
use super::op::{CompareOp, Op};
use crate::heap::Heap;
use crate::value::Value;

/// One decoded instruction: its offset, opcode, and operand (if any).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Instruction {
    pub offset: usize,
    pub op: Op,
    pub operand: Operand,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Operand {
    None,
    U8(u8),
    U16(u16),
}

/// Decodes `code.bytecode` into a flat instruction list. Returns `None` at
/// the first invalid opcode byte or truncated operand. Callers that need
/// the partial prefix should slice `code.bytecode` themselves.
pub fn decode(code: &Code) -> Option<Vec<Instruction>> {
    let mut out = Vec::new();
    let mut offset = 0;
    let bytes = &code.bytecode;
    while offset < bytes.len() {
        let start = offset;
        let op = Op::from_repr(bytes[offset])?;
        offset += 1;
        let operand = match op.operand_width() {
            0 => Operand::None,
            1 => {
                let b = *bytes.get(offset)?;
                offset += 1;
                Operand::U8(b)
            }
            2 => {
                let hi = *bytes.get(offset)?;
                let lo = *bytes.get(offset + 1)?;
                offset += 2;
                Operand::U16(u16::from_be_bytes([hi, lo]))
            }
            _ => unreachable!("operand_width only returns 0, 1, or 2"),
        };
        out.push(Instruction { offset: start, op, operand });
    }
    Some(out)
}

/// Full listing: a constants section (for the top-level `Code` only, not
/// recursively for nested function constants) followed by the instruction
/// stream, one line per instruction, annotated with resolved names/targets.
pub fn disassemble(code: &Code, heap: &Heap) -> String {
    let mut out = String::new();

    if !code.constants.is_empty() {
        writeln!(out, "=== Constants ({}) ===", code.name).unwrap();
        for (idx, constant) in code.constants.iter().enumerate() {
            writeln!(out, "{idx}: {}", format_value(*constant, heap)).unwrap();
        }
        writeln!(out).unwrap();
    }

    writeln!(out, "=== Instructions ({}) ===", code.name).unwrap();
    match decode(code) {
        Some(instructions) => {
            for instr in &instructions {
                writeln!(out, "{}", format_instruction(instr)).unwrap();
            }
        }
        None => {
            writeln!(out, "<disassembly aborted: malformed bytecode>").unwrap();
        }
    }
    out
}

/// One line: `OFFSET  MNEMONIC operand` with jump targets and compare ops
/// annotated for readability.
pub fn format_instruction(instr: &Instruction) -> String {
    let mnemonic: &'static str = instr.op.into();
    match (instr.op, instr.operand) {
        (_, Operand::None) => format!("{:04}  {mnemonic}", instr.offset),
        (Op::Compare, Operand::U8(code)) => match CompareOp::from_repr(code) {
            Some(cmp) => format!("{:04}  {mnemonic} {code} ({cmp:?})", instr.offset),
            None => format!("{:04}  {mnemonic} {code} (invalid)", instr.offset),
        },
        (_, Operand::U8(b)) => format!("{:04}  {mnemonic} {b}", instr.offset),
        (Op::Jmp | Op::JmpIfFalse, Operand::U16(addr)) => {
            format!("{:04}  {mnemonic} {addr:04} (-> {addr:04})", instr.offset)
        }
        (_, Operand::U16(addr)) => format!("{:04}  {mnemonic} {addr}", instr.offset),
    }
}

fn format_value(value: Value, heap: &Heap) -> String {
    match value {
        Value::Number(n) => {
            if n.fract() == 0.0 && n.is_finite() {
                format!("{n:.0}")
            } else {
                n.to_string()
            }
        }
        Value::Bool(b) => b.to_string(),
        Value::Object(id) => match heap.get(id) {
            crate::heap::HeapObject::Str(s) => format!("{s:?}"),
            crate::heap::HeapObject::Code(c) => format!("<code {} arity={}>", c.name, c.arity),
            crate::heap::HeapObject::Function(f) => format!("<function code={}>", f.code),
            crate::heap::HeapObject::Cell(_) => "<cell>".to_string(),
            crate::heap::HeapObject::Native(n) => format!("<native {}>", n.name),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::global::Global;
    use crate::heap::Heap;
    use crate::parse::parse_program;
    use crate::scope::analyze;

    fn compile(src: &str) -> (Heap, Code) {
        let mut heap = Heap::new();
        let mut global = Global::new();
        let program = parse_program(src).unwrap();
        let scopes = analyze(&program).unwrap();
        let main = crate::bytecode::compiler::compile(&mut heap, &mut global, &program, &scopes).unwrap();
        let code = heap.get_code(main).clone();
        (heap, code)
    }

    #[test]
    fn decodes_every_instruction_with_no_trailing_garbage() {
        let (_heap, code) = compile("(+ 1 2)");
        let instructions = decode(&code).expect("well-formed bytecode decodes");
        let total: usize = instructions.iter().map(|i| 1 + i.op.operand_width()).sum();
        assert_eq!(total, code.bytecode.len());
    }

    #[test]
    fn jump_targets_land_inside_the_bytecode() {
        let (_heap, code) = compile("(var x 1) (if (== x 1) (set x 2) (set x 3)) x");
        let instructions = decode(&code).unwrap();
        for instr in &instructions {
            if let (Op::Jmp | Op::JmpIfFalse, Operand::U16(target)) = (instr.op, instr.operand) {
                assert!((target as usize) <= code.bytecode.len(), "jump target out of range");
            }
        }
    }

    #[test]
    fn const_indices_stay_in_pool_bounds() {
        let (_heap, code) = compile("(+ 1 (+ 2 3))");
        let instructions = decode(&code).unwrap();
        for instr in &instructions {
            if let (Op::Const, Operand::U8(idx)) = (instr.op, instr.operand) {
                assert!((idx as usize) < code.constants.len());
            }
        }
    }

    #[test]
    fn disassembly_mentions_every_constant() {
        let (heap, code) = compile(r#"(+ "a" "b")"#);
        let text = disassemble(&code, &heap);
        assert!(text.contains("\"a\""));
        assert!(text.contains("\"b\""));
    }

    #[test]
    fn reparsing_the_listing_yields_the_same_mnemonic_stream() {
        let (_heap, code) = compile("(var i 0) (while (< i 3) (set i (+ i 1))) i");
        let instructions = decode(&code).unwrap();
        let lines: Vec<String> = instructions.iter().map(format_instruction).collect();
        let mnemonics: Vec<&str> = instructions.iter().map(|i| Into::<&'static str>::into(i.op)).collect();
        let reparsed_mnemonics: Vec<&str> = lines.iter().map(|l| l.split_whitespace().nth(1).unwrap()).collect();
        assert_eq!(mnemonics, reparsed_mnemonics);
    }
}

//! Everything to do with the compiled representation: the opcode set, the
//! per-function `Code` object, incremental bytecode emission, the
//! AST-to-bytecode compiler, and the disassembler used by tests and the CLI.

pub mod builder;
pub mod code;
pub mod compiler;
pub mod disasm;
pub mod op;
